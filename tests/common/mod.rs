//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use llm_session::inference::backend::{Engine, EngineError, LoadParams, Step, TokenId};
use llm_session::inference::stub::{StubContext, StubEngine};
use llm_session::SamplingConfig;

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend((s.len() as u64).to_le_bytes());
    buf.extend(s.as_bytes());
}

/// Write a GGUF v3 file with no tensors and an architecture + context length.
pub fn write_gguf(dir: &Path, context_length: Option<u32>) -> PathBuf {
    let path = dir.join("model.gguf");
    let kv_count: u64 = if context_length.is_some() { 2 } else { 1 };

    let mut buf = Vec::new();
    buf.extend(b"GGUF");
    buf.extend(3u32.to_le_bytes());
    buf.extend(0u64.to_le_bytes());
    buf.extend(kv_count.to_le_bytes());

    put_string(&mut buf, "general.architecture");
    buf.extend(8u32.to_le_bytes());
    put_string(&mut buf, "llama");

    if let Some(n) = context_length {
        put_string(&mut buf, "llama.context_length");
        buf.extend(4u32.to_le_bytes());
        buf.extend(n.to_le_bytes());
    }

    std::fs::write(&path, buf).unwrap();
    path
}

/// Raw template: the rendered prompt is exactly the message text.
pub fn raw_config(context_size: usize) -> SamplingConfig {
    SamplingConfig {
        context_size,
        prompt_template: "{content}".to_string(),
        generation_headroom: 0,
        ..Default::default()
    }
}

/// Stub engine whose step fails on the given call.
pub struct FailingStepEngine {
    pub inner: StubEngine,
    fail_on: usize,
    calls: AtomicUsize,
}

impl FailingStepEngine {
    pub fn new(inner: StubEngine, fail_on: usize) -> Self {
        Self {
            inner,
            fail_on,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Engine for FailingStepEngine {
    type Context = StubContext;

    fn load(&self, path: &Path, params: &LoadParams) -> Result<StubContext, EngineError> {
        self.inner.load(path, params)
    }

    fn tokenize(
        &self,
        ctx: &StubContext,
        text: &str,
        add_bos: bool,
    ) -> Result<Vec<TokenId>, EngineError> {
        self.inner.tokenize(ctx, text, add_bos)
    }

    fn prime(&self, ctx: &mut StubContext, tokens: &[TokenId]) -> Result<(), EngineError> {
        self.inner.prime(ctx, tokens)
    }

    fn evict_front(&self, ctx: &mut StubContext, n_tokens: usize) -> Result<(), EngineError> {
        self.inner.evict_front(ctx, n_tokens)
    }

    fn step(&self, ctx: &mut StubContext) -> Result<Step, EngineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(EngineError::DecodeFailed("llama_decode() failed".to_string()));
        }
        self.inner.step(ctx)
    }

    fn decode(&self, ctx: &StubContext, token: TokenId) -> Result<Vec<u8>, EngineError> {
        self.inner.decode(ctx, token)
    }

    fn release(&self, ctx: StubContext) -> Result<(), EngineError> {
        self.inner.release(ctx)
    }
}
