//! In-process stub engine.
//!
//! Simulates a native engine without linking one: a byte-level tokenizer, a
//! bounded context window with front eviction, and a reply that either echoes
//! the last primed text or replays a fixed script. Used by the binary when no
//! native engine is linked and by the tests, which rely on its load/release
//! counters.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::inference::backend::{Engine, EngineError, LoadParams, Step, TokenId};

/// Begin-of-sequence token.
pub const BOS_TOKEN: TokenId = 1;

/// End-of-sequence token.
pub const EOS_TOKEN: TokenId = 2;

// Byte b is token b + BYTE_OFFSET.
const BYTE_OFFSET: TokenId = 3;

#[derive(Debug, Clone)]
enum Reply {
    Echo,
    Script(Vec<u8>),
}

/// Deterministic engine with load/release accounting.
#[derive(Debug)]
pub struct StubEngine {
    reply: Reply,
    step_delay: Option<Duration>,
    loads: AtomicUsize,
    releases: AtomicUsize,
    steps: AtomicUsize,
}

/// Stub context handle.
#[derive(Debug)]
pub struct StubContext {
    n_ctx: usize,
    window: Vec<TokenId>,
    reply: VecDeque<TokenId>,
}

impl StubEngine {
    /// Reply to every prompt with the prompt text itself.
    pub fn echo() -> Self {
        Self::with_reply(Reply::Echo)
    }

    /// Reply to every prompt with `script`.
    pub fn scripted(script: impl Into<String>) -> Self {
        Self::with_reply(Reply::Script(script.into().into_bytes()))
    }

    fn with_reply(reply: Reply) -> Self {
        Self {
            reply,
            step_delay: None,
            loads: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            steps: AtomicUsize::new(0),
        }
    }

    /// Sleep this long inside every step, like a real forward pass would.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn step_count(&self) -> usize {
        self.steps.load(Ordering::SeqCst)
    }
}

impl StubContext {
    /// Tokens currently held in the context window.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

fn byte_tokens(bytes: &[u8]) -> impl Iterator<Item = TokenId> + '_ {
    bytes.iter().map(|&b| TokenId::from(b) + BYTE_OFFSET)
}

impl Engine for StubEngine {
    type Context = StubContext;

    fn load(&self, path: &Path, params: &LoadParams) -> Result<StubContext, EngineError> {
        std::fs::metadata(path)
            .map_err(|e| EngineError::ModelLoadFailed(format!("{}: {e}", path.display())))?;
        if params.n_ctx == 0 {
            return Err(EngineError::ContextFailed(
                "context size must be positive".to_string(),
            ));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(StubContext {
            n_ctx: params.n_ctx,
            window: Vec::with_capacity(params.n_ctx),
            reply: VecDeque::new(),
        })
    }

    fn tokenize(
        &self,
        _ctx: &StubContext,
        text: &str,
        add_bos: bool,
    ) -> Result<Vec<TokenId>, EngineError> {
        if text.contains('\0') {
            return Err(EngineError::TokenizeFailed(
                "text contains an interior NUL byte".to_string(),
            ));
        }
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(BOS_TOKEN);
        }
        tokens.extend(byte_tokens(text.as_bytes()));
        Ok(tokens)
    }

    fn prime(&self, ctx: &mut StubContext, tokens: &[TokenId]) -> Result<(), EngineError> {
        if ctx.window.len() + tokens.len() > ctx.n_ctx {
            return Err(EngineError::ContextFailed("context size reached".to_string()));
        }
        ctx.window.extend_from_slice(tokens);
        ctx.reply = match &self.reply {
            Reply::Echo => tokens.iter().copied().filter(|&t| t >= BYTE_OFFSET).collect(),
            Reply::Script(script) => byte_tokens(script).collect(),
        };
        Ok(())
    }

    fn evict_front(&self, ctx: &mut StubContext, n_tokens: usize) -> Result<(), EngineError> {
        let n = n_tokens.min(ctx.window.len());
        ctx.window.drain(..n);
        Ok(())
    }

    fn step(&self, ctx: &mut StubContext) -> Result<Step, EngineError> {
        if let Some(delay) = self.step_delay {
            std::thread::sleep(delay);
        }
        self.steps.fetch_add(1, Ordering::SeqCst);

        match ctx.reply.pop_front() {
            Some(token) => {
                if ctx.window.len() >= ctx.n_ctx {
                    return Err(EngineError::ContextFailed("context size reached".to_string()));
                }
                ctx.window.push(token);
                Ok(Step::Token(token))
            }
            None => Ok(Step::EndOfGeneration),
        }
    }

    fn decode(&self, _ctx: &StubContext, token: TokenId) -> Result<Vec<u8>, EngineError> {
        match token {
            BOS_TOKEN | EOS_TOKEN => Ok(Vec::new()),
            t if (BYTE_OFFSET..BYTE_OFFSET + 256).contains(&t) => Ok(vec![(t - BYTE_OFFSET) as u8]),
            t => Err(EngineError::DecodeFailed(format!("unknown token {t}"))),
        }
    }

    fn release(&self, _ctx: StubContext) -> Result<(), EngineError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
