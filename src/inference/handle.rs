//! Single-owner wrapper around an engine context.
//!
//! An [`EngineHandle`] owns exactly one native context. Release is idempotent:
//! the context is moved out on the first call and later calls do nothing.
//! Every accessor fails with [`EngineError::HandleReleased`] once the context
//! is gone. Dropping an unreleased handle releases it.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::inference::backend::{Engine, EngineError, LoadParams, Step, TokenId};

pub struct EngineHandle<E: Engine> {
    engine: Arc<E>,
    context: Option<E::Context>,
}

impl<E: Engine> EngineHandle<E> {
    /// Ask the engine to load a model and wrap the resulting context.
    pub fn load(engine: Arc<E>, path: &Path, params: &LoadParams) -> Result<Self, EngineError> {
        let context = engine.load(path, params)?;
        debug!(path = %path.display(), n_ctx = params.n_ctx, "Engine context created");
        Ok(Self {
            engine,
            context: Some(context),
        })
    }

    pub fn is_released(&self) -> bool {
        self.context.is_none()
    }

    fn context(&self) -> Result<&E::Context, EngineError> {
        self.context.as_ref().ok_or_else(|| {
            error!("Engine handle accessed after release");
            EngineError::HandleReleased
        })
    }

    fn context_mut(&mut self) -> Result<&mut E::Context, EngineError> {
        self.context.as_mut().ok_or_else(|| {
            error!("Engine handle accessed after release");
            EngineError::HandleReleased
        })
    }

    pub fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, EngineError> {
        let ctx = self.context()?;
        self.engine.tokenize(ctx, text, add_bos)
    }

    pub fn prime(&mut self, tokens: &[TokenId]) -> Result<(), EngineError> {
        let engine = Arc::clone(&self.engine);
        engine.prime(self.context_mut()?, tokens)
    }

    pub fn evict_front(&mut self, n_tokens: usize) -> Result<(), EngineError> {
        if n_tokens == 0 {
            return Ok(());
        }
        let engine = Arc::clone(&self.engine);
        engine.evict_front(self.context_mut()?, n_tokens)
    }

    pub fn step(&mut self) -> Result<Step, EngineError> {
        let engine = Arc::clone(&self.engine);
        engine.step(self.context_mut()?)
    }

    pub fn decode(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        let ctx = self.context()?;
        self.engine.decode(ctx, token)
    }

    /// Release the native context. The context is consumed even when the
    /// engine reports an error, so it can never be released twice.
    pub fn release(&mut self) -> Result<(), EngineError> {
        match self.context.take() {
            Some(ctx) => self.engine.release(ctx),
            None => Ok(()),
        }
    }
}

impl<E: Engine> Drop for EngineHandle<E> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Releasing engine context on drop failed: {e}");
        }
    }
}
