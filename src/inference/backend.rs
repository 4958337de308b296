//! The engine interface.
//!
//! The model-execution engine (llama.cpp or similar) is an external collaborator.
//! Sessions only see it through [`Engine`]: load a context, tokenize, prime the
//! context with prompt tokens, run one step at a time, decode a token into its
//! byte piece, and release. Sampling happens inside the engine using the
//! parameters handed over at load time.

use std::path::Path;

use thiserror::Error;

use crate::config::SamplingConfig;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("Tokenization failed: {0}")]
    TokenizeFailed(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Context operation failed: {0}")]
    ContextFailed(String),

    #[error("Release failed: {0}")]
    ReleaseFailed(String),

    #[error("Engine handle used after release")]
    HandleReleased,
}

/// Token ID type.
pub type TokenId = i32;

/// Sampler chain parameters (mirrors the engine's sampler construction).
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerParams {
    pub temperature: f32,
    pub top_p: f32,
    pub min_p: f32,
    pub top_k: u32,
    pub xtc_p: f32,
    pub xtc_t: f32,
}

/// Everything the engine needs to load a model and create its context.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadParams {
    /// Context size in tokens.
    pub n_ctx: usize,

    /// Number of threads for computation.
    pub n_threads: usize,

    /// Use memory mapping for the model file.
    pub use_mmap: bool,

    /// Use memory locking.
    pub use_mlock: bool,

    pub sampler: SamplerParams,
}

impl LoadParams {
    pub fn from_config(config: &SamplingConfig, n_ctx: usize) -> Self {
        Self {
            n_ctx,
            n_threads: config.thread_count,
            use_mmap: config.use_mmap,
            use_mlock: config.use_mlock,
            sampler: SamplerParams {
                temperature: config.temperature,
                top_p: config.top_p,
                min_p: config.min_p,
                top_k: config.top_k,
                xtc_p: config.xtc_p,
                xtc_t: config.xtc_t,
            },
        }
    }
}

/// Outcome of a single inference step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A token was sampled.
    Token(TokenId),
    /// The engine sampled its end-of-generation token.
    EndOfGeneration,
}

/// A model-execution engine.
///
/// `Context` is the per-model native state (weights plus KV cache). It is
/// created by [`Engine::load`] and consumed by [`Engine::release`]; callers
/// hold it through [`crate::inference::handle::EngineHandle`].
pub trait Engine: Send + Sync {
    type Context: Send;

    /// Load weights from `path` and create a context.
    fn load(&self, path: &Path, params: &LoadParams) -> Result<Self::Context, EngineError>;

    /// Convert text into tokens. `add_bos` prepends the begin-of-sequence token.
    fn tokenize(
        &self,
        ctx: &Self::Context,
        text: &str,
        add_bos: bool,
    ) -> Result<Vec<TokenId>, EngineError>;

    /// Append tokens to the context. They are evaluated by the next step.
    fn prime(&self, ctx: &mut Self::Context, tokens: &[TokenId]) -> Result<(), EngineError>;

    /// Drop the oldest `n_tokens` from the context.
    fn evict_front(&self, ctx: &mut Self::Context, n_tokens: usize) -> Result<(), EngineError>;

    /// Run one forward pass and sample the next token. Not interruptible.
    fn step(&self, ctx: &mut Self::Context) -> Result<Step, EngineError>;

    /// Byte piece for a token. May be part of a multi-byte character.
    fn decode(&self, ctx: &Self::Context, token: TokenId) -> Result<Vec<u8>, EngineError>;

    /// Free the context and its model.
    fn release(&self, ctx: Self::Context) -> Result<(), EngineError>;
}
