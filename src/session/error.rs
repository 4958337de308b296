//! Session-level errors.

use thiserror::Error;

use crate::chat::history::InvalidRoleError;
use crate::config::ConfigError;
use crate::inference::backend::EngineError;

#[derive(Error, Debug)]
pub enum SessionError {
    /// Bad path, unrecognized format, or the engine could not allocate the model.
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Invalid session configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error(transparent)]
    InvalidRole(#[from] InvalidRoleError),

    #[error("Session is busy generating a response")]
    SessionBusy,

    #[error("Failed to tokenize prompt: {0}")]
    Tokenization(String),

    #[error("Prompt of {prompt_tokens} tokens does not fit in a context of {context_size} tokens")]
    ContextOverflow {
        prompt_tokens: usize,
        context_size: usize,
    },

    #[error("No completion in progress")]
    NotGenerating,

    /// A prime, step, or decode call failed. The turn is aborted.
    #[error("Engine failure: {0}")]
    Engine(#[from] EngineError),

    #[error("Failed to release engine resources: {0}")]
    Release(String),
}

impl SessionError {
    /// Whether the error prevents a session from existing at all.
    ///
    /// Every other error leaves the session usable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::ModelLoad(_) | SessionError::InvalidConfig(_))
    }
}
