//! llm-session: streaming, cancellable chat sessions over a native LLM engine.
//!
//! The engine (tokenizer, forward pass, sampler) is an external collaborator
//! behind [`inference::backend::Engine`]. This crate owns everything around it:
//! - [`session`]: The generation state machine, cancellation, and telemetry
//! - [`chat`]: Chat history and prompt templates
//! - [`inference`]: Engine trait, single-owner engine handle, GGUF probing
//! - [`config`]: Sampling configuration and CLI arguments

pub mod chat;
pub mod config;
pub mod inference;
pub mod session;

pub use chat::history::{ChatHistory, ChatRole, ChatTurn};
pub use config::{Config, SamplingConfig};
pub use inference::backend::{Engine, EngineError};
pub use session::{
    Completion, FinishReason, InferenceSession, SessionController, SessionError, SessionState,
};
