//! Engine boundary.
//!
//! - [`backend`]: The [`Engine`](backend::Engine) trait every model-execution engine implements
//! - [`handle`]: Single-owner wrapper around a loaded engine context
//! - [`model_loader`]: GGUF header probing and model metadata
//! - [`stub`]: Deterministic in-process engine

pub mod backend;
pub mod handle;
pub mod model_loader;
pub mod stub;
