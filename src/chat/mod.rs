//! Conversation state and prompt rendering.
//!
//! - [`history`]: Chat roles, turns, and the append-only history
//! - [`template`]: Turn-to-text rendering for the engine

pub mod history;
pub mod template;
