//! Generation state shared between the driver thread and controller threads.
//!
//! The only state written from more than one thread is the Idle/Generating/
//! Cancelling flag, kept in an atomic. A stop request is a compare-and-swap
//! from Generating to Cancelling; the driver observes it at the start of its
//! next call and never mid-step.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::session::telemetry::{Telemetry, TelemetrySnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Generating = 1,
    Cancelling = 2,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionState::Generating,
            2 => SessionState::Cancelling,
            _ => SessionState::Idle,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Generating => "generating",
            SessionState::Cancelling => "cancelling",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(SessionState::Idle as u8))
    }

    pub(crate) fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Idle -> Generating. Returns the state that blocked the transition.
    pub(crate) fn begin(&self) -> Result<(), SessionState> {
        self.0
            .compare_exchange(
                SessionState::Idle as u8,
                SessionState::Generating as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(SessionState::from_u8)
    }

    /// Generating -> Cancelling. Returns whether the transition happened.
    pub(crate) fn request_stop(&self) -> bool {
        self.0
            .compare_exchange(
                SessionState::Generating as u8,
                SessionState::Cancelling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn finish(&self) {
        self.0.store(SessionState::Idle as u8, Ordering::Release);
    }
}

/// State reachable from any thread.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) id: Uuid,
    pub(crate) state: StateCell,
    pub(crate) telemetry: Telemetry,
}

impl Shared {
    pub(crate) fn new(id: Uuid, context_size: usize) -> Self {
        Self {
            id,
            state: StateCell::new(),
            telemetry: Telemetry::new(context_size),
        }
    }

    pub(crate) fn stop(&self) {
        if self.state.request_stop() {
            debug!(session_id = %self.id, "Stop requested");
        }
    }
}

/// Cloneable handle for stopping a session and reading its telemetry from
/// another thread.
#[derive(Debug, Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Request cancellation of the running completion. Never blocks.
    ///
    /// No-op unless the session is generating. The in-flight step, if any,
    /// completes; the next completion call returns end-of-generation.
    pub fn stop_completion(&self) {
        self.shared.stop();
    }

    pub fn session_id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.get()
    }

    /// Tokens per second for the current or last turn.
    pub fn generation_speed(&self) -> f32 {
        self.shared.telemetry.generation_speed()
    }

    pub fn context_size_used(&self) -> usize {
        self.shared.telemetry.context_used()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.shared.telemetry.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), SessionState::Idle);

        // Stop while idle is a no-op.
        assert!(!cell.request_stop());
        assert_eq!(cell.get(), SessionState::Idle);

        cell.begin().unwrap();
        assert_eq!(cell.begin().unwrap_err(), SessionState::Generating);

        assert!(cell.request_stop());
        assert!(!cell.request_stop());
        assert_eq!(cell.get(), SessionState::Cancelling);
        assert_eq!(cell.begin().unwrap_err(), SessionState::Cancelling);

        cell.finish();
        assert_eq!(cell.get(), SessionState::Idle);
    }
}
