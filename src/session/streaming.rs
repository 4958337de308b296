//! Async streaming over a session.
//!
//! The generation loop is blocking, so [`spawn_generation`] moves the session
//! onto a blocking tokio task that drives one turn and forwards each fragment
//! as a [`GenerationEvent`] over a channel. The session is handed back by
//! [`GenerationStream::finish`].

use futures::stream::Stream;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::inference::backend::Engine;
use crate::session::{Completion, FinishReason, InferenceSession, SessionController};

/// A streamed generation event.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// A new fragment was generated.
    Token { text: String },
    /// Generation is complete.
    Done {
        reason: FinishReason,
        completion_tokens: u64,
        context_used: usize,
        tokens_per_second: f32,
    },
    /// Starting or stepping the completion failed.
    Error(String),
}

/// Receiving side of a running turn.
pub struct GenerationStream<E: Engine + 'static> {
    events: mpsc::Receiver<GenerationEvent>,
    controller: SessionController,
    task: JoinHandle<InferenceSession<E>>,
}

/// Run one turn for `prompt` on a blocking task, streaming its fragments.
pub fn spawn_generation<E: Engine + 'static>(
    mut session: InferenceSession<E>,
    prompt: String,
) -> GenerationStream<E> {
    let (tx, rx) = mpsc::channel(32);
    let controller = session.controller();

    let task = tokio::task::spawn_blocking(move || {
        if let Err(e) = session.start_completion(&prompt) {
            let _ = tx.blocking_send(GenerationEvent::Error(e.to_string()));
            return session;
        }

        loop {
            match session.completion_loop() {
                Ok(Completion::Fragment(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    if tx.blocking_send(GenerationEvent::Token { text }).is_err() {
                        // Receiver dropped: stop, but keep stepping so the
                        // turn is finalized.
                        debug!(session_id = %session.id(), "Receiver dropped, stopping");
                        session.stop_completion();
                    }
                }
                Ok(Completion::EndOfGeneration) => {
                    let telemetry = session.telemetry();
                    let _ = tx.blocking_send(GenerationEvent::Done {
                        reason: session
                            .last_finish_reason()
                            .unwrap_or(FinishReason::EndToken),
                        completion_tokens: telemetry.tokens_generated,
                        context_used: telemetry.context_used,
                        tokens_per_second: telemetry.tokens_per_second,
                    });
                    break;
                }
                Err(e) => {
                    warn!(session_id = %session.id(), "Generation failed: {e}");
                    let _ = tx.blocking_send(GenerationEvent::Error(e.to_string()));
                    break;
                }
            }
        }
        session
    });

    GenerationStream {
        events: rx,
        controller,
        task,
    }
}

impl<E: Engine + 'static> GenerationStream<E> {
    /// Next event, or `None` once the turn is over.
    pub async fn recv(&mut self) -> Option<GenerationEvent> {
        self.events.recv().await
    }

    /// Request cancellation. The stream still ends with `Done`.
    pub fn stop(&self) {
        self.controller.stop_completion();
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    /// Wait for the turn to end and take the session back.
    ///
    /// Remaining events are discarded.
    pub async fn finish(self) -> Result<InferenceSession<E>, JoinError> {
        drop(self.events);
        self.task.await
    }

    /// Split into a `Stream` of events and a handle that yields the session.
    pub fn into_parts(
        self,
    ) -> (
        impl Stream<Item = GenerationEvent>,
        SessionController,
        JoinHandle<InferenceSession<E>>,
    ) {
        (ReceiverStream::new(self.events), self.controller, self.task)
    }
}
