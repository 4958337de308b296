//! Inference sessions.
//!
//! An [`InferenceSession`] owns one loaded engine context and one chat
//! history, and runs a pull-based generation loop: [`start_completion`]
//! primes the context, then every [`completion_loop`] call produces at most
//! one token. A [`SessionController`] obtained from the session can stop the
//! loop and read telemetry from another thread.
//!
//! - [`error`]: Session errors
//! - [`state`]: Idle/Generating/Cancelling state and the controller handle
//! - [`telemetry`]: Throughput and context occupancy counters
//! - [`streaming`]: Async event stream over a session
//!
//! [`start_completion`]: InferenceSession::start_completion
//! [`completion_loop`]: InferenceSession::completion_loop

pub mod error;
pub mod state;
pub mod streaming;
pub mod telemetry;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::chat::history::{ChatHistory, ChatRole, ChatTurn};
use crate::chat::template::PromptTemplate;
use crate::config::SamplingConfig;
use crate::inference::backend::{Engine, EngineError, LoadParams, Step, TokenId};
use crate::inference::handle::EngineHandle;
use crate::inference::model_loader;

use state::Shared;

pub use error::SessionError;
pub use state::{SessionController, SessionState};
pub use telemetry::TelemetrySnapshot;

/// Boundary string for [`Completion::EndOfGeneration`].
pub const EOG_MARKER: &str = "[EOG]";

/// Result of one `completion_loop` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Text produced by one token. Empty while a multi-byte character is
    /// still incomplete.
    Fragment(String),
    /// The turn is over.
    EndOfGeneration,
}

impl Completion {
    pub fn is_end(&self) -> bool {
        matches!(self, Completion::EndOfGeneration)
    }

    /// String form used across FFI-style boundaries, with `[EOG]` for the end.
    pub fn as_boundary_str(&self) -> &str {
        match self {
            Completion::Fragment(text) => text,
            Completion::EndOfGeneration => EOG_MARKER,
        }
    }
}

/// Why the last turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The engine sampled its end-of-generation token.
    EndToken,
    /// The context window is full.
    ContextFull,
    /// A stop was requested.
    Cancelled,
}

/// A chat session over one loaded engine context.
pub struct InferenceSession<E: Engine> {
    engine: EngineHandle<E>,
    config: SamplingConfig,
    template: PromptTemplate,
    context_size: usize,
    history: ChatHistory,
    shared: Arc<Shared>,

    /// Tokens held by the engine context. Mirrored into telemetry.
    occupied: usize,
    /// Rendered conversation already fed to the engine (persisted history only).
    rendered: String,
    /// Text generated so far in the current turn.
    response: String,
    /// Bytes of an incomplete UTF-8 character.
    carry: Vec<u8>,
    finish_reason: Option<FinishReason>,
}

impl<E: Engine> InferenceSession<E> {
    /// Load a model and create an idle session with an empty history.
    ///
    /// The model file is probed first; a missing file, a non-GGUF file, or an
    /// engine allocation failure all surface as [`SessionError::ModelLoad`].
    pub fn load(
        engine: Arc<E>,
        path: impl AsRef<Path>,
        config: SamplingConfig,
    ) -> Result<Self, SessionError> {
        let path = path.as_ref();
        let template = config.validate()?;

        let metadata = model_loader::load_metadata(path)
            .map_err(|e| SessionError::ModelLoad(e.to_string()))?;
        let context_size = match config.context_size {
            0 => metadata
                .context_length
                .and_then(|n| usize::try_from(n).ok())
                .filter(|&n| n > 0)
                .ok_or_else(|| {
                    SessionError::ModelLoad("model does not declare a context length".into())
                })?,
            n => n,
        };

        let params = LoadParams::from_config(&config, context_size);
        let engine = EngineHandle::load(engine, path, &params)
            .map_err(|e| SessionError::ModelLoad(e.to_string()))?;

        let id = Uuid::new_v4();
        info!(
            session_id = %id,
            path = %path.display(),
            context_size,
            threads = config.thread_count,
            mmap = config.use_mmap,
            mlock = config.use_mlock,
            persist_history = config.persist_history,
            "Session loaded"
        );

        Ok(Self {
            engine,
            config,
            template,
            context_size,
            history: ChatHistory::new(),
            shared: Arc::new(Shared::new(id, context_size)),
            occupied: 0,
            rendered: String::new(),
            response: String::new(),
            carry: Vec::new(),
            finish_reason: None,
        })
    }

    /// Unique id, attached to every log line of this session.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Configuration the session was loaded with.
    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Context window in tokens, after resolving a configured size of 0.
    pub fn context_size(&self) -> usize {
        self.context_size
    }

    /// Conversation so far, including turns no longer held in the context.
    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    /// Current generation state.
    pub fn state(&self) -> SessionState {
        self.shared.state.get()
    }

    /// Why the last turn ended, `None` before the first turn or after a failed one.
    pub fn last_finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Handle for stopping generation and reading telemetry from other threads.
    pub fn controller(&self) -> SessionController {
        SessionController::new(Arc::clone(&self.shared))
    }

    /// Append a turn. `role` must be `system`, `user` or `assistant`.
    ///
    /// Only allowed while idle. The engine sees the turn when the next
    /// completion starts.
    pub fn add_message(&mut self, role: &str, text: &str) -> Result<(), SessionError> {
        if self.state() != SessionState::Idle {
            return Err(SessionError::SessionBusy);
        }
        let role: ChatRole = role.parse()?;
        self.history.push(ChatTurn::new(role, text));
        Ok(())
    }

    pub fn add_system_prompt(&mut self, text: &str) -> Result<(), SessionError> {
        self.add_message(ChatRole::System.as_str(), text)
    }

    pub fn add_user_message(&mut self, text: &str) -> Result<(), SessionError> {
        self.add_message(ChatRole::User.as_str(), text)
    }

    pub fn add_assistant_message(&mut self, text: &str) -> Result<(), SessionError> {
        self.add_message(ChatRole::Assistant.as_str(), text)
    }

    /// Render and prime the prompt, moving the session from Idle to Generating.
    ///
    /// Produces no token; the first one comes from the next
    /// [`completion_loop`](Self::completion_loop) call. On error the session
    /// is Idle again and the history is unchanged.
    pub fn start_completion(&mut self, prompt: &str) -> Result<(), SessionError> {
        if self.shared.state.begin().is_err() {
            return Err(SessionError::SessionBusy);
        }
        if let Err(e) = self.prime_turn(prompt) {
            self.shared.state.finish();
            return Err(e);
        }
        Ok(())
    }

    fn prime_turn(&mut self, prompt: &str) -> Result<(), SessionError> {
        self.shared.telemetry.reset_turn();
        self.response.clear();
        self.carry.clear();
        self.finish_reason = None;

        let user_turn = (!prompt.is_empty()).then(|| ChatTurn::new(ChatRole::User, prompt));
        let turns: Vec<&ChatTurn> = if self.config.persist_history {
            self.history.turns().iter().chain(user_turn.as_ref()).collect()
        } else {
            user_turn.as_ref().or(self.history.last()).into_iter().collect()
        };

        // With persisted history the context already holds the earlier
        // conversation, so only the new suffix is fed.
        let mut delta = None;
        if self.config.persist_history && !self.rendered.is_empty() {
            let full = self.template.render(turns.iter().copied(), true);
            if let Some(suffix) = full.strip_prefix(self.rendered.as_str()) {
                delta = Some(suffix.to_string());
            }
        }

        let (tokens, retained, skipped_turns) = match delta {
            Some(text) => {
                let tokens = self
                    .engine
                    .tokenize(&text, self.occupied == 0)
                    .map_err(|e| SessionError::Tokenization(e.to_string()))?;
                (tokens, self.occupied, 0)
            }
            None => {
                let (tokens, skipped) = self.fit_turns(&turns)?;
                (tokens, 0, skipped)
            }
        };

        if tokens.len() > self.context_size {
            return Err(SessionError::ContextOverflow {
                prompt_tokens: tokens.len(),
                context_size: self.context_size,
            });
        }

        // Sliding window: drop the oldest tokens until prompt plus headroom fits.
        let needed = retained + tokens.len() + self.config.generation_headroom;
        let slide = needed.saturating_sub(self.context_size).min(retained);
        let evicted = (self.occupied - retained) + slide;

        if let Err(e) = self.evict(evicted).and_then(|()| self.engine.prime(&tokens)) {
            self.clear_context();
            return Err(e.into());
        }
        self.occupied += tokens.len();
        self.shared.telemetry.set_context_used(self.occupied);

        if self.config.persist_history {
            if let Some(turn) = user_turn {
                self.history.push(turn);
            }
        } else {
            self.history.clear();
        }

        info!(
            session_id = %self.shared.id,
            prompt_tokens = tokens.len(),
            evicted,
            skipped_turns,
            context_used = self.occupied,
            context_size = self.context_size,
            "Completion started"
        );
        Ok(())
    }

    /// Render `turns` for an empty context, leaving out the oldest turns until
    /// the prompt plus headroom fits. The newest turn is always kept.
    ///
    /// Returns the tokens and how many turns were left out.
    fn fit_turns(&self, turns: &[&ChatTurn]) -> Result<(Vec<TokenId>, usize), SessionError> {
        let budget = self
            .context_size
            .saturating_sub(self.config.generation_headroom);
        let mut first = 0;
        loop {
            let text = self.template.render(turns[first..].iter().copied(), true);
            let tokens = self
                .engine
                .tokenize(&text, true)
                .map_err(|e| SessionError::Tokenization(e.to_string()))?;
            if tokens.len() <= budget || first + 1 >= turns.len() {
                if first > 0 {
                    debug!(
                        session_id = %self.shared.id,
                        skipped_turns = first,
                        prompt_tokens = tokens.len(),
                        "Oldest turns left out of the context"
                    );
                }
                return Ok((tokens, first));
            }
            first += 1;
        }
    }

    /// Produce the next fragment of the response.
    ///
    /// Returns [`Completion::EndOfGeneration`] exactly once per turn: when the
    /// engine emits its end token, when the context is full, or on the first
    /// call after a stop request. The session is Idle afterwards.
    pub fn completion_loop(&mut self) -> Result<Completion, SessionError> {
        match self.state() {
            SessionState::Idle => return Err(SessionError::NotGenerating),
            SessionState::Cancelling => return Ok(self.finish_turn(FinishReason::Cancelled)),
            SessionState::Generating => {}
        }
        if self.occupied >= self.context_size {
            return Ok(self.finish_turn(FinishReason::ContextFull));
        }

        let started = Instant::now();
        let token = match self.engine.step() {
            Ok(Step::Token(token)) => token,
            Ok(Step::EndOfGeneration) => return Ok(self.finish_turn(FinishReason::EndToken)),
            Err(e) => return Err(self.abort_turn(e)),
        };
        self.occupied += 1;
        self.shared.telemetry.set_context_used(self.occupied);

        let piece = match self.engine.decode(token) {
            Ok(piece) => piece,
            Err(e) => return Err(self.abort_turn(e)),
        };
        self.shared.telemetry.record_token(started.elapsed());

        self.carry.extend_from_slice(&piece);
        let fragment = drain_utf8(&mut self.carry);
        self.response.push_str(&fragment);
        trace!(token, fragment = %fragment, "Token generated");

        Ok(Completion::Fragment(fragment))
    }

    /// Request cancellation of the running completion. See
    /// [`SessionController::stop_completion`].
    pub fn stop_completion(&self) {
        self.shared.stop();
    }

    /// Run a whole turn and return the generated text.
    pub fn get_response(&mut self, prompt: &str) -> Result<String, SessionError> {
        self.start_completion(prompt)?;
        let mut response = String::new();
        while let Completion::Fragment(fragment) = self.completion_loop()? {
            response.push_str(&fragment);
        }
        Ok(response)
    }

    /// Tokens per second for the current or last turn, 0.0 before any token.
    pub fn generation_speed(&self) -> f32 {
        self.shared.telemetry.generation_speed()
    }

    /// Tokens currently occupying the context window.
    pub fn context_size_used(&self) -> usize {
        self.shared.telemetry.context_used()
    }

    /// Counters for the current or last turn.
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.shared.telemetry.snapshot()
    }

    /// Session metrics in the Prometheus text format.
    pub fn render_metrics(&self) -> String {
        self.shared.telemetry.render_metrics()
    }

    /// Release the engine context. Consumes the session.
    pub fn close(mut self) -> Result<(), SessionError> {
        if self.state() != SessionState::Idle {
            warn!(session_id = %self.shared.id, "Closing session with a completion in progress");
            self.shared.state.finish();
        }
        self.engine
            .release()
            .map_err(|e| SessionError::Release(e.to_string()))?;
        info!(session_id = %self.shared.id, "Session closed");
        Ok(())
    }

    fn finish_turn(&mut self, reason: FinishReason) -> Completion {
        // An incomplete trailing character was never returned, so it is dropped.
        self.carry.clear();
        let response = std::mem::take(&mut self.response);
        if self.config.persist_history {
            // Pushed even when empty: the context already holds the assistant
            // opener, and turns stay user/assistant alternating.
            self.history.push(ChatTurn::new(ChatRole::Assistant, response));
            self.rendered = self.template.render(self.history.turns(), false);
        }
        self.finish_reason = Some(reason);
        self.shared.state.finish();

        let telemetry = self.shared.telemetry.snapshot();
        info!(
            session_id = %self.shared.id,
            reason = ?reason,
            tokens = telemetry.tokens_generated,
            tokens_per_second = telemetry.tokens_per_second,
            context_used = telemetry.context_used,
            "Completion finished"
        );
        Completion::EndOfGeneration
    }

    fn abort_turn(&mut self, error: EngineError) -> SessionError {
        warn!(session_id = %self.shared.id, "Completion aborted: {error}");
        self.response.clear();
        self.carry.clear();
        self.clear_context();
        self.finish_reason = None;
        self.shared.state.finish();
        SessionError::Engine(error)
    }

    fn evict(&mut self, n_tokens: usize) -> Result<(), EngineError> {
        self.engine.evict_front(n_tokens)?;
        self.occupied -= n_tokens;
        self.shared.telemetry.set_context_used(self.occupied);
        if n_tokens > 0 {
            debug!(session_id = %self.shared.id, evicted = n_tokens, "Evicted context tokens");
        }
        Ok(())
    }

    /// Empty the engine context so the next turn is fed from scratch.
    fn clear_context(&mut self) {
        self.rendered.clear();
        if let Err(e) = self.evict(self.occupied) {
            warn!(session_id = %self.shared.id, "Failed to clear context: {e}");
        }
    }
}

/// Take the longest valid UTF-8 prefix out of `carry`.
///
/// An incomplete character at the end stays in `carry`; invalid sequences
/// become U+FFFD.
fn drain_utf8(carry: &mut Vec<u8>) -> String {
    let mut out = String::new();
    while !carry.is_empty() {
        let (valid, invalid) = match std::str::from_utf8(carry) {
            Ok(s) => (s.len(), None),
            Err(e) => (e.valid_up_to(), Some(e.error_len())),
        };
        out.push_str(&String::from_utf8_lossy(&carry[..valid]));
        match invalid {
            None => carry.clear(),
            Some(None) => {
                carry.drain(..valid);
                break;
            }
            Some(Some(len)) => {
                out.push(char::REPLACEMENT_CHARACTER);
                carry.drain(..valid + len);
            }
        }
    }
    out
}
