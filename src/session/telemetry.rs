//! Per-session telemetry: generation throughput and context occupancy.
//!
//! Counters are written only by the driver thread but read from anywhere, so
//! they are plain atomics. The same updates feed a per-session Prometheus
//! registry for export.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use serde::Serialize;
use tracing::warn;

/// Point-in-time view of a session's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    /// Tokens generated in the current or last turn.
    pub tokens_generated: u64,
    /// Engine time spent generating them.
    pub elapsed: Duration,
    pub tokens_per_second: f32,
    pub context_used: usize,
    pub context_size: usize,
}

#[derive(Debug)]
struct SessionMetrics {
    registry: Registry,
    tokens_generated: IntCounter,
    context_used: IntGauge,
    step_seconds: Histogram,
}

impl SessionMetrics {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("llm_session".to_string()), None)?;

        let tokens_generated =
            IntCounter::new("tokens_generated_total", "Tokens generated across all turns")?;
        let context_used = IntGauge::new("context_tokens_used", "Tokens occupying the context")?;
        let step_seconds = Histogram::with_opts(
            HistogramOpts::new("step_seconds", "Engine time per generated token").buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
        )?;

        registry.register(Box::new(tokens_generated.clone()))?;
        registry.register(Box::new(context_used.clone()))?;
        registry.register(Box::new(step_seconds.clone()))?;

        Ok(Self {
            registry,
            tokens_generated,
            context_used,
            step_seconds,
        })
    }
}

#[derive(Debug)]
pub struct Telemetry {
    context_size: usize,
    context_used: AtomicUsize,
    tokens_generated: AtomicU64,
    generation_nanos: AtomicU64,
    metrics: Option<SessionMetrics>,
}

impl Telemetry {
    pub fn new(context_size: usize) -> Self {
        let metrics = match SessionMetrics::new() {
            Ok(m) => Some(m),
            Err(e) => {
                warn!("Session metrics disabled: {e}");
                None
            }
        };
        Self {
            context_size,
            context_used: AtomicUsize::new(0),
            tokens_generated: AtomicU64::new(0),
            generation_nanos: AtomicU64::new(0),
            metrics,
        }
    }

    /// Start counting a new turn.
    pub(crate) fn reset_turn(&self) {
        self.tokens_generated.store(0, Ordering::Release);
        self.generation_nanos.store(0, Ordering::Release);
    }

    pub(crate) fn record_token(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.generation_nanos.fetch_add(nanos, Ordering::AcqRel);
        self.tokens_generated.fetch_add(1, Ordering::AcqRel);
        if let Some(m) = &self.metrics {
            m.tokens_generated.inc();
            m.step_seconds.observe(elapsed.as_secs_f64());
        }
    }

    pub(crate) fn set_context_used(&self, tokens: usize) {
        self.context_used.store(tokens, Ordering::Release);
        if let Some(m) = &self.metrics {
            m.context_used.set(i64::try_from(tokens).unwrap_or(i64::MAX));
        }
    }

    pub fn context_size(&self) -> usize {
        self.context_size
    }

    pub fn context_used(&self) -> usize {
        self.context_used.load(Ordering::Acquire)
    }

    pub fn tokens_generated(&self) -> u64 {
        self.tokens_generated.load(Ordering::Acquire)
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.generation_nanos.load(Ordering::Acquire))
    }

    /// Tokens per second for the current or last turn, 0.0 before any token.
    pub fn generation_speed(&self) -> f32 {
        let tokens = self.tokens_generated();
        let secs = self.elapsed().as_secs_f64();
        if tokens == 0 || secs == 0.0 {
            return 0.0;
        }
        (tokens as f64 / secs) as f32
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            tokens_generated: self.tokens_generated(),
            elapsed: self.elapsed(),
            tokens_per_second: self.generation_speed(),
            context_used: self.context_used(),
            context_size: self.context_size,
        }
    }

    /// Metrics in the Prometheus text exposition format.
    pub fn render_metrics(&self) -> String {
        let Some(m) = &self.metrics else {
            return String::new();
        };
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&m.registry.gather(), &mut buffer) {
            warn!("Failed to encode metrics: {e}");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
