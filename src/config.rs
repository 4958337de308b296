//! Runtime configuration for llm-session.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Everything a session needs at load time lives in [`SamplingConfig`], which is
//! treated as immutable once a session has been created.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chat::template::PromptTemplate;

/// ChatML, the default prompt template.
pub const CHATML_TEMPLATE: &str = "<|im_start|>{role}\n{content}<|im_end|>\n";

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "llm-session", about = "Interactive chat over a local LLM engine")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Model file, overrides the path in the configuration file.
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Run a single completion for this prompt and exit.
    #[arg(short, long)]
    pub prompt: Option<String>,

    /// System prompt added before the first turn.
    #[arg(short, long)]
    pub system: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,

    /// Print session metrics (Prometheus text format) on exit.
    #[arg(long)]
    pub metrics: bool,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("temperature must be a finite value >= 0, got {0}")]
    Temperature(f32),

    #[error("{name} must be within [0, 1], got {value}")]
    Probability { name: &'static str, value: f32 },

    #[error("thread_count must be at least 1")]
    ThreadCount,

    #[error("invalid prompt template: {0}")]
    Template(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model configuration.
    pub model: ModelConfig,

    /// Generation and context settings for the session.
    pub sampling: SamplingConfig,
}

/// Model-related settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Path to the GGUF model file.
    pub model_path: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model.gguf"),
        }
    }
}

/// Generation parameters and engine resource settings.
///
/// Created once per session. Reconfiguring means closing the session and
/// loading a new one with a different value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Sampling temperature (0.0 = greedy).
    pub temperature: f32,

    /// Nucleus sampling threshold.
    pub top_p: f32,

    /// Minimum probability relative to the most likely token.
    pub min_p: f32,

    /// Cap on candidate tokens (0 = unlimited).
    pub top_k: u32,

    /// Probability of applying exclude-top-choices sampling.
    pub xtc_p: f32,

    /// Probability threshold above which top choices are excluded.
    pub xtc_t: f32,

    /// Context window in tokens. 0 uses the model's trained context length.
    pub context_size: usize,

    /// Compute threads for the engine.
    pub thread_count: usize,

    /// Memory-map the model file instead of reading it into the heap.
    pub use_mmap: bool,

    /// Lock model weights in RAM.
    pub use_mlock: bool,

    /// Keep the conversation across turns.
    pub persist_history: bool,

    /// Per-turn template with `{role}` and `{content}` placeholders.
    pub prompt_template: String,

    /// Tokens kept free for generation when a new prompt is primed.
    pub generation_headroom: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_p: 0.9,
            min_p: 0.1,
            top_k: 40,
            xtc_p: 0.0,
            xtc_t: 1.0,
            context_size: 2048,
            thread_count: 4,
            use_mmap: true,
            use_mlock: false,
            persist_history: true,
            prompt_template: CHATML_TEMPLATE.to_string(),
            generation_headroom: 128,
        }
    }
}

impl SamplingConfig {
    /// Check value ranges and parse the prompt template.
    pub fn validate(&self) -> Result<PromptTemplate, ConfigError> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(ConfigError::Temperature(self.temperature));
        }
        for (name, value) in [
            ("top_p", self.top_p),
            ("min_p", self.min_p),
            ("xtc_p", self.xtc_p),
            ("xtc_t", self.xtc_t),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Probability { name, value });
            }
        }
        if self.thread_count == 0 {
            return Err(ConfigError::ThreadCount);
        }
        PromptTemplate::parse(&self.prompt_template)
            .map_err(|e| ConfigError::Template(e.to_string()))
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
