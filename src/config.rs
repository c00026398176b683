//! Session configuration
//!
//! Every knob a session recognises, with validation and JSON persistence.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{InferenceError, Result};

/// Constraint applied to generated output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StructuredOutput {
    /// Unconstrained sampling
    #[default]
    None,
    /// Output must be a JSON value (built-in grammar)
    Json,
    /// Caller-supplied GBNF grammar starting at `root`
    Grammar { grammar: String, root: String },
}

/// Session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Context window size in tokens
    pub context_size: u32,
    /// Maximum tokens submitted per decode call
    pub batch_size: u32,
    /// Worker thread count (auto-computed when absent)
    pub threads: Option<i32>,
    /// Temperature for sampling (0.0 = near-greedy)
    pub temperature: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: i32,
    /// Top-p (nucleus) sampling parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Locally typical sampling parameter (1.0 = disabled)
    pub typical_p: f32,
    /// Number of recent tokens the repetition penalty looks at
    pub penalty_last_n: i32,
    /// Repetition penalty factor (1.0 = disabled)
    pub penalty_repeat: f32,
    /// Random seed for sampling (engine default when absent)
    pub seed: Option<u32>,
    /// Extra strings that end generation when produced
    pub stop_sequences: Vec<String>,
    /// Grammar constraint applied as the last sampler stage
    pub structured_output: StructuredOutput,
    /// Maximum number of tokens generated per request
    pub max_tokens: u32,
    /// Number of layers to offload to GPU (0 = CPU only)
    pub gpu_layers: u32,
    /// Positions at the start of the sequence that compaction never drops
    pub keep_head: u32,
    /// Fraction of the context compaction aims to leave occupied
    pub target_usage: f32,
    /// Route native engine logs into tracing and log cache bookkeeping at info
    pub verbose: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            context_size: 4096,
            batch_size: 512,
            threads: None,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            typical_p: 1.0,
            penalty_last_n: 64,
            penalty_repeat: 1.1,
            seed: None,
            stop_sequences: Vec::new(),
            structured_output: StructuredOutput::None,
            max_tokens: 2048,
            gpu_layers: 0,
            keep_head: 128,
            target_usage: 0.6,
            verbose: false,
        }
    }
}

impl SessionConfig {
    /// Thread count actually handed to the engine
    pub fn resolved_threads(&self) -> i32 {
        self.threads.unwrap_or_else(default_thread_count)
    }

    /// Checks every parameter and reports the first violation
    pub fn validate(&self) -> Result<()> {
        if self.context_size == 0 {
            return Err(invalid("context_size must be greater than 0"));
        }
        let threads = self.resolved_threads();
        if threads <= 0 {
            return Err(invalid(format!(
                "thread count must be greater than 0, got {threads}"
            )));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size must be greater than 0"));
        }
        // NaN fails every comparison, so the checks are phrased to reject it
        if !(self.temperature >= 0.0) {
            return Err(invalid(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if self.top_k < 0 {
            return Err(invalid(format!("top_k must be >= 0, got {}", self.top_k)));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(invalid(format!(
                "top_p must be within [0, 1], got {}",
                self.top_p
            )));
        }
        if !(0.0..=1.0).contains(&self.typical_p) {
            return Err(invalid(format!(
                "typical_p must be within [0, 1], got {}",
                self.typical_p
            )));
        }
        if self.penalty_last_n < 0 {
            return Err(invalid(format!(
                "penalty_last_n must be >= 0, got {}",
                self.penalty_last_n
            )));
        }
        if !(self.penalty_repeat >= 0.0) {
            return Err(invalid(format!(
                "penalty_repeat must be >= 0, got {}",
                self.penalty_repeat
            )));
        }
        if !(self.target_usage > 0.0 && self.target_usage <= 1.0) {
            return Err(invalid(format!(
                "target_usage must be within (0, 1], got {}",
                self.target_usage
            )));
        }
        if let StructuredOutput::Grammar { grammar, root } = &self.structured_output {
            if grammar.trim().is_empty() || root.trim().is_empty() {
                return Err(invalid("custom grammar requires both a grammar and a root rule"));
            }
        }
        Ok(())
    }

    /// Loads settings from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| InferenceError::Config(format!("{}: {e}", path.display())))?;
        let config: SessionConfig = serde_json::from_str(&json)
            .map_err(|e| InferenceError::Config(format!("{}: {e}", path.display())))?;
        tracing::debug!("Loaded session config from {}", path.display());
        Ok(config)
    }

    /// Loads settings from the default location, falling back to defaults if absent
    pub fn load_or_default() -> Result<Self> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => {
                tracing::info!("Config file not found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Saves settings as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| InferenceError::Config(e.to_string()))?;
        }
        let json =
            serde_json::to_string_pretty(self).map_err(|e| InferenceError::Config(e.to_string()))?;
        fs::write(path, json).map_err(|e| InferenceError::Config(e.to_string()))?;
        tracing::debug!("Saved session config to {}", path.display());
        Ok(())
    }
}

/// Platform config location, e.g. `~/.config/kvchat/config.json` on Linux
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "kvchat", "kvchat")
        .map(|dirs| dirs.config_dir().join("config.json"))
}

/// `clamp(processors - 2, 1, 8)`, leaving headroom for the host
pub fn default_thread_count() -> i32 {
    let processors = std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(1);
    (processors - 2).clamp(1, 8)
}

fn invalid(reason: impl Into<String>) -> InferenceError {
    InferenceError::InvalidParameter(reason.into())
}
