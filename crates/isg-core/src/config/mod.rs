//! Configuration management for isg.
//!
//! Configuration is loaded from multiple sources with the following priority:
//! 1. Environment variables (highest priority)
//! 2. Project-local `isg.toml` file
//! 3. User config `~/.config/isg/config.toml`
//! 4. Built-in defaults (lowest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

mod defaults;

pub use defaults::*;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Graph store configuration.
    pub store: StoreConfig,

    /// Hybrid retrieval configuration.
    pub retrieval: RetrievalConfig,

    /// Pattern knowledge base configuration.
    pub patterns: PatternConfig,

    /// Validator configuration.
    pub validator: ValidatorConfig,

    /// Safety gate configuration.
    pub gate: GateConfig,

    /// Embedding provider configuration.
    pub embedding: EmbeddingConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from default locations.
    ///
    /// Searches for config in order:
    /// 1. `./isg.toml` (project local)
    /// 2. `~/.config/isg/config.toml` (user config)
    /// 3. Falls back to defaults
    pub fn load() -> Result<Self, ConfigError> {
        if Path::new("isg.toml").exists() {
            return Self::from_file("isg.toml");
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("isg").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("ISG_DATA_DIR") {
            self.store.data_dir = dir;
        }

        if let Ok(provider) = std::env::var("ISG_EMBED_PROVIDER") {
            self.embedding.provider = provider;
        }
        if let Ok(model) = std::env::var("ISG_EMBED_MODEL") {
            self.embedding.model = Some(model);
        }
        if let Ok(url) = std::env::var("ISG_EMBED_BASE_URL") {
            self.embedding.base_url = Some(url);
        }
        if let Ok(key) = std::env::var("ISG_EMBED_API_KEY") {
            self.embedding.api_key = Some(key);
        }

        if let Ok(workers) = std::env::var("ISG_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.gate.workers = n;
            }
        }

        if let Ok(filter) = std::env::var("ISG_LOG") {
            self.logging.filter = filter;
        }
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.retrieval.weights;
        if [w.level, w.graph, w.vector, w.pattern]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(ConfigError::Invalid(
                "retrieval weights must be finite and non-negative".to_string(),
            ));
        }
        if self.retrieval.max_items == 0 {
            return Err(ConfigError::Invalid("retrieval.max_items must be > 0".to_string()));
        }
        if self.retrieval.chars_per_token == 0 {
            return Err(ConfigError::Invalid(
                "retrieval.chars_per_token must be > 0".to_string(),
            ));
        }

        let p = &self.patterns;
        if !(0.0..=2.0).contains(&p.high_severity_threshold)
            || p.medium_severity_threshold < p.high_severity_threshold
        {
            return Err(ConfigError::Invalid(format!(
                "severity thresholds must satisfy 0 <= high ({}) <= medium ({})",
                p.high_severity_threshold, p.medium_severity_threshold
            )));
        }
        if !(p.confidence_alpha > 0.0 && p.confidence_alpha <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "patterns.confidence_alpha must be in (0, 1], got {}",
                p.confidence_alpha
            )));
        }

        let v = &self.validator;
        if v.diagnostics_timeout_ms == 0 || v.build_timeout_ms == 0 || v.test_timeout_ms == 0 {
            return Err(ConfigError::Invalid("validator timeouts must be > 0".to_string()));
        }
        if v.diagnostic_norm == 0 {
            return Err(ConfigError::Invalid("validator.diagnostic_norm must be > 0".to_string()));
        }

        if self.gate.workers == 0 {
            return Err(ConfigError::Invalid("gate.workers must be > 0".to_string()));
        }

        Ok(())
    }

    /// Create a default config file content as a string.
    pub fn default_config_string() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Graph store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base directory for isg data (default: ".isg").
    pub data_dir: String,

    /// Database directory name inside `data_dir`.
    pub db_dir: String,

    /// Whether ingests and commits are written to the database.
    pub persist: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: DEFAULT_DATA_DIR.to_string(),
            db_dir: DEFAULT_DB_DIR.to_string(),
            persist: true,
        }
    }
}

impl StoreConfig {
    /// Full path to the database directory.
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.db_dir)
    }
}

/// Weights of the retrieval rank terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankWeights {
    /// Level priority (w1).
    pub level: f32,
    /// One minus normalized graph distance (w2).
    pub graph: f32,
    /// One minus normalized vector distance (w3).
    pub vector: f32,
    /// Pattern relevance (w4).
    pub pattern: f32,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            level: DEFAULT_WEIGHT_LEVEL,
            graph: DEFAULT_WEIGHT_GRAPH,
            vector: DEFAULT_WEIGHT_VECTOR,
            pattern: DEFAULT_WEIGHT_PATTERN,
        }
    }
}

/// Hybrid retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Maximum items in a shortlist.
    pub max_items: usize,

    /// Maximum nodes kept per traversal hop.
    pub max_per_hop: usize,

    /// Nearest neighbours requested from the vector index.
    pub vector_k: usize,

    /// Nearest patterns consulted for pattern relevance.
    pub pattern_k: usize,

    /// Rank term weights.
    pub weights: RankWeights,

    /// Budget used when a request does not carry one.
    pub default_token_budget: usize,

    /// Characters per token for budget estimation.
    pub chars_per_token: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            max_per_hop: DEFAULT_MAX_PER_HOP,
            vector_k: DEFAULT_VECTOR_K,
            pattern_k: DEFAULT_PATTERN_K,
            weights: RankWeights::default(),
            default_token_budget: DEFAULT_TOKEN_BUDGET,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

/// Pattern knowledge base configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// YAML pattern library. If not set, the built-in seed corpus is used.
    pub library_path: Option<PathBuf>,

    /// Distance below which an anti-pattern match is High severity.
    pub high_severity_threshold: f32,

    /// Distance below which an anti-pattern match is Medium severity.
    pub medium_severity_threshold: f32,

    /// Smoothing factor of the rolling average confidence.
    pub confidence_alpha: f32,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            library_path: None,
            high_severity_threshold: DEFAULT_HIGH_SEVERITY_THRESHOLD,
            medium_severity_threshold: DEFAULT_MEDIUM_SEVERITY_THRESHOLD,
            confidence_alpha: DEFAULT_CONFIDENCE_ALPHA,
        }
    }
}

/// Validator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Root of the cargo workspace being edited.
    pub workspace_root: PathBuf,

    /// Cargo binary.
    pub cargo_bin: String,

    /// Diagnostics phase budget (ms).
    pub diagnostics_timeout_ms: u64,

    /// Build phase budget (ms).
    pub build_timeout_ms: u64,

    /// Test phase budget (ms).
    pub test_timeout_ms: u64,

    /// Diagnostic count at which consistency reaches zero.
    pub diagnostic_norm: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            cargo_bin: DEFAULT_CARGO_BIN.to_string(),
            diagnostics_timeout_ms: DEFAULT_DIAGNOSTICS_TIMEOUT_MS,
            build_timeout_ms: DEFAULT_BUILD_TIMEOUT_MS,
            test_timeout_ms: DEFAULT_TEST_TIMEOUT_MS,
            diagnostic_norm: DEFAULT_DIAGNOSTIC_NORM,
        }
    }
}

/// Safety gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Concurrent validation tasks.
    pub workers: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
        }
    }
}

/// Embedding provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Provider name: "fastembed", "hash", or "openai-compatible".
    pub provider: String,

    /// Model name (provider-specific).
    pub model: Option<String>,

    /// Base URL for openai-compatible providers.
    pub base_url: Option<String>,

    /// API key (can also be set via environment variable).
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Vector dimension of the hashing embedder.
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: DEFAULT_EMBED_PROVIDER.to_string(),
            model: None,
            base_url: None,
            api_key: None,
            dimension: DEFAULT_EMBED_DIMENSION,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive.
    pub filter: String,

    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            json: false,
        }
    }
}
