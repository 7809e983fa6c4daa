//! TOML configuration for flowwatch.
//!
//! Every section carries compiled-in defaults so an empty (or missing) file is a
//! valid configuration. The config file path can be overridden with the
//! `FLOWWATCH_CONFIG` environment variable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "FLOWWATCH_CONFIG";

/// Config file picked up from the working directory when nothing else is given.
pub const LOCAL_CONFIG: &str = "flowwatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the flowwatch process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowwatchConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub baseline: BaselineConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub explain: ExplainConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl FlowwatchConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded flowwatch configuration");
        Ok(config)
    }

    /// Resolve the configuration, in order:
    /// 1. `explicit` (a `--config` argument); errors are fatal.
    /// 2. The path in `FLOWWATCH_CONFIG`; errors are fatal.
    /// 3. `./flowwatch.toml` if present.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&env_path))
                .with_context(|| format!("{CONFIG_ENV} is set but could not be loaded"));
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let m = &self.model;
        if !(m.contamination > 0.0 && m.contamination <= 0.5) {
            bail!(
                "model.contamination must be in (0, 0.5], got {}",
                m.contamination
            );
        }
        if m.n_estimators == 0 {
            bail!("model.n_estimators must be at least 1");
        }
        if m.max_samples < 2 {
            bail!("model.max_samples must be at least 2");
        }
        if self.baseline.source.is_none() && self.baseline.simulated_samples == 0 {
            bail!("baseline.simulated_samples must be at least 1 when no baseline file is set");
        }

        let p = &self.pipeline;
        if p.workers == 0 {
            bail!("pipeline.workers must be at least 1");
        }
        if p.queue_capacity == 0 {
            bail!("pipeline.queue_capacity must be at least 1");
        }
        if p.max_pending_explanations == 0 {
            bail!("pipeline.max_pending_explanations must be at least 1");
        }

        if self.explain.timeout_secs == 0 {
            bail!("explain.timeout_secs must be at least 1");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Anomaly store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite database file. Parent directories are created on open.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/anomalies.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Isolation forest parameters. Fixed for the lifetime of a fitted model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of isolation trees in the ensemble.
    pub n_estimators: usize,
    /// Expected fraction of the baseline labeled anomalous. This is the only
    /// contamination setting; nothing else overrides it.
    pub contamination: f64,
    /// Sub-sample size drawn for each tree (capped at the baseline size).
    pub max_samples: usize,
    /// Seed for tree construction. Same baseline + same seed = same labels.
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_estimators: 200,
            contamination: 0.03,
            max_samples: 256,
            seed: 42,
        }
    }
}

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

/// Where the startup baseline comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// JSONL file of observations assumed mostly normal. When unset a simulated
    /// narrow-band baseline is generated.
    pub source: Option<PathBuf>,
    /// Number of simulated baseline observations. The default covers the
    /// recommended baseline for the default ensemble size.
    pub simulated_samples: usize,
    /// Seed for the simulated baseline.
    pub seed: u64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            source: None,
            simulated_samples: 400,
            seed: 42,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Worker pool and persistence retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Workers draining the observation queue.
    pub workers: usize,
    /// Bounded queue between ingestion and the workers.
    pub queue_capacity: usize,
    /// Extra append attempts after the first failure.
    pub store_retries: u32,
    /// Linear backoff step between append attempts.
    pub retry_backoff_ms: u64,
    /// Explanation tasks allowed to run at once. Further anomalies wait for a
    /// slot without holding up the workers.
    pub max_pending_explanations: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            store_retries: 3,
            retry_backoff_ms: 100,
            max_pending_explanations: 64,
        }
    }
}

impl PipelineConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

// ---------------------------------------------------------------------------
// Explanation dispatch
// ---------------------------------------------------------------------------

/// Which reasoning service backs explanations and chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions endpoint.
    Openai,
    /// Deterministic local summaries, no network access.
    Local,
}

/// Reasoning service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplainConfig {
    pub provider: ProviderKind,
    /// Base URL of the chat completions API.
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Hard timeout for one explanation, retries included.
    pub timeout_secs: u64,
    /// Extra attempts after a failed call. Zero means a single attempt.
    pub retries: u32,
    /// Prior anomalies included as context.
    pub history_limit: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    pub chat_max_tokens: u32,
}

impl Default for ExplainConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Openai,
            endpoint: "https://api.openai.com".to_string(),
            model: "gpt-4".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 5,
            retries: 0,
            history_limit: 10,
            temperature: 0.5,
            max_tokens: 300,
            chat_max_tokens: 500,
        }
    }
}

impl ExplainConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// API key from the configured environment variable, if set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

/// HTTP listener for the query/chat API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}
