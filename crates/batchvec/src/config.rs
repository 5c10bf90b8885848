use std::path::Path;

use serde::Deserialize;

use crate::error::EmbedError;

/// Environment variable that overrides `endpoint.api_key` from the file.
pub const API_KEY_ENV: &str = "BATCHVEC_API_KEY";

pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

/// Remote endpoint settings. Everything the caller can tune lives here;
/// nothing is hardcoded at call sites.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Full URL of the embedding endpoint.
    pub url: String,
    /// Bearer token. The `BATCHVEC_API_KEY` environment variable takes
    /// precedence over this field.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Declared output dimensionality of the model behind the endpoint.
    pub dimensions: usize,
    /// Ask the server to silently truncate oversized inputs instead of
    /// rejecting them. The client never pre-validates length.
    #[serde(default)]
    pub truncate: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl EndpointConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.api_key.clone())
    }
}

/// Batch-level knobs: the admission-gate width and the optional row cap.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Maximum simultaneously open requests.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Optional cap on how many records are read from the input dataset.
    #[serde(default)]
    pub row_limit: Option<usize>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            row_limit: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchvecConfig {
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

impl BatchvecConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, EmbedError> {
        let cfg: Self = toml::from_str(raw).map_err(|e| EmbedError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, EmbedError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EmbedError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    fn validate(&self) -> Result<(), EmbedError> {
        if self.endpoint.url.trim().is_empty() {
            return Err(EmbedError::Config("endpoint.url must not be empty".into()));
        }
        if self.endpoint.dimensions == 0 {
            return Err(EmbedError::Config(
                "endpoint.dimensions must be positive".into(),
            ));
        }
        if self.batch.max_in_flight == 0 {
            return Err(EmbedError::Config(
                "batch.max_in_flight must be positive".into(),
            ));
        }
        Ok(())
    }
}
