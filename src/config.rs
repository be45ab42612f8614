//! Engine configuration: defaults, an optional TOML file, then environment.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::gateway::ProviderKind;

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

pub const ENV_API_KEY: &str = "CCSI_API_KEY";
pub const ENV_ENDPOINT: &str = "CCSI_ORACLE_ENDPOINT";
pub const ENV_MODEL: &str = "CCSI_MODEL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

/// Everything the engine needs, passed in at construction.
#[derive(Clone)]
pub struct EngineConfig {
    pub provider: ProviderKind,
    /// Base URL override; the provider's public endpoint when unset.
    pub oracle_endpoint: Option<String>,
    pub api_credential: Option<String>,
    pub model: String,
    pub temperature: Option<f32>,
    /// Total attempts per record, first one included.
    pub max_retries: u32,
    pub retry_backoff_base: Duration,
    pub request_timeout: Duration,
    pub inter_call_delay: Duration,
    pub min_note_length: usize,
    pub min_source_count: usize,
    pub cache_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Gemini,
            oracle_endpoint: None,
            api_credential: None,
            model: DEFAULT_MODEL.to_string(),
            temperature: None,
            max_retries: 3,
            retry_backoff_base: Duration::from_secs(2),
            request_timeout: Duration::from_secs(120),
            inter_call_delay: Duration::from_millis(1500),
            min_note_length: 80,
            min_source_count: 3,
            cache_path: None,
        }
    }
}

// The credential never reaches logs, even via `{:?}`.
impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("provider", &self.provider)
            .field("oracle_endpoint", &self.oracle_endpoint)
            .field(
                "api_credential",
                &self.api_credential.as_ref().map(|_| "<redacted>"),
            )
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_base", &self.retry_backoff_base)
            .field("request_timeout", &self.request_timeout)
            .field("inter_call_delay", &self.inter_call_delay)
            .field("min_note_length", &self.min_note_length)
            .field("min_source_count", &self.min_source_count)
            .field("cache_path", &self.cache_path)
            .finish()
    }
}

/// On-disk shape. Durations are in (fractional) seconds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    provider: Option<ProviderKind>,
    oracle_endpoint: Option<String>,
    api_credential: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    max_retries: Option<u32>,
    retry_backoff_base: Option<f64>,
    request_timeout: Option<f64>,
    inter_call_delay: Option<f64>,
    min_note_length: Option<usize>,
    min_source_count: Option<usize>,
    cache_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Defaults, overlaid by `path` when given, overlaid by the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        let file: ConfigFile = toml::from_str(text)?;
        let mut config = Self::default();
        if let Some(v) = file.provider {
            config.provider = v;
        }
        config.oracle_endpoint = file.oracle_endpoint.or(config.oracle_endpoint);
        config.api_credential = file.api_credential.or(config.api_credential);
        if let Some(v) = file.model {
            config.model = v;
        }
        config.temperature = file.temperature.or(config.temperature);
        if let Some(v) = file.max_retries {
            config.max_retries = v;
        }
        if let Some(v) = file.retry_backoff_base {
            config.retry_backoff_base = seconds(v);
        }
        if let Some(v) = file.request_timeout {
            config.request_timeout = seconds(v);
        }
        if let Some(v) = file.inter_call_delay {
            config.inter_call_delay = seconds(v);
        }
        if let Some(v) = file.min_note_length {
            config.min_note_length = v;
        }
        if let Some(v) = file.min_source_count {
            config.min_source_count = v;
        }
        config.cache_path = file.cache_path.or(config.cache_path);
        Ok(config)
    }

    /// Environment wins over the file. The provider-specific key variables
    /// are only consulted when neither `CCSI_API_KEY` nor the file set one.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty(ENV_API_KEY) {
            self.api_credential = Some(key);
        } else if self.api_credential.is_none() {
            let fallback = match self.provider {
                ProviderKind::Gemini => "GEMINI_API_KEY",
                ProviderKind::OpenRouter => "OPENROUTER_API_KEY",
            };
            self.api_credential = non_empty(fallback);
        }
        if let Some(endpoint) = non_empty(ENV_ENDPOINT) {
            self.oracle_endpoint = Some(endpoint);
        }
        if let Some(model) = non_empty(ENV_MODEL) {
            self.model = model;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "max_retries",
                message: "must allow at least one attempt".to_string(),
            });
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "model",
                message: "must not be empty".to_string(),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "request_timeout",
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn endpoint(&self) -> String {
        self.oracle_endpoint
            .clone()
            .unwrap_or_else(|| self.provider.default_endpoint().to_string())
    }
}

fn seconds(v: f64) -> Duration {
    Duration::try_from_secs_f64(v.max(0.0)).unwrap_or(Duration::ZERO)
}
