//! Configuration module for tus-uploadr
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Maximum number of retry delays accepted in `tus.retry_delays_ms`
pub const MAX_RETRY_DELAYS: usize = 10;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

lazy_static::lazy_static! {
    static ref ENV_VAR_RE: regex_lite::Regex =
        regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]+))?\}").unwrap();
}

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("MY_VAR", "value");
/// let result = expand_env_vars("prefix-${MY_VAR}-suffix");
/// assert_eq!(result, "prefix-value-suffix");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in ENV_VAR_RE.captures_iter(s) {
        let Some(full_match) = cap.get(0) else {
            continue;
        };
        let var_name = &cap[1];

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);

    result
}

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub tus: TusConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Build a configuration for the given endpoint with every other value defaulted
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            tus: TusConfig::with_endpoint(endpoint),
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tus = &self.tus;

        if !is_valid_http_url(&tus.endpoint) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid tus endpoint '{}': must start with http:// or https://",
                tus.endpoint
            )));
        }

        if tus.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "chunk_size must be greater than zero".into(),
            ));
        }

        if tus.progress_step_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "progress_step_bytes must be greater than zero".into(),
            ));
        }

        if tus.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "request_timeout_secs must be greater than zero".into(),
            ));
        }

        if tus.retry_delays_ms.len() > MAX_RETRY_DELAYS {
            return Err(ConfigError::ValidationError(format!(
                "At most {} retry delays are allowed, got {}",
                MAX_RETRY_DELAYS,
                tus.retry_delays_ms.len()
            )));
        }

        for key in tus.metadata.keys() {
            if key.is_empty() || key.contains([' ', ',']) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid metadata key '{}': must be non-empty without spaces or commas",
                    key
                )));
            }
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid logging format '{}': must be 'text' or 'json'",
                    other
                )))
            }
        }

        Ok(())
    }
}

/// tus server and transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TusConfig {
    /// Creation endpoint, e.g. `http://localhost:8080/tus-files/`
    pub endpoint: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// One delay per retry of a range, in milliseconds
    #[serde(default = "default_retry_delays_ms")]
    pub retry_delays_ms: Vec<u64>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_progress_step_bytes")]
    pub progress_step_bytes: usize,
    /// Extra headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Extra `Upload-Metadata` entries added on creation
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl TusConfig {
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            chunk_size: default_chunk_size(),
            retry_delays_ms: default_retry_delays_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            progress_step_bytes: default_progress_step_bytes(),
            headers: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }
}

fn default_chunk_size() -> u64 {
    5242880 // 5MB
}

fn default_retry_delays_ms() -> Vec<u64> {
    vec![0, 3000]
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_progress_step_bytes() -> usize {
    65536 // 64KB
}

/// Session controller configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Issue a tus termination request when a session is cancelled
    #[serde(default)]
    pub terminate_on_cancel: bool,
    /// JSON file remembering created resources; memory-only when absent
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}
