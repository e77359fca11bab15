//! Configuration file parser for ~/.config/newsdesk/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde, though we log a warning for each one
//! since they are usually typos.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::net::{NewsApiConfig, DEFAULT_BASE_URL};
use crate::storage::Category;

/// Environment variable that overrides `news_api_key`.
pub const API_KEY_ENV: &str = "NEWS_API_KEY";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// A key parsed but holds an unusable value
    #[error("Invalid value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// `Debug` masks `news_api_key`.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the news API, without a trailing endpoint.
    pub news_api_base_url: String,

    /// News API key (alternative to the NEWS_API_KEY env var).
    /// Env var takes precedence over config file.
    pub news_api_key: Option<String>,

    /// Two-letter country code for headlines.
    pub country: String,

    /// Articles requested per call.
    pub page_size: u32,

    pub request_timeout_secs: u64,

    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,

    /// First retry delay in milliseconds; doubles per retry.
    pub retry_backoff_ms: u64,

    /// Headline polling interval for `watch`.
    pub poll_interval_minutes: u64,

    /// Categories whose last raw batch stays in memory.
    pub raw_batch_memory_slots: usize,

    /// Category used when none is given on the command line.
    pub default_category: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            news_api_base_url: DEFAULT_BASE_URL.to_string(),
            news_api_key: None,
            country: "us".to_string(),
            page_size: 20,
            request_timeout_secs: 10,
            max_retries: 1,
            retry_backoff_ms: 500,
            poll_interval_minutes: 15,
            raw_batch_memory_slots: 8,
            default_category: "all".to_string(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("news_api_base_url", &self.news_api_base_url)
            .field(
                "news_api_key",
                &self.news_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("country", &self.country)
            .field("page_size", &self.page_size)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("poll_interval_minutes", &self.poll_interval_minutes)
            .field("raw_batch_memory_slots", &self.raw_batch_memory_slots)
            .field("default_category", &self.default_category)
            .finish()
    }
}

const KNOWN_KEYS: [&str; 10] = [
    "news_api_base_url",
    "news_api_key",
    "country",
    "page_size",
    "request_timeout_secs",
    "max_retries",
    "retry_backoff_ms",
    "poll_interval_minutes",
    "raw_batch_memory_slots",
    "default_category",
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    /// - Unusable values → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            base_url = %config.news_api_base_url,
            "Loaded configuration"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.category()?;
        if self.page_size == 0 || self.page_size > 100 {
            return Err(ConfigError::Invalid {
                key: "page_size",
                reason: format!("{} is outside 1..=100", self.page_size),
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "request_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.poll_interval_minutes == 0 {
            return Err(ConfigError::Invalid {
                key: "poll_interval_minutes",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// `default_category` parsed.
    pub fn category(&self) -> Result<Category, ConfigError> {
        self.default_category
            .parse()
            .map_err(|reason| ConfigError::Invalid {
                key: "default_category",
                reason,
            })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_minutes.saturating_mul(60))
    }

    /// Client settings, with the API key taken from `NEWS_API_KEY` if set.
    pub fn news_api_config(&self) -> NewsApiConfig {
        self.news_api_config_with_env(std::env::var(API_KEY_ENV).ok())
    }

    fn news_api_config_with_env(&self, env_key: Option<String>) -> NewsApiConfig {
        let api_key = non_blank(env_key)
            .or_else(|| non_blank(self.news_api_key.clone()))
            .map(SecretString::from);

        NewsApiConfig {
            base_url: self.news_api_base_url.clone(),
            api_key,
            country: self.country.clone(),
            page_size: self.page_size,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ============================================================================
// Tests
// ============================================================================
