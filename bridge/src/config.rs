//! Configuration for the bridge and for the engines it creates.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::retry::RetryPolicy;

/// Default capacity of stream buffers.
pub const DEFAULT_STREAM_BUFFER: usize = 100;

/// Bridge configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Items a stream buffers before dropping the oldest
    pub stream_buffer: usize,
    /// Policy used by the `*_with_retry` helpers
    pub retry: RetryPolicy,
    /// Timeout applied to single-shot operations without explicit options
    pub operation_timeout: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stream_buffer: DEFAULT_STREAM_BUFFER,
            retry: RetryPolicy::default(),
            operation_timeout: None,
        }
    }
}

impl BridgeConfig {
    /// Load `.env` if present, then read the environment.
    pub fn load() -> std::result::Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Load configuration from environment variables.
    ///
    /// - `TETHER_STREAM_BUFFER`
    /// - `TETHER_RETRY_MAX_ATTEMPTS`
    /// - `TETHER_RETRY_INITIAL_DELAY_MS`
    /// - `TETHER_OP_TIMEOUT_MS` (unset or `0` disables the timeout)
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> std::result::Result<Self, ConfigError> {
        let defaults = Self::default();

        let stream_buffer = parse_var(&lookup, "TETHER_STREAM_BUFFER")?
            .unwrap_or(defaults.stream_buffer);
        if stream_buffer == 0 {
            return Err(ConfigError::MustBePositive("TETHER_STREAM_BUFFER"));
        }

        let max_attempts = parse_var(&lookup, "TETHER_RETRY_MAX_ATTEMPTS")?
            .unwrap_or(defaults.retry.max_attempts);
        if max_attempts == 0 {
            return Err(ConfigError::MustBePositive("TETHER_RETRY_MAX_ATTEMPTS"));
        }

        let initial_delay = parse_var(&lookup, "TETHER_RETRY_INITIAL_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry.initial_delay);

        let operation_timeout = parse_var::<u64>(&lookup, "TETHER_OP_TIMEOUT_MS")?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        Ok(Self {
            stream_buffer,
            retry: RetryPolicy {
                max_attempts,
                initial_delay,
            },
            operation_timeout,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> std::result::Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid {var} value: {value:?}")]
    InvalidValue { var: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),
}

/// Options for one engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Blob store directory (required)
    pub storage_path: PathBuf,
    /// Whether to use relay servers
    pub relay_enabled: bool,
    /// Relay to use instead of the default ones
    pub custom_relay_url: Option<String>,
    /// Whether the node can create, join and sync documents
    pub docs_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::new(),
            relay_enabled: true,
            custom_relay_url: None,
            docs_enabled: false,
        }
    }
}

impl EngineConfig {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            ..Self::default()
        }
    }

    pub fn with_docs(mut self) -> Self {
        self.docs_enabled = true;
        self
    }

    pub fn with_relay(mut self, url: impl Into<String>) -> Self {
        self.relay_enabled = true;
        self.custom_relay_url = Some(url.into());
        self
    }

    pub fn without_relay(mut self) -> Self {
        self.relay_enabled = false;
        self.custom_relay_url = None;
        self
    }

    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| BridgeError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the config before it reaches the native layer.
    pub fn validate(&self) -> Result<()> {
        let path = self.storage_path.to_str().ok_or_else(|| {
            BridgeError::InvalidConfiguration("storage path is not valid UTF-8".into())
        })?;
        if path.trim().is_empty() {
            return Err(BridgeError::InvalidConfiguration(
                "storage path is required".into(),
            ));
        }
        if path.contains('\0') {
            return Err(BridgeError::InvalidConfiguration(
                "storage path contains a null byte".into(),
            ));
        }

        if let Some(url) = &self.custom_relay_url {
            if !self.relay_enabled {
                return Err(BridgeError::InvalidConfiguration(
                    "custom relay url set while relays are disabled".into(),
                ));
            }
            let valid = (url.starts_with("https://") || url.starts_with("http://"))
                && !url.contains('\0');
            if !valid {
                return Err(BridgeError::InvalidConfiguration(format!(
                    "invalid relay url: {url}"
                )));
            }
        }
        Ok(())
    }
}
