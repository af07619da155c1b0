//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};

/// Rate limiting algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
    LeakyBucket,
}

impl Strategy {
    /// All built-in strategies.
    pub const ALL: [Strategy; 4] = [
        Strategy::FixedWindow,
        Strategy::SlidingWindow,
        Strategy::TokenBucket,
        Strategy::LeakyBucket,
    ];

    /// The configuration name of this strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::FixedWindow => "fixed_window",
            Strategy::SlidingWindow => "sliding_window",
            Strategy::TokenBucket => "token_bucket",
            Strategy::LeakyBucket => "leaky_bucket",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        Strategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| TurnstileError::UnknownStrategy(s.to_string()))
    }
}

/// How the caller-facing identity of a request is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyBy {
    /// Remote IP address
    #[default]
    Ip,
    /// API key taken from a request header
    ApiKey,
    /// Bearer token from the `Authorization` header
    Token,
    /// User supplied extraction function
    Custom,
}

impl FromStr for KeyBy {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ip" => Ok(KeyBy::Ip),
            "api_key" => Ok(KeyBy::ApiKey),
            "token" => Ok(KeyBy::Token),
            "custom" => Ok(KeyBy::Custom),
            other => Err(TurnstileError::ConfigInvalid(format!(
                "unknown key_by value: {}",
                other
            ))),
        }
    }
}

/// Which sliding window implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlidingWindowMode {
    /// Exact timestamp log in a sorted set
    #[default]
    Precise,
    /// Two interpolated fixed-window counters
    Weighted,
}

/// Configuration for one rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Algorithm to run
    pub strategy: Strategy,

    /// How request identities are derived
    #[serde(default)]
    pub key_by: KeyBy,

    /// Maximum admissions per window
    pub limit: u64,

    /// Window length in milliseconds
    pub window_ms: u64,

    /// Redis connection string; absent or empty selects the in-process backend
    #[serde(default)]
    pub backend_url: Option<String>,

    /// Allow requests when the backend is unavailable
    #[serde(default)]
    pub fail_open: bool,

    /// Header carrying the API key when `key_by` is `api_key`
    #[serde(default)]
    pub header_key: Option<String>,

    /// Optional namespace prepended to every storage key
    #[serde(default)]
    pub namespace: Option<String>,

    /// Sliding window implementation
    #[serde(default)]
    pub sliding_window: SlidingWindowMode,

    /// Redis client tuning
    #[serde(default)]
    pub redis: RedisConfig,
}

impl LimiterConfig {
    /// Create a configuration with defaults for everything but the quota.
    pub fn new(strategy: Strategy, limit: u64, window: Duration) -> Self {
        Self {
            strategy,
            key_by: KeyBy::default(),
            limit,
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            backend_url: None,
            fail_open: false,
            header_key: None,
            namespace: None,
            sliding_window: SlidingWindowMode::default(),
            redis: RedisConfig::default(),
        }
    }

    /// The window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// The Redis URL, if a remote backend was requested.
    pub fn remote_url(&self) -> Option<&str> {
        self.backend_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    /// Check the quota is usable.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(TurnstileError::ConfigInvalid(
                "limit must be greater than zero".to_string(),
            ));
        }
        if self.window_ms == 0 {
            return Err(TurnstileError::ConfigInvalid(
                "window must be greater than zero".to_string(),
            ));
        }
        if let Some(namespace) = &self.namespace {
            if namespace.contains(':') {
                return Err(TurnstileError::ConfigInvalid(format!(
                    "namespace must not contain ':': {}",
                    namespace
                )));
            }
        }
        if let Some(header) = &self.header_key {
            if header.trim().is_empty() {
                return Err(TurnstileError::ConfigInvalid(
                    "header_key must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Redis client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Timeout for establishing a connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Read/write timeout per command
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,

    /// Connections kept open between calls
    #[serde(default = "default_max_idle")]
    pub max_idle_connections: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            io_timeout_ms: default_io_timeout(),
            max_idle_connections: default_max_idle(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    500
}

fn default_io_timeout() -> u64 {
    250
}

fn default_max_idle() -> usize {
    16
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration for the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// The limiter to build
    pub limiter: LimiterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TurnstileConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::ConfigInvalid(format!("failed to parse config: {}", e)))
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a YAML file and layer `TURNSTILE__*` environment variables on top.
    ///
    /// Nested keys are separated by a double underscore, e.g.
    /// `TURNSTILE__LIMITER__LIMIT=50`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading layered configuration");

        config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix("TURNSTILE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|layered| layered.try_deserialize())
            .map_err(|e| TurnstileError::ConfigInvalid(e.to_string()))
    }
}
