//! Configuration management for the operator console.
//!
//! Loaded from `config/console`, `/etc/relay/console` and `CONSOLE__`-prefixed
//! environment variables, later sources overriding earlier ones.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the console.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsoleConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Relay API client configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Event feed configuration
    #[serde(default)]
    pub feed: FeedConfig,

    /// Topics the session keeps subscribed
    #[serde(default)]
    pub subscriptions: SubscriptionConfig,

    /// Sensor status configuration
    #[serde(default)]
    pub sensors: SensorConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Relay API client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the relay server
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Author recorded on notes written by this console
    #[serde(default = "default_operator")]
    pub operator: String,
}

/// Event feed configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Interval between polls in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum number of entries kept in the feed
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

/// Subscription bootstrap configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    /// Topics subscribed when the session starts
    #[serde(default)]
    pub topics: Vec<String>,

    /// Interval between retries of failed subscriptions in seconds
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
}

/// Sensor status configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    /// Topic carrying sensor status messages
    #[serde(default = "default_status_topic")]
    pub status_topic: String,

    /// Sensors the operator expects to see
    #[serde(default)]
    pub sensor_ids: Vec<String>,

    /// Silence after which a sensor is considered timed out, in seconds
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold_secs: u64,

    /// Interval between timeout checks in seconds
    #[serde(default = "default_timeout_check_interval")]
    pub timeout_check_interval_secs: u64,

    /// Interval between sensor status polls in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_base_url() -> String {
    "http://localhost:3001".to_string()
}
fn default_request_timeout() -> u64 {
    10
}
fn default_operator() -> String {
    "operator".to_string()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_max_events() -> usize {
    400
}
fn default_retry_interval() -> u64 {
    30
}
fn default_status_topic() -> String {
    "sensor_status".to_string()
}
/// Largest silence threshold `chrono::Duration` can represent
pub const MAX_SILENCE_THRESHOLD_SECS: u64 = (i64::MAX / 1000) as u64;

fn default_silence_threshold() -> u64 {
    300
}
fn default_timeout_check_interval() -> u64 {
    60
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            operator: default_operator(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_events: default_max_events(),
        }
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            retry_interval_secs: default_retry_interval(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            status_topic: default_status_topic(),
            sensor_ids: Vec::new(),
            silence_threshold_secs: default_silence_threshold(),
            timeout_check_interval_secs: default_timeout_check_interval(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ConsoleConfig {
    /// Load configuration from file and environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/console").required(false))
            .add_source(File::with_name("/etc/relay/console").required(false))
            // Override with environment variables (e.g., CONSOLE__API__BASE_URL)
            .add_source(
                Environment::with_prefix("CONSOLE")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("subscriptions.topics")
                    .with_list_parse_key("sensors.sensor_ids"),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://") {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.base_url".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }

        if self.feed.poll_interval_ms == 0 || self.sensors.poll_interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "poll_interval_ms".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }

        if self.feed.max_events == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "feed.max_events".to_string(),
                message: "Feed must hold at least one event".to_string(),
            });
        }

        if self.subscriptions.retry_interval_secs == 0
            || self.sensors.timeout_check_interval_secs == 0
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "retry_interval_secs/timeout_check_interval_secs".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }

        if self.sensors.silence_threshold_secs > MAX_SILENCE_THRESHOLD_SECS {
            return Err(ConfigValidationError::InvalidValue {
                field: "sensors.silence_threshold_secs".to_string(),
                message: format!("Threshold must not exceed {} seconds", MAX_SILENCE_THRESHOLD_SECS),
            });
        }

        if self.sensors.status_topic.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "sensors.status_topic".to_string(),
            ));
        }

        Ok(())
    }
}

impl ApiConfig {
    /// Get request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl FeedConfig {
    /// Get poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl SubscriptionConfig {
    /// Get retry interval as Duration.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

impl SensorConfig {
    pub fn silence_threshold(&self) -> chrono::Duration {
        let secs = self.silence_threshold_secs.min(MAX_SILENCE_THRESHOLD_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_secs(self.timeout_check_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
