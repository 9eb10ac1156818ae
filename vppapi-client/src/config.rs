//! Connection configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via VPPAPI_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration for a [`Connection`](crate::Connection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Hard deadline for a single reply.
    pub reply_timeout_ms: u64,
    /// Soft deadline after which a slow reply is logged once.
    pub slow_reply_warning_ms: u64,
    /// How long the dispatcher waits on a full reply queue before dropping.
    pub reply_delivery_timeout_ms: u64,
    /// Capacity of each channel's request queue.
    pub request_queue_size: usize,
    /// Capacity of each channel's reply queue.
    pub reply_queue_size: usize,
    /// Default capacity for notification queues created by callers.
    pub notification_queue_size: usize,
    /// Capacity of the inbound frame queue between the adapter and the dispatcher.
    pub inbound_queue_size: usize,
    /// Capacity of the connection event queue.
    pub event_queue_size: usize,
    /// Connect retries made by the supervisor after the first failed
    /// attempt before giving up.
    pub max_reconnect_attempts: u32,
    /// Pause between connect attempts.
    pub reconnect_interval_ms: u64,
    /// Interval between health check probes.
    pub health_check_probe_interval_ms: u64,
    /// Deadline for a probe reply. Also the window in which a reply on any
    /// other channel counts as a sign of life.
    pub health_check_reply_timeout_ms: u64,
    /// Consecutive probe timeouts tolerated before the engine is declared
    /// not responding.
    pub health_check_threshold: u32,
    /// Start with call tracing enabled.
    pub trace_enabled: bool,
    /// Maximum number of retained trace records.
    pub trace_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 1000,
            slow_reply_warning_ms: 100,
            reply_delivery_timeout_ms: 100,
            request_queue_size: 100,
            reply_queue_size: 100,
            notification_queue_size: 100,
            inbound_queue_size: 4096,
            event_queue_size: 100,
            max_reconnect_attempts: 3,
            reconnect_interval_ms: 1000,
            health_check_probe_interval_ms: 1000,
            health_check_reply_timeout_ms: 250,
            health_check_threshold: 1,
            trace_enabled: false,
            trace_capacity: 1000,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("VPPAPI_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: ConnectionConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        env_override("VPPAPI_REPLY_TIMEOUT_MS", &mut self.reply_timeout_ms);
        env_override("VPPAPI_SLOW_REPLY_WARNING_MS", &mut self.slow_reply_warning_ms);
        env_override(
            "VPPAPI_REPLY_DELIVERY_TIMEOUT_MS",
            &mut self.reply_delivery_timeout_ms,
        );
        env_override("VPPAPI_REQUEST_QUEUE_SIZE", &mut self.request_queue_size);
        env_override("VPPAPI_REPLY_QUEUE_SIZE", &mut self.reply_queue_size);
        env_override(
            "VPPAPI_NOTIFICATION_QUEUE_SIZE",
            &mut self.notification_queue_size,
        );
        env_override("VPPAPI_INBOUND_QUEUE_SIZE", &mut self.inbound_queue_size);
        env_override("VPPAPI_EVENT_QUEUE_SIZE", &mut self.event_queue_size);
        env_override(
            "VPPAPI_MAX_RECONNECT_ATTEMPTS",
            &mut self.max_reconnect_attempts,
        );
        env_override("VPPAPI_RECONNECT_INTERVAL_MS", &mut self.reconnect_interval_ms);
        env_override(
            "VPPAPI_HEALTH_CHECK_PROBE_INTERVAL_MS",
            &mut self.health_check_probe_interval_ms,
        );
        env_override(
            "VPPAPI_HEALTH_CHECK_REPLY_TIMEOUT_MS",
            &mut self.health_check_reply_timeout_ms,
        );
        env_override(
            "VPPAPI_HEALTH_CHECK_THRESHOLD",
            &mut self.health_check_threshold,
        );
        env_override("VPPAPI_TRACE_CAPACITY", &mut self.trace_capacity);

        if let Ok(enabled) = std::env::var("VPPAPI_TRACE_ENABLED") {
            self.trace_enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let queues = [
            ("request_queue_size", self.request_queue_size),
            ("reply_queue_size", self.reply_queue_size),
            ("notification_queue_size", self.notification_queue_size),
            ("inbound_queue_size", self.inbound_queue_size),
            ("event_queue_size", self.event_queue_size),
        ];
        for (name, size) in queues {
            if size == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if self.reply_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "reply_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.health_check_probe_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "health_check_probe_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.health_check_reply_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "health_check_reply_timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_slow_reply_warning(mut self, after: Duration) -> Self {
        self.slow_reply_warning_ms = duration_ms(after);
        self
    }

    pub fn with_reply_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.reply_delivery_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_queue_sizes(mut self, request: usize, reply: usize) -> Self {
        self.request_queue_size = request.max(1);
        self.reply_queue_size = reply.max(1);
        self
    }

    pub fn with_inbound_queue_size(mut self, size: usize) -> Self {
        self.inbound_queue_size = size.max(1);
        self
    }

    pub fn with_event_queue_size(mut self, size: usize) -> Self {
        self.event_queue_size = size.max(1);
        self
    }

    pub fn with_reconnect(mut self, retries: u32, interval: Duration) -> Self {
        self.max_reconnect_attempts = retries;
        self.reconnect_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_health_check(
        mut self,
        probe_interval: Duration,
        reply_timeout: Duration,
        threshold: u32,
    ) -> Self {
        self.health_check_probe_interval_ms = duration_ms(probe_interval);
        self.health_check_reply_timeout_ms = duration_ms(reply_timeout);
        self.health_check_threshold = threshold;
        self
    }

    pub fn with_trace(mut self, enabled: bool, capacity: usize) -> Self {
        self.trace_enabled = enabled;
        self.trace_capacity = capacity;
        self
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn slow_reply_warning(&self) -> Duration {
        Duration::from_millis(self.slow_reply_warning_ms)
    }

    pub fn reply_delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_delivery_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn health_check_probe_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_probe_interval_ms)
    }

    pub fn health_check_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_reply_timeout_ms)
    }
}

fn env_override<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(value) = std::env::var(key) {
        if let Ok(parsed) = value.parse() {
            *target = parsed;
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
