//! Bucket configuration: validated limits plus the serde surface accepted by `create`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Requests admitted per window unless configured otherwise.
pub const DEFAULT_MAX_REQUESTS: u32 = 5;
/// Default fixed-window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(30_000);
/// Default idle period after which a bucket retires itself.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Errors produced when validating or parsing bucket configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `max_requests` must be > 0.
    #[error("max_requests must be > 0 (got {provided})")]
    InvalidMaxRequests {
        /// Value provided by caller.
        provided: u32,
    },
    /// Window must be a whole number of milliseconds, at least 1 ms.
    #[error("window must be a whole number of milliseconds >= 1ms (got {0:?})")]
    InvalidWindow(Duration),
    /// Idle timeout must be > 0.
    #[error("idle_timeout must be > 0 (got {0:?})")]
    InvalidIdleTimeout(Duration),
    /// The config document could not be decoded.
    #[error("invalid bucket config: {0}")]
    Parse(String),
}

/// Validated, immutable configuration for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBucketConfig", into = "RawBucketConfig")]
pub struct BucketConfig {
    max_requests: u32,
    window: Duration,
    idle_timeout: Duration,
}

impl BucketConfig {
    /// Create a config with validation.
    ///
    /// # Examples
    /// ```
    /// use quotabox::BucketConfig;
    /// use std::time::Duration;
    /// let cfg = BucketConfig::new(2, Duration::from_secs(30), Duration::from_secs(60)).unwrap();
    /// assert_eq!(cfg.max_requests(), 2);
    /// ```
    pub fn new(
        max_requests: u32,
        window: Duration,
        idle_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let cfg = Self { max_requests, window, idle_timeout };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Override the request limit; must be > 0.
    pub fn with_max_requests(mut self, max_requests: u32) -> Result<Self, ConfigError> {
        self.max_requests = max_requests;
        self.validate()?;
        Ok(self)
    }

    /// Override the window length; whole milliseconds, at least 1 ms.
    pub fn with_window(mut self, window: Duration) -> Result<Self, ConfigError> {
        self.window = window;
        self.validate()?;
        Ok(self)
    }

    /// Override the idle timeout; must be > 0.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Result<Self, ConfigError> {
        self.idle_timeout = idle_timeout;
        self.validate()?;
        Ok(self)
    }

    /// Parse a JSON config document. Missing fields take the defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let raw: RawBucketConfig =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::try_from(raw)
    }

    /// Requests admitted per window.
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Fixed-window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Idle period after which the bucket terminates.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub(crate) fn window_millis(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(ConfigError::InvalidMaxRequests { provided: 0 });
        }
        // Windows are tracked in whole milliseconds.
        if self.window < Duration::from_millis(1) || self.window.subsec_nanos() % 1_000_000 != 0 {
            return Err(ConfigError::InvalidWindow(self.window));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::InvalidIdleTimeout(self.idle_timeout));
        }
        Ok(())
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: DEFAULT_WINDOW,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Wire shape of [`BucketConfig`]; durations in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBucketConfig {
    #[serde(default = "default_max_requests", alias = "maxRequests")]
    max_requests: u32,
    #[serde(default = "default_window_ms", alias = "windowDuration")]
    window_ms: u64,
    #[serde(default = "default_idle_timeout_ms", alias = "idleTimeout")]
    idle_timeout_ms: u64,
}

fn default_max_requests() -> u32 {
    DEFAULT_MAX_REQUESTS
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW.as_millis() as u64
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT.as_millis() as u64
}

impl TryFrom<RawBucketConfig> for BucketConfig {
    type Error = ConfigError;

    fn try_from(raw: RawBucketConfig) -> Result<Self, Self::Error> {
        BucketConfig::new(
            raw.max_requests,
            Duration::from_millis(raw.window_ms),
            Duration::from_millis(raw.idle_timeout_ms),
        )
    }
}

impl From<BucketConfig> for RawBucketConfig {
    fn from(cfg: BucketConfig) -> Self {
        Self {
            max_requests: cfg.max_requests,
            window_ms: cfg.window_millis(),
            idle_timeout_ms: u64::try_from(cfg.idle_timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}
