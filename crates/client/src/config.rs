//! Client configuration, read from `JOBWATCH_*` environment variables.

use std::time::Duration;

use thiserror::Error;

use crate::poller::PollerConfig;
use crate::retry::RetryPolicy;
use crate::transport::TransportConfig;

/// Uploads must be allowed at least this many default timeouts.
pub const MIN_UPLOAD_TIMEOUT_FACTOR: u32 = 5;

pub const ENV_API_URL: &str = "JOBWATCH_API_URL";
pub const ENV_TIMEOUT_MS: &str = "JOBWATCH_TIMEOUT_MS";
pub const ENV_UPLOAD_TIMEOUT_MS: &str = "JOBWATCH_UPLOAD_TIMEOUT_MS";
pub const ENV_SUBMIT_ATTEMPTS: &str = "JOBWATCH_SUBMIT_ATTEMPTS";
pub const ENV_STATUS_ATTEMPTS: &str = "JOBWATCH_STATUS_ATTEMPTS";
pub const ENV_RETRY_BASE_MS: &str = "JOBWATCH_RETRY_BASE_MS";
pub const ENV_RETRY_MULTIPLIER: &str = "JOBWATCH_RETRY_MULTIPLIER";
pub const ENV_POLL_ACTIVE_MS: &str = "JOBWATCH_POLL_ACTIVE_MS";
pub const ENV_POLL_IDLE_MS: &str = "JOBWATCH_POLL_IDLE_MS";
pub const ENV_GRACE_MS: &str = "JOBWATCH_GRACE_MS";
pub const ENV_DISCOVERY_PATH: &str = "JOBWATCH_DISCOVERY_PATH";

const DEFAULT_API_URL: &str = "http://localhost:8000";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_UPLOAD_FACTOR: u32 = 10;
const DEFAULT_SUBMIT_ATTEMPTS: u32 = 2;
const DEFAULT_STATUS_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;
const DEFAULT_ACTIVE_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_DISCOVERY_PATH: &str = "/jobs";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

impl ConfigError {
    fn invalid(key: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            message: message.into(),
        }
    }
}

/// Everything the tracker needs to know about its environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub base_url: String,
    pub default_timeout: Duration,
    pub upload_timeout: Duration,
    /// Kept low: a retried POST may create a duplicate job.
    pub submit_retry: RetryPolicy,
    pub status_retry: RetryPolicy,
    pub active_interval: Duration,
    pub idle_interval: Duration,
    pub grace_period: Duration,
    pub discovery_path: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            default_timeout: DEFAULT_TIMEOUT,
            upload_timeout: DEFAULT_TIMEOUT * DEFAULT_UPLOAD_FACTOR,
            submit_retry: RetryPolicy::exponential(
                DEFAULT_SUBMIT_ATTEMPTS,
                DEFAULT_RETRY_BASE,
                DEFAULT_RETRY_MULTIPLIER,
            ),
            status_retry: RetryPolicy::exponential(
                DEFAULT_STATUS_ATTEMPTS,
                DEFAULT_RETRY_BASE,
                DEFAULT_RETRY_MULTIPLIER,
            ),
            active_interval: DEFAULT_ACTIVE_INTERVAL,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
            discovery_path: Some(DEFAULT_DISCOVERY_PATH.to_string()),
        }
    }
}

impl ClientConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` as the environment. Unset keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(url) = get(ENV_API_URL) {
            config.base_url = url;
        }
        if let Some(ms) = parse_millis(ENV_TIMEOUT_MS, get(ENV_TIMEOUT_MS))? {
            config.default_timeout = ms;
            config.upload_timeout = ms * DEFAULT_UPLOAD_FACTOR;
        }
        if let Some(ms) = parse_millis(ENV_UPLOAD_TIMEOUT_MS, get(ENV_UPLOAD_TIMEOUT_MS))? {
            config.upload_timeout = ms;
        }

        let base_delay = parse_millis(ENV_RETRY_BASE_MS, get(ENV_RETRY_BASE_MS))?.unwrap_or(DEFAULT_RETRY_BASE);
        let multiplier = match get(ENV_RETRY_MULTIPLIER) {
            Some(raw) => raw
                .parse::<f64>()
                .map_err(|e| ConfigError::invalid(ENV_RETRY_MULTIPLIER, e.to_string()))?,
            None => DEFAULT_RETRY_MULTIPLIER,
        };
        let submit_attempts = parse_count(ENV_SUBMIT_ATTEMPTS, get(ENV_SUBMIT_ATTEMPTS))?
            .unwrap_or(DEFAULT_SUBMIT_ATTEMPTS);
        let status_attempts = parse_count(ENV_STATUS_ATTEMPTS, get(ENV_STATUS_ATTEMPTS))?
            .unwrap_or(DEFAULT_STATUS_ATTEMPTS);
        config.submit_retry = RetryPolicy::exponential(submit_attempts, base_delay, multiplier);
        config.status_retry = RetryPolicy::exponential(status_attempts, base_delay, multiplier);

        if let Some(ms) = parse_millis(ENV_POLL_ACTIVE_MS, get(ENV_POLL_ACTIVE_MS))? {
            config.active_interval = ms;
        }
        if let Some(ms) = parse_millis(ENV_POLL_IDLE_MS, get(ENV_POLL_IDLE_MS))? {
            config.idle_interval = ms;
        }
        if let Some(ms) = parse_millis(ENV_GRACE_MS, get(ENV_GRACE_MS))? {
            config.grace_period = ms;
        }
        // Set-but-empty disables discovery.
        if let Some(path) = lookup(ENV_DISCOVERY_PATH) {
            let path = path.trim();
            config.discovery_path = (!path.is_empty()).then(|| path.to_string());
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::invalid(ENV_API_URL, "must be an http(s) URL"));
        }
        if self.default_timeout.is_zero() {
            return Err(ConfigError::invalid(ENV_TIMEOUT_MS, "must be positive"));
        }
        if self.upload_timeout < self.default_timeout * MIN_UPLOAD_TIMEOUT_FACTOR {
            return Err(ConfigError::invalid(
                ENV_UPLOAD_TIMEOUT_MS,
                format!("must be at least {MIN_UPLOAD_TIMEOUT_FACTOR}x the default timeout"),
            ));
        }
        if self.submit_retry.max_attempts == 0 {
            return Err(ConfigError::invalid(ENV_SUBMIT_ATTEMPTS, "must be at least 1"));
        }
        if self.status_retry.max_attempts == 0 {
            return Err(ConfigError::invalid(ENV_STATUS_ATTEMPTS, "must be at least 1"));
        }
        if !self.status_retry.backoff_multiplier.is_finite() || self.status_retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(ENV_RETRY_MULTIPLIER, "must be a finite number >= 1"));
        }
        if self.active_interval.is_zero() {
            return Err(ConfigError::invalid(ENV_POLL_ACTIVE_MS, "must be positive"));
        }
        if self.idle_interval < self.active_interval {
            return Err(ConfigError::invalid(ENV_POLL_IDLE_MS, "must not be shorter than the active interval"));
        }
        Ok(())
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Not validated here; call [`ClientConfig::validate`] afterwards.
    pub fn with_timeouts(mut self, default_timeout: Duration, upload_timeout: Duration) -> Self {
        self.default_timeout = default_timeout;
        self.upload_timeout = upload_timeout;
        self
    }

    pub fn with_submit_retry(mut self, policy: RetryPolicy) -> Self {
        self.submit_retry = policy;
        self
    }

    pub fn with_status_retry(mut self, policy: RetryPolicy) -> Self {
        self.status_retry = policy;
        self
    }

    pub fn with_intervals(mut self, active: Duration, idle: Duration) -> Self {
        self.active_interval = active;
        self.idle_interval = idle;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_discovery_path(mut self, path: Option<String>) -> Self {
        self.discovery_path = path;
        self
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            base_url: self.base_url.clone(),
            default_timeout: self.default_timeout,
            upload_timeout: self.upload_timeout,
        }
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            active_interval: self.active_interval,
            idle_interval: self.idle_interval,
            grace_period: self.grace_period,
            status_retry: self.status_retry.clone(),
            discovery_path: self.discovery_path.clone(),
        }
    }
}

fn parse_millis(key: &'static str, raw: Option<String>) -> Result<Option<Duration>, ConfigError> {
    raw.map(|raw| {
        raw.parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| ConfigError::invalid(key, format!("{raw:?}: {e}")))
    })
    .transpose()
}

fn parse_count(key: &'static str, raw: Option<String>) -> Result<Option<u32>, ConfigError> {
    raw.map(|raw| {
        raw.parse::<u32>()
            .map_err(|e| ConfigError::invalid(key, format!("{raw:?}: {e}")))
    })
    .transpose()
}
