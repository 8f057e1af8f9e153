use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::scheduler::RefreshPolicy;
use crate::synchronizer::DEFAULT_ELEMENT_PREFIX;
use crate::types::DEFAULT_EVENT_TYPE;

/// Live-data configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// SSE endpoint; `{topic}` is replaced by the topic key, otherwise the key is appended as a path segment
    pub stream_url: String,
    /// Snapshot endpoint polled by the refresh scheduler (poll channel disabled when unset)
    pub snapshot_url: Option<String>,
    /// Interval between successful refreshes
    pub refresh_base_interval: Duration,
    /// Upper bound for the backoff interval
    pub refresh_cap_interval: Duration,
    /// Consecutive failures before auto-refresh pauses
    pub refresh_max_retries: u32,
    /// SSE event types routed to subscribers
    pub event_types: Vec<String>,
    /// Delay before the SSE transport reconnects (a server `retry:` field overrides it)
    pub sse_retry: Duration,
    /// Timeout for snapshot requests
    pub request_timeout: Duration,
    /// Prefix joined with the sensor id to find its rendered element
    pub element_id_prefix: String,
}

impl LiveConfig {
    /// Configuration with defaults for everything but the stream URL
    pub fn new(stream_url: impl Into<String>) -> Self {
        let policy = RefreshPolicy::default();
        Self {
            stream_url: stream_url.into(),
            snapshot_url: None,
            refresh_base_interval: policy.base_interval,
            refresh_cap_interval: policy.cap_interval,
            refresh_max_retries: policy.max_retries,
            event_types: vec![DEFAULT_EVENT_TYPE.to_string()],
            sse_retry: Duration::from_millis(3000),
            request_timeout: Duration::from_secs(10),
            element_id_prefix: DEFAULT_ELEMENT_PREFIX.to_string(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(None)
    }

    /// Load configuration from environment variables, taking the stream URL
    /// from `stream_url` when given instead of `SENSOR_STREAM_URL`
    pub fn from_env_with(stream_url: Option<String>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(stream_url, |name| env::var(name).ok())
    }

    fn from_vars<F>(stream_url: Option<String>, var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let stream_url = stream_url
            .or_else(|| var("SENSOR_STREAM_URL"))
            .ok_or_else(|| ConfigError::MissingEnvVar("SENSOR_STREAM_URL".to_string()))?;

        let mut config = Self::new(stream_url);
        config.snapshot_url = var("SENSOR_SNAPSHOT_URL").filter(|s| !s.trim().is_empty());
        config.refresh_base_interval =
            Duration::from_millis(parse_var(&var, "REFRESH_BASE_INTERVAL_MS", 60_000u64)?);
        config.refresh_cap_interval =
            Duration::from_millis(parse_var(&var, "REFRESH_CAP_INTERVAL_MS", 300_000u64)?);
        config.refresh_max_retries = parse_var(&var, "REFRESH_MAX_RETRIES", 3u32)?;
        if let Some(types) = var("PUSH_EVENT_TYPES") {
            config.event_types = types
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        config.sse_retry = Duration::from_millis(parse_var(&var, "SSE_RETRY_MS", 3000u64)?);
        config.request_timeout =
            Duration::from_secs(parse_var(&var, "REQUEST_TIMEOUT_SECS", 10u64)?);
        if let Some(prefix) = var("ELEMENT_ID_PREFIX") {
            config.element_id_prefix = prefix;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the scheduler and transports cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "SENSOR_STREAM_URL must not be empty".to_string(),
            ));
        }
        if self.refresh_base_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "REFRESH_BASE_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }
        if self.refresh_cap_interval < self.refresh_base_interval {
            return Err(ConfigError::InvalidValue(
                "REFRESH_CAP_INTERVAL_MS must not be below REFRESH_BASE_INTERVAL_MS".to_string(),
            ));
        }
        if self.refresh_max_retries == 0 {
            return Err(ConfigError::InvalidValue(
                "REFRESH_MAX_RETRIES must be at least 1".to_string(),
            ));
        }
        if self.event_types.is_empty() {
            return Err(ConfigError::InvalidValue(
                "PUSH_EVENT_TYPES must name at least one event type".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff policy for the refresh scheduler
    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            base_interval: self.refresh_base_interval,
            cap_interval: self.refresh_cap_interval,
            max_retries: self.refresh_max_retries,
        }
    }
}

fn parse_var<T, F>(var: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{} is not a valid number: {}", name, raw))),
        None => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}
