use crate::error::{FleetError, Result};
use crate::fleet::request::RequestTarget;
use std::env;
use std::time::Duration;

/// Default identity-echo endpoint queried through a freshly validated proxy
pub const DEFAULT_IP_INFO_URL: &str = "http://ipinfo.io/json";

/// Process-wide tunables shared by the validator and the executor
#[derive(Debug, Clone, PartialEq)]
pub struct FleetConfig {
    /// Maximum number of tasks in flight at once
    pub max_concurrent_requests: usize,
    /// Maximum number of validation probes in flight at once
    pub validation_concurrency: usize,
    /// Deadline for one whole validation (connect + handshake)
    pub health_check_timeout: Duration,
    /// Per-attempt deadline for tasks that do not carry their own
    pub default_timeout: Duration,
    /// Retry budget for tasks that do not carry their own
    pub default_max_retries: u32,
    /// A Valid endpoint is demoted once its consecutive task failures exceed this
    pub failure_threshold: u32,
    /// Query the identity endpoint after a successful handshake
    pub check_ip_info: bool,
    /// Identity-echo endpoint, also the handshake destination during validation
    pub ip_info_url: String,
    /// User-Agent sent with identity lookups and tasks lacking one
    pub user_agent: String,
    /// Interval between background re-validation rounds
    pub revalidate_interval: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            validation_concurrency: 20,
            health_check_timeout: Duration::from_secs(10),
            default_timeout: Duration::from_secs(30),
            default_max_retries: 3,
            failure_threshold: 0,
            check_ip_info: false,
            ip_info_url: DEFAULT_IP_INFO_URL.to_string(),
            user_agent: format!("proxy-fleet/{}", env!("CARGO_PKG_VERSION")),
            revalidate_interval: Duration::from_secs(300),
        }
    }
}

impl FleetConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = FleetConfig {
            max_concurrent_requests: parse_env(
                "FLEET_MAX_CONCURRENT_REQUESTS",
                defaults.max_concurrent_requests,
            )?,
            validation_concurrency: parse_env(
                "FLEET_VALIDATION_CONCURRENCY",
                defaults.validation_concurrency,
            )?,
            health_check_timeout: secs_env(
                "FLEET_HEALTH_CHECK_TIMEOUT",
                defaults.health_check_timeout,
            )?,
            default_timeout: secs_env("FLEET_DEFAULT_TIMEOUT", defaults.default_timeout)?,
            default_max_retries: parse_env(
                "FLEET_DEFAULT_MAX_RETRIES",
                defaults.default_max_retries,
            )?,
            failure_threshold: parse_env("FLEET_FAILURE_THRESHOLD", defaults.failure_threshold)?,
            check_ip_info: parse_env("FLEET_CHECK_IP_INFO", defaults.check_ip_info)?,
            ip_info_url: get_env_or("FLEET_IP_INFO_URL", &defaults.ip_info_url),
            user_agent: get_env_or("FLEET_USER_AGENT", &defaults.user_agent),
            revalidate_interval: secs_env(
                "FLEET_REVALIDATE_INTERVAL",
                defaults.revalidate_interval,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject tunables the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            return Err(FleetError::InvalidConfig(
                "max_concurrent_requests must be at least 1".into(),
            ));
        }
        if self.validation_concurrency == 0 {
            return Err(FleetError::InvalidConfig(
                "validation_concurrency must be at least 1".into(),
            ));
        }
        if self.health_check_timeout.is_zero() {
            return Err(FleetError::InvalidConfig(
                "health_check_timeout must be non-zero".into(),
            ));
        }
        if self.default_timeout.is_zero() {
            return Err(FleetError::InvalidConfig(
                "default_timeout must be non-zero".into(),
            ));
        }
        if self.revalidate_interval.is_zero() {
            return Err(FleetError::InvalidConfig(
                "revalidate_interval must be non-zero".into(),
            ));
        }
        self.ip_info_target()?;
        Ok(())
    }

    /// Parsed identity endpoint
    pub fn ip_info_target(&self) -> Result<RequestTarget> {
        RequestTarget::parse(&self.ip_info_url).map_err(|e| {
            FleetError::InvalidConfig(format!("ip_info_url is not usable: {}", e))
        })
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LogConfig {
    /// Load logging configuration from environment variables
    pub fn from_env() -> Self {
        LogConfig {
            level: get_env_or("LOG_LEVEL", "info"),
            format: get_env_or("LOG_FORMAT", "pretty"),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| FleetError::InvalidConfig(format!("{} has an invalid value", key))),
        Err(_) => Ok(default),
    }
}

/// Durations are configured in whole seconds
fn secs_env(key: &str, default: Duration) -> Result<Duration> {
    parse_env(key, default.as_secs()).map(Duration::from_secs)
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
