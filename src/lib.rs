//! Proxy Fleet - proxy validation and fleet execution engine
//!
//! Validates HTTP, SOCKS4 and SOCKS5 proxies by speaking their handshakes
//! directly over a socket, tracks their health for a session and runs
//! HTTP tasks through them with bounded concurrency and rotating retries.
//!
//! ## Features
//!
//! - Byte-exact SOCKS4/4a, SOCKS5 and HTTP CONNECT handshakes
//! - Deadline-bounded validation with optional exit identity lookup
//! - Least-recently-used proxy selection with health-driven demotion
//! - Concurrent task execution with per-task proxy rotation
//! - Periodic background re-validation

pub mod config;
pub mod error;
pub mod fleet;
pub mod logging;
pub mod models;
pub mod proxy;

#[cfg(test)]
mod test_support;

pub use config::{FleetConfig, LogConfig};
pub use error::{FleetError, Result};
pub use fleet::{ProxyFleet, TaskExecutor};
pub use models::{
    HealthRecord, HttpMethod, HttpTask, IpInfo, ProxyEndpoint, ProxyHealth, ProxyProtocol,
    ProxyState, TaskResult, TaskSummary, ValidationResult,
};
pub use proxy::{HealthMonitor, HealthMonitorHandle, PoolStats, ProxyPool, Validator};
