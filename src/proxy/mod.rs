//! Proxy side of the engine
//!
//! This module provides:
//! - Pure SOCKS4 / SOCKS5 / HTTP-CONNECT handshake framing
//! - Deadline-bounded tunnel establishment
//! - Handshake-based validation
//! - The session pool with health tracking and periodic re-validation

pub mod codec;
pub mod health;
pub mod pool;
pub mod transport;
pub mod validator;

pub use health::{HealthMonitor, HealthMonitorHandle};
pub use pool::{PoolStats, ProxyPool};
pub use transport::ProxyTransport;
pub use validator::Validator;
