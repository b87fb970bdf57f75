use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ProxyEndpoint;

/// Identity details reported by the echo endpoint through a proxy
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IpInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    /// Any other fields the endpoint returned
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl IpInfo {
    /// Parse an echo response body; `None` unless it carries at least an `ip`
    pub fn from_json(body: &[u8]) -> Option<Self> {
        let info: IpInfo = serde_json::from_slice(body).ok()?;
        info.ip.as_ref()?;
        Some(info)
    }
}

/// Outcome of one validation probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// The identity actually probed (address plus the protocol used)
    pub endpoint: ProxyEndpoint,
    pub is_valid: bool,
    pub error: Option<String>,
    pub ip_info: Option<IpInfo>,
    pub latency: Duration,
}

impl ValidationResult {
    pub fn valid(endpoint: ProxyEndpoint, latency: Duration, ip_info: Option<IpInfo>) -> Self {
        Self {
            endpoint,
            is_valid: true,
            error: None,
            ip_info,
            latency,
        }
    }

    pub fn invalid(endpoint: ProxyEndpoint, latency: Duration, error: impl Into<String>) -> Self {
        Self {
            endpoint,
            is_valid: false,
            error: Some(error.into()),
            ip_info: None,
            latency,
        }
    }
}
