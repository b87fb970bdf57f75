use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::IpInfo;
use crate::error::{FleetError, Result};

/// Proxy protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    /// Plain HTTP proxy spoken to with `CONNECT`
    Http,
    Socks4,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks5 => "socks5",
        }
    }

    /// Parse a protocol name or URL scheme
    ///
    /// `https` maps to HTTP-CONNECT, `socks4a` to SOCKS4 (domains are always
    /// sent with the 4a extension) and `socks5h` to SOCKS5.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" | "https" => Some(ProxyProtocol::Http),
            "socks4" | "socks4a" => Some(ProxyProtocol::Socks4),
            "socks5" | "socks5h" => Some(ProxyProtocol::Socks5),
            _ => None,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(self, ProxyProtocol::Socks4 | ProxyProtocol::Socks5)
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A proxy's address and protocol identity
///
/// Two endpoints are the same proxy iff host, port and protocol all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16, protocol: ProxyProtocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
        }
    }

    /// Same address probed as a different protocol
    pub fn with_protocol(&self, protocol: ProxyProtocol) -> Self {
        Self {
            host: self.host.clone(),
            port: self.port,
            protocol,
        }
    }

    /// `host:port` suitable for `TcpStream::connect`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        format_host_port(&self.host, self.port)
    }

    /// Get proxy URL
    pub fn url(&self) -> String {
        format!("{}://{}", self.protocol, self.address())
    }

    /// Parse `scheme://host:port`, or bare `host:port` using `default_protocol`
    pub fn parse_with_default(s: &str, default_protocol: ProxyProtocol) -> Result<Self> {
        let s = s.trim();
        let (protocol, rest) = match s.split_once("://") {
            Some((scheme, rest)) => {
                let protocol = ProxyProtocol::from_str(scheme).ok_or_else(|| {
                    FleetError::InvalidProxyAddress(format!(
                        "unsupported proxy scheme '{}' in '{}'",
                        scheme, s
                    ))
                })?;
                (protocol, rest)
            }
            None => (default_protocol, s),
        };

        // Use URL parsing to properly handle bracketed IPv6 like "[::1]:8080".
        let url = url::Url::parse(&format!("http://{}", rest)).map_err(|e| {
            FleetError::InvalidProxyAddress(format!("invalid address '{}': {}", s, e))
        })?;

        let host = url.host_str().ok_or_else(|| {
            FleetError::InvalidProxyAddress(format!("invalid address '{}': missing host", s))
        })?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        // `Url::port` hides the scheme default, so ":80" has to be checked by hand.
        let port = match url.port() {
            Some(p) => p,
            None if rest.trim_end_matches('/').ends_with(":80") => 80,
            None => {
                return Err(FleetError::InvalidProxyAddress(format!(
                    "invalid address '{}': missing port",
                    s
                )))
            }
        };

        Ok(Self::new(host, port, protocol))
    }
}

impl FromStr for ProxyEndpoint {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        if !s.contains("://") {
            return Err(FleetError::InvalidProxyAddress(format!(
                "'{}' has no scheme, use parse_with_default",
                s
            )));
        }
        Self::parse_with_default(s, ProxyProtocol::Http)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}

/// Parse a newline separated proxy list
///
/// Blank lines and `#` comments are skipped, malformed lines are dropped and
/// duplicates are merged keeping first-seen order.
pub fn parse_proxy_list(text: &str, default_protocol: ProxyProtocol) -> Vec<ProxyEndpoint> {
    let mut seen = HashSet::new();
    let mut endpoints = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match ProxyEndpoint::parse_with_default(line, default_protocol) {
            Ok(endpoint) => {
                if seen.insert(endpoint.clone()) {
                    endpoints.push(endpoint);
                }
            }
            Err(e) => debug!("Skipping proxy list line '{}': {}", line, e),
        }
    }

    endpoints
}

pub(crate) fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Validity state of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    #[default]
    Untested,
    Valid,
    Failed,
}

impl ProxyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyState::Untested => "untested",
            ProxyState::Valid => "valid",
            ProxyState::Failed => "failed",
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self, ProxyState::Valid)
    }
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tracked health of one endpoint
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProxyHealth {
    pub state: ProxyState,
    pub last_checked: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_info: Option<IpInfo>,
}

/// Endpoint identity plus health, as exchanged with a persistent store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub endpoint: ProxyEndpoint,
    pub health: ProxyHealth,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_protocol_parsing_and_helpers() {
        assert_eq!(ProxyProtocol::from_str("HTTP"), Some(ProxyProtocol::Http));
        assert_eq!(ProxyProtocol::from_str("https"), Some(ProxyProtocol::Http));
        assert_eq!(
            ProxyProtocol::from_str("SOCKS4A"),
            Some(ProxyProtocol::Socks4)
        );
        assert_eq!(
            ProxyProtocol::from_str("socks5h"),
            Some(ProxyProtocol::Socks5)
        );
        assert_eq!(ProxyProtocol::from_str("unknown"), None);

        assert!(ProxyProtocol::Socks5.is_socks());
        assert!(!ProxyProtocol::Http.is_socks());
        assert_eq!(ProxyProtocol::Socks4.to_string(), "socks4");
    }

    #[test]
    fn test_endpoint_identity_includes_protocol() {
        let a = ProxyEndpoint::new("10.0.0.1", 1080, ProxyProtocol::Socks5);
        let b = a.with_protocol(ProxyProtocol::Socks4);
        assert_ne!(a, b);
        assert_eq!(a, ProxyEndpoint::new("10.0.0.1", 1080, ProxyProtocol::Socks5));
    }

    #[test]
    fn test_endpoint_parse_with_scheme() {
        let ep: ProxyEndpoint = "socks5://1.2.3.4:1080".parse().unwrap();
        assert_eq!(ep, ProxyEndpoint::new("1.2.3.4", 1080, ProxyProtocol::Socks5));

        let ep: ProxyEndpoint = "socks4a://[::1]:9050".parse().unwrap();
        assert_eq!(ep, ProxyEndpoint::new("::1", 9050, ProxyProtocol::Socks4));
        assert_eq!(ep.address(), "[::1]:9050");

        let ep: ProxyEndpoint = "http://proxy.example:80".parse().unwrap();
        assert_eq!(ep.port, 80);

        assert!("ftp://1.2.3.4:21".parse::<ProxyEndpoint>().is_err());
        assert!("1.2.3.4:1080".parse::<ProxyEndpoint>().is_err());
    }

    #[test]
    fn test_endpoint_parse_with_default() {
        let ep = ProxyEndpoint::parse_with_default("1.2.3.4:3128", ProxyProtocol::Http).unwrap();
        assert_eq!(ep.url(), "http://1.2.3.4:3128");

        let err = ProxyEndpoint::parse_with_default("1.2.3.4", ProxyProtocol::Http).unwrap_err();
        assert!(matches!(err, FleetError::InvalidProxyAddress(_)));
    }

    #[test]
    fn test_parse_proxy_list_skips_noise_and_duplicates() {
        let text = "\
# comment
1.2.3.4:1080

socks4://5.6.7.8:4145
1.2.3.4:1080
garbage
9.9.9.9:notaport
";
        let endpoints = parse_proxy_list(text, ProxyProtocol::Socks5);
        assert_eq!(
            endpoints,
            vec![
                ProxyEndpoint::new("1.2.3.4", 1080, ProxyProtocol::Socks5),
                ProxyEndpoint::new("5.6.7.8", 4145, ProxyProtocol::Socks4),
            ]
        );
    }

    #[test]
    fn test_health_record_serde() {
        let record = HealthRecord {
            endpoint: ProxyEndpoint::new("1.2.3.4", 8080, ProxyProtocol::Http),
            health: ProxyHealth {
                state: ProxyState::Failed,
                last_checked: None,
                consecutive_failures: 4,
                ip_info: None,
            },
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["endpoint"]["protocol"], "http");
        assert_eq!(json["health"]["state"], "failed");
        assert_eq!(json["health"]["consecutive_failures"], 4);

        let back: HealthRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
