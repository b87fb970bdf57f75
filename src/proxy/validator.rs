//! Proxy validation by raw handshake
//!
//! A probe opens a socket to the proxy, runs the protocol handshake towards
//! the identity endpoint and, when enabled, fetches the exit identity
//! through the resulting tunnel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant as StdInstant;

use futures::stream::{self, StreamExt};
use http::Method;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::config::FleetConfig;
use crate::error::{FleetError, Result};
use crate::fleet::request::{send_through_tunnel, OutboundRequest, RequestTarget};
use crate::models::{IpInfo, ProxyEndpoint, ProxyProtocol, ValidationResult};
use crate::proxy::transport::ProxyTransport;

/// Stateless handshake prober
#[derive(Clone)]
pub struct Validator {
    config: Arc<FleetConfig>,
    identity: Arc<RequestTarget>,
}

impl Validator {
    pub fn new(config: Arc<FleetConfig>) -> Result<Self> {
        let identity = config.ip_info_target()?;

        Ok(Self {
            config,
            identity: Arc::new(identity),
        })
    }

    /// Probe one endpoint, optionally overriding its protocol
    ///
    /// Never fails: every problem is reported in the returned result.
    #[instrument(skip(self), fields(proxy = %endpoint))]
    pub async fn validate(
        &self,
        endpoint: &ProxyEndpoint,
        protocol_hint: Option<ProxyProtocol>,
    ) -> ValidationResult {
        let endpoint = match protocol_hint {
            Some(protocol) => endpoint.with_protocol(protocol),
            None => endpoint.clone(),
        };

        let started = StdInstant::now();
        let deadline = Instant::now() + self.config.health_check_timeout;

        let tunnel = match ProxyTransport::connect(
            &endpoint,
            &self.identity.host,
            self.identity.port,
            deadline,
        )
        .await
        {
            Ok(tunnel) => tunnel,
            Err(e) => {
                debug!(category = e.category(), "Proxy {} failed validation: {}", endpoint, e);
                return ValidationResult::invalid(endpoint, started.elapsed(), e.to_string());
            }
        };
        let latency = started.elapsed();

        let ip_info = if self.config.check_ip_info {
            self.fetch_ip_info(tunnel).await
        } else {
            None
        };

        debug!(
            "Proxy {} is valid ({}ms)",
            endpoint,
            latency.as_millis()
        );
        ValidationResult::valid(endpoint, latency, ip_info)
    }

    /// Best-effort identity lookup through a proven tunnel
    async fn fetch_ip_info(&self, tunnel: TcpStream) -> Option<IpInfo> {
        let deadline = Instant::now() + self.config.health_check_timeout;
        let headers = BTreeMap::new();
        let request = OutboundRequest {
            method: Method::GET,
            headers: &headers,
            body: None,
            user_agent: &self.config.user_agent,
        };

        match send_through_tunnel(tunnel, &self.identity, request, deadline).await {
            Ok(response) if (200..300).contains(&response.status) => {
                let info = IpInfo::from_json(&response.body);
                if info.is_none() {
                    debug!("Identity endpoint returned an unrecognised body");
                }
                info
            }
            Ok(response) => {
                debug!("Identity endpoint returned status {}", response.status);
                None
            }
            Err(e) => {
                debug!("Identity lookup failed: {}", e);
                None
            }
        }
    }

    /// Validate a batch with the configured concurrency
    ///
    /// Results pair 1:1 with `endpoints`. `hints`, when given, must have the
    /// same length.
    pub async fn validate_all(
        &self,
        endpoints: &[ProxyEndpoint],
        hints: Option<&[ProxyProtocol]>,
    ) -> Result<Vec<ValidationResult>> {
        self.validate_all_with_limit(endpoints, hints, self.config.validation_concurrency)
            .await
    }

    /// Validate a batch with at most `limit` probes in flight
    pub async fn validate_all_with_limit(
        &self,
        endpoints: &[ProxyEndpoint],
        hints: Option<&[ProxyProtocol]>,
        limit: usize,
    ) -> Result<Vec<ValidationResult>> {
        if let Some(hints) = hints {
            if hints.len() != endpoints.len() {
                return Err(FleetError::InvalidRequest(format!(
                    "{} protocol hints for {} endpoints",
                    hints.len(),
                    endpoints.len()
                )));
            }
        }
        if limit == 0 {
            return Err(FleetError::InvalidConfig(
                "validation concurrency must be at least 1".into(),
            ));
        }

        let results: Vec<ValidationResult> = stream::iter(endpoints.iter().enumerate())
            .map(|(i, endpoint)| {
                let hint = hints.map(|h| h[i]);
                self.validate(endpoint, hint)
            })
            .buffered(limit)
            .collect()
            .await;

        let valid = results.iter().filter(|r| r.is_valid).count();
        info!(
            "Validated {} proxies: {} valid, {} invalid",
            results.len(),
            valid,
            results.len() - valid
        );

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_test::assert_ok;

    use super::*;
    use crate::test_support::{
        refused_endpoint, spawn_fake_proxy, spawn_silent_server, FakeProxyKind, FAKE_EXIT_IP,
    };

    fn config(check_ip_info: bool) -> Arc<FleetConfig> {
        Arc::new(FleetConfig {
            health_check_timeout: Duration::from_millis(500),
            check_ip_info,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_validate_each_protocol() {
        let validator = Validator::new(config(false)).unwrap();

        for kind in [FakeProxyKind::Socks4, FakeProxyKind::Socks5, FakeProxyKind::HttpConnect] {
            let proxy = spawn_fake_proxy(kind).await;
            let result = validator.validate(&proxy.endpoint, None).await;
            assert!(result.is_valid, "{:?}: {:?}", kind, result.error);
            assert!(result.error.is_none());
            assert!(result.ip_info.is_none());
            // Handshake only, no HTTP request
            assert!(proxy.stats.requests().is_empty());
        }
    }

    #[tokio::test]
    async fn test_validate_fetches_ip_info() {
        let validator = Validator::new(config(true)).unwrap();
        let proxy = spawn_fake_proxy(FakeProxyKind::Socks5).await;

        let result = validator.validate(&proxy.endpoint, None).await;
        assert!(result.is_valid);
        let info = result.ip_info.unwrap();
        assert_eq!(info.ip.as_deref(), Some(FAKE_EXIT_IP));
        assert_eq!(info.country.as_deref(), Some("NL"));

        let heads = proxy.stats.requests();
        assert!(heads[0].starts_with("GET /json HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_rejections_are_protocol_specific() {
        let validator = Validator::new(config(false)).unwrap();

        let socks4 = spawn_fake_proxy(FakeProxyKind::Socks4Reply(0x5B)).await;
        let result = validator.validate(&socks4.endpoint, None).await;
        assert!(!result.is_valid);
        assert!(result.error.unwrap().contains("SOCKS4"));

        let socks5 = spawn_fake_proxy(FakeProxyKind::Socks5Reply(0x02)).await;
        let result = validator.validate(&socks5.endpoint, None).await;
        assert!(result.error.unwrap().contains("not allowed by ruleset"));

        let http = spawn_fake_proxy(FakeProxyKind::HttpStatus(403)).await;
        let result = validator.validate(&http.endpoint, None).await;
        assert!(result.error.unwrap().contains("403"));
    }

    #[tokio::test]
    async fn test_protocol_hint_overrides_endpoint_protocol() {
        let validator = Validator::new(config(false)).unwrap();
        let proxy = spawn_fake_proxy(FakeProxyKind::Socks5).await;
        let as_http = proxy.endpoint.with_protocol(ProxyProtocol::Http);

        let result = validator
            .validate(&as_http, Some(ProxyProtocol::Socks5))
            .await;
        assert!(result.is_valid);
        assert_eq!(result.endpoint, proxy.endpoint);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_idempotent() {
        let validator = Validator::new(config(false)).unwrap();
        let endpoint = refused_endpoint(ProxyProtocol::Socks5).await;

        let first = validator.validate(&endpoint, None).await;
        let second = validator.validate(&endpoint, None).await;

        for result in [&first, &second] {
            assert!(!result.is_valid);
            assert!(result
                .error
                .as_deref()
                .unwrap()
                .starts_with("connection failed:"));
        }
        assert_eq!(first.endpoint, second.endpoint);
    }

    #[tokio::test]
    async fn test_validation_releases_sockets() {
        let validator = Validator::new(config(true)).unwrap();

        for kind in [
            FakeProxyKind::Socks5,
            FakeProxyKind::Socks4Reply(0x5B),
            FakeProxyKind::Socks5Reply(0x05),
            FakeProxyKind::HttpStatus(407),
            FakeProxyKind::Stall,
        ] {
            let proxy = spawn_fake_proxy(kind).await;
            for _ in 0..2 {
                let result = validator.validate(&proxy.endpoint, None).await;
                assert_eq!(result.is_valid, kind == FakeProxyKind::Socks5, "{:?}", kind);
                assert!(
                    proxy.stats.wait_until_closed().await,
                    "{:?} left {} socket(s) open",
                    kind,
                    proxy.stats.open()
                );
            }
            assert_eq!(proxy.stats.connections(), 2);
        }
    }

    #[tokio::test]
    async fn test_silent_proxy_times_out_within_budget() {
        let validator = Validator::new(config(false)).unwrap();
        let server = spawn_silent_server().await;
        let endpoint = ProxyEndpoint::new("127.0.0.1", server.port(), ProxyProtocol::Socks4);

        let started = StdInstant::now();
        let result = validator.validate(&endpoint, None).await;
        assert!(!result.is_valid);
        assert!(result.error.unwrap().starts_with("timed out"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_validate_all_pairs_results_with_input() {
        let validator = Validator::new(config(false)).unwrap();
        let good = spawn_fake_proxy(FakeProxyKind::Socks4).await;
        let bad = refused_endpoint(ProxyProtocol::Socks5).await;
        let endpoints = vec![bad.clone(), good.endpoint.clone(), bad.clone()];

        let results = assert_ok!(validator.validate_all(&endpoints, None).await);
        assert_eq!(results.len(), 3);
        assert!(!results[0].is_valid);
        assert!(results[1].is_valid);
        assert!(!results[2].is_valid);
        assert_eq!(results[1].endpoint, good.endpoint);

        let hints = [ProxyProtocol::Socks5];
        assert!(matches!(
            validator.validate_all(&endpoints, Some(&hints)).await,
            Err(FleetError::InvalidRequest(_))
        ));
        assert!(validator.validate_all(&[], None).await.unwrap().is_empty());
    }
}
