//! One HTTP/1.1 exchange over an established proxy tunnel

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, HOST, USER_AGENT};
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use crate::error::{FleetError, Result};
use crate::models::proxy::format_host_port;

/// Destination of a tunnelled request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Origin-form request target, e.g. `/json?x=1`
    pub path_and_query: String,
}

impl RequestTarget {
    /// Parse an absolute `http` / `https` URL
    pub fn parse(url: &str) -> Result<Self> {
        let url = Url::parse(url)?;

        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(FleetError::InvalidRequest(format!(
                    "unsupported URL scheme: {}",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| FleetError::InvalidRequest(format!("URL has no host: {}", url)))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| FleetError::InvalidRequest(format!("URL has no port: {}", url)))?;

        let mut path_and_query = url.path().to_string();
        if let Some(query) = url.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        Ok(Self {
            host,
            port,
            tls,
            path_and_query,
        })
    }

    /// `Host` header value, omitting the scheme's default port
    pub fn authority(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        match (self.port == default_port, self.host.contains(':')) {
            (true, true) => format!("[{}]", self.host),
            (true, false) => self.host.clone(),
            (false, _) => format_host_port(&self.host, self.port),
        }
    }
}

/// What to send
#[derive(Debug, Clone)]
pub struct OutboundRequest<'a> {
    pub method: Method,
    pub headers: &'a BTreeMap<String, String>,
    pub body: Option<Bytes>,
    pub user_agent: &'a str,
}

/// What came back
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Reject a request that no proxy could ever carry
///
/// Catches malformed headers and TLS server names before any attempt so a
/// bad task never counts against a proxy.
pub fn check_request(target: &RequestTarget, headers: &BTreeMap<String, String>) -> Result<()> {
    for (name, value) in headers {
        header_pair(name, value)?;
    }
    if target.tls {
        server_name(target)?;
    }
    Ok(())
}

fn header_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| FleetError::InvalidRequest(format!("invalid header name {}: {}", name, e)))?;
    let header_value = HeaderValue::from_str(value).map_err(|e| {
        FleetError::InvalidRequest(format!("invalid value for header {}: {}", name, e))
    })?;
    Ok((header_name, header_value))
}

fn server_name(target: &RequestTarget) -> Result<ServerName<'static>> {
    ServerName::try_from(target.host.clone()).map_err(|e| {
        FleetError::InvalidRequest(format!("invalid TLS server name {}: {}", target.host, e))
    })
}

static TLS_CONFIG: OnceLock<Option<Arc<ClientConfig>>> = OnceLock::new();

fn build_tls_config() -> Option<Arc<ClientConfig>> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .ok()?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Some(Arc::new(config))
}

fn tls_connector() -> Result<TlsConnector> {
    TLS_CONFIG
        .get_or_init(build_tls_config)
        .clone()
        .map(TlsConnector::from)
        .ok_or_else(|| FleetError::Internal("failed to build TLS client configuration".into()))
}

/// Send `request` to `target` through `tunnel`, finishing before `deadline`
///
/// The tunnel is consumed; the connection is closed once the body is read.
pub async fn send_through_tunnel(
    tunnel: TcpStream,
    target: &RequestTarget,
    request: OutboundRequest<'_>,
    deadline: Instant,
) -> Result<HttpResponse> {
    let exchange = connect_and_send(tunnel, target, request);

    match timeout_at(deadline, exchange).await {
        Ok(result) => result,
        Err(_) => Err(FleetError::Timeout(format!(
            "waiting for response from {}",
            target.authority()
        ))),
    }
}

async fn connect_and_send(
    tunnel: TcpStream,
    target: &RequestTarget,
    request: OutboundRequest<'_>,
) -> Result<HttpResponse> {
    if !target.tls {
        return send_request(tunnel, target, request).await;
    }

    let tls = tls_connector()?
        .connect(server_name(target)?, tunnel)
        .await
        .map_err(|e| {
            FleetError::ConnectError(format!("TLS handshake with {} failed: {}", target.host, e))
        })?;
    send_request(tls, target, request).await
}

/// Run one HTTP/1.1 request over any byte stream
pub async fn send_request<S>(
    stream: S,
    target: &RequestTarget,
    request: OutboundRequest<'_>,
) -> Result<HttpResponse>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut builder = Request::builder()
        .method(request.method)
        .uri(target.path_and_query.as_str())
        .header(HOST, target.authority());

    let has_user_agent = request
        .headers
        .keys()
        .any(|name| name.eq_ignore_ascii_case(USER_AGENT.as_str()));
    if !has_user_agent {
        builder = builder.header(USER_AGENT, request.user_agent);
    }

    for (name, value) in request.headers {
        if name.eq_ignore_ascii_case(HOST.as_str()) {
            continue;
        }
        let (name, value) = header_pair(name, value)?;
        builder = builder.header(name, value);
    }

    let http_request = builder
        .body(Full::new(request.body.unwrap_or_default()))
        .map_err(|e| FleetError::InvalidRequest(format!("Failed to build request: {}", e)))?;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    let conn_task = tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Tunnel connection ended: {}", e);
        }
    });

    let result = async {
        let response = sender.send_request(http_request).await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok::<_, FleetError>(HttpResponse {
            status: parts.status.as_u16(),
            body,
        })
    }
    .await;

    conn_task.abort();
    result
}
