//! HTTP `CONNECT` tunnel framing

use super::{Exchange, HandshakeCodec, ReadFrame};
use crate::error::{FleetError, Result};
use crate::models::proxy::format_host_port;

/// Upper bound on the proxy's response head
pub const MAX_CONNECT_REPLY: usize = 8192;

pub fn encode_http_connect_request(dest_host: &str, dest_port: u16) -> Vec<u8> {
    let authority = format_host_port(dest_host, dest_port);
    format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: Keep-Alive\r\n\r\n"
    )
    .into_bytes()
}

/// Status line of the proxy's answer to `CONNECT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConnectReply {
    pub status: u16,
    pub reason: String,
}

impl HttpConnectReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Parse the response head; any non-2xx status is an error
pub fn parse_http_connect_reply(head: &[u8]) -> Result<HttpConnectReply> {
    let text = String::from_utf8_lossy(head);
    let status_line = text.lines().next().unwrap_or_default();

    if !status_line.starts_with("HTTP/") {
        return Err(FleetError::Protocol(format!(
            "invalid HTTP CONNECT reply: {:?}",
            truncate(status_line, 64)
        )));
    }

    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next();
    let status = parts
        .next()
        .and_then(|s| s.trim().parse::<u16>().ok())
        .ok_or_else(|| {
            FleetError::Protocol(format!(
                "invalid HTTP CONNECT status line: {:?}",
                truncate(status_line, 64)
            ))
        })?;
    let reason = parts.next().unwrap_or_default().trim().to_string();

    let reply = HttpConnectReply { status, reason };
    if !reply.is_success() {
        return Err(FleetError::Protocol(format!(
            "HTTP CONNECT rejected: {} {}",
            reply.status, reply.reason
        )));
    }
    Ok(reply)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// HTTP CONNECT handshake: one request, one header block
#[derive(Debug, Clone)]
pub struct HttpConnectHandshake {
    dest_host: String,
    dest_port: u16,
}

impl HttpConnectHandshake {
    pub fn new(dest_host: &str, dest_port: u16) -> Self {
        Self {
            dest_host: dest_host
                .strip_prefix('[')
                .and_then(|h| h.strip_suffix(']'))
                .unwrap_or(dest_host)
                .to_string(),
            dest_port,
        }
    }
}

impl HandshakeCodec for HttpConnectHandshake {
    fn begin(&mut self) -> Result<Exchange> {
        if self.dest_host.is_empty() {
            return Err(FleetError::Protocol(
                "destination host must not be empty".to_string(),
            ));
        }
        Ok(Exchange {
            send: Some(encode_http_connect_request(&self.dest_host, self.dest_port)),
            expect: ReadFrame::UntilBlankLine {
                limit: MAX_CONNECT_REPLY,
            },
        })
    }

    fn advance(&mut self, reply: &[u8]) -> Result<Option<Exchange>> {
        parse_http_connect_reply(reply)?;
        Ok(None)
    }
}
