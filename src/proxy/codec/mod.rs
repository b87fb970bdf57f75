//! Handshake framing for SOCKS4, SOCKS5 and HTTP-CONNECT
//!
//! Everything here is pure: it produces the bytes to send and interprets the
//! bytes received, but never touches a socket. The transport drives a
//! [`Handshake`] through its [`Exchange`] steps.

pub mod http_connect;
pub mod socks4;
pub mod socks5;

pub use http_connect::{encode_http_connect_request, parse_http_connect_reply, HttpConnectReply};
pub use socks4::{decode_socks4_request, encode_socks4_request, parse_socks4_reply, Socks4Reply};
pub use socks5::{
    decode_socks5_connect_request, encode_socks5_connect_request, encode_socks5_greeting,
    parse_socks5_connect_reply, parse_socks5_greeting_reply, Socks5ReplyCode,
};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{FleetError, Result};
use crate::models::ProxyProtocol;

/// Destination address as carried inside a handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl TargetAddr {
    /// Classify a host string, accepting bracketed IPv6 literals
    pub fn from_host(host: &str) -> Result<Self> {
        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        match bare.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Ok(TargetAddr::Ipv4(ip)),
            Ok(IpAddr::V6(ip)) => Ok(TargetAddr::Ipv6(ip)),
            Err(_) if bare.is_empty() => Err(FleetError::Protocol(
                "destination host must not be empty".to_string(),
            )),
            Err(_) => Ok(TargetAddr::Domain(bare.to_string())),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip) => write!(f, "{}", ip),
            TargetAddr::Ipv6(ip) => write!(f, "{}", ip),
            TargetAddr::Domain(d) => write!(f, "{}", d),
        }
    }
}

/// How many reply bytes the next step consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrame {
    Exact(usize),
    /// Header block terminated by `\r\n\r\n`, capped at `limit` bytes
    UntilBlankLine { limit: usize },
}

/// One round of a handshake: optionally send, then read a framed reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub send: Option<Vec<u8>>,
    pub expect: ReadFrame,
}

/// A handshake state machine, one implementation per protocol
pub trait HandshakeCodec {
    /// First exchange of the handshake
    fn begin(&mut self) -> Result<Exchange>;

    /// Feed the framed reply of the previous exchange
    ///
    /// Returns the next exchange, or `None` once the tunnel is established.
    fn advance(&mut self, reply: &[u8]) -> Result<Option<Exchange>>;
}

/// Closed set of supported handshakes
#[derive(Debug, Clone)]
pub enum Handshake {
    Socks4(socks4::Socks4Handshake),
    Socks5(socks5::Socks5Handshake),
    HttpConnect(http_connect::HttpConnectHandshake),
}

impl Handshake {
    pub fn new(protocol: ProxyProtocol, dest_host: &str, dest_port: u16) -> Self {
        match protocol {
            ProxyProtocol::Socks4 => {
                Handshake::Socks4(socks4::Socks4Handshake::new(dest_host, dest_port))
            }
            ProxyProtocol::Socks5 => {
                Handshake::Socks5(socks5::Socks5Handshake::new(dest_host, dest_port))
            }
            ProxyProtocol::Http => Handshake::HttpConnect(
                http_connect::HttpConnectHandshake::new(dest_host, dest_port),
            ),
        }
    }
}

impl HandshakeCodec for Handshake {
    fn begin(&mut self) -> Result<Exchange> {
        match self {
            Handshake::Socks4(h) => h.begin(),
            Handshake::Socks5(h) => h.begin(),
            Handshake::HttpConnect(h) => h.begin(),
        }
    }

    fn advance(&mut self, reply: &[u8]) -> Result<Option<Exchange>> {
        match self {
            Handshake::Socks4(h) => h.advance(reply),
            Handshake::Socks5(h) => h.advance(reply),
            Handshake::HttpConnect(h) => h.advance(reply),
        }
    }
}
