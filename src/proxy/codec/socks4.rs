//! SOCKS4 / SOCKS4a CONNECT framing

use std::net::Ipv4Addr;

use super::{Exchange, HandshakeCodec, ReadFrame, TargetAddr};
use crate::error::{FleetError, Result};

pub const SOCKS4_VERSION: u8 = 0x04;
pub const SOCKS4_CMD_CONNECT: u8 = 0x01;
pub const SOCKS4_REPLY_LEN: usize = 8;

const REPLY_GRANTED: u8 = 0x5A;

/// Marker address telling a SOCKS4a server a domain name follows
const SOCKS4A_MARKER: [u8; 4] = [0, 0, 0, 1];

/// Encode a CONNECT request with an empty user id
///
/// Non-IPv4 destinations use the SOCKS4a extension.
pub fn encode_socks4_request(dest_host: &str, dest_port: u16) -> Result<Vec<u8>> {
    let target = TargetAddr::from_host(dest_host)?;

    let mut request = Vec::with_capacity(10 + dest_host.len());
    request.push(SOCKS4_VERSION);
    request.push(SOCKS4_CMD_CONNECT);
    request.extend_from_slice(&dest_port.to_be_bytes());

    match &target {
        TargetAddr::Ipv4(ip) => {
            request.extend_from_slice(&ip.octets());
            request.push(0x00); // empty user id
        }
        TargetAddr::Domain(domain) => {
            if domain.as_bytes().contains(&0) {
                return Err(FleetError::Protocol(
                    "SOCKS4a domain must not contain NUL bytes".to_string(),
                ));
            }
            request.extend_from_slice(&SOCKS4A_MARKER);
            request.push(0x00); // empty user id
            request.extend_from_slice(domain.as_bytes());
            request.push(0x00);
        }
        TargetAddr::Ipv6(_) => {
            return Err(FleetError::Protocol(
                "SOCKS4 cannot address IPv6 destinations".to_string(),
            ))
        }
    }

    Ok(request)
}

/// Parsed SOCKS4 reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Socks4Reply {
    pub granted: bool,
    pub status: u8,
}

impl Socks4Reply {
    pub fn message(&self) -> &'static str {
        match self.status {
            0x5A => "request granted",
            0x5B => "request rejected or failed",
            0x5C => "request rejected: cannot connect to identd",
            0x5D => "request rejected: identd user id mismatch",
            _ => "unknown reply status",
        }
    }
}

/// Parse the 8-byte reply; a non-granted status is not an error
pub fn parse_socks4_reply(reply: &[u8]) -> Result<Socks4Reply> {
    if reply.len() != SOCKS4_REPLY_LEN {
        return Err(FleetError::Protocol(format!(
            "SOCKS4 reply must be {} bytes, got {}",
            SOCKS4_REPLY_LEN,
            reply.len()
        )));
    }
    if reply[0] != 0x00 {
        return Err(FleetError::Protocol(format!(
            "invalid SOCKS4 reply version: 0x{:02x}",
            reply[0]
        )));
    }

    Ok(Socks4Reply {
        granted: reply[1] == REPLY_GRANTED,
        status: reply[1],
    })
}

/// Server-side decode of a CONNECT request into its destination
pub fn decode_socks4_request(request: &[u8]) -> Result<(TargetAddr, u16)> {
    if request.len() < 9 || request[0] != SOCKS4_VERSION {
        return Err(FleetError::Protocol("malformed SOCKS4 request".to_string()));
    }
    if request[1] != SOCKS4_CMD_CONNECT {
        return Err(FleetError::Protocol(format!(
            "unsupported SOCKS4 command: 0x{:02x}",
            request[1]
        )));
    }

    let port = u16::from_be_bytes([request[2], request[3]]);
    let ip = [request[4], request[5], request[6], request[7]];

    let rest = &request[8..];
    let user_end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| FleetError::Protocol("unterminated SOCKS4 user id".to_string()))?;

    // 0.0.0.x with x != 0 announces a SOCKS4a domain
    if ip[..3] == [0, 0, 0] && ip[3] != 0 {
        let domain = &rest[user_end + 1..];
        let end = domain
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| FleetError::Protocol("unterminated SOCKS4a domain".to_string()))?;
        let domain = std::str::from_utf8(&domain[..end])
            .map_err(|_| FleetError::Protocol("SOCKS4a domain is not UTF-8".to_string()))?;
        return Ok((TargetAddr::Domain(domain.to_string()), port));
    }

    Ok((TargetAddr::Ipv4(Ipv4Addr::from(ip)), port))
}

/// SOCKS4 handshake: one request, one fixed-size reply
#[derive(Debug, Clone)]
pub struct Socks4Handshake {
    dest_host: String,
    dest_port: u16,
}

impl Socks4Handshake {
    pub fn new(dest_host: &str, dest_port: u16) -> Self {
        Self {
            dest_host: dest_host.to_string(),
            dest_port,
        }
    }
}

impl HandshakeCodec for Socks4Handshake {
    fn begin(&mut self) -> Result<Exchange> {
        Ok(Exchange {
            send: Some(encode_socks4_request(&self.dest_host, self.dest_port)?),
            expect: ReadFrame::Exact(SOCKS4_REPLY_LEN),
        })
    }

    fn advance(&mut self, reply: &[u8]) -> Result<Option<Exchange>> {
        let reply = parse_socks4_reply(reply)?;
        if !reply.granted {
            return Err(FleetError::Protocol(format!(
                "SOCKS4 {} (0x{:02x})",
                reply.message(),
                reply.status
            )));
        }
        Ok(None)
    }
}
