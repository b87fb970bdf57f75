//! SOCKS5 CONNECT framing, no-auth only

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use super::{Exchange, HandshakeCodec, ReadFrame, TargetAddr};
use crate::error::{FleetError, Result};

pub const SOCKS5_VERSION: u8 = 0x05;
pub const SOCKS5_CMD_CONNECT: u8 = 0x01;
pub const SOCKS5_NO_AUTH: u8 = 0x00;
pub const SOCKS5_NO_ACCEPTABLE_METHODS: u8 = 0xFF;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Reply status of a CONNECT request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5ReplyCode {
    Succeeded,
    GeneralFailure,
    NotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Unknown(u8),
}

impl Socks5ReplyCode {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => Socks5ReplyCode::Succeeded,
            0x01 => Socks5ReplyCode::GeneralFailure,
            0x02 => Socks5ReplyCode::NotAllowed,
            0x03 => Socks5ReplyCode::NetworkUnreachable,
            0x04 => Socks5ReplyCode::HostUnreachable,
            0x05 => Socks5ReplyCode::ConnectionRefused,
            0x06 => Socks5ReplyCode::TtlExpired,
            0x07 => Socks5ReplyCode::CommandNotSupported,
            0x08 => Socks5ReplyCode::AddressTypeNotSupported,
            other => Socks5ReplyCode::Unknown(other),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            Socks5ReplyCode::Succeeded => 0x00,
            Socks5ReplyCode::GeneralFailure => 0x01,
            Socks5ReplyCode::NotAllowed => 0x02,
            Socks5ReplyCode::NetworkUnreachable => 0x03,
            Socks5ReplyCode::HostUnreachable => 0x04,
            Socks5ReplyCode::ConnectionRefused => 0x05,
            Socks5ReplyCode::TtlExpired => 0x06,
            Socks5ReplyCode::CommandNotSupported => 0x07,
            Socks5ReplyCode::AddressTypeNotSupported => 0x08,
            Socks5ReplyCode::Unknown(b) => *b,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Socks5ReplyCode::Succeeded => "succeeded",
            Socks5ReplyCode::GeneralFailure => "general SOCKS server failure",
            Socks5ReplyCode::NotAllowed => "connection not allowed by ruleset",
            Socks5ReplyCode::NetworkUnreachable => "network unreachable",
            Socks5ReplyCode::HostUnreachable => "host unreachable",
            Socks5ReplyCode::ConnectionRefused => "connection refused",
            Socks5ReplyCode::TtlExpired => "TTL expired",
            Socks5ReplyCode::CommandNotSupported => "command not supported",
            Socks5ReplyCode::AddressTypeNotSupported => "address type not supported",
            Socks5ReplyCode::Unknown(_) => "unknown reply code",
        }
    }
}

impl fmt::Display for Socks5ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02x})", self.message(), self.as_byte())
    }
}

/// Method negotiation offering only "no authentication"
pub fn encode_socks5_greeting() -> Vec<u8> {
    vec![SOCKS5_VERSION, 0x01, SOCKS5_NO_AUTH]
}

pub fn parse_socks5_greeting_reply(reply: &[u8]) -> Result<()> {
    if reply.len() != 2 {
        return Err(FleetError::Protocol(format!(
            "SOCKS5 method reply must be 2 bytes, got {}",
            reply.len()
        )));
    }
    if reply[0] != SOCKS5_VERSION {
        return Err(FleetError::Protocol(format!(
            "invalid SOCKS5 version in method reply: 0x{:02x}",
            reply[0]
        )));
    }
    match reply[1] {
        SOCKS5_NO_AUTH => Ok(()),
        SOCKS5_NO_ACCEPTABLE_METHODS => Err(FleetError::Protocol(
            "SOCKS5 server accepted no authentication method".to_string(),
        )),
        other => Err(FleetError::Protocol(format!(
            "SOCKS5 server requires unsupported authentication method 0x{:02x}",
            other
        ))),
    }
}

fn encode_addr(buf: &mut Vec<u8>, target: &TargetAddr) -> Result<()> {
    match target {
        TargetAddr::Ipv4(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        TargetAddr::Ipv6(ip) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
        TargetAddr::Domain(domain) => {
            let len = u8::try_from(domain.len()).map_err(|_| {
                FleetError::Protocol(format!(
                    "SOCKS5 domain too long ({} bytes, max 255)",
                    domain.len()
                ))
            })?;
            buf.push(ATYP_DOMAIN);
            buf.push(len);
            buf.extend_from_slice(domain.as_bytes());
        }
    }
    Ok(())
}

pub fn encode_socks5_connect_request(dest_host: &str, dest_port: u16) -> Result<Vec<u8>> {
    let target = TargetAddr::from_host(dest_host)?;

    let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, 0x00];
    encode_addr(&mut request, &target)?;
    request.extend_from_slice(&dest_port.to_be_bytes());
    Ok(request)
}

/// Decode `ATYP ADDR PORT` starting at `buf[0]`, returning the bytes consumed
fn decode_addr(buf: &[u8]) -> Result<(TargetAddr, u16, usize)> {
    let truncated = || FleetError::Protocol("truncated SOCKS5 address".to_string());
    let atyp = *buf.first().ok_or_else(truncated)?;

    let (target, addr_end) = match atyp {
        ATYP_IPV4 => {
            let octets: [u8; 4] = buf.get(1..5).ok_or_else(truncated)?.try_into().map_err(|_| truncated())?;
            (TargetAddr::Ipv4(Ipv4Addr::from(octets)), 5)
        }
        ATYP_IPV6 => {
            let octets: [u8; 16] = buf.get(1..17).ok_or_else(truncated)?.try_into().map_err(|_| truncated())?;
            (TargetAddr::Ipv6(Ipv6Addr::from(octets)), 17)
        }
        ATYP_DOMAIN => {
            let len = *buf.get(1).ok_or_else(truncated)? as usize;
            let raw = buf.get(2..2 + len).ok_or_else(truncated)?;
            let domain = std::str::from_utf8(raw)
                .map_err(|_| FleetError::Protocol("SOCKS5 domain is not UTF-8".to_string()))?;
            (TargetAddr::Domain(domain.to_string()), 2 + len)
        }
        other => {
            return Err(FleetError::Protocol(format!(
                "unknown SOCKS5 address type: 0x{:02x}",
                other
            )))
        }
    };

    let port = buf.get(addr_end..addr_end + 2).ok_or_else(truncated)?;
    Ok((target, u16::from_be_bytes([port[0], port[1]]), addr_end + 2))
}

/// Server-side decode of a CONNECT request
pub fn decode_socks5_connect_request(request: &[u8]) -> Result<(TargetAddr, u16)> {
    if request.len() < 4 || request[0] != SOCKS5_VERSION {
        return Err(FleetError::Protocol("malformed SOCKS5 request".to_string()));
    }
    if request[1] != SOCKS5_CMD_CONNECT {
        return Err(FleetError::Protocol(format!(
            "unsupported SOCKS5 command: 0x{:02x}",
            request[1]
        )));
    }
    let (target, port, consumed) = decode_addr(&request[3..])?;
    if 3 + consumed != request.len() {
        return Err(FleetError::Protocol(
            "trailing bytes after SOCKS5 request".to_string(),
        ));
    }
    Ok((target, port))
}

fn check_reply_head(reply: &[u8]) -> Result<()> {
    if reply.len() < 4 {
        return Err(FleetError::Protocol(format!(
            "SOCKS5 reply too short: {} bytes",
            reply.len()
        )));
    }
    if reply[0] != SOCKS5_VERSION {
        return Err(FleetError::Protocol(format!(
            "invalid SOCKS5 reply version: 0x{:02x}",
            reply[0]
        )));
    }
    let code = Socks5ReplyCode::from_byte(reply[1]);
    if code != Socks5ReplyCode::Succeeded {
        return Err(FleetError::Protocol(format!(
            "SOCKS5 connect failed: {}",
            code
        )));
    }
    Ok(())
}

/// Parse a complete CONNECT reply, returning the bound address
pub fn parse_socks5_connect_reply(reply: &[u8]) -> Result<(TargetAddr, u16)> {
    check_reply_head(reply)?;
    let (target, port, consumed) = decode_addr(&reply[3..])?;
    if 3 + consumed != reply.len() {
        return Err(FleetError::Protocol(format!(
            "SOCKS5 reply length mismatch: expected {}, got {}",
            3 + consumed,
            reply.len()
        )));
    }
    Ok((target, port))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Greeting,
    ReplyHead,
    DomainLen,
    ReplyTail,
}

/// SOCKS5 handshake
///
/// The bound address in the reply has a variable length, so the reply is
/// read in pieces: the fixed head, the domain length if any, then the rest.
#[derive(Debug, Clone)]
pub struct Socks5Handshake {
    dest_host: String,
    dest_port: u16,
    step: Step,
    reply: Vec<u8>,
}

impl Socks5Handshake {
    pub fn new(dest_host: &str, dest_port: u16) -> Self {
        Self {
            dest_host: dest_host.to_string(),
            dest_port,
            step: Step::Greeting,
            reply: Vec::new(),
        }
    }

    fn read(&mut self, step: Step, n: usize) -> Option<Exchange> {
        self.step = step;
        Some(Exchange {
            send: None,
            expect: ReadFrame::Exact(n),
        })
    }
}

impl HandshakeCodec for Socks5Handshake {
    fn begin(&mut self) -> Result<Exchange> {
        self.step = Step::Greeting;
        self.reply.clear();
        Ok(Exchange {
            send: Some(encode_socks5_greeting()),
            expect: ReadFrame::Exact(2),
        })
    }

    fn advance(&mut self, reply: &[u8]) -> Result<Option<Exchange>> {
        match self.step {
            Step::Greeting => {
                parse_socks5_greeting_reply(reply)?;
                self.step = Step::ReplyHead;
                Ok(Some(Exchange {
                    send: Some(encode_socks5_connect_request(
                        &self.dest_host,
                        self.dest_port,
                    )?),
                    expect: ReadFrame::Exact(4),
                }))
            }
            Step::ReplyHead => {
                check_reply_head(reply)?;
                self.reply.extend_from_slice(reply);
                match reply[3] {
                    ATYP_IPV4 => Ok(self.read(Step::ReplyTail, 4 + 2)),
                    ATYP_IPV6 => Ok(self.read(Step::ReplyTail, 16 + 2)),
                    ATYP_DOMAIN => Ok(self.read(Step::DomainLen, 1)),
                    other => Err(FleetError::Protocol(format!(
                        "unknown SOCKS5 address type: 0x{:02x}",
                        other
                    ))),
                }
            }
            Step::DomainLen => {
                let len = *reply.first().ok_or_else(|| {
                    FleetError::Protocol("truncated SOCKS5 reply".to_string())
                })? as usize;
                self.reply.extend_from_slice(reply);
                Ok(self.read(Step::ReplyTail, len + 2))
            }
            Step::ReplyTail => {
                self.reply.extend_from_slice(reply);
                parse_socks5_connect_reply(&self.reply)?;
                Ok(None)
            }
        }
    }
}
