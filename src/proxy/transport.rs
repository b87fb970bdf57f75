//! Proxy transport layer for HTTP-CONNECT and SOCKS protocols
//!
//! Opens a TCP connection to an upstream proxy and drives the raw handshake
//! until the proxy is relaying bytes to the requested destination.

use std::io::ErrorKind;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, instrument};

use crate::error::{FleetError, Result};
use crate::models::ProxyEndpoint;
use crate::proxy::codec::{Exchange, Handshake, HandshakeCodec, ReadFrame};

/// Proxy transport handler
pub struct ProxyTransport;

impl ProxyTransport {
    /// Open a tunnel to `dest_host:dest_port` through `endpoint`
    ///
    /// The whole operation, TCP connect included, must finish before
    /// `deadline`.
    #[instrument(skip_all, fields(proxy = %endpoint, target = %dest_host, port = dest_port))]
    pub async fn connect(
        endpoint: &ProxyEndpoint,
        dest_host: &str,
        dest_port: u16,
        deadline: Instant,
    ) -> Result<TcpStream> {
        let mut stream = Self::connect_tcp(endpoint, deadline).await?;

        let mut handshake = Handshake::new(endpoint.protocol, dest_host, dest_port);
        match timeout_at(deadline, Self::drive(&mut stream, &mut handshake)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(FleetError::Timeout(format!(
                    "{} handshake with {}",
                    endpoint.protocol,
                    endpoint.address()
                )))
            }
        }

        debug!("{} tunnel established", endpoint.protocol);
        Ok(stream)
    }

    async fn connect_tcp(endpoint: &ProxyEndpoint, deadline: Instant) -> Result<TcpStream> {
        let address = endpoint.address();
        debug!("Connecting to {} proxy at {}", endpoint.protocol, address);

        let stream = match timeout_at(deadline, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(FleetError::ConnectError(format!("{}: {}", address, e))),
            Err(_) => {
                return Err(FleetError::Timeout(format!(
                    "connecting to proxy {}",
                    address
                )))
            }
        };

        // Handshake frames are tiny; do not let Nagle hold them back
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Run every exchange of the handshake over `stream`
    async fn drive(stream: &mut TcpStream, handshake: &mut Handshake) -> Result<()> {
        let mut exchange: Exchange = handshake.begin()?;

        loop {
            if let Some(bytes) = exchange.send.take() {
                stream.write_all(&bytes).await.map_err(handshake_io_error)?;
            }

            let reply = read_frame(stream, exchange.expect).await?;
            match handshake.advance(&reply)? {
                Some(next) => exchange = next,
                None => return Ok(()),
            }
        }
    }
}

/// Read exactly one reply frame, never consuming tunnelled bytes
async fn read_frame(stream: &mut TcpStream, frame: ReadFrame) -> Result<Vec<u8>> {
    match frame {
        ReadFrame::Exact(n) => {
            let mut buf = vec![0u8; n];
            stream
                .read_exact(&mut buf)
                .await
                .map_err(handshake_io_error)?;
            Ok(buf)
        }
        ReadFrame::UntilBlankLine { limit } => {
            let mut buf = Vec::with_capacity(256);
            let mut byte = [0u8; 1];
            while !buf.ends_with(b"\r\n\r\n") {
                if buf.len() >= limit {
                    return Err(FleetError::Protocol(format!(
                        "proxy reply header exceeds {} bytes",
                        limit
                    )));
                }
                let n = stream.read(&mut byte).await.map_err(handshake_io_error)?;
                if n == 0 {
                    return Err(FleetError::Protocol(
                        "proxy closed the connection mid-handshake".to_string(),
                    ));
                }
                buf.push(byte[0]);
            }
            Ok(buf)
        }
    }
}

fn handshake_io_error(e: std::io::Error) -> FleetError {
    match e.kind() {
        ErrorKind::UnexpectedEof => {
            FleetError::Protocol("proxy closed the connection mid-handshake".to_string())
        }
        _ => FleetError::ConnectError(e.to_string()),
    }
}
