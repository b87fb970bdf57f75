//! In-process fake proxies for tests
//!
//! Each fake speaks the server side of one handshake and then plays the
//! destination HTTP server itself, so no test leaves the loopback interface.
//! Request paths steer the response: `/delay/<ms>` sleeps before answering,
//! `/status/<code>` picks the status and `/echo` returns the request body.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::models::{ProxyEndpoint, ProxyProtocol};
use crate::proxy::codec::{decode_socks4_request, decode_socks5_connect_request};

/// Address every fake reports as the proxy's exit IP
pub const FAKE_EXIT_IP: &str = "203.0.113.9";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeProxyKind {
    Socks4,
    Socks5,
    HttpConnect,
    /// SOCKS4 server answering with the given status byte
    Socks4Reply(u8),
    /// SOCKS5 server answering CONNECT with the given reply code
    Socks5Reply(u8),
    /// HTTP proxy answering CONNECT with the given status
    HttpStatus(u16),
    /// SOCKS5 proxy that reads the greeting and never answers
    Stall,
}

impl FakeProxyKind {
    pub fn protocol(&self) -> ProxyProtocol {
        match self {
            FakeProxyKind::Socks4 | FakeProxyKind::Socks4Reply(_) => ProxyProtocol::Socks4,
            FakeProxyKind::Socks5 | FakeProxyKind::Socks5Reply(_) | FakeProxyKind::Stall => {
                ProxyProtocol::Socks5
            }
            FakeProxyKind::HttpConnect | FakeProxyKind::HttpStatus(_) => ProxyProtocol::Http,
        }
    }
}

/// Counters shared by one or more fakes
#[derive(Debug, Default)]
pub struct FakeStats {
    connections: AtomicUsize,
    tunnels: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    open: AtomicUsize,
    requests: Mutex<Vec<String>>,
}

impl FakeStats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn tunnels(&self) -> usize {
        self.tunnels.load(Ordering::SeqCst)
    }

    /// Highest number of connections open at once
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Connections the client has not closed yet
    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Wait up to two seconds for every client socket to close
    pub async fn wait_until_closed(&self) -> bool {
        for _ in 0..200 {
            if self.open() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.open() == 0
    }

    /// Raw heads of the HTTP requests received through tunnels
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    fn enter(self: &Arc<Self>) -> ActiveGuard {
        self.connections.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        ActiveGuard {
            stats: self.clone(),
            released: false,
        }
    }
}

struct ActiveGuard {
    stats: Arc<FakeStats>,
    released: bool,
}

impl ActiveGuard {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.stats.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct FakeProxy {
    pub endpoint: ProxyEndpoint,
    pub stats: Arc<FakeStats>,
    task: JoinHandle<()>,
}

impl Drop for FakeProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn spawn_fake_proxy(kind: FakeProxyKind) -> FakeProxy {
    spawn_fake_proxy_with_stats(kind, Arc::new(FakeStats::default())).await
}

pub async fn spawn_fake_proxy_with_stats(kind: FakeProxyKind, stats: Arc<FakeStats>) -> FakeProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shared = stats.clone();
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let stats = shared.clone();
            stats.open.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut guard = stats.enter();
                let _ = serve(kind, &mut stream, &stats, &mut guard).await;
                drop(guard);
                wait_for_client_close(&mut stream).await;
                stats.open.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });

    FakeProxy {
        endpoint: ProxyEndpoint::new("127.0.0.1", addr.port(), kind.protocol()),
        stats,
        task,
    }
}

async fn serve(
    kind: FakeProxyKind,
    stream: &mut TcpStream,
    stats: &Arc<FakeStats>,
    guard: &mut ActiveGuard,
) -> std::io::Result<()> {
    let granted = match kind {
        FakeProxyKind::Socks4 => socks4_handshake(stream, 0x5A).await?,
        FakeProxyKind::Socks4Reply(status) => socks4_handshake(stream, status).await?,
        FakeProxyKind::Socks5 => socks5_handshake(stream, 0x00).await?,
        FakeProxyKind::Socks5Reply(code) => socks5_handshake(stream, code).await?,
        FakeProxyKind::HttpConnect => http_handshake(stream, 200).await?,
        FakeProxyKind::HttpStatus(status) => http_handshake(stream, status).await?,
        FakeProxyKind::Stall => false,
    };
    if !granted {
        return Ok(());
    }
    stats.tunnels.fetch_add(1, Ordering::SeqCst);

    serve_http(stream, stats, guard).await
}

/// Discard whatever the client still sends until it hangs up
async fn wait_for_client_close(stream: &mut TcpStream) {
    let mut buf = [0u8; 512];
    while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 {
            return;
        }
    }
}

async fn read_until_nul(stream: &mut TcpStream, buf: &mut Vec<u8>) -> std::io::Result<()> {
    loop {
        let b = stream.read_u8().await?;
        buf.push(b);
        if b == 0 {
            return Ok(());
        }
    }
}

async fn socks4_handshake(stream: &mut TcpStream, status: u8) -> std::io::Result<bool> {
    let mut request = vec![0u8; 8];
    stream.read_exact(&mut request).await?;
    read_until_nul(stream, &mut request).await?;
    if request[4..7] == [0, 0, 0] && request[7] != 0 {
        read_until_nul(stream, &mut request).await?;
    }
    if decode_socks4_request(&request).is_err() {
        return Ok(false);
    }

    stream.write_all(&[0x00, status, 0, 0, 0, 0, 0, 0]).await?;
    Ok(status == 0x5A)
}

async fn socks5_handshake(stream: &mut TcpStream, code: u8) -> std::io::Result<bool> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    if head[0] != 0x05 || !methods.contains(&0x00) {
        stream.write_all(&[0x05, 0xFF]).await?;
        return Ok(false);
    }
    stream.write_all(&[0x05, 0x00]).await?;

    let mut request = vec![0u8; 4];
    stream.read_exact(&mut request).await?;
    let rest = match request[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => {
            let len = stream.read_u8().await?;
            request.push(len);
            len as usize + 2
        }
        _ => return Ok(false),
    };
    let mut tail = vec![0u8; rest];
    stream.read_exact(&mut tail).await?;
    request.extend_from_slice(&tail);
    if decode_socks5_connect_request(&request).is_err() {
        return Ok(false);
    }

    stream
        .write_all(&[0x05, code, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90])
        .await?;
    Ok(code == 0x00)
}

async fn read_head(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    while !buf.ends_with(b"\r\n\r\n") {
        buf.push(stream.read_u8().await?);
    }
    Ok(buf)
}

async fn http_handshake(stream: &mut TcpStream, status: u16) -> std::io::Result<bool> {
    let head = read_head(stream).await?;
    if !head.starts_with(b"CONNECT ") {
        return Ok(false);
    }
    stream
        .write_all(format!("HTTP/1.1 {} Fake\r\n\r\n", status).as_bytes())
        .await?;
    Ok((200..300).contains(&status))
}

async fn serve_http(
    stream: &mut TcpStream,
    stats: &Arc<FakeStats>,
    guard: &mut ActiveGuard,
) -> std::io::Result<()> {
    let head = String::from_utf8_lossy(&read_head(stream).await?).into_owned();

    let content_length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut request_body = vec![0u8; content_length];
    stream.read_exact(&mut request_body).await?;

    let path = head
        .lines()
        .next()
        .and_then(|l| l.split(' ').nth(1))
        .unwrap_or("/")
        .to_string();
    stats.requests.lock().push(head);

    let mut status = 200u16;
    let mut body = format!(r#"{{"ip":"{}","country":"NL","city":"Amsterdam"}}"#, FAKE_EXIT_IP).into_bytes();
    if let Some(ms) = path.strip_prefix("/delay/") {
        let ms: u64 = ms.parse().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    } else if let Some(code) = path.strip_prefix("/status/") {
        status = code.parse().unwrap_or(500);
    } else if path == "/echo" {
        body = request_body;
    }

    guard.release();
    let response = format!(
        "HTTP/1.1 {} Fake\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.shutdown().await
}

/// Accepts connections and never answers
pub struct SilentServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl SilentServer {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for SilentServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn spawn_silent_server() -> SilentServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    SilentServer { addr, task }
}

/// An endpoint whose port has nothing listening
pub async fn refused_endpoint(protocol: ProxyProtocol) -> ProxyEndpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    ProxyEndpoint::new("127.0.0.1", port, protocol)
}
