//! HTTP tunnel directory and vhost listener.
//!
//! All HTTP tunnels share one listener. For every connection the request
//! head is read just far enough to find the Host header, the vhost is
//! resolved against the directory, and the connection turns into a regular
//! downstream session with the sniffed bytes relayed first. Unknown vhosts
//! get a small error response instead of a proxied connection.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, Instrument};

use culvert_proto::TunnelToken;

use super::downstream::serve_downstream;
use super::sessions::TunnelSessions;
use crate::error::RelayError;

/// Most bytes we will read while looking for the end of a request head.
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// How long a downstream peer gets to finish sending its request head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct HttpIndex {
    by_vhost: HashMap<String, Arc<TunnelSessions>>,
    vhosts_by_token: HashMap<TunnelToken, String>,
}

/// Counters for the shared HTTP listener.
#[derive(Debug, Default)]
pub struct HttpServerStats {
    pub connections_accepted: AtomicU64,
    pub vhost_matched: AtomicU64,
    pub vhost_missed: AtomicU64,
}

/// Directory of live HTTP tunnels plus the shared vhost listener.
pub struct HttpServer {
    listener: TcpListener,
    index: RwLock<HttpIndex>,
    stats: HttpServerStats,
}

impl HttpServer {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(bind_addr = %listener.local_addr()?, "HTTP listener bound");
        Ok(Self {
            listener,
            index: RwLock::new(HttpIndex::default()),
            stats: HttpServerStats::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &HttpServerStats {
        &self.stats
    }

    /// Whether a live tunnel already holds this vhost.
    pub async fn is_registered(&self, vhost: &str) -> bool {
        let key = normalize_host(vhost);
        self.index.read().await.by_vhost.contains_key(&key)
    }

    /// Claim a vhost for a tunnel. Fails without touching the existing
    /// registration if the vhost is already held.
    pub async fn register(
        &self,
        vhost: &str,
        sessions: Arc<TunnelSessions>,
    ) -> Result<(), RelayError> {
        let key = normalize_host(vhost);
        let token = sessions.token();
        let mut index = self.index.write().await;
        if index.by_vhost.contains_key(&key) {
            return Err(RelayError::VhostAlreadyUsed(vhost.to_string()));
        }
        index.by_vhost.insert(key.clone(), sessions);
        index.vhosts_by_token.insert(token, key.clone());
        info!(vhost = %key, tunnel = %token, "HTTP tunnel registered");
        Ok(())
    }

    /// Release a vhost and close its sessions. No-op when it is not
    /// registered.
    pub async fn unregister(&self, vhost: &str) {
        let key = normalize_host(vhost);
        let entry = {
            let mut index = self.index.write().await;
            let entry = index.by_vhost.remove(&key);
            if let Some(sessions) = &entry {
                index.vhosts_by_token.remove(&sessions.token());
            }
            entry
        };
        if let Some(sessions) = entry {
            sessions.close_all().await;
            info!(vhost = %key, tunnel = %sessions.token(), "HTTP tunnel unregistered");
        }
    }

    /// Look up a live tunnel's session registry by token.
    pub async fn registry(&self, token: TunnelToken) -> Option<Arc<TunnelSessions>> {
        let index = self.index.read().await;
        let vhost = index.vhosts_by_token.get(&token)?;
        index.by_vhost.get(vhost).map(Arc::clone)
    }

    pub async fn registry_by_vhost(&self, vhost: &str) -> Option<Arc<TunnelSessions>> {
        let key = normalize_host(vhost);
        self.index.read().await.by_vhost.get(&key).map(Arc::clone)
    }

    pub async fn vhost_count(&self) -> usize {
        self.index.read().await.by_vhost.len()
    }

    /// Accept downstream connections until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        info!(bind_addr = %self.listener.local_addr()?, "HTTP listener started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                        let server = Arc::clone(&self);
                        tokio::spawn(
                            async move { server.handle_connection(stream).await }
                                .instrument(tracing::info_span!("http_conn", peer = %peer_addr)),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        info!("HTTP listener stopped");
        Ok(())
    }

    async fn handle_connection(&self, mut stream: TcpStream) {
        let mut buf = BytesMut::with_capacity(1024);
        let sniffed = match tokio::time::timeout(HEAD_TIMEOUT, sniff_host(&mut stream, &mut buf))
            .await
        {
            Ok(Ok(sniffed)) => sniffed,
            Ok(Err(e)) => {
                debug!(error = %e, "Failed reading request head");
                return;
            }
            Err(_) => {
                debug!("Request head timed out");
                return;
            }
        };

        match sniffed {
            HostSniff::Found(host) => match self.registry_by_vhost(&host).await {
                Some(sessions) => {
                    self.stats.vhost_matched.fetch_add(1, Ordering::Relaxed);
                    debug!(vhost = %host, tunnel = %sessions.token(), "Vhost matched");
                    serve_downstream(sessions, stream, buf.freeze()).await;
                }
                None => {
                    self.stats.vhost_missed.fetch_add(1, Ordering::Relaxed);
                    debug!(vhost = %host, "Unknown vhost");
                    let body = format!("vhost {host} not found");
                    write_http_error(&mut stream, 404, "Not Found", &body).await;
                }
            },
            HostSniff::Missing => {
                self.stats.vhost_missed.fetch_add(1, Ordering::Relaxed);
                debug!("Request head has no host header");
                write_http_error(&mut stream, 400, "Bad Request", "missing host header").await;
            }
            HostSniff::TooLarge => {
                debug!("Request head exceeds limit");
                write_http_error(&mut stream, 431, "Request Header Fields Too Large", "").await;
            }
            HostSniff::Incomplete => {
                debug!("Peer closed before finishing the request head");
            }
        }
    }
}

enum HostSniff {
    Found(String),
    Missing,
    TooLarge,
    Incomplete,
}

/// Read until the blank line ending the request head and extract the Host
/// header. Everything read stays in `buf` for relaying.
async fn sniff_host(stream: &mut TcpStream, buf: &mut BytesMut) -> io::Result<HostSniff> {
    loop {
        if let Some(head_end) = find_head_end(buf) {
            return Ok(match parse_host(&buf[..head_end]) {
                Some(host) => HostSniff::Found(host),
                None => HostSniff::Missing,
            });
        }
        if buf.len() >= MAX_HEAD_BYTES {
            return Ok(HostSniff::TooLarge);
        }
        buf.reserve(1024);
        if stream.read_buf(buf).await? == 0 {
            return Ok(HostSniff::Incomplete);
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_host(head: &[u8]) -> Option<String> {
    for line in head.split(|b| *b == b'\n').skip(1) {
        let line = std::str::from_utf8(line).ok()?.trim_end_matches('\r');
        let (name, value) = match line.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        if name.trim().eq_ignore_ascii_case("host") {
            let host = normalize_host(value);
            if host.is_empty() {
                return None;
            }
            return Some(host);
        }
    }
    None
}

/// Normalize a host for directory keys: lowercase, no port suffix, no
/// trailing dot.
fn normalize_host(raw: &str) -> String {
    let mut host = raw.trim().to_ascii_lowercase();
    if host.starts_with('[') {
        // Bracketed IPv6 literal; the port comes after the bracket.
        if let Some(end) = host.find(']') {
            host.truncate(end + 1);
        }
    } else if let Some(idx) = host.rfind(':') {
        if host[idx + 1..].chars().all(|c| c.is_ascii_digit()) {
            host.truncate(idx);
        }
    }
    while host.ends_with('.') {
        host.pop();
    }
    host
}

async fn write_http_error(stream: &mut TcpStream, status: u16, reason: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
