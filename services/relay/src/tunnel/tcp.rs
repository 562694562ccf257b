//! TCP tunnel directory.
//!
//! Every TCP tunnel gets its own relay-side listener on the requested
//! remote port. The directory maps ports and tunnel tokens to their
//! session registries and owns the accept tasks.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, Instrument};

use culvert_proto::TunnelToken;

use super::downstream::serve_downstream;
use super::sessions::TunnelSessions;
use crate::error::RelayError;

struct TcpTunnel {
    sessions: Arc<TunnelSessions>,
    accept_task: JoinHandle<()>,
}

#[derive(Default)]
struct TcpIndex {
    by_port: HashMap<u16, TcpTunnel>,
    ports_by_token: HashMap<TunnelToken, u16>,
}

/// Directory of live TCP tunnels.
pub struct TcpServer {
    bind_ip: IpAddr,
    index: RwLock<TcpIndex>,
}

impl TcpServer {
    /// `bind_ip` is the interface tunnel listeners bind on.
    pub fn new(bind_ip: IpAddr) -> Self {
        Self {
            bind_ip,
            index: RwLock::new(TcpIndex::default()),
        }
    }

    /// Bind `remote_port` and start accepting downstream connections for
    /// this tunnel. Port 0 lets the OS pick; the bound port is returned
    /// either way. The port and token indexes are updated under one lock,
    /// so lookups never see a half-registered tunnel.
    pub async fn start_tunnel(
        &self,
        remote_port: u16,
        sessions: Arc<TunnelSessions>,
    ) -> Result<u16, RelayError> {
        let token = sessions.token();
        let mut index = self.index.write().await;

        if remote_port != 0 && index.by_port.contains_key(&remote_port) {
            return Err(RelayError::PortAlreadyUsed(remote_port));
        }

        let listener = TcpListener::bind(SocketAddr::new(self.bind_ip, remote_port))
            .await
            .map_err(|source| RelayError::Bind {
                port: remote_port,
                source,
            })?;
        let bound_port = listener
            .local_addr()
            .map_err(|source| RelayError::Bind {
                port: remote_port,
                source,
            })?
            .port();

        let accept_task = tokio::spawn(
            accept_loop(listener, Arc::clone(&sessions))
                .instrument(tracing::info_span!("tcp_tunnel", port = bound_port, tunnel = %token)),
        );

        index.by_port.insert(
            bound_port,
            TcpTunnel {
                sessions,
                accept_task,
            },
        );
        index.ports_by_token.insert(token, bound_port);
        info!(port = bound_port, tunnel = %token, "TCP tunnel bound");
        Ok(bound_port)
    }

    /// Tear down the tunnel owning `token` and close its sessions.
    /// No-op when the tunnel is already gone. The port is free for
    /// rebinding by the time this returns.
    pub async fn shutdown_tunnel(&self, token: TunnelToken) {
        let entry = {
            let mut index = self.index.write().await;
            match index.ports_by_token.remove(&token) {
                Some(port) => index.by_port.remove(&port),
                None => None,
            }
        };
        let Some(tunnel) = entry else { return };

        tunnel.accept_task.abort();
        // The listener is dropped once the abort lands; wait for that so
        // the port really is free when we return.
        let _ = tunnel.accept_task.await;
        tunnel.sessions.close_all().await;
        info!(tunnel = %token, "TCP tunnel closed");
    }

    /// Look up a live tunnel's session registry.
    pub async fn registry(&self, token: TunnelToken) -> Option<Arc<TunnelSessions>> {
        let index = self.index.read().await;
        let port = index.ports_by_token.get(&token)?;
        index
            .by_port
            .get(port)
            .map(|tunnel| Arc::clone(&tunnel.sessions))
    }

    pub async fn tunnel_count(&self) -> usize {
        self.index.read().await.by_port.len()
    }
}

async fn accept_loop(listener: TcpListener, sessions: Arc<TunnelSessions>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let sessions = Arc::clone(&sessions);
                tokio::spawn(
                    serve_downstream(sessions, stream, Bytes::new())
                        .instrument(tracing::info_span!("session", peer = %peer_addr)),
                );
            }
            Err(e) => {
                error!(error = %e, "Accept error");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
