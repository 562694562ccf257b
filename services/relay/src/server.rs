//! Relay server bootstrap.
//!
//! [`RelayServer`] binds the control listener (and the shared HTTP vhost
//! listener when configured), owns the state every control connection
//! shares, and runs the accept loop until shutdown is signalled.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, Instrument};

use crate::config::Config;
use crate::handler;
use crate::interceptor::{AllowAll, PortPolicy, RequestInterceptor};
use crate::tokens::TokenProducer;
use crate::tunnel::{HttpServer, TcpServer};

/// Counters for the relay as a whole.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Control connections accepted.
    pub control_connections: AtomicU64,
    /// Tunnels admitted.
    pub tunnels_established: AtomicU64,
    /// Open requests refused.
    pub tunnels_refused: AtomicU64,
}

/// State shared by every control connection.
pub struct RelayState {
    pub producer: TokenProducer,
    pub tcp: TcpServer,
    pub http: Option<Arc<HttpServer>>,
    pub interceptor: Arc<dyn RequestInterceptor>,
    pub idle_timeout: Option<Duration>,
    pub stats: RelayStats,
}

/// The relay: control listener plus the shared tunnel state.
pub struct RelayServer {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Bind the control listener and, when configured, the HTTP vhost
    /// listener. Port-range policy becomes the interceptor when allowed
    /// ports are configured; everything is admitted otherwise.
    pub async fn bind(config: &Config) -> io::Result<Self> {
        let listener = TcpListener::bind(config.control_bind).await?;
        info!(control_bind = %listener.local_addr()?, "Control listener bound");

        let http = match config.http_bind {
            Some(addr) => Some(Arc::new(HttpServer::bind(addr).await?)),
            None => None,
        };

        let interceptor: Arc<dyn RequestInterceptor> = match &config.allowed_ports {
            Some(ranges) => Arc::new(PortPolicy::new(ranges.clone())),
            None => Arc::new(AllowAll),
        };

        let state = Arc::new(RelayState {
            producer: TokenProducer::new(),
            tcp: TcpServer::new(config.control_bind.ip()),
            http,
            interceptor,
            idle_timeout: config.idle_timeout(),
            stats: RelayStats::default(),
        });

        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Address of the shared HTTP vhost listener, when enabled.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.state
            .http
            .as_ref()
            .and_then(|http| http.local_addr().ok())
    }

    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    /// Accept control connections until shutdown is signalled (or the
    /// shutdown channel is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        if let Some(http) = self.state.http.clone() {
            let http_shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = http.run(http_shutdown).await {
                    error!(error = %e, "HTTP listener error");
                }
            });
        }

        info!(control_bind = %self.listener.local_addr()?, "Relay started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        self.state
                            .stats
                            .control_connections
                            .fetch_add(1, Ordering::Relaxed);
                        let state = Arc::clone(&self.state);
                        tokio::spawn(
                            handler::handle_control(state, stream)
                                .instrument(tracing::info_span!("control", peer = %peer_addr)),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        info!("Relay stopped");
        Ok(())
    }
}
