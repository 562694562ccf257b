//! Per-tunnel session registry.
//!
//! One [`TunnelSessions`] exists per established tunnel. It ties together
//! the tunnel token, the admitted request, the control-connection outbound
//! queue and the live downstream sessions. The control handler creates it
//! at admission time and the owning directory drops it when the tunnel
//! goes away, closing every remaining session with it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};

use culvert_proto::{ProtoMessage, SessionToken, TunnelRequest, TunnelToken};

/// Queue depth for outbound frames on one control connection and for
/// pending writes on one downstream socket. Senders await free space, so
/// a slow consumer backpressures its producers instead of buffering
/// without bound.
pub const QUEUE_DEPTH: usize = 256;

/// Sender half of a control connection's outbound frame queue.
pub type ControlSender = mpsc::Sender<ProtoMessage>;

/// Commands consumed by a downstream session's socket task.
#[derive(Debug)]
pub enum SessionCommand {
    /// Write these bytes to the downstream socket.
    Data(Bytes),
    /// Finish pending writes, then close the socket.
    Shutdown,
}

/// Handle to one live downstream session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn new(tx: mpsc::Sender<SessionCommand>) -> Self {
        Self { tx }
    }

    /// Queue bytes for the downstream socket, in order. Returns false if
    /// the session is already gone.
    pub async fn send_data(&self, data: Bytes) -> bool {
        self.tx.send(SessionCommand::Data(data)).await.is_ok()
    }

    /// Ask the session to flush and close. Returns false if the session
    /// is already gone.
    pub async fn shutdown(&self) -> bool {
        self.tx.send(SessionCommand::Shutdown).await.is_ok()
    }
}

/// Byte and session counters for one tunnel.
#[derive(Debug, Default)]
pub struct TunnelStats {
    /// Downstream connections accepted over the tunnel's lifetime.
    pub sessions_opened: AtomicU64,
    /// Downstream connections closed.
    pub sessions_closed: AtomicU64,
    /// Bytes relayed from downstream peers toward the client.
    pub bytes_to_client: AtomicU64,
    /// Bytes relayed from the client toward downstream peers.
    pub bytes_from_client: AtomicU64,
}

/// State for one established tunnel.
pub struct TunnelSessions {
    token: TunnelToken,
    request: TunnelRequest,
    control_tx: ControlSender,
    sessions: RwLock<HashMap<SessionToken, SessionHandle>>,
    next_session: AtomicU64,
    stats: TunnelStats,
}

impl TunnelSessions {
    pub fn new(token: TunnelToken, request: TunnelRequest, control_tx: ControlSender) -> Self {
        Self {
            token,
            request,
            control_tx,
            sessions: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            stats: TunnelStats::default(),
        }
    }

    pub fn token(&self) -> TunnelToken {
        self.token
    }

    pub fn request(&self) -> &TunnelRequest {
        &self.request
    }

    pub fn control_sender(&self) -> ControlSender {
        self.control_tx.clone()
    }

    pub fn stats(&self) -> &TunnelStats {
        &self.stats
    }

    /// Mint the next session token. Scoped to this tunnel; tokens restart
    /// at 1 for every tunnel.
    pub fn next_session_token(&self) -> SessionToken {
        SessionToken::new(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn insert(&self, session: SessionToken, handle: SessionHandle) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session, handle);
    }

    pub async fn get(&self, session: SessionToken) -> Option<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions.get(&session).cloned()
    }

    /// Remove a session. Safe to call more than once per session.
    pub async fn remove(&self, session: SessionToken) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(&session)
    }

    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }

    /// Close every live session. The registry is empty afterwards.
    pub async fn close_all(&self) {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.shutdown().await;
        }
    }
}

impl std::fmt::Debug for TunnelSessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSessions")
            .field("token", &self.token)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}
