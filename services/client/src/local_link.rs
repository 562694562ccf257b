//! Local service links.
//!
//! Every downstream session the relay announces gets one link: a TCP
//! connection from the client to the local service, pumped by its own
//! task. [`LocalLinks`] is the live-link table keyed by session token;
//! the control connection owns one per tunnel and consults it for every
//! session-scoped frame.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

use culvert_proto::{ProtoMessage, SessionToken, TunnelToken};

/// Queue depth for the control outbound queue and for pending writes on
/// one local socket. Senders await free space, so a slow local service
/// backpressures the control connection instead of buffering without
/// bound.
pub const QUEUE_DEPTH: usize = 256;

const READ_CHUNK: usize = 8 * 1024;

/// Commands consumed by a link's socket task.
#[derive(Debug)]
pub enum LinkCommand {
    /// Write these bytes to the local socket.
    Data(Bytes),
    /// Finish pending writes, then close the socket.
    Shutdown,
}

/// Handle to one live local link.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    tx: mpsc::Sender<LinkCommand>,
}

impl LinkHandle {
    pub fn new(tx: mpsc::Sender<LinkCommand>) -> Self {
        Self { tx }
    }

    /// Queue bytes for the local socket, in order. Returns false if the
    /// link is already gone.
    pub async fn send_data(&self, data: Bytes) -> bool {
        self.tx.send(LinkCommand::Data(data)).await.is_ok()
    }

    /// Ask the link to flush and close. Returns false if the link is
    /// already gone.
    pub async fn shutdown(&self) -> bool {
        self.tx.send(LinkCommand::Shutdown).await.is_ok()
    }
}

/// Table of live links keyed by session token.
#[derive(Debug, Default)]
pub struct LocalLinks {
    links: RwLock<HashMap<SessionToken, LinkHandle>>,
}

impl LocalLinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: SessionToken, handle: LinkHandle) {
        let mut links = self.links.write().await;
        links.insert(session, handle);
    }

    pub async fn get(&self, session: SessionToken) -> Option<LinkHandle> {
        let links = self.links.read().await;
        links.get(&session).cloned()
    }

    /// Remove a link. Safe to call more than once per session.
    pub async fn remove(&self, session: SessionToken) -> Option<LinkHandle> {
        let mut links = self.links.write().await;
        links.remove(&session)
    }

    pub async fn link_count(&self) -> usize {
        let links = self.links.read().await;
        links.len()
    }

    /// Close every live link. The table is empty afterwards.
    pub async fn close_all(&self) {
        let handles: Vec<LinkHandle> = {
            let mut links = self.links.write().await;
            links.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.shutdown().await;
        }
    }
}

/// Serve one local link for an announced downstream session.
///
/// The caller registers the link before spawning this task, so transfers
/// queued behind the announcement land in the command queue while the
/// dial is still in flight. A failed dial answers with a disconnect
/// instead of a connect, and the close announcement is sent on every
/// exit path.
pub(crate) async fn run_link(
    links: Arc<LocalLinks>,
    control_tx: mpsc::Sender<ProtoMessage>,
    tunnel: TunnelToken,
    session: SessionToken,
    local_addr: String,
    local_port: u16,
    mut cmd_rx: mpsc::Receiver<LinkCommand>,
) {
    let mut stream = match TcpStream::connect((local_addr.as_str(), local_port)).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(session = %session, error = %e, "Local dial failed");
            links.remove(session).await;
            let _ = control_tx
                .send(ProtoMessage::local_disconnect(tunnel, session))
                .await;
            return;
        }
    };

    if control_tx
        .send(ProtoMessage::local_connected(tunnel, session))
        .await
        .is_err()
    {
        // Control connection is gone and the tunnel is tearing down.
        links.remove(session).await;
        return;
    }
    debug!(session = %session, "Local link opened");

    let (mut read_half, mut write_half) = stream.split();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(LinkCommand::Data(data)) => {
                    if write_half.write_all(&data).await.is_err() {
                        break;
                    }
                }
                // Shutdown command, or every handle dropped by a teardown.
                Some(LinkCommand::Shutdown) | None => break,
            },
            read = read_half.read_buf(&mut buf) => match read {
                Ok(0) => break,
                Ok(_) => {
                    let data = buf.split().freeze();
                    if control_tx
                        .send(ProtoMessage::transfer(tunnel, session, data))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    buf.reserve(READ_CHUNK);
                }
                Err(e) => {
                    trace!(error = %e, "Local read error");
                    break;
                }
            },
        }
    }

    // Pending writes were drained above; this flushes and half-closes
    // before the socket is dropped entirely.
    let _ = write_half.shutdown().await;
    links.remove(session).await;
    let _ = control_tx
        .send(ProtoMessage::local_disconnect(tunnel, session))
        .await;
    debug!(session = %session, "Local link closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use culvert_proto::MessageType;
    use tokio::net::TcpListener;

    const TUNNEL: TunnelToken = TunnelToken::new(7);

    async fn spawn_echo() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = stream.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        port
    }

    /// Binds and immediately drops a listener to find a port nothing
    /// listens on.
    fn dead_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let links = LocalLinks::new();
        let (tx, mut rx) = mpsc::channel(4);
        let session = SessionToken::new(1);

        links.insert(session, LinkHandle::new(tx)).await;
        assert_eq!(links.link_count().await, 1);

        let handle = links.get(session).await.unwrap();
        assert!(handle.send_data(Bytes::from_static(b"hi")).await);
        assert!(matches!(
            rx.recv().await,
            Some(LinkCommand::Data(data)) if &data[..] == b"hi"
        ));

        assert!(links.remove(session).await.is_some());
        assert!(links.remove(session).await.is_none());
        assert!(links.get(session).await.is_none());
    }

    #[tokio::test]
    async fn test_close_all_shuts_down_every_link() {
        let links = LocalLinks::new();
        let mut receivers = Vec::new();
        for raw in 1..=3 {
            let (tx, rx) = mpsc::channel(4);
            links.insert(SessionToken::new(raw), LinkHandle::new(tx)).await;
            receivers.push(rx);
        }

        links.close_all().await;
        assert_eq!(links.link_count().await, 0);
        for rx in &mut receivers {
            assert!(matches!(rx.recv().await, Some(LinkCommand::Shutdown)));
        }
    }

    #[tokio::test]
    async fn test_failed_dial_answers_with_disconnect() {
        let links = Arc::new(LocalLinks::new());
        let (control_tx, mut control_rx) = mpsc::channel(QUEUE_DEPTH);
        let session = SessionToken::new(1);
        let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_DEPTH);
        links.insert(session, LinkHandle::new(cmd_tx)).await;

        run_link(
            Arc::clone(&links),
            control_tx,
            TUNNEL,
            session,
            "127.0.0.1".to_string(),
            dead_port(),
            cmd_rx,
        )
        .await;

        let msg = control_rx.recv().await.unwrap();
        assert_eq!(msg.ty, MessageType::LocalDisconnect);
        assert_eq!(msg.session_head().unwrap(), (TUNNEL, session));
        assert_eq!(links.link_count().await, 0);
    }

    #[tokio::test]
    async fn test_link_pumps_both_directions() {
        let port = spawn_echo().await;
        let links = Arc::new(LocalLinks::new());
        let (control_tx, mut control_rx) = mpsc::channel(QUEUE_DEPTH);
        let session = SessionToken::new(1);
        let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_DEPTH);
        let handle = LinkHandle::new(cmd_tx);
        links.insert(session, handle.clone()).await;

        let task = tokio::spawn(run_link(
            Arc::clone(&links),
            control_tx,
            TUNNEL,
            session,
            "127.0.0.1".to_string(),
            port,
            cmd_rx,
        ));

        let msg = control_rx.recv().await.unwrap();
        assert_eq!(msg.ty, MessageType::LocalConnected);

        assert!(handle.send_data(Bytes::from_static(b"over the wire")).await);
        let msg = control_rx.recv().await.unwrap();
        assert_eq!(msg.ty, MessageType::Transfer);
        assert_eq!(msg.session_head().unwrap(), (TUNNEL, session));
        assert_eq!(&msg.data[..], b"over the wire");

        assert!(handle.shutdown().await);
        let msg = control_rx.recv().await.unwrap();
        assert_eq!(msg.ty, MessageType::LocalDisconnect);
        assert_eq!(links.link_count().await, 0);
        task.await.unwrap();
    }
}
