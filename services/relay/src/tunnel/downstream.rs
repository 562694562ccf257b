//! Downstream session plumbing shared by the TCP and HTTP listeners.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use culvert_proto::ProtoMessage;

use super::sessions::{SessionCommand, SessionHandle, TunnelSessions, QUEUE_DEPTH};

const READ_CHUNK: usize = 8 * 1024;

/// Serve one downstream connection over its tunnel.
///
/// The session is registered before it is announced, so a `Transfer` from
/// the client can never name a session the registry does not know yet.
/// `initial` carries bytes that were already read off the socket (the
/// sniffed HTTP head); they are relayed ahead of anything else.
///
/// The close announcement is sent on every exit path, including when a
/// racing teardown already removed the registry entry.
pub(super) async fn serve_downstream(
    sessions: Arc<TunnelSessions>,
    mut stream: TcpStream,
    initial: Bytes,
) {
    let tunnel = sessions.token();
    let session = sessions.next_session_token();
    let control_tx = sessions.control_sender();

    let (cmd_tx, mut cmd_rx) = mpsc::channel(QUEUE_DEPTH);
    sessions.insert(session, SessionHandle::new(cmd_tx)).await;
    let stats = sessions.stats();
    stats.sessions_opened.fetch_add(1, Ordering::Relaxed);

    if control_tx
        .send(ProtoMessage::remote_connected(tunnel, session))
        .await
        .is_err()
    {
        // Control connection is gone and the tunnel is tearing down.
        sessions.remove(session).await;
        stats.sessions_closed.fetch_add(1, Ordering::Relaxed);
        return;
    }
    debug!(session = %session, "Downstream session opened");

    if !initial.is_empty() {
        stats
            .bytes_to_client
            .fetch_add(initial.len() as u64, Ordering::Relaxed);
        if control_tx
            .send(ProtoMessage::transfer(tunnel, session, initial))
            .await
            .is_err()
        {
            sessions.remove(session).await;
            stats.sessions_closed.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }

    let (mut read_half, mut write_half) = stream.split();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::Data(data)) => {
                    stats
                        .bytes_from_client
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                    if write_half.write_all(&data).await.is_err() {
                        break;
                    }
                }
                // Shutdown command, or every handle dropped by a teardown.
                Some(SessionCommand::Shutdown) | None => break,
            },
            read = read_half.read_buf(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    stats.bytes_to_client.fetch_add(n as u64, Ordering::Relaxed);
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
                    trace!(error = %e, "Downstream read error");
                    break;
                }
            },
        }
    }

    // Pending writes were drained above; this flushes and half-closes
    // before the socket is dropped entirely.
    let _ = write_half.shutdown().await;
    sessions.remove(session).await;
    stats.sessions_closed.fetch_add(1, Ordering::Relaxed);
    let _ = control_tx
        .send(ProtoMessage::remote_disconnect(tunnel, session))
        .await;
    debug!(session = %session, "Downstream session closed");
}
