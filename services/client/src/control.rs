//! Control connection to the relay.
//!
//! [`Tunnel::open`] dials the relay, sends the open request and waits
//! for the verdict. An established tunnel is then driven by
//! [`Tunnel::serve`]: one task runs the read loop and a second owns the
//! outbound half of the framed socket, fed by an mpsc queue shared with
//! the link tasks, so frames from every producer go out in send order.
//! [`run`] wraps both in the redial loop the daemon lives in.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn, Instrument};

use culvert_proto::{
    MessageType, OpenReply, ProtoCodec, ProtoMessage, TunnelRequest, TunnelToken,
};

use crate::config::Settings;
use crate::error::ClientError;
use crate::local_link::{run_link, LinkHandle, LocalLinks, QUEUE_DEPTH};

type ControlSink = SplitSink<Framed<TcpStream, ProtoCodec>, ProtoMessage>;
type ControlStream = SplitStream<Framed<TcpStream, ProtoCodec>>;

/// One established tunnel over a live control connection.
pub struct Tunnel {
    token: TunnelToken,
    granted: TunnelRequest,
    inbound: ControlStream,
    out_tx: mpsc::Sender<ProtoMessage>,
    writer: JoinHandle<()>,
    links: Arc<LocalLinks>,
    heartbeat: Duration,
    /// Session frames that arrived ahead of the open response. The relay
    /// publishes the public endpoint before it answers, so a fast
    /// downstream peer can get announced first. Replayed by `serve`.
    pending: Vec<ProtoMessage>,
}

impl Tunnel {
    /// Dial the relay and run the open handshake to a verdict.
    pub async fn open(settings: &Settings) -> Result<Self, ClientError> {
        // Serialize the descriptor before dialing so a bad one fails
        // without touching the network.
        let request = ProtoMessage::request(&settings.request)?;

        let stream = TcpStream::connect(&settings.relay_addr).await?;
        let framed = Framed::new(stream, ProtoCodec);
        let (sink, mut inbound) = framed.split();
        let (out_tx, out_rx) = mpsc::channel(QUEUE_DEPTH);
        let writer = tokio::spawn(write_loop(sink, out_rx));

        if out_tx.send(request).await.is_err() {
            writer.abort();
            return Err(ClientError::Handshake("writer task gone"));
        }
        debug!(request = %settings.request, "Open request sent");

        let mut pending = Vec::new();
        let reply = loop {
            match inbound.next().await {
                None => {
                    writer.abort();
                    return Err(ClientError::Handshake("relay closed before answering"));
                }
                Some(Err(e)) => {
                    writer.abort();
                    return Err(e.into());
                }
                Some(Ok(msg)) if msg.ty == MessageType::Response => {
                    break msg.open_reply()?;
                }
                Some(Ok(msg)) => pending.push(msg),
            }
        };

        match reply {
            OpenReply::Refused { reason } => {
                writer.abort();
                Err(ClientError::Rejected(reason))
            }
            OpenReply::Established { token, request } => {
                info!(tunnel = %token, granted = %request, "Tunnel established");
                Ok(Self {
                    token,
                    granted: request,
                    inbound,
                    out_tx,
                    writer,
                    links: Arc::new(LocalLinks::new()),
                    heartbeat: settings.heartbeat,
                    pending,
                })
            }
        }
    }

    /// Token the relay minted for this tunnel.
    pub fn token(&self) -> TunnelToken {
        self.token
    }

    /// The descriptor as admitted, with the port the relay actually
    /// bound when the request asked for 0.
    pub fn granted(&self) -> &TunnelRequest {
        &self.granted
    }

    /// Drive the tunnel until shutdown is signalled or the connection is
    /// lost. Returns `Ok(())` only for a signalled shutdown; connection
    /// loss is an error so the caller can decide to redial.
    pub async fn serve(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
        // The first tick fires at once, which doubles as a connect-time
        // liveness probe.
        let mut heartbeat = tokio::time::interval(self.heartbeat);

        let mut result = Ok(());
        for msg in std::mem::take(&mut self.pending) {
            result = self.dispatch(msg).await;
            if result.is_err() {
                break;
            }
        }

        while result.is_ok() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, closing tunnel");
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    trace!("Heartbeat ping");
                    if self.out_tx.send(ProtoMessage::heartbeat_ping()).await.is_err() {
                        result = Err(ClientError::ConnectionLost);
                    }
                }
                next = self.inbound.next() => match next {
                    None => result = Err(ClientError::ConnectionLost),
                    Some(Err(e)) => {
                        debug!(error = %e, "Control protocol error");
                        result = Err(e.into());
                    }
                    Some(Ok(msg)) => result = self.dispatch(msg).await,
                },
            }
        }

        self.links.close_all().await;
        // With every sender gone the writer drains what is queued
        // (including the links' final disconnects) and closes the socket.
        drop(self.out_tx);
        let _ = self.writer.await;
        debug!("Control connection finished");
        result
    }

    async fn dispatch(&mut self, msg: ProtoMessage) -> Result<(), ClientError> {
        match msg.ty {
            MessageType::HeartbeatPong => {
                trace!("Heartbeat pong");
                Ok(())
            }
            MessageType::HeartbeatPing => {
                trace!("Heartbeat ping from relay");
                self.send(ProtoMessage::heartbeat_pong()).await
            }
            MessageType::RemoteConnected => self.handle_remote_connected(msg).await,
            MessageType::RemoteDisconnect => self.handle_remote_disconnect(msg).await,
            MessageType::Transfer => self.handle_transfer(msg).await,
            MessageType::Response => {
                debug!("Duplicate open response, ignored");
                Ok(())
            }
            MessageType::Request | MessageType::LocalConnected | MessageType::LocalDisconnect => {
                warn!(ty = ?msg.ty, "Ignoring message type not meant for the client");
                Ok(())
            }
        }
    }

    async fn handle_remote_connected(&mut self, msg: ProtoMessage) -> Result<(), ClientError> {
        let (tunnel, session) = msg.session_head()?;

        // Register before dialing so transfers right behind the
        // announcement land in the link's queue while the dial is still
        // in flight.
        let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_DEPTH);
        self.links.insert(session, LinkHandle::new(cmd_tx)).await;
        debug!(session = %session, "Downstream session announced");

        tokio::spawn(
            run_link(
                Arc::clone(&self.links),
                self.out_tx.clone(),
                tunnel,
                session,
                self.granted.local_addr().to_string(),
                self.granted.local_port(),
                cmd_rx,
            )
            .instrument(tracing::info_span!("link", session = %session)),
        );
        Ok(())
    }

    async fn handle_remote_disconnect(&mut self, msg: ProtoMessage) -> Result<(), ClientError> {
        let (_, session) = msg.session_head()?;
        if let Some(handle) = self.links.get(session).await {
            debug!(session = %session, "Downstream session closed, shutting down link");
            handle.shutdown().await;
        } else {
            trace!(session = %session, "Remote disconnect for unknown session, ignored");
        }
        Ok(())
    }

    async fn handle_transfer(&mut self, msg: ProtoMessage) -> Result<(), ClientError> {
        let (_, session) = msg.session_head()?;

        // Lookup misses are teardown races, not errors. The frame is
        // dropped and the connection stays up.
        match self.links.get(session).await {
            Some(handle) => {
                if !handle.send_data(msg.data).await {
                    trace!(session = %session, "Transfer raced a closing link, dropped");
                }
            }
            None => trace!(session = %session, "Transfer for unknown session, dropped"),
        }
        Ok(())
    }

    /// Queue a frame for the writer task.
    async fn send(&self, msg: ProtoMessage) -> Result<(), ClientError> {
        self.out_tx
            .send(msg)
            .await
            .map_err(|_| ClientError::ConnectionLost)
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("token", &self.token)
            .field("granted", &self.granted)
            .finish_non_exhaustive()
    }
}

/// Run the client daemon: open the tunnel, serve it, redial on loss.
///
/// A refused open request is final and returned to the caller; transport
/// failures wait out the configured delay and try again. Returns
/// `Ok(())` once shutdown is signalled.
pub async fn run(settings: Settings, mut shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        match Tunnel::open(&settings).await {
            Err(ClientError::Rejected(reason)) => return Err(ClientError::Rejected(reason)),
            Err(e) => warn!(error = %e, relay_addr = %settings.relay_addr, "Failed to open tunnel"),
            Ok(tunnel) => match tunnel.serve(shutdown.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(error = %e, "Tunnel lost"),
            },
        }

        info!(delay_ms = settings.reconnect_delay.as_millis() as u64, "Redialing relay");
        tokio::select! {
            _ = tokio::time::sleep(settings.reconnect_delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

async fn write_loop(mut sink: ControlSink, mut out_rx: mpsc::Receiver<ProtoMessage>) {
    while let Some(msg) = out_rx.recv().await {
        if sink.send(msg).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}
