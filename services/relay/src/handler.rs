//! Control connection handling.
//!
//! One task per control connection runs the protocol state machine. A
//! second task owns the outbound half of the framed socket, fed by an
//! mpsc queue shared with the downstream session tasks, so frames from
//! every producer go out in send order. The connection is unbound until
//! an open request is admitted, bound to exactly one tunnel afterwards,
//! and its binding is released exactly once when the read loop ends, on
//! every exit path.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use culvert_proto::{MessageType, ProtoCodec, ProtoMessage, TunnelRequest, TunnelToken};

use crate::error::RelayError;
use crate::server::RelayState;
use crate::tunnel::{TunnelSessions, QUEUE_DEPTH};

type ControlSink = SplitSink<Framed<TcpStream, ProtoCodec>, ProtoMessage>;
type ControlStream = SplitStream<Framed<TcpStream, ProtoCodec>>;

enum Flow {
    Continue,
    Close(&'static str),
}

/// Serve one control connection to completion.
pub async fn handle_control(state: Arc<RelayState>, stream: TcpStream) {
    let framed = Framed::new(stream, ProtoCodec);
    let (sink, mut inbound) = framed.split();
    let (out_tx, out_rx) = mpsc::channel(QUEUE_DEPTH);
    let writer = tokio::spawn(write_loop(sink, out_rx));

    let mut conn = ControlConnection {
        state,
        out_tx,
        attached: None,
        granted: None,
    };
    let reason = conn.run(&mut inbound).await;
    conn.cleanup().await;
    drop(conn);

    // With every sender gone the writer drains what is queued (including
    // a final failure response) and only then closes the socket.
    let _ = writer.await;
    debug!(reason = reason, "Control connection finished");
}

struct ControlConnection {
    state: Arc<RelayState>,
    out_tx: mpsc::Sender<ProtoMessage>,
    /// The bound tunnel's registry. `None` means unbound.
    attached: Option<Arc<TunnelSessions>>,
    /// The success response as sent, repeated verbatim if the client
    /// retries its open request.
    granted: Option<ProtoMessage>,
}

impl ControlConnection {
    async fn run(&mut self, inbound: &mut ControlStream) -> &'static str {
        loop {
            let next = match self.state.idle_timeout {
                Some(idle) => match tokio::time::timeout(idle, inbound.next()).await {
                    Ok(next) => next,
                    Err(_) => return "idle timeout",
                },
                None => inbound.next().await,
            };

            let msg = match next {
                None => return "closed by peer",
                Some(Err(e)) => {
                    debug!(error = %e, "Control protocol error");
                    return "protocol error";
                }
                Some(Ok(msg)) => msg,
            };

            match self.dispatch(msg).await {
                Flow::Continue => {}
                Flow::Close(reason) => return reason,
            }
        }
    }

    async fn dispatch(&mut self, msg: ProtoMessage) -> Flow {
        match msg.ty {
            MessageType::HeartbeatPing => {
                trace!("Heartbeat ping");
                self.send(ProtoMessage::heartbeat_pong()).await
            }
            MessageType::Request => self.handle_request(msg).await,
            MessageType::Transfer => self.handle_transfer(msg).await,
            MessageType::LocalConnected => {
                // Informational; sessions are registered at accept time.
                if let Ok((_, session)) = msg.session_head() {
                    trace!(session = %session, "Local link up");
                }
                Flow::Continue
            }
            MessageType::LocalDisconnect => self.handle_local_disconnect(msg).await,
            MessageType::HeartbeatPong
            | MessageType::Response
            | MessageType::RemoteConnected
            | MessageType::RemoteDisconnect => {
                warn!(ty = ?msg.ty, "Ignoring message type not meant for the relay");
                Flow::Continue
            }
        }
    }

    async fn handle_request(&mut self, msg: ProtoMessage) -> Flow {
        if let Some(granted) = self.granted.clone() {
            // A bound client retrying its open request gets the stored
            // response again; nothing is re-bound.
            debug!("Duplicate open request, repeating stored response");
            return self.send(granted).await;
        }

        let request = match TunnelRequest::from_bytes(&msg.head) {
            Ok(request) => request,
            Err(e) => return self.refuse(RelayError::from(e)).await,
        };
        debug!(request = %request, "Open request");

        let request = match self.state.interceptor.proceed(request).await {
            Ok(request) => request,
            Err(e) => return self.refuse(e).await,
        };

        match request {
            TunnelRequest::Tcp {
                local_addr,
                local_port,
                remote_port,
            } => self.open_tcp(local_addr, local_port, remote_port).await,
            TunnelRequest::Http {
                local_addr,
                local_port,
                vhost,
            } => self.open_http(local_addr, local_port, vhost).await,
        }
    }

    async fn open_tcp(&mut self, local_addr: String, local_port: u16, remote_port: u16) -> Flow {
        let token = self.state.producer.next();
        let sessions = Arc::new(TunnelSessions::new(
            token,
            TunnelRequest::Tcp {
                local_addr: local_addr.clone(),
                local_port,
                remote_port,
            },
            self.out_tx.clone(),
        ));

        let bound_port = match self
            .state
            .tcp
            .start_tunnel(remote_port, Arc::clone(&sessions))
            .await
        {
            Ok(port) => port,
            Err(e) => return self.refuse(e).await,
        };

        // The response carries the port that actually got bound, which
        // differs from the request when the client asked for 0.
        let granted = TunnelRequest::Tcp {
            local_addr,
            local_port,
            remote_port: bound_port,
        };
        self.establish(token, sessions, granted).await
    }

    async fn open_http(&mut self, local_addr: String, local_port: u16, vhost: String) -> Flow {
        let Some(http) = self.state.http.clone() else {
            return self
                .refuse(RelayError::Rejected("http tunnels are disabled".to_string()))
                .await;
        };
        if http.is_registered(&vhost).await {
            return self.refuse(RelayError::VhostAlreadyUsed(vhost)).await;
        }

        let token = self.state.producer.next();
        let request = TunnelRequest::Http {
            local_addr,
            local_port,
            vhost: vhost.clone(),
        };
        let sessions = Arc::new(TunnelSessions::new(
            token,
            request.clone(),
            self.out_tx.clone(),
        ));

        if let Err(e) = http.register(&vhost, Arc::clone(&sessions)).await {
            return self.refuse(e).await;
        }
        self.establish(token, sessions, request).await
    }

    async fn establish(
        &mut self,
        token: TunnelToken,
        sessions: Arc<TunnelSessions>,
        granted: TunnelRequest,
    ) -> Flow {
        // Attach before building the response so a refusal below still
        // releases the binding through cleanup().
        self.attached = Some(sessions);
        let response = match ProtoMessage::response_ok(token, &granted) {
            Ok(response) => response,
            Err(e) => return self.refuse(RelayError::from(e)).await,
        };
        self.granted = Some(response.clone());
        self.state
            .stats
            .tunnels_established
            .fetch_add(1, Ordering::Relaxed);
        info!(tunnel = %token, granted = %granted, "Tunnel established");
        self.send(response).await
    }

    async fn handle_transfer(&mut self, msg: ProtoMessage) -> Flow {
        let (tunnel, session) = match msg.session_head() {
            Ok(head) => head,
            Err(e) => {
                debug!(error = %e, "Malformed transfer head");
                return Flow::Close("protocol error");
            }
        };

        // Lookup misses are teardown races, not errors. The frame is
        // dropped and the connection stays up.
        let Some(registry) = self.lookup_registry(tunnel).await else {
            trace!(tunnel = %tunnel, session = %session, "Transfer for unknown tunnel, dropped");
            return Flow::Continue;
        };
        let Some(handle) = registry.get(session).await else {
            trace!(tunnel = %tunnel, session = %session, "Transfer for unknown session, dropped");
            return Flow::Continue;
        };
        if !handle.send_data(msg.data).await {
            trace!(session = %session, "Transfer raced a closing session, dropped");
        }
        Flow::Continue
    }

    async fn handle_local_disconnect(&mut self, msg: ProtoMessage) -> Flow {
        let (tunnel, session) = match msg.session_head() {
            Ok(head) => head,
            Err(e) => {
                debug!(error = %e, "Malformed local disconnect head");
                return Flow::Close("protocol error");
            }
        };

        // Resolves only in the connection's own registry. The tunnel
        // token in the head never reaches other tunnels' sessions.
        if let Some(registry) = &self.attached {
            if let Some(handle) = registry.get(session).await {
                debug!(session = %session, "Local link closed, shutting down session");
                handle.shutdown().await;
                return Flow::Continue;
            }
        }
        trace!(tunnel = %tunnel, session = %session, "Local disconnect for unknown session, ignored");
        Flow::Continue
    }

    /// Resolve a tunnel token through the directory matching the bound
    /// tunnel's protocol. Unbound connections have nothing to resolve
    /// against.
    async fn lookup_registry(&self, tunnel: TunnelToken) -> Option<Arc<TunnelSessions>> {
        let attached = self.attached.as_ref()?;
        match attached.request() {
            TunnelRequest::Tcp { .. } => self.state.tcp.registry(tunnel).await,
            TunnelRequest::Http { .. } => match &self.state.http {
                Some(http) => http.registry(tunnel).await,
                None => None,
            },
        }
    }

    /// Queue a frame for the writer task.
    async fn send(&self, msg: ProtoMessage) -> Flow {
        if self.out_tx.send(msg).await.is_err() {
            return Flow::Close("writer gone");
        }
        Flow::Continue
    }

    /// Refuse the open request and close. The failure response is queued
    /// first and the writer drains its queue before closing the socket,
    /// so the reason reaches the client.
    async fn refuse(&mut self, error: RelayError) -> Flow {
        warn!(reason = %error, "Tunnel refused");
        self.state
            .stats
            .tunnels_refused
            .fetch_add(1, Ordering::Relaxed);
        match self.send(ProtoMessage::response_err(&error.to_string())).await {
            Flow::Continue => Flow::Close("request refused"),
            close => close,
        }
    }

    /// Release the tunnel binding and close its sessions. The take()
    /// makes a second call a no-op, so every exit path can funnel here.
    async fn cleanup(&mut self) {
        let Some(sessions) = self.attached.take() else {
            return;
        };
        let token = sessions.token();
        match sessions.request() {
            TunnelRequest::Tcp { .. } => self.state.tcp.shutdown_tunnel(token).await,
            TunnelRequest::Http { vhost, .. } => {
                if let Some(http) = &self.state.http {
                    http.unregister(vhost).await;
                }
            }
        }

        let stats = sessions.stats();
        info!(
            tunnel = %token,
            sessions = stats.sessions_opened.load(Ordering::Relaxed),
            bytes_in = stats.bytes_from_client.load(Ordering::Relaxed),
            bytes_out = stats.bytes_to_client.load(Ordering::Relaxed),
            "Tunnel torn down"
        );
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
