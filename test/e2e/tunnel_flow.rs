//! End-to-end tunnel flow tests.
//!
//! Each test stands up a real relay, a real local backend and the real
//! client, then talks to the tunnel's public endpoint like any downstream
//! peer would, verifying:
//!
//! 1. TCP traffic round trips downstream -> relay -> client -> backend
//! 2. Vhost claims are exclusive while held and free again after close
//! 3. Remote ports are reclaimed after the holding client goes away
//! 4. The client keeps redialing until a relay shows up
//!
//! ## Running
//!
//! ```bash
//! cargo test -p culvert-e2e --test tunnel_flow
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use culvert_client::{ClientError, Settings, Tunnel};
use culvert_proto::TunnelRequest;
use culvert_relay::{Config, RelayServer, RelayState};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,culvert_relay=debug,culvert_client=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// A relay running in the background for one test.
struct Relay {
    control_addr: SocketAddr,
    http_addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown_tx: watch::Sender<bool>,
}

impl Relay {
    async fn spawn() -> Self {
        Self::spawn_on("127.0.0.1:0".parse().unwrap()).await
    }

    async fn spawn_on(control_bind: SocketAddr) -> Self {
        let config = Config {
            control_bind,
            http_bind: Some("127.0.0.1:0".parse().unwrap()),
            allowed_ports: None,
            idle_timeout_secs: 600,
            log_level: "info".to_string(),
        };
        let server = RelayServer::bind(&config).await.expect("relay bind failed");
        let control_addr = server.local_addr().unwrap();
        let http_addr = server.http_addr().unwrap();
        let state = server.state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = server.run(shutdown_rx).await;
        });
        Self {
            control_addr,
            http_addr,
            state,
            shutdown_tx,
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// A local TCP echo service standing in for the user's backend.
struct EchoBackend {
    port: u16,
    connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl EchoBackend {
    async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&connections);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        let Ok((mut stream, _)) = accepted else { break };
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(async move {
                            let (mut rd, mut wr) = stream.split();
                            let _ = tokio::io::copy(&mut rd, &mut wr).await;
                        });
                    }
                }
            }
        });

        Self {
            port,
            connections,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for EchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A local HTTP service that answers every request with a canned body
/// and closes.
struct HttpBackend {
    port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl HttpBackend {
    async fn spawn(body: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        let Ok((mut stream, _)) = accepted else { break };
                        tokio::spawn(async move {
                            let mut head = Vec::new();
                            let mut byte = [0u8; 1];
                            while !head.ends_with(b"\r\n\r\n") {
                                match stream.read(&mut byte).await {
                                    Ok(0) | Err(_) => return,
                                    Ok(_) => head.push(byte[0]),
                                }
                            }
                            let response = format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                                body.len()
                            );
                            let _ = stream.write_all(response.as_bytes()).await;
                            let _ = stream.shutdown().await;
                        });
                    }
                }
            }
        });

        Self {
            port,
            shutdown_tx: Some(shutdown_tx),
        }
    }
}

impl Drop for HttpBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn settings(relay_addr: SocketAddr, request: TunnelRequest) -> Settings {
    Settings {
        relay_addr: relay_addr.to_string(),
        request,
        heartbeat: Duration::from_secs(30),
        reconnect_delay: Duration::from_millis(100),
    }
}

fn tcp_request(local_port: u16, remote_port: u16) -> TunnelRequest {
    TunnelRequest::Tcp {
        local_addr: "127.0.0.1".to_string(),
        local_port,
        remote_port,
    }
}

fn http_request(local_port: u16, vhost: &str) -> TunnelRequest {
    TunnelRequest::Http {
        local_addr: "127.0.0.1".to_string(),
        local_port,
        vhost: vhost.to_string(),
    }
}

/// An established tunnel being served in the background.
#[derive(Debug)]
struct Client {
    granted: TunnelRequest,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<(), ClientError>>,
}

impl Client {
    async fn spawn(relay_addr: SocketAddr, request: TunnelRequest) -> Result<Self, ClientError> {
        let tunnel = Tunnel::open(&settings(relay_addr, request)).await?;
        let granted = tunnel.granted().clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(tunnel.serve(shutdown_rx));
        Ok(Self {
            granted,
            shutdown_tx,
            task,
        })
    }

    fn granted_port(&self) -> u16 {
        match &self.granted {
            TunnelRequest::Tcp { remote_port, .. } => *remote_port,
            other => panic!("expected a tcp descriptor, got {other}"),
        }
    }

    /// Signal shutdown and wait for the serve loop to wind down.
    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let result = timeout(TEST_TIMEOUT, self.task)
            .await
            .expect("client did not stop in time")
            .unwrap();
        assert!(result.is_ok(), "clean shutdown failed: {result:?}");
    }
}

async fn roundtrip(port: u16, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut echoed))
        .await
        .expect("timed out reading the echo")
        .unwrap();
    echoed
}

#[tokio::test]
async fn e2e_tcp_echo_through_tunnel() {
    init_tracing();
    let backend = EchoBackend::spawn().await;
    let relay = Relay::spawn().await;

    let client = Client::spawn(relay.control_addr, tcp_request(backend.port, 0))
        .await
        .unwrap();
    let public_port = client.granted_port();
    assert_ne!(public_port, 0);

    // Two sequential downstream peers, each with its own session.
    let echoed = roundtrip(public_port, b"first peer says hello").await;
    assert_eq!(echoed, b"first peer says hello");
    let echoed = roundtrip(public_port, b"second peer says hello").await;
    assert_eq!(echoed, b"second peer says hello");

    assert_eq!(backend.connection_count(), 2);
    assert_eq!(
        relay.state.stats.tunnels_established.load(Ordering::Relaxed),
        1
    );

    client.stop().await;
}

#[tokio::test]
async fn e2e_vhost_exclusive_while_held() {
    init_tracing();
    let backend = HttpBackend::spawn("tunneled").await;
    let relay = Relay::spawn().await;

    let holder = Client::spawn(relay.control_addr, http_request(backend.port, "app.example.com"))
        .await
        .unwrap();

    // A second claim on the same vhost is turned down.
    let err = Client::spawn(relay.control_addr, http_request(backend.port, "app.example.com"))
        .await
        .unwrap_err();
    match err {
        ClientError::Rejected(reason) => {
            assert!(reason.contains("already used"), "got: {reason}")
        }
        other => panic!("expected a rejection, got {other}"),
    }

    // The holder still serves requests end to end.
    let mut downstream = TcpStream::connect(relay.http_addr).await.unwrap();
    downstream
        .write_all(b"GET / HTTP/1.1\r\nHost: app.example.com\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    timeout(TEST_TIMEOUT, downstream.read_to_end(&mut response))
        .await
        .expect("timed out reading the response")
        .unwrap();
    assert!(response.starts_with(b"HTTP/1.1 200 OK"));
    assert!(response.ends_with(b"tunneled"));

    // Once the holder leaves, the vhost can be claimed again.
    holder.stop().await;
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    let successor = loop {
        match Client::spawn(relay.control_addr, http_request(backend.port, "app.example.com"))
            .await
        {
            Ok(client) => break client,
            Err(ClientError::Rejected(_)) => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "vhost was never released"
                );
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(other) => panic!("unexpected open failure: {other}"),
        }
    };
    successor.stop().await;
}

#[tokio::test]
async fn e2e_remote_port_reclaimed_after_shutdown() {
    init_tracing();
    let backend = EchoBackend::spawn().await;
    let relay = Relay::spawn().await;

    let first = Client::spawn(relay.control_addr, tcp_request(backend.port, 0))
        .await
        .unwrap();
    let port = first.granted_port();
    first.stop().await;

    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    let second = loop {
        match Client::spawn(relay.control_addr, tcp_request(backend.port, port)).await {
            Ok(client) => break client,
            Err(ClientError::Rejected(_)) => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "port was never released"
                );
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(other) => panic!("unexpected open failure: {other}"),
        }
    };
    assert_eq!(second.granted_port(), port);

    let echoed = roundtrip(port, b"still in business").await;
    assert_eq!(echoed, b"still in business");
    second.stop().await;
}

#[tokio::test]
async fn e2e_client_redials_until_relay_appears() {
    init_tracing();
    let backend = EchoBackend::spawn().await;

    // Reserve an address nothing listens on yet.
    let relay_addr = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap()
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let client = tokio::spawn(culvert_client::run(
        settings(relay_addr, tcp_request(backend.port, 0)),
        shutdown_rx,
    ));

    // Let a few dials fail, then bring the relay up on that address.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let relay = Relay::spawn_on(relay_addr).await;

    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while relay.state.tcp.tunnel_count().await == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "client never reached the relay"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    shutdown_tx.send(true).unwrap();
    let result = timeout(TEST_TIMEOUT, client)
        .await
        .expect("client did not stop in time")
        .unwrap();
    assert!(result.is_ok(), "clean shutdown failed: {result:?}");
}
