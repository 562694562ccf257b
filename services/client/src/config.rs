//! Client configuration.
//!
//! Settings come from three layers. Command-line flags (or their
//! `CULVERT_*` environment fallbacks) win over the optional TOML tunnel
//! file, and built-in defaults fill whatever is left.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use culvert_proto::TunnelRequest;
use serde::Deserialize;

pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:7835";
pub const DEFAULT_LOCAL_ADDR: &str = "127.0.0.1";
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;
pub const DEFAULT_RECONNECT_SECS: u64 = 3;

/// Tunnel protocol selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Tcp,
    Http,
}

/// Command-line arguments. Every flag can also come from the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "culvert", version, about = "Culvert tunnel client")]
pub struct Args {
    /// Tunnel file (TOML). Flags override values from the file.
    #[arg(long, env = "CULVERT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Relay control address, host:port.
    #[arg(long, env = "CULVERT_RELAY_ADDR")]
    pub relay_addr: Option<String>,

    /// Tunnel protocol.
    #[arg(long, env = "CULVERT_PROTO", value_enum)]
    pub proto: Option<Proto>,

    /// Address of the local service the tunnel forwards to.
    #[arg(long, env = "CULVERT_LOCAL_ADDR")]
    pub local_addr: Option<String>,

    /// Port of the local service the tunnel forwards to.
    #[arg(long, env = "CULVERT_LOCAL_PORT")]
    pub local_port: Option<u16>,

    /// Public port to claim on the relay (tcp tunnels). 0 lets the relay pick.
    #[arg(long, env = "CULVERT_REMOTE_PORT")]
    pub remote_port: Option<u16>,

    /// Virtual host to claim on the relay (http tunnels).
    #[arg(long, env = "CULVERT_VHOST")]
    pub vhost: Option<String>,

    /// Seconds between heartbeat pings on the control connection.
    #[arg(long, env = "CULVERT_HEARTBEAT_SECS")]
    pub heartbeat_secs: Option<u64>,

    /// Seconds to wait before redialing a lost relay connection.
    #[arg(long, env = "CULVERT_RECONNECT_SECS")]
    pub reconnect_secs: Option<u64>,

    /// Log level filter when RUST_LOG is unset.
    #[arg(long, env = "CULVERT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Tunnel file schema. Every key is optional; unknown keys are rejected
/// so typos fail loudly instead of being silently ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    relay_addr: Option<String>,
    proto: Option<Proto>,
    local_addr: Option<String>,
    local_port: Option<u16>,
    remote_port: Option<u16>,
    vhost: Option<String>,
    heartbeat_secs: Option<u64>,
    reconnect_secs: Option<u64>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read tunnel file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse tunnel file {}", path.display()))
    }
}

/// Fully resolved client settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Relay control address, host:port.
    pub relay_addr: String,
    /// The tunnel to request on connect.
    pub request: TunnelRequest,
    /// Interval between heartbeat pings.
    pub heartbeat: Duration,
    /// Delay before redialing a lost relay connection.
    pub reconnect_delay: Duration,
}

impl Settings {
    /// Merge flags over the tunnel file and validate the result.
    pub fn resolve(args: &Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let relay_addr = args
            .relay_addr
            .clone()
            .or(file.relay_addr)
            .unwrap_or_else(|| DEFAULT_RELAY_ADDR.to_string());
        let proto = args.proto.or(file.proto).unwrap_or(Proto::Tcp);
        let local_addr = args
            .local_addr
            .clone()
            .or(file.local_addr)
            .unwrap_or_else(|| DEFAULT_LOCAL_ADDR.to_string());
        let local_port = args
            .local_port
            .or(file.local_port)
            .context("a local port is required (--local-port or the tunnel file)")?;

        let request = match proto {
            Proto::Tcp => TunnelRequest::Tcp {
                local_addr,
                local_port,
                remote_port: args.remote_port.or(file.remote_port).unwrap_or(0),
            },
            Proto::Http => TunnelRequest::Http {
                local_addr,
                local_port,
                vhost: args
                    .vhost
                    .clone()
                    .or(file.vhost)
                    .context("http tunnels need a virtual host (--vhost or the tunnel file)")?,
            },
        };

        Ok(Self {
            relay_addr,
            request,
            heartbeat: Duration::from_secs(
                args.heartbeat_secs
                    .or(file.heartbeat_secs)
                    .unwrap_or(DEFAULT_HEARTBEAT_SECS),
            ),
            reconnect_delay: Duration::from_secs(
                args.reconnect_secs
                    .or(file.reconnect_secs)
                    .unwrap_or(DEFAULT_RECONNECT_SECS),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).expect("argv should parse")
    }

    fn tunnel_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(contents.as_bytes()).expect("write tunnel file");
        file
    }

    #[test]
    fn test_defaults_fill_unset_fields() {
        let args = parse(&["culvert", "--local-port", "8080"]);
        let settings = Settings::resolve(&args).unwrap();

        assert_eq!(settings.relay_addr, DEFAULT_RELAY_ADDR);
        assert_eq!(settings.heartbeat, Duration::from_secs(30));
        assert_eq!(settings.reconnect_delay, Duration::from_secs(3));
        match settings.request {
            TunnelRequest::Tcp {
                local_addr,
                local_port,
                remote_port,
            } => {
                assert_eq!(local_addr, "127.0.0.1");
                assert_eq!(local_port, 8080);
                assert_eq!(remote_port, 0);
            }
            other => panic!("expected a tcp request, got {other}"),
        }
    }

    #[test]
    fn test_local_port_is_required() {
        let args = parse(&["culvert"]);
        let err = Settings::resolve(&args).unwrap_err();
        assert!(err.to_string().contains("local port"));
    }

    #[test]
    fn test_http_requires_vhost() {
        let args = parse(&["culvert", "--proto", "http", "--local-port", "3000"]);
        let err = Settings::resolve(&args).unwrap_err();
        assert!(err.to_string().contains("virtual host"));
    }

    #[test]
    fn test_http_request_built_from_flags() {
        let args = parse(&[
            "culvert",
            "--proto",
            "http",
            "--local-port",
            "3000",
            "--vhost",
            "app.example.com",
        ]);
        let settings = Settings::resolve(&args).unwrap();
        match settings.request {
            TunnelRequest::Http { vhost, local_port, .. } => {
                assert_eq!(vhost, "app.example.com");
                assert_eq!(local_port, 3000);
            }
            other => panic!("expected an http request, got {other}"),
        }
    }

    #[test]
    fn test_tunnel_file_supplies_values() {
        let file = tunnel_file(
            r#"
            relay_addr = "relay.example.com:7835"
            proto = "http"
            local_addr = "10.0.0.5"
            local_port = 3000
            vhost = "app.example.com"
            heartbeat_secs = 10
            reconnect_secs = 1
            "#,
        );
        let args = parse(&["culvert", "--config", file.path().to_str().unwrap()]);
        let settings = Settings::resolve(&args).unwrap();

        assert_eq!(settings.relay_addr, "relay.example.com:7835");
        assert_eq!(settings.heartbeat, Duration::from_secs(10));
        assert_eq!(settings.reconnect_delay, Duration::from_secs(1));
        match settings.request {
            TunnelRequest::Http {
                local_addr,
                local_port,
                vhost,
            } => {
                assert_eq!(local_addr, "10.0.0.5");
                assert_eq!(local_port, 3000);
                assert_eq!(vhost, "app.example.com");
            }
            other => panic!("expected an http request, got {other}"),
        }
    }

    #[test]
    fn test_flags_override_tunnel_file() {
        let file = tunnel_file(
            r#"
            relay_addr = "relay.example.com:7835"
            local_port = 3000
            remote_port = 9000
            "#,
        );
        let args = parse(&[
            "culvert",
            "--config",
            file.path().to_str().unwrap(),
            "--relay-addr",
            "127.0.0.1:9999",
            "--remote-port",
            "9001",
        ]);
        let settings = Settings::resolve(&args).unwrap();

        assert_eq!(settings.relay_addr, "127.0.0.1:9999");
        match settings.request {
            TunnelRequest::Tcp {
                local_port,
                remote_port,
                ..
            } => {
                assert_eq!(local_port, 3000);
                assert_eq!(remote_port, 9001);
            }
            other => panic!("expected a tcp request, got {other}"),
        }
    }

    #[test]
    fn test_unknown_tunnel_file_key_rejected() {
        let file = tunnel_file("local_prot = 3000\n");
        let args = parse(&["culvert", "--config", file.path().to_str().unwrap()]);
        let err = Settings::resolve(&args).unwrap_err();
        assert!(err.to_string().contains("failed to parse tunnel file"));
    }

    #[test]
    fn test_missing_tunnel_file_rejected() {
        let args = parse(&["culvert", "--config", "/nonexistent/culvert.toml"]);
        let err = Settings::resolve(&args).unwrap_err();
        assert!(err.to_string().contains("failed to read tunnel file"));
    }
}
