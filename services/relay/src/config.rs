//! Relay configuration.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::port_range::PortRanges;

/// Relay server configuration (flags, each overridable via environment).
#[derive(Debug, Clone, Parser)]
#[command(name = "culvertd", version, about = "Culvert relay server")]
pub struct Config {
    /// Address the control listener binds on. Per-tunnel TCP listeners
    /// share this interface.
    #[arg(long, env = "CULVERT_CONTROL_BIND", default_value = "0.0.0.0:7835")]
    pub control_bind: SocketAddr,

    /// Address of the shared HTTP vhost listener. HTTP tunnel requests
    /// are refused when unset.
    #[arg(long, env = "CULVERT_HTTP_BIND")]
    pub http_bind: Option<SocketAddr>,

    /// Remote ports TCP tunnels may claim, as ports and inclusive
    /// ranges: "1024-65535" or "8000-8999,9500". Any port when unset.
    #[arg(long, env = "CULVERT_ALLOWED_PORTS")]
    pub allowed_ports: Option<PortRanges>,

    /// Seconds a control connection may stay silent before it is
    /// closed. Heartbeats count as traffic. 0 disables the timeout.
    #[arg(long, env = "CULVERT_IDLE_TIMEOUT_SECS", default_value_t = 600)]
    pub idle_timeout_secs: u64,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error).
    #[arg(long, env = "CULVERT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs != 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}
