//! Tunnel directories and session plumbing.

mod downstream;
mod http;
mod sessions;
mod tcp;

pub use http::{HttpServer, HttpServerStats};
pub use sessions::{
    ControlSender, SessionCommand, SessionHandle, TunnelSessions, TunnelStats, QUEUE_DEPTH,
};
pub use tcp::TcpServer;
