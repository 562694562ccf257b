//! # culvert-relay
//!
//! The culvert relay server. It accepts long-lived control connections
//! from tunnel clients behind NAT, exposes a public TCP port or an HTTP
//! virtual host per admitted tunnel, and relays downstream traffic back
//! over the control connection, multiplexed by (tunnel token, session
//! token) pairs.
//!
//! - [`server`] binds the listeners and owns the shared state
//! - [`handler`] runs the per-connection protocol state machine
//! - [`tunnel`] holds the TCP and HTTP tunnel directories and the
//!   downstream session plumbing
//! - [`interceptor`] is the admission seam (policy, auth)

pub mod config;
pub mod error;
pub mod handler;
pub mod interceptor;
pub mod port_range;
pub mod server;
pub mod tokens;
pub mod tunnel;

pub use config::Config;
pub use error::RelayError;
pub use interceptor::{AllowAll, PortPolicy, RequestInterceptor};
pub use port_range::PortRanges;
pub use server::{RelayServer, RelayState, RelayStats};
pub use tokens::TokenProducer;
