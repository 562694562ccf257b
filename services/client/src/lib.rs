//! # culvert-client
//!
//! The culvert tunnel client. It dials out to a relay, requests a public
//! endpoint for one local service and keeps the tunnel alive, opening a
//! fresh connection to the local service for every downstream session
//! the relay announces.
//!
//! - [`config`] layers flags over the optional TOML tunnel file
//! - [`control`] runs the handshake, the serve loop and the redial loop
//! - [`local_link`] dials the local service and pumps its sockets

pub mod config;
pub mod control;
pub mod error;
pub mod local_link;

pub use config::{Args, Proto, Settings};
pub use control::{run, Tunnel};
pub use error::ClientError;
pub use local_link::{LinkHandle, LocalLinks};
