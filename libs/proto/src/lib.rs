//! # culvert-proto
//!
//! Wire protocol shared by the culvert relay and tunnel client.
//!
//! The control channel is a single TCP connection carrying length-prefixed
//! frames ([`ProtoCodec`]). A client opens a tunnel with a [`TunnelRequest`]
//! and, once admitted, all downstream traffic is multiplexed over the same
//! connection as [`MessageType::Transfer`] frames keyed by
//! ([`TunnelToken`], [`SessionToken`]) pairs.
//!
//! Message flow:
//! - client sends `Request`, relay answers `Response`
//! - relay announces downstream sessions with `RemoteConnected` /
//!   `RemoteDisconnect`
//! - client mirrors its local links with `LocalConnected` /
//!   `LocalDisconnect`
//! - payload bytes ride `Transfer` frames in both directions
//! - `HeartbeatPing` / `HeartbeatPong` keep idle connections alive

mod codec;
mod error;
mod message;
mod request;
mod token;

pub use codec::{ProtoCodec, MAX_FRAME_LEN};
pub use error::ProtoError;
pub use message::{MessageType, OpenReply, ProtoMessage, SESSION_HEAD_LEN};
pub use request::TunnelRequest;
pub use token::{SessionToken, TunnelToken};
