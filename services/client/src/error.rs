//! Error types for the tunnel client.

use culvert_proto::ProtoError;
use thiserror::Error;

/// Errors surfaced by the client control connection.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The relay went away before answering the open request.
    #[error("handshake failed: {0}")]
    Handshake(&'static str),

    /// The relay refused the tunnel. Carries the relay's reason verbatim.
    #[error("tunnel refused by relay: {0}")]
    Rejected(String),

    /// Framing or descriptor error on the control channel.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// The control connection dropped while the tunnel was live.
    #[error("connection to the relay lost")]
    ConnectionLost,

    /// Transport-level I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
