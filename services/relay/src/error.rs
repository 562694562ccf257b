//! Error types for the relay.

use thiserror::Error;

use culvert_proto::ProtoError;

/// Errors raised while admitting or serving tunnels.
///
/// The first four variants are admission failures. Their `Display` text is
/// what travels back to the client in the failure response, so it has to
/// stand on its own without source-chain context.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The interceptor turned the request down.
    #[error("{0}")]
    Rejected(String),

    /// Another live tunnel already holds this vhost.
    #[error("vhost({0}) already used")]
    VhostAlreadyUsed(String),

    /// Another live tunnel already holds this remote port.
    #[error("port({0}) already used")]
    PortAlreadyUsed(u16),

    /// The OS refused to listen on the requested port.
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Framing or descriptor error on the control channel.
    #[error(transparent)]
    Proto(#[from] ProtoError),
}
