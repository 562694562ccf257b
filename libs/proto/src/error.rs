//! Error types for the wire protocol.

use thiserror::Error;

use crate::message::MessageType;

/// Errors raised while encoding or decoding control-channel traffic.
///
/// Every variant except `Io` indicates a peer that is not speaking the
/// protocol; callers treat them as fatal to the connection.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Transport-level I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame declared a length above the hard cap.
    #[error("frame of {got} bytes exceeds the {max} byte limit")]
    FrameTooLarge { got: usize, max: usize },

    /// The head/data section lengths disagree with the outer frame length.
    #[error("frame sections need {sections} bytes but the frame declares {declared}")]
    FrameLengthMismatch { declared: usize, sections: usize },

    /// The type tag is not one we know.
    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),

    /// A message head has the wrong size for its type.
    #[error("{ty:?} head must be {want} bytes, got {got}")]
    BadHead {
        ty: MessageType,
        want: usize,
        got: usize,
    },

    /// A response head is neither a valid success nor failure shape.
    #[error("malformed response head ({0} bytes)")]
    BadResponseHead(usize),

    /// A string field is too long for its u16 length prefix.
    #[error("tunnel request {field} of {len} bytes exceeds the wire limit")]
    FieldTooLong { field: &'static str, len: usize },

    /// A tunnel request descriptor ended before all fields were read.
    #[error("truncated tunnel request")]
    TruncatedRequest,

    /// A tunnel request descriptor carried bytes past its last field.
    #[error("trailing bytes after tunnel request")]
    TrailingRequestBytes,

    /// The proto tag of a tunnel request is not TCP or HTTP.
    #[error("unknown tunnel proto tag {0}")]
    UnknownProto(u8),

    /// A string field of a tunnel request is not valid UTF-8.
    #[error("tunnel request field is not valid UTF-8")]
    InvalidUtf8,

    /// An HTTP tunnel request named no virtual host.
    #[error("http tunnel request has an empty vhost")]
    EmptyVhost,
}
