//! Control-channel messages.
//!
//! Every frame is a type tag plus two opaque byte sections, head and
//! data. The head carries fixed-layout routing fields (tokens, flags),
//! the data carries variable payloads (relayed bytes, descriptors, error
//! text). Which sections a type uses is fixed per type.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtoError;
use crate::request::TunnelRequest;
use crate::token::{SessionToken, TunnelToken};

/// Length of a `[tunnel_token][session_token]` head.
pub const SESSION_HEAD_LEN: usize = 16;

const RESPONSE_OK: u8 = 1;
const RESPONSE_ERR: u8 = 0;

/// Message type tags on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Liveness probe, client to relay.
    HeartbeatPing = 0x01,
    /// Probe reply, relay to client.
    HeartbeatPong = 0x02,
    /// Tunnel-open request; head carries the serialized descriptor.
    Request = 0x10,
    /// Tunnel-open reply; see [`OpenReply`].
    Response = 0x20,
    /// Relayed payload bytes for one session, either direction.
    Transfer = 0x30,
    /// Relay notice: a downstream connection opened a session.
    RemoteConnected = 0x40,
    /// Relay notice: a downstream session closed.
    RemoteDisconnect = 0x41,
    /// Client notice: the local link for a session is up.
    LocalConnected = 0x50,
    /// Client notice: the local link for a session closed.
    LocalDisconnect = 0x51,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Result<Self, ProtoError> {
        match value {
            0x01 => Ok(Self::HeartbeatPing),
            0x02 => Ok(Self::HeartbeatPong),
            0x10 => Ok(Self::Request),
            0x20 => Ok(Self::Response),
            0x30 => Ok(Self::Transfer),
            0x40 => Ok(Self::RemoteConnected),
            0x41 => Ok(Self::RemoteDisconnect),
            0x50 => Ok(Self::LocalConnected),
            0x51 => Ok(Self::LocalDisconnect),
            other => Err(ProtoError::UnknownMessageType(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// One control-channel frame, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtoMessage {
    pub ty: MessageType,
    pub head: Bytes,
    pub data: Bytes,
}

impl ProtoMessage {
    pub fn new(ty: MessageType, head: Bytes, data: Bytes) -> Self {
        Self { ty, head, data }
    }

    pub fn heartbeat_ping() -> Self {
        Self::new(MessageType::HeartbeatPing, Bytes::new(), Bytes::new())
    }

    pub fn heartbeat_pong() -> Self {
        Self::new(MessageType::HeartbeatPong, Bytes::new(), Bytes::new())
    }

    /// Tunnel-open request carrying the descriptor in its head. Fails if
    /// a descriptor string does not fit its length prefix.
    pub fn request(request: &TunnelRequest) -> Result<Self, ProtoError> {
        Ok(Self::new(
            MessageType::Request,
            request.to_bytes()?,
            Bytes::new(),
        ))
    }

    /// Successful open reply: head = `[1][tunnel_token]`, data = the
    /// admitted (possibly rewritten) descriptor.
    pub fn response_ok(token: TunnelToken, request: &TunnelRequest) -> Result<Self, ProtoError> {
        let mut head = BytesMut::with_capacity(9);
        head.put_u8(RESPONSE_OK);
        head.put_u64(token.raw());
        Ok(Self::new(
            MessageType::Response,
            head.freeze(),
            request.to_bytes()?,
        ))
    }

    /// Failed open reply: head = `[0]`, data = human-readable reason.
    pub fn response_err(reason: &str) -> Self {
        Self::new(
            MessageType::Response,
            Bytes::from_static(&[RESPONSE_ERR]),
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    pub fn transfer(tunnel: TunnelToken, session: SessionToken, data: Bytes) -> Self {
        Self::new(MessageType::Transfer, session_head(tunnel, session), data)
    }

    pub fn remote_connected(tunnel: TunnelToken, session: SessionToken) -> Self {
        Self::new(
            MessageType::RemoteConnected,
            session_head(tunnel, session),
            Bytes::new(),
        )
    }

    pub fn remote_disconnect(tunnel: TunnelToken, session: SessionToken) -> Self {
        Self::new(
            MessageType::RemoteDisconnect,
            session_head(tunnel, session),
            Bytes::new(),
        )
    }

    pub fn local_connected(tunnel: TunnelToken, session: SessionToken) -> Self {
        Self::new(
            MessageType::LocalConnected,
            session_head(tunnel, session),
            Bytes::new(),
        )
    }

    pub fn local_disconnect(tunnel: TunnelToken, session: SessionToken) -> Self {
        Self::new(
            MessageType::LocalDisconnect,
            session_head(tunnel, session),
            Bytes::new(),
        )
    }

    /// Parse a `[tunnel_token][session_token]` head.
    ///
    /// Valid for `Transfer` and the four session-lifecycle types.
    pub fn session_head(&self) -> Result<(TunnelToken, SessionToken), ProtoError> {
        if self.head.len() != SESSION_HEAD_LEN {
            return Err(ProtoError::BadHead {
                ty: self.ty,
                want: SESSION_HEAD_LEN,
                got: self.head.len(),
            });
        }
        let mut head = self.head.clone();
        let tunnel = TunnelToken::new(head.get_u64());
        let session = SessionToken::new(head.get_u64());
        Ok((tunnel, session))
    }

    /// Interpret a `Response` frame.
    pub fn open_reply(&self) -> Result<OpenReply, ProtoError> {
        match (self.head.len(), self.head.first().copied()) {
            (1, Some(RESPONSE_ERR)) => Ok(OpenReply::Refused {
                reason: String::from_utf8_lossy(&self.data).into_owned(),
            }),
            (9, Some(RESPONSE_OK)) => {
                let mut head = self.head.clone();
                head.advance(1);
                let token = TunnelToken::new(head.get_u64());
                let request = TunnelRequest::from_bytes(&self.data)?;
                Ok(OpenReply::Established { token, request })
            }
            (len, _) => Err(ProtoError::BadResponseHead(len)),
        }
    }
}

/// A `Response` frame, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenReply {
    /// The relay admitted the tunnel and bound the public side.
    Established {
        token: TunnelToken,
        request: TunnelRequest,
    },
    /// The relay refused; the control connection is about to close.
    Refused { reason: String },
}

fn session_head(tunnel: TunnelToken, session: SessionToken) -> Bytes {
    let mut head = BytesMut::with_capacity(SESSION_HEAD_LEN);
    head.put_u64(tunnel.raw());
    head.put_u64(session.raw());
    head.freeze()
}
