//! Tunnel request descriptors.
//!
//! A descriptor tells the relay what to expose on the client's behalf.
//! It travels in the head of a `Request` frame and, possibly rewritten by
//! the relay, in the data of a successful `Response` frame.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtoError;

const PROTO_TCP: u8 = 1;
const PROTO_HTTP: u8 = 2;

/// What a client asks the relay to expose.
///
/// Exactly one of the two shapes exists per tunnel. The local endpoint is
/// where the client will dial for each downstream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelRequest {
    /// Expose a raw TCP port on the relay. `remote_port` 0 asks the relay
    /// to pick one; the granted port comes back in the response descriptor.
    Tcp {
        local_addr: String,
        local_port: u16,
        remote_port: u16,
    },
    /// Expose an HTTP virtual host on the relay's shared HTTP listener.
    Http {
        local_addr: String,
        local_port: u16,
        vhost: String,
    },
}

impl TunnelRequest {
    /// Serialize to the wire form.
    ///
    /// Layout: proto tag (u8), local_addr (u16 length + UTF-8), local_port
    /// (u16), then remote_port (u16) for TCP or vhost (u16 length + UTF-8)
    /// for HTTP. All integers big-endian. String fields longer than their
    /// u16 length prefix can carry are rejected.
    pub fn to_bytes(&self) -> Result<Bytes, ProtoError> {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Self::Tcp {
                local_addr,
                local_port,
                remote_port,
            } => {
                buf.put_u8(PROTO_TCP);
                put_string(&mut buf, "local_addr", local_addr)?;
                buf.put_u16(*local_port);
                buf.put_u16(*remote_port);
            }
            Self::Http {
                local_addr,
                local_port,
                vhost,
            } => {
                buf.put_u8(PROTO_HTTP);
                put_string(&mut buf, "local_addr", local_addr)?;
                buf.put_u16(*local_port);
                put_string(&mut buf, "vhost", vhost)?;
            }
        }
        Ok(buf.freeze())
    }

    /// Parse the wire form. Rejects truncated input, trailing bytes,
    /// unknown proto tags, invalid UTF-8 and empty vhosts.
    pub fn from_bytes(mut buf: &[u8]) -> Result<Self, ProtoError> {
        let proto = take_u8(&mut buf)?;
        let local_addr = take_string(&mut buf)?;
        let local_port = take_u16(&mut buf)?;

        let request = match proto {
            PROTO_TCP => {
                let remote_port = take_u16(&mut buf)?;
                Self::Tcp {
                    local_addr,
                    local_port,
                    remote_port,
                }
            }
            PROTO_HTTP => {
                let vhost = take_string(&mut buf)?;
                if vhost.is_empty() {
                    return Err(ProtoError::EmptyVhost);
                }
                Self::Http {
                    local_addr,
                    local_port,
                    vhost,
                }
            }
            other => return Err(ProtoError::UnknownProto(other)),
        };

        if buf.has_remaining() {
            return Err(ProtoError::TrailingRequestBytes);
        }
        Ok(request)
    }

    /// The endpoint the client dials for each downstream session.
    pub fn local_addr(&self) -> &str {
        match self {
            Self::Tcp { local_addr, .. } | Self::Http { local_addr, .. } => local_addr,
        }
    }

    pub fn local_port(&self) -> u16 {
        match self {
            Self::Tcp { local_port, .. } | Self::Http { local_port, .. } => *local_port,
        }
    }

    /// Short protocol name for logs.
    pub fn proto_name(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => "tcp",
            Self::Http { .. } => "http",
        }
    }
}

impl fmt::Display for TunnelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp {
                local_addr,
                local_port,
                remote_port,
            } => write!(f, "tcp://{local_addr}:{local_port}<-{remote_port}"),
            Self::Http {
                local_addr,
                local_port,
                vhost,
            } => write!(f, "http://{local_addr}:{local_port}<-{vhost}"),
        }
    }
}

fn put_string(buf: &mut BytesMut, field: &'static str, s: &str) -> Result<(), ProtoError> {
    let len = u16::try_from(s.len()).map_err(|_| ProtoError::FieldTooLong {
        field,
        len: s.len(),
    })?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, ProtoError> {
    if buf.remaining() < 1 {
        return Err(ProtoError::TruncatedRequest);
    }
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut &[u8]) -> Result<u16, ProtoError> {
    if buf.remaining() < 2 {
        return Err(ProtoError::TruncatedRequest);
    }
    Ok(buf.get_u16())
}

fn take_string(buf: &mut &[u8]) -> Result<String, ProtoError> {
    let len = take_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(ProtoError::TruncatedRequest);
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtoError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_tcp_round_trip() {
        let request = TunnelRequest::Tcp {
            local_addr: "localhost".to_string(),
            local_port: 8080,
            remote_port: 9000,
        };
        let parsed = TunnelRequest::from_bytes(&request.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_http_round_trip() {
        let request = TunnelRequest::Http {
            local_addr: "127.0.0.1".to_string(),
            local_port: 3000,
            vhost: "a.example.com".to_string(),
        };
        let parsed = TunnelRequest::from_bytes(&request.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_empty_vhost_rejected() {
        let request = TunnelRequest::Http {
            local_addr: "localhost".to_string(),
            local_port: 80,
            vhost: String::new(),
        };
        let err = TunnelRequest::from_bytes(&request.to_bytes().unwrap()).unwrap_err();
        assert!(matches!(err, ProtoError::EmptyVhost));
    }

    #[test]
    fn test_unknown_proto_rejected() {
        let err = TunnelRequest::from_bytes(&[9, 0, 0, 0, 80]).unwrap_err();
        assert!(matches!(err, ProtoError::UnknownProto(9)));
    }

    #[rstest]
    #[case::empty(&[])]
    #[case::tag_only(&[1])]
    #[case::addr_len_overruns(&[1, 0, 5, b'a'])]
    #[case::missing_remote_port(&[1, 0, 1, b'a', 0, 80])]
    fn test_truncated_rejected(#[case] raw: &[u8]) {
        let err = TunnelRequest::from_bytes(raw).unwrap_err();
        assert!(matches!(err, ProtoError::TruncatedRequest));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut raw = TunnelRequest::Tcp {
            local_addr: "a".to_string(),
            local_port: 1,
            remote_port: 2,
        }
        .to_bytes()
        .unwrap()
        .to_vec();
        raw.push(0);
        let err = TunnelRequest::from_bytes(&raw).unwrap_err();
        assert!(matches!(err, ProtoError::TrailingRequestBytes));
    }

    #[test]
    fn test_oversized_field_rejected_on_serialize() {
        let request = TunnelRequest::Http {
            local_addr: "localhost".to_string(),
            local_port: 80,
            vhost: "v".repeat(u16::MAX as usize + 1),
        };
        let err = request.to_bytes().unwrap_err();
        assert!(matches!(err, ProtoError::FieldTooLong { field: "vhost", .. }));
    }

    #[test]
    fn test_display_forms() {
        let tcp = TunnelRequest::Tcp {
            local_addr: "localhost".to_string(),
            local_port: 8080,
            remote_port: 9000,
        };
        assert_eq!(tcp.to_string(), "tcp://localhost:8080<-9000");

        let http = TunnelRequest::Http {
            local_addr: "localhost".to_string(),
            local_port: 3000,
            vhost: "a.example.com".to_string(),
        };
        assert_eq!(http.to_string(), "http://localhost:3000<-a.example.com");
    }
}
