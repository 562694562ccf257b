//! Length-prefixed framing for the control channel.
//!
//! Wire layout per frame, all integers big-endian:
//!
//! ```text
//! frame_len : u32   bytes after this prefix
//! type      : u8
//! head_len  : u32
//! head      : head_len bytes
//! data_len  : u32
//! data      : data_len bytes
//! ```
//!
//! `frame_len` must equal `1 + 4 + head_len + 4 + data_len`. Frames above
//! [`MAX_FRAME_LEN`] and frames whose section lengths disagree with the
//! prefix are decode errors; the connection is torn down, not resynced.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtoError;
use crate::message::{MessageType, ProtoMessage};

/// Hard cap on a single frame, length prefix excluded.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

const LEN_PREFIX: usize = 4;
/// type tag + head length field + data length field
const SECTION_OVERHEAD: usize = 1 + 4 + 4;

/// Codec for [`ProtoMessage`] frames, for use with `tokio_util::codec::Framed`.
#[derive(Debug, Default)]
pub struct ProtoCodec;

impl Decoder for ProtoCodec {
    type Item = ProtoMessage;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ProtoMessage>, ProtoError> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len > MAX_FRAME_LEN {
            return Err(ProtoError::FrameTooLarge {
                got: frame_len,
                max: MAX_FRAME_LEN,
            });
        }
        if frame_len < SECTION_OVERHEAD {
            return Err(ProtoError::FrameLengthMismatch {
                declared: frame_len,
                sections: SECTION_OVERHEAD,
            });
        }
        if src.len() < LEN_PREFIX + frame_len {
            src.reserve(LEN_PREFIX + frame_len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let mut frame = src.split_to(frame_len).freeze();

        let ty = MessageType::from_u8(frame.get_u8())?;
        let head_len = frame.get_u32() as usize;
        if frame.remaining() < head_len + 4 {
            return Err(ProtoError::FrameLengthMismatch {
                declared: frame_len,
                sections: SECTION_OVERHEAD + head_len,
            });
        }
        let head = frame.split_to(head_len);
        let data_len = frame.get_u32() as usize;
        if frame.remaining() != data_len {
            return Err(ProtoError::FrameLengthMismatch {
                declared: frame_len,
                sections: SECTION_OVERHEAD + head_len + data_len,
            });
        }

        Ok(Some(ProtoMessage::new(ty, head, frame)))
    }
}

impl Encoder<ProtoMessage> for ProtoCodec {
    type Error = ProtoError;

    fn encode(&mut self, msg: ProtoMessage, dst: &mut BytesMut) -> Result<(), ProtoError> {
        let frame_len = SECTION_OVERHEAD + msg.head.len() + msg.data.len();
        if frame_len > MAX_FRAME_LEN {
            return Err(ProtoError::FrameTooLarge {
                got: frame_len,
                max: MAX_FRAME_LEN,
            });
        }
        dst.reserve(LEN_PREFIX + frame_len);
        dst.put_u32(frame_len as u32);
        dst.put_u8(msg.ty.as_u8());
        dst.put_u32(msg.head.len() as u32);
        dst.extend_from_slice(&msg.head);
        dst.put_u32(msg.data.len() as u32);
        dst.extend_from_slice(&msg.data);
        Ok(())
    }
}
