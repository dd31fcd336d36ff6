//! Duplex framing.
//!
//! Wire format: `[1-byte tag][4-byte big-endian length][payload]`
//!
//! `NEXT`, `CANCEL` and `END` carry no payload. `DATA` carries raw bytes and
//! `ERROR` a UTF-8 reason.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_WIRE_FRAME_LEN;

pub const TAG_NEXT: u8 = 0;
pub const TAG_CANCEL: u8 = 1;
pub const TAG_DATA: u8 = 2;
pub const TAG_ERROR: u8 = 3;
pub const TAG_END: u8 = 4;

const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Reader → writer: ready for exactly one more frame.
    Next,
    /// Reader → writer: stop producing.
    Cancel,
    Data(Bytes),
    /// Writer → reader: the stream failed.
    Error(String),
    /// Writer → reader: the stream finished.
    End,
}

impl Frame {
    fn tag(&self) -> u8 {
        match self {
            Self::Next => TAG_NEXT,
            Self::Cancel => TAG_CANCEL,
            Self::Data(_) => TAG_DATA,
            Self::Error(_) => TAG_ERROR,
            Self::End => TAG_END,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Self::Data(data) => data,
            Self::Error(reason) => reason.as_bytes(),
            Self::Next | Self::Cancel | Self::End => &[],
        }
    }

    /// Encode into a standalone buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload().len());
        put_frame(self, &mut buf);
        buf.freeze()
    }
}

fn put_frame(frame: &Frame, dst: &mut BytesMut) {
    let payload = frame.payload();
    dst.reserve(HEADER_LEN + payload.len());
    dst.put_u8(frame.tag());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unknown frame tag {0}")]
    UnknownTag(u8),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("tag {tag} frame must be empty, got {len} bytes")]
    UnexpectedPayload { tag: u8, len: usize },

    #[error("error frame is not valid UTF-8")]
    InvalidReason,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.min(MAX_WIRE_FRAME_LEN),
        }
    }

    /// Reject a payload the decoder on the other side would refuse.
    pub fn check_len(&self, len: usize) -> Result<(), FrameError> {
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let tag = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if tag > TAG_END {
            return Err(FrameError::UnknownTag(tag));
        }
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if matches!(tag, TAG_NEXT | TAG_CANCEL | TAG_END) && len != 0 {
            return Err(FrameError::UnexpectedPayload { tag, len });
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        let frame = match tag {
            TAG_NEXT => Frame::Next,
            TAG_CANCEL => Frame::Cancel,
            TAG_DATA => Frame::Data(payload),
            TAG_ERROR => Frame::Error(
                String::from_utf8(payload.to_vec()).map_err(|_| FrameError::InvalidReason)?,
            ),
            _ => Frame::End,
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        self.check_len(frame.payload().len())?;
        put_frame(&frame, dst);
        Ok(())
    }
}
