//! Length-prefixed codec for wire packets.
//!
//! Frame format:
//! ```text
//! +----------------+------------------+
//! |  4 bytes       |  N bytes         |
//! |  (length BE)   |  (JSON packet)   |
//! +----------------+------------------+
//! ```
//!
//! The length prefix is the only thing that keeps a stream aligned. A frame
//! whose body is not a packet is consumed whole and handed up as
//! [`Frame::Malformed`], so the next frame still decodes. Only a length over
//! [`MAX_FRAME_SIZE`] is fatal: past that point the boundaries are lost.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::Packet;

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes
const LENGTH_PREFIX_SIZE: usize = 4;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Packet(Packet),
    /// A complete frame whose body is not valid UTF-8 JSON or not a packet.
    Malformed { len: usize, reason: String },
}

impl Frame {
    #[must_use]
    pub fn into_packet(self) -> Option<Packet> {
        match self {
            Frame::Packet(packet) => Some(packet),
            Frame::Malformed { .. } => None,
        }
    }

    fn parse(body: &[u8]) -> Self {
        match serde_json::from_slice(body) {
            Ok(packet) => Frame::Packet(packet),
            Err(e) => Frame::Malformed {
                len: body.len(),
                reason: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
enum ReadState {
    #[default]
    Head,
    Body(usize),
}

#[derive(Debug, Default)]
pub struct PacketCodec {
    state: ReadState,
}

impl PacketCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for PacketCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        let len = match self.state {
            ReadState::Body(len) => len,
            ReadState::Head => {
                if src.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let len = src.get_u32() as usize;
                if len > MAX_FRAME_SIZE {
                    return Err(CodecError::FrameTooLarge(len));
                }
                self.state = ReadState::Body(len);
                len
            }
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.state = ReadState::Head;
        let body = src.split_to(len);
        Ok(Some(Frame::parse(&body)))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    // Frame size is checked against MAX_FRAME_SIZE (fits in u32)
    #[allow(clippy::cast_possible_truncation)]
    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body = serde_json::to_vec(&packet)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(body.len()));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Cannot encode packet: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),
}
