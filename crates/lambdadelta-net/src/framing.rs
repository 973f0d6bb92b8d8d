//! Message framing for protocol streams
//!
//! Provides length-prefixed framing with a one-byte frame type.

use bytes::{Buf, BufMut, BytesMut};
use lambdadelta_core::canonical::{canonical_bytes, from_canonical_bytes};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB)
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Unexpected frame type: {0:?}")]
    UnexpectedType(FrameType),
}

/// A framed message
#[derive(Clone, Debug)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Payload bytes
    pub payload: Vec<u8>,
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Membership handshake
    Handshake = 10,
    /// Handshake rejected; stream will close
    HandshakeRejected = 11,
    /// One published event during direct sync
    SyncEvent = 20,
    /// End of a direct sync stream
    SyncDone = 21,
    /// Dandelion++ stem-phase event
    RelayedEvent = 30,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            10 => Ok(Self::Handshake),
            11 => Ok(Self::HandshakeRejected),
            20 => Ok(Self::SyncEvent),
            21 => Ok(Self::SyncDone),
            30 => Ok(Self::RelayedEvent),
            _ => Err(FrameError::Serialization(format!("Unknown frame type: {}", value))),
        }
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes type byte)
/// - 1 byte: frame type
/// - N bytes: payload
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 5 bytes (4 length + 1 type)
        if src.len() < 5 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if length == 0 {
            return Err(FrameError::Serialization("empty frame".into()));
        }

        // Need full frame
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame_type = FrameType::try_from(src[0])?;
        src.advance(1);

        let payload = src.split_to(length - 1).to_vec();

        Ok(Some(Frame { frame_type, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self { frame_type, payload }
    }

    /// Create a frame carrying the canonical encoding of `message`
    pub fn message<T: Serialize>(frame_type: FrameType, message: &T) -> Result<Self, FrameError> {
        let payload =
            canonical_bytes(message).map_err(|e| FrameError::Serialization(e.to_string()))?;
        Ok(Self::new(frame_type, payload))
    }

    /// Decode the payload, checking the frame type first
    pub fn decode<T: DeserializeOwned>(&self, expected: FrameType) -> Result<T, FrameError> {
        if self.frame_type != expected {
            return Err(FrameError::UnexpectedType(self.frame_type));
        }
        from_canonical_bytes(&self.payload).map_err(|e| FrameError::Serialization(e.to_string()))
    }

    /// Create an empty frame of the given type
    pub fn empty(frame_type: FrameType) -> Self {
        Self::new(frame_type, vec![])
    }
}
