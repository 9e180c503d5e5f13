//! Length-prefixed bincode codec for [`Frame`]s
//!
//! Format: `[length: u32 big-endian][payload: bincode serialized frame]`

use crate::rpc::Frame;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame codec for use with `tokio_util::codec::Framed`
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Override the payload size limit
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        // Need at least 4 bytes for length header
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_frame_size {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let payload = buf.split_to(length);
        let frame = bincode::deserialize(&payload)?;

        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(&frame)?;

        if payload.len() > self.max_frame_size {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        buf.reserve(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(())
    }
}
