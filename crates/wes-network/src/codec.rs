//! Frame encoding/decoding for the node-to-node transport

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::NetworkError;
use crate::transport::TransportFrame;

/// Maximum frame size (16 MB).
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size (4 bytes).
const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec for encoding/decoding transport frames.
///
/// Wire format: [length: u32 BE] [bincode-encoded frame]
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Partial decode state
    decode_state: DecodeState,
}

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    ReadingLength,
    ReadingPayload {
        length: usize,
    },
}

impl FrameCodec {
    /// Creates a new codec.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = TransportFrame;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match &self.decode_state {
                DecodeState::ReadingLength => {
                    if src.len() < LENGTH_PREFIX_SIZE {
                        return Ok(None);
                    }

                    let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

                    if length > MAX_FRAME_SIZE {
                        return Err(NetworkError::Codec(format!(
                            "frame length {} exceeds max {}",
                            length, MAX_FRAME_SIZE
                        )));
                    }

                    src.advance(LENGTH_PREFIX_SIZE);
                    self.decode_state = DecodeState::ReadingPayload { length };
                }
                DecodeState::ReadingPayload { length } => {
                    let length = *length;
                    if src.len() < length {
                        return Ok(None);
                    }

                    let payload = src.split_to(length);
                    self.decode_state = DecodeState::ReadingLength;

                    let frame: TransportFrame = bincode::deserialize(&payload)
                        .map_err(|e| NetworkError::Codec(format!("deserialize error: {}", e)))?;

                    return Ok(Some(frame));
                }
            }
        }
    }
}

impl Encoder<TransportFrame> for FrameCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: TransportFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&item)
            .map_err(|e| NetworkError::Codec(format!("serialize error: {}", e)))?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(NetworkError::Codec(format!(
                "frame too large: {} bytes (max {})",
                payload.len(),
                MAX_FRAME_SIZE
            )));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}
