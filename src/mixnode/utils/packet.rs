//! Transport frame codec
//!
//! Length-prefixed framing for the TCP transport: a 4-byte big-endian
//! length followed by the frame body. Sphinx frames are always 1200 bytes,
//! but the codec itself carries any body up to the sanity cap so the
//! handshake advertisement can reuse it.

use bytes::{Bytes, BytesMut};

use crate::{MixnodeError, Result};

/// Upper bound on a framed body; anything larger is a protocol violation.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// One framed transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Bytes,
}

impl Packet {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    /// Serialize with the length prefix.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.data.len() > MAX_FRAME_SIZE {
            return Err(MixnodeError::Packet(format!(
                "frame body {} exceeds {} bytes",
                self.data.len(),
                MAX_FRAME_SIZE
            )));
        }
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    /// Pull one complete frame off the front of `buffer`, if present.
    /// Returns an error on oversized length prefixes so the connection can
    /// be torn down instead of buffering unbounded garbage.
    pub fn decode_stream(buffer: &mut BytesMut) -> Result<Option<Packet>> {
        if buffer.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(MixnodeError::Protocol(format!(
                "frame length {} exceeds {} bytes",
                length, MAX_FRAME_SIZE
            )));
        }
        if buffer.len() < 4 + length {
            return Ok(None);
        }
        let data = buffer.split_to(4 + length).split_off(4).freeze();
        Ok(Some(Packet { data }))
    }
}
