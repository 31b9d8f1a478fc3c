//! # Frame Codec
//!
//! Length-prefix framing: every message travels as a 4-byte big-endian
//! length followed by that many payload bytes.
//!
//! [`encode_frame`] and [`decode_frame`] are pure functions over byte
//! slices. [`FrameCodec`] wraps the same rules as a `tokio_util` codec so the
//! receive loop can pull frames off a socket regardless of how the peer's
//! writes were split into TCP segments.
//!
//! ```rust
//! use msgpipe::core::codec::{decode_frame, encode_frame};
//!
//! let frame = encode_frame(&[1, 2, 3]);
//! assert_eq!(frame, vec![0, 0, 0, 3, 1, 2, 3]);
//!
//! let (payload, consumed) = decode_frame(&frame, 16).unwrap().unwrap();
//! assert_eq!(payload, &[1, 2, 3]);
//! assert_eq!(consumed, 7);
//! ```

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::config::HEADER_SIZE;
use crate::error::{ProtocolError, Result};

/// Encode one payload as a standalone frame
///
/// `payload` must fit the 4-byte header, i.e. be at most `u32::MAX` bytes.
/// `TransportConfig::validate` keeps `max_message_size` within that bound.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    write_frame(payload, &mut out);
    out
}

/// Append one frame to `dst`
///
/// Several calls against the same buffer produce concatenated frames, which
/// is how the send pipe batches a whole queue into one socket write. The
/// same `u32::MAX` bound as [`encode_frame`] applies.
#[inline]
pub fn write_frame<B: BufMut>(payload: &[u8], dst: &mut B) {
    debug_assert!(
        u32::try_from(payload.len()).is_ok(),
        "payload of {} bytes does not fit a frame header",
        payload.len()
    );
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
}

/// Size on the wire of a frame carrying `payload_len` bytes
#[inline]
pub fn frame_len(payload_len: usize) -> usize {
    HEADER_SIZE + payload_len
}

/// Read the length header at the start of `src`
///
/// Returns `Ok(None)` if fewer than four bytes are available and
/// `OversizedPacket` if the advertised length exceeds `max_message_size`.
#[inline]
pub fn peek_length(src: &[u8], max_message_size: usize) -> Result<Option<usize>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&src[..HEADER_SIZE]);
    let len = u32::from_be_bytes(header) as usize;

    if len > max_message_size {
        return Err(ProtocolError::OversizedPacket(len));
    }
    Ok(Some(len))
}

/// Decode the first frame in `src`
///
/// On success returns the payload and the number of bytes consumed
/// (`4 + payload.len()`). Returns `Ok(None)` when `src` holds only part of a
/// frame.
pub fn decode_frame(src: &[u8], max_message_size: usize) -> Result<Option<(&[u8], usize)>> {
    let len = match peek_length(src, max_message_size)? {
        Some(len) => len,
        None => return Ok(None),
    };

    let total = frame_len(len);
    if src.len() < total {
        return Ok(None);
    }
    Ok(Some((&src[HEADER_SIZE..total], total)))
}

/// Tokio codec for length-prefixed frames
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_message_size: usize,
}

impl FrameCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let len = match peek_length(src, self.max_message_size)? {
            Some(len) => len,
            None => {
                src.reserve(HEADER_SIZE);
                return Ok(None);
            }
        };

        let total = frame_len(len);
        if src.len() < total {
            // Length is already validated, so this reservation is bounded
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        trace!(bytes = len, "Decoded frame");
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        if payload.len() > self.max_message_size {
            return Err(ProtocolError::OversizedPacket(payload.len()));
        }
        dst.reserve(frame_len(payload.len()));
        write_frame(payload, dst);
        Ok(())
    }
}
