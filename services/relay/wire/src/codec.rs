//! Encoding, decoding, and framing for the wire protocol.
//!
//! Frames are a `u32` big-endian length prefix followed by that many bytes
//! of UTF-8 JSON. The decoder is incremental: feed it a read buffer and it
//! yields complete frames as they become available.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::envelope::Envelope;
use crate::error::WireError;

/// Maximum frame size (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Serialize an envelope to its JSON text form
pub fn encode_envelope(envelope: &Envelope) -> Result<Bytes, WireError> {
    let json = serde_json::to_vec(envelope)?;
    Ok(Bytes::from(json))
}

/// Parse an envelope from a frame's payload bytes.
///
/// A payload that is not valid UTF-8 is a protocol violation distinct from
/// malformed JSON: the peer sent a non-text frame.
pub fn decode_envelope(payload: &[u8]) -> Result<Envelope, WireError> {
    let text = std::str::from_utf8(payload).map_err(|_| WireError::NotText)?;
    Ok(serde_json::from_str(text)?)
}

/// Encode an envelope as a complete length-prefixed frame
pub fn encode_frame(envelope: &Envelope, max_frame_size: usize) -> Result<Bytes, WireError> {
    let payload = encode_envelope(envelope)?;
    if payload.len() > max_frame_size {
        return Err(WireError::Size(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Incremental frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder with the default size limit
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a custom frame size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode one frame payload from a buffer.
    ///
    /// Returns `Ok(None)` when more data is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        // Need at least 4 bytes for frame length
        if buf.len() < 4 {
            return Ok(None);
        }

        // Peek at frame length
        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if frame_len > self.max_frame_size {
            return Err(WireError::Size(frame_len));
        }

        // Check if we have the complete frame
        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        Ok(Some(buf.split_to(frame_len).freeze()))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Body;

    #[test]
    fn test_frame_roundtrip() {
        let env = Envelope::new(Body::Ping { corr_id: 99 });
        let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(frame.as_ref());
        let payload = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decode_envelope(&payload).unwrap(), env);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_incremental_decode() {
        let env = Envelope::new(Body::Pong { corr_id: 5 });
        let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();

        // Feed one byte at a time; nothing decodes until the frame completes
        for (i, byte) in frame.iter().enumerate() {
            buf.put_u8(*byte);
            let result = decoder.decode(&mut buf).unwrap();
            if i + 1 < frame.len() {
                assert!(result.is_none());
            } else {
                let payload = result.unwrap();
                assert_eq!(decode_envelope(&payload).unwrap(), env);
            }
        }
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let a = Envelope::new(Body::Ping { corr_id: 1 });
        let b = Envelope::new(Body::Ping { corr_id: 2 });

        let mut buf = BytesMut::new();
        buf.put_slice(&encode_frame(&a, DEFAULT_MAX_FRAME_SIZE).unwrap());
        buf.put_slice(&encode_frame(&b, DEFAULT_MAX_FRAME_SIZE).unwrap());

        let mut decoder = FrameDecoder::new();
        let first = decoder.decode(&mut buf).unwrap().unwrap();
        let second = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decode_envelope(&first).unwrap(), a);
        assert_eq!(decode_envelope(&second).unwrap(), b);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(DEFAULT_MAX_FRAME_SIZE as u32 + 1);
        buf.put_slice(b"xxxx");

        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WireError::Size(_))
        ));
    }

    #[test]
    fn test_non_text_payload_rejected() {
        // 0xFF is never valid UTF-8
        let payload = [0xFF, 0xFE, 0x00, 0x01];
        assert!(matches!(
            decode_envelope(&payload),
            Err(WireError::NotText)
        ));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(
            decode_envelope(b"{\"type\":"),
            Err(WireError::Json(_))
        ));
    }
}
