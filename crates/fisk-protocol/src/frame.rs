//! Frame codec.
//!
//! Every frame on the wire is `[u8 kind][u32 LE length][payload]`. Kind `1`
//! carries a UTF-8 JSON document, kind `2` carries raw bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Frame kind tag for JSON text.
pub const KIND_TEXT: u8 = 1;

/// Frame kind tag for binary payload.
pub const KIND_BINARY: u8 = 2;

/// Size of the kind + length prefix.
pub const FRAME_HEADER_LEN: usize = 5;

/// Default upper bound for a single frame payload (8 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// One frame as seen by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// JSON document.
    Text(String),
    /// Raw bytes belonging to a declared payload.
    Binary(Bytes),
}

/// Framing errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    #[error("frame of {len} bytes exceeds maximum {max}")]
    TooLarge { len: usize, max: usize },

    #[error("text frame is not valid UTF-8")]
    InvalidUtf8,
}

/// Length-prefixed codec for [`Frame`]s.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    /// Create a codec that rejects frames above `max_frame_len` bytes.
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Maximum accepted payload length.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let kind = src[0];
        let len = u32::from_le_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if kind != KIND_TEXT && kind != KIND_BINARY {
            return Err(FrameError::UnknownKind(kind));
        }
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(len).freeze();

        if kind == KIND_TEXT {
            let text = String::from_utf8(payload.to_vec()).map_err(|_| FrameError::InvalidUtf8)?;
            Ok(Some(Frame::Text(text)))
        } else {
            Ok(Some(Frame::Binary(payload)))
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let (kind, payload): (u8, &[u8]) = match &frame {
            Frame::Text(text) => (KIND_TEXT, text.as_bytes()),
            Frame::Binary(data) => (KIND_BINARY, data.as_ref()),
        };
        if payload.len() > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }

        dst.reserve(FRAME_HEADER_LEN + payload.len());
        dst.put_u8(kind);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::Binary(Bytes::from_static(b"abc")), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[KIND_BINARY, 3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::Text("{\"a\":1}".to_string()), &mut buf)
            .unwrap();

        let mut partial = buf.split_to(6);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame, Frame::Text("{\"a\":1}".to_string()));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_decode_two_frames_back_to_back() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Frame::Text("{}".to_string()), &mut buf).unwrap();
        codec
            .encode(Frame::Binary(Bytes::from_static(&[1, 2])), &mut buf)
            .unwrap();

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Text("{}".to_string()))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Binary(Bytes::from_static(&[1, 2])))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::from(&[KIND_BINARY, 5, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::TooLarge { len: 5, max: 4 })
        ));
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[9u8, 0, 0, 0, 0][..]);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::UnknownKind(9))));
    }
}
