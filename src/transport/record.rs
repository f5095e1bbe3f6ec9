//! Record framing.
//!
//! Wire form per message, all integers big-endian:
//!
//! ```text
//! +-------------+----------------+-------------+
//! |   4 bytes   |    4 bytes     |   N bytes   |
//! +-------------+----------------+-------------+
//! | body length | transaction id |    body     |
//! +-------------+----------------+-------------+
//! ```
//!
//! No checksum, no magic. The format is bit-exact for interoperability with
//! other implementations.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{BoxCodec, Frame, Transport};
use crate::error::TransportError;

/// Length of the fixed header in bytes.
pub const HEADER_LEN: usize = 8;

/// Default cap on a single body.
pub const DEFAULT_MAX_BODY: usize = 100 * 1024 * 1024;

/// Codec for the record framing, identical on both sides of a connection.
#[derive(Debug, Clone)]
pub struct RecordCodec {
    max_body: usize,
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self {
            max_body: DEFAULT_MAX_BODY,
        }
    }
}

impl RecordCodec {
    /// Create a codec with the default body cap.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Override the maximum accepted body size.
    #[must_use]
    pub const fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }
}

impl Decoder for RecordCodec {
    type Error = TransportError;
    type Item = Frame;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let body_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if body_len > self.max_body {
            return Err(TransportError::InvalidPacket(format!(
                "body length {body_len} exceeds the {} byte limit",
                self.max_body
            )));
        }
        let frame_len = HEADER_LEN + body_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }
        let transaction_id = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
        src.advance(HEADER_LEN);
        let body = src.split_to(body_len).to_vec();
        Ok(Some(Frame {
            transaction_id,
            body,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(TransportError::InvalidPacket(
                "stream ended inside a frame".into(),
            )),
        }
    }
}

impl Encoder<Frame> for RecordCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), TransportError> {
        let body_len = u32::try_from(item.body.len())
            .map_err(|_| TransportError::InvalidPacket("body exceeds u32 length".into()))?;
        if item.body.len() > self.max_body {
            return Err(TransportError::InvalidPacket(format!(
                "body length {body_len} exceeds the {} byte limit",
                self.max_body
            )));
        }
        dst.reserve(HEADER_LEN + item.body.len());
        dst.put_u32(body_len);
        dst.put_u32(item.transaction_id);
        dst.put_slice(&item.body);
        Ok(())
    }
}

/// Factory for the record framing.
#[derive(Debug, Clone)]
pub struct RecordTransport {
    max_body: usize,
}

impl Default for RecordTransport {
    fn default() -> Self {
        Self {
            max_body: DEFAULT_MAX_BODY,
        }
    }
}

impl RecordTransport {
    /// Create a transport with the default body cap.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Override the maximum accepted body size.
    #[must_use]
    pub const fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }
}

impl Transport for RecordTransport {
    fn name(&self) -> &'static str { "record" }

    fn server_codec(&self) -> BoxCodec {
        BoxCodec::new(RecordCodec::new().with_max_body(self.max_body))
    }

    fn client_codec(&self) -> BoxCodec {
        BoxCodec::new(RecordCodec::new().with_max_body(self.max_body))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn encode_one(codec: &mut RecordCodec, frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).expect("encode");
        buf
    }

    #[test]
    fn header_is_bit_exact() {
        let mut codec = RecordCodec::new();
        let buf = encode_one(
            &mut codec,
            Frame {
                transaction_id: 0x0102_0304,
                body: b"abc".to_vec(),
            },
        );
        assert_eq!(&buf[..], b"\x00\x00\x00\x03\x01\x02\x03\x04abc");
    }

    #[test]
    fn partial_input_yields_nothing() {
        let mut codec = RecordCodec::new();
        let full = encode_one(&mut codec, Frame {
            transaction_id: 9,
            body: vec![1, 2, 3, 4, 5],
        });
        let mut src = BytesMut::new();
        for chunk in full.chunks(3) {
            assert!(src.is_empty() || codec.decode(&mut src).expect("decode").is_none());
            src.extend_from_slice(chunk);
        }
        let frame = codec.decode(&mut src).expect("decode").expect("complete");
        assert_eq!(frame.transaction_id, 9);
        assert_eq!(frame.body, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn oversized_body_is_rejected_early() {
        let mut codec = RecordCodec::new().with_max_body(8);
        let mut src = BytesMut::new();
        src.put_u32(9);
        src.put_u32(1);
        assert!(matches!(
            codec.decode(&mut src),
            Err(TransportError::InvalidPacket(_))
        ));
    }

    #[test]
    fn eof_inside_a_frame_is_invalid() {
        let mut codec = RecordCodec::new();
        let mut src = BytesMut::new();
        src.put_u32(10);
        src.put_u32(1);
        src.put_slice(b"abc");
        assert!(matches!(
            codec.decode_eof(&mut src),
            Err(TransportError::InvalidPacket(_))
        ));
    }

    #[test]
    fn eof_at_a_boundary_is_clean() {
        let mut codec = RecordCodec::new();
        let mut src = BytesMut::new();
        assert!(codec.decode_eof(&mut src).expect("clean eof").is_none());
    }

    proptest! {
        /// `read(write(tid, body)) == (tid, body)` for arbitrary ids and
        /// bodies, including back-to-back frames in one buffer.
        #[test]
        fn round_trips_arbitrary_frames(
            transaction_id in any::<u32>(),
            body in proptest::collection::vec(any::<u8>(), 0..2048),
            second in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let mut codec = RecordCodec::new();
            let mut buf = BytesMut::new();
            codec.encode(Frame { transaction_id, body: body.clone() }, &mut buf).expect("encode");
            codec.encode(Frame { transaction_id: 1, body: second.clone() }, &mut buf).expect("encode");

            let first = codec.decode(&mut buf).expect("decode").expect("first frame");
            prop_assert_eq!(first.transaction_id, transaction_id);
            prop_assert_eq!(first.body, body);
            let next = codec.decode(&mut buf).expect("decode").expect("second frame");
            prop_assert_eq!(next.transaction_id, 1);
            prop_assert_eq!(next.body, second);
            prop_assert!(buf.is_empty());
        }
    }
}
