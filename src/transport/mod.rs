//! Framing layer: byte streams in, `(transaction id, body)` messages out.
//!
//! Each framing is a pair of tokio codecs produced by a [`Transport`]
//! factory, so every connection owns independent decoder state. The record
//! framing is symmetric; the HTTP framing distinguishes the accepting side
//! (reads requests, writes fixed responses) from the initiating side.

pub mod http;
pub mod record;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

pub use http::{HttpResponseParser, HttpTransport, Stage};
pub use record::{RecordCodec, RecordTransport};

use crate::error::TransportError;

/// One framed wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Identifier pairing this message with its counterpart.
    pub transaction_id: u32,
    /// Opaque encoded body.
    pub body: Vec<u8>,
}

/// Stateful codec turning a byte stream into [`Frame`]s and back.
pub trait FrameCodec:
    Decoder<Item = Frame, Error = TransportError>
    + Encoder<Frame, Error = TransportError>
    + Send
{
}

impl<T> FrameCodec for T where
    T: Decoder<Item = Frame, Error = TransportError>
        + Encoder<Frame, Error = TransportError>
        + Send
{
}

/// Boxed [`FrameCodec`] usable with `FramedRead`/`FramedWrite`.
pub struct BoxCodec(Box<dyn FrameCodec>);

impl BoxCodec {
    /// Box a concrete codec.
    #[must_use]
    pub fn new<C: FrameCodec + 'static>(codec: C) -> Self { Self(Box::new(codec)) }
}

impl std::fmt::Debug for BoxCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxCodec")
    }
}

impl Decoder for BoxCodec {
    type Error = TransportError;
    type Item = Frame;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        self.0.decode(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        self.0.decode_eof(src)
    }
}

impl Encoder<Frame> for BoxCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), TransportError> {
        self.0.encode(item, dst)
    }
}

/// Factory for the two codec roles of a framing.
pub trait Transport: Send + Sync {
    /// Scheme name published in register URLs.
    fn name(&self) -> &'static str;

    /// Codec for the accepting side of a connection.
    fn server_codec(&self) -> BoxCodec;

    /// Codec for the initiating side of a connection.
    fn client_codec(&self) -> BoxCodec;
}

/// Require the next frame of a framed stream.
///
/// End of stream at a frame boundary means the remote closed the socket and
/// surfaces as [`TransportError::SocketAlreadyClosed`]; EOF inside a frame
/// arrives as the decoder's own invalid-packet error.
///
/// # Errors
/// Returns the decoder failure, or [`TransportError::SocketAlreadyClosed`]
/// on a clean end of stream.
pub fn require_frame(
    next: Option<Result<Frame, TransportError>>,
) -> Result<Frame, TransportError> {
    next.unwrap_or(Err(TransportError::SocketAlreadyClosed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_at_a_boundary_is_socket_already_closed() {
        assert!(matches!(
            require_frame(None),
            Err(TransportError::SocketAlreadyClosed)
        ));
    }

    #[test]
    fn frames_and_errors_pass_through() {
        let frame = Frame {
            transaction_id: 3,
            body: b"ok".to_vec(),
        };
        let passed = require_frame(Some(Ok(frame.clone()))).expect("frame passes through");
        assert_eq!(passed, frame);
        assert!(matches!(
            require_frame(Some(Err(TransportError::InvalidPacket("bad".into())))),
            Err(TransportError::InvalidPacket(_))
        ));
    }
}
