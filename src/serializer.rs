//! Conversion between wire messages and opaque byte bodies.
//!
//! The framework mandates nothing about the concrete format beyond two
//! properties: `decode(encode(m)) == m` for every message shape, and the
//! encoded form self-describes whether it holds a request or a response.

use crate::error::SerializerError;
use crate::message::{Message, WireEnvelope};

/// Symmetric encoder/decoder for wire messages.
pub trait Serializer: Send + Sync {
    /// Encoder name published in register URLs.
    fn name(&self) -> &'static str;

    /// Encode a message into an opaque body.
    ///
    /// # Errors
    /// Returns [`SerializerError::Serialization`] when the message cannot be
    /// represented in the wire format.
    fn encode(&self, message: &Message) -> Result<Vec<u8>, SerializerError>;

    /// Decode an opaque body back into a message.
    ///
    /// # Errors
    /// Returns [`SerializerError::Deserialization`] on malformed input.
    fn decode(&self, bytes: &[u8]) -> Result<Message, SerializerError>;
}

/// JSON encoding of the wire envelope.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str { "json" }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, SerializerError> {
        serde_json::to_vec(&WireEnvelope::from(message))
            .map_err(|err| SerializerError::Serialization(err.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, SerializerError> {
        let envelope: WireEnvelope = serde_json::from_slice(bytes)
            .map_err(|err| SerializerError::Deserialization(err.to_string()))?;
        envelope.try_into()
    }
}

/// MessagePack encoding of the wire envelope.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgpackSerializer;

impl Serializer for MsgpackSerializer {
    fn name(&self) -> &'static str { "msgpack" }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, SerializerError> {
        rmp_serde::to_vec_named(&WireEnvelope::from(message))
            .map_err(|err| SerializerError::Serialization(err.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, SerializerError> {
        let envelope: WireEnvelope = rmp_serde::from_slice(bytes)
            .map_err(|err| SerializerError::Deserialization(err.to_string()))?;
        envelope.try_into()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::error::RemoteError;
    use crate::message::{Request, Response};

    fn serializers() -> Vec<Box<dyn Serializer>> {
        vec![Box::new(JsonSerializer), Box::new(MsgpackSerializer)]
    }

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Request(Request::new("calc", "add")),
            Message::Request(
                Request::new("calc", "add")
                    .with_args(vec![json!(1), json!("two"), json!([3.5, null])])
                    .with_kwarg("precision", json!(2))
                    .with_meta(json!({"trace": "abc"})),
            ),
            Message::Response(Response::success(None, None)),
            Message::Response(Response::success(Some(json!({"sum": 3})), Some(json!("m")))),
            Message::Response(Response::failure(
                &RemoteError::MethodExecution("divide by zero".into()),
                None,
            )),
        ]
    }

    #[test]
    fn round_trips_every_message_shape() {
        for serializer in serializers() {
            for message in sample_messages() {
                let bytes = serializer.encode(&message).expect("encode");
                let decoded = serializer.decode(&bytes).expect("decode");
                assert_eq!(decoded, message, "{} round trip", serializer.name());
            }
        }
    }

    #[rstest]
    #[case(&b"not a message"[..])]
    #[case(&b""[..])]
    #[case(&b"{\"service\": \"calc\"}"[..])]
    fn malformed_input_is_a_deserialization_error(#[case] bytes: &[u8]) {
        let serializer = JsonSerializer;
        assert!(matches!(
            serializer.decode(bytes),
            Err(SerializerError::Deserialization(_))
        ));
    }

    #[test]
    fn names_match_the_published_encoders() {
        assert_eq!(JsonSerializer.name(), "json");
        assert_eq!(MsgpackSerializer.name(), "msgpack");
    }
}
