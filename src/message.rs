//! Request and response structures and their wire envelope.
//!
//! A request names a `(service, method)` pair and carries positional and
//! keyword arguments plus an opaque `meta` value the caller can thread
//! through to the response. A response carries either a value or an error
//! description. On the wire both travel inside a single envelope whose
//! `is_request` field discriminates the two.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{RemoteError, SerializerError};

/// Dynamic argument and result type carried by requests and responses.
pub type Value = serde_json::Value;

/// A remote method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Name of the target service.
    pub service: String,
    /// Name of the target method.
    pub method: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,
    /// Caller context echoed back in the response.
    #[serde(default)]
    pub meta: Option<Value>,
}

impl Request {
    /// Create a request with empty arguments.
    #[must_use]
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            meta: None,
        }
    }

    /// Replace the positional arguments.
    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Add one keyword argument.
    #[must_use]
    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    /// Attach caller context.
    #[must_use]
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Check the request invariants.
    ///
    /// # Errors
    /// Returns [`RemoteError::RequestValidate`] when either name is empty.
    pub fn validate(&self) -> Result<(), RemoteError> {
        if self.service.is_empty() || self.method.is_empty() {
            return Err(RemoteError::RequestValidate(
                "missing service name or method name".into(),
            ));
        }
        Ok(())
    }
}

/// Error description carried inside a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Stable error kind tag.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl WireError {
    /// Rebuild the typed error this description was produced from.
    #[must_use]
    pub fn to_remote(&self) -> RemoteError { RemoteError::from_wire(&self.kind, &self.message) }
}

impl From<&RemoteError> for WireError {
    fn from(err: &RemoteError) -> Self {
        Self {
            kind: err.kind().to_owned(),
            message: err.to_string(),
        }
    }
}

/// Outcome of a remote method invocation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Response {
    /// The value produced by the method, when it succeeded.
    #[serde(default)]
    pub value: Option<Value>,
    /// The failure description, when it did not.
    #[serde(default)]
    pub error: Option<WireError>,
    /// The `meta` of the originating request, echoed back.
    #[serde(default)]
    pub meta: Option<Value>,
}

impl Response {
    /// Build a successful response.
    #[must_use]
    pub const fn success(value: Option<Value>, meta: Option<Value>) -> Self {
        Self {
            value,
            error: None,
            meta,
        }
    }

    /// Build a failed response.
    #[must_use]
    pub fn failure(err: &RemoteError, meta: Option<Value>) -> Self {
        Self {
            value: None,
            error: Some(WireError::from(err)),
            meta,
        }
    }
}

/// A wire message: either a request or a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Client-to-server invocation.
    Request(Request),
    /// Server-to-client outcome.
    Response(Response),
}

/// Flat wire form with an explicit `is_request` discriminator.
///
/// Every field is concrete so the envelope survives any self-describing
/// serde format without relying on tagged-enum representations.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireEnvelope {
    pub is_request: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kwargs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl From<&Message> for WireEnvelope {
    fn from(message: &Message) -> Self {
        match message {
            Message::Request(req) => Self {
                is_request: true,
                service: Some(req.service.clone()),
                method: Some(req.method.clone()),
                args: req.args.clone(),
                kwargs: req.kwargs.clone(),
                value: None,
                error: None,
                meta: req.meta.clone(),
            },
            Message::Response(resp) => Self {
                is_request: false,
                service: None,
                method: None,
                args: Vec::new(),
                kwargs: BTreeMap::new(),
                value: resp.value.clone(),
                error: resp.error.clone(),
                meta: resp.meta.clone(),
            },
        }
    }
}

impl TryFrom<WireEnvelope> for Message {
    type Error = SerializerError;

    fn try_from(envelope: WireEnvelope) -> Result<Self, SerializerError> {
        if envelope.is_request {
            let service = envelope.service.ok_or_else(|| {
                SerializerError::Deserialization("request without service name".into())
            })?;
            let method = envelope.method.ok_or_else(|| {
                SerializerError::Deserialization("request without method name".into())
            })?;
            Ok(Self::Request(Request {
                service,
                method,
                args: envelope.args,
                kwargs: envelope.kwargs,
                meta: envelope.meta,
            }))
        } else {
            Ok(Self::Response(Response {
                value: envelope.value,
                error: envelope.error,
                meta: envelope.meta,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn validate_rejects_empty_names() {
        assert!(Request::new("calc", "add").validate().is_ok());
        assert!(Request::new("", "add").validate().is_err());
        assert!(Request::new("calc", "").validate().is_err());
    }

    #[test]
    fn envelope_discriminates_requests_and_responses() {
        let request = Message::Request(Request::new("calc", "add").with_args(vec![json!(1)]));
        let encoded = serde_json::to_value(WireEnvelope::from(&request)).expect("encode");
        assert_eq!(encoded.get("is_request"), Some(&json!(true)));

        let response = Message::Response(Response::success(Some(json!(2)), None));
        let encoded = serde_json::to_value(WireEnvelope::from(&response)).expect("encode");
        assert_eq!(encoded.get("is_request"), Some(&json!(false)));
    }

    #[test]
    fn request_without_names_is_rejected() {
        let envelope = WireEnvelope {
            is_request: true,
            service: None,
            method: Some("add".into()),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            value: None,
            error: None,
            meta: None,
        };
        assert!(Message::try_from(envelope).is_err());
    }

    #[test]
    fn failure_response_carries_kind_and_message() {
        let err = RemoteError::LookupMethod("(calc, mul) is not exported".into());
        let response = Response::failure(&err, Some(json!({"trace": "t1"})));
        let wire = response.error.expect("error present");
        assert_eq!(wire.kind, "lookup_method_error");
        assert!(wire.message.contains("mul"));
        assert!(matches!(wire.to_remote(), RemoteError::LookupMethod(_)));
    }
}
