//! Register URLs: the canonical published form of a provider.
//!
//! A provider advertises one method as
//! `<transport>://<host>:<port>/<service>/<method>?serializer=<enc>&max_buffer_size=<n>`,
//! percent-encoded so the whole URL fits in a single path segment of the
//! coordination service. The segment name is also the discovery key.

use std::borrow::Cow;
use std::fmt;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use url::Url;

/// Everything outside the unreserved set is escaped.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// A remote provider address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parsed form of one register URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderUrl {
    /// Transport scheme name.
    pub transport: String,
    /// Provider host.
    pub host: String,
    /// Provider port.
    pub port: u16,
    /// Exported service name.
    pub service: String,
    /// Exported method name.
    pub method: String,
    /// Encoder name.
    pub serializer: String,
    /// Buffer cap the provider accepts.
    pub max_buffer_size: usize,
}

impl ProviderUrl {
    /// Render the plain URL form.
    #[must_use]
    pub fn to_url(&self) -> String {
        format!(
            "{}://{}:{}/{}/{}?serializer={}&max_buffer_size={}",
            self.transport,
            self.host,
            self.port,
            self.service,
            self.method,
            self.serializer,
            self.max_buffer_size
        )
    }

    /// Render the percent-encoded single-segment form.
    #[must_use]
    pub fn encode(&self) -> String { utf8_percent_encode(&self.to_url(), SEGMENT).to_string() }

    /// Decode a percent-encoded segment back into a URL string.
    #[must_use]
    pub fn decode_segment(segment: &str) -> Option<String> {
        percent_decode_str(segment)
            .decode_utf8()
            .ok()
            .map(Cow::into_owned)
    }

    /// Parse a plain register URL.
    ///
    /// Returns `None` for anything that does not match the canonical form;
    /// discovery skips such children instead of failing.
    #[must_use]
    pub fn parse(url: &str) -> Option<Self> {
        let parsed = Url::parse(url).ok()?;
        let transport = parsed.scheme().to_owned();
        let host = parsed.host_str()?.to_owned();
        let port = parsed.port()?;

        let mut segments = parsed.path_segments()?;
        let service = segments.next()?.to_owned();
        let method = segments.next()?.to_owned();
        if segments.next().is_some() || service.is_empty() || method.is_empty() {
            return None;
        }

        let mut serializer = None;
        let mut max_buffer_size = 0usize;
        for (name, value) in parsed.query_pairs() {
            match name.as_ref() {
                "serializer" => serializer = Some(value.into_owned()),
                "max_buffer_size" => max_buffer_size = value.parse().unwrap_or(0),
                _ => {}
            }
        }

        Some(Self {
            transport,
            host,
            port,
            service,
            method,
            serializer: serializer?,
            max_buffer_size,
        })
    }

    /// The provider's endpoint.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint { Endpoint::new(self.host.clone(), self.port) }

    /// The `/service/method` path used as part of the discovery key.
    #[must_use]
    pub fn target_path(&self) -> String { format!("/{}/{}", self.service, self.method) }
}
