//! Client pipeline: an ordered filter chain ahead of the invoker.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::connection::Connection;
use crate::error::{RpcError, StubError};
use crate::invoker::{Invoker, RpcInvoker};
use crate::message::{Request, Value};
use crate::serializer::Serializer;

/// Observes or rejects requests before they reach the invoker.
pub trait Filter: Send + Sync {
    /// Filters run sorted by descending order value.
    fn order(&self) -> i64;

    /// Inspect `request`; an error stops the invocation.
    ///
    /// # Errors
    /// Implementations reject a request by returning any [`RpcError`].
    fn apply(&self, request: &Request) -> Result<(), RpcError>;
}

/// Logs every invocation; runs before every other filter.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFilter;

impl Filter for LogFilter {
    fn order(&self) -> i64 { i64::MAX }

    fn apply(&self, request: &Request) -> Result<(), RpcError> {
        info!(
            service = %request.service,
            method = %request.method,
            args = request.args.len(),
            kwargs = request.kwargs.len(),
            "invoking remote method"
        );
        Ok(())
    }
}

/// Rejects calls to methods deliberately not exposed to this client.
#[derive(Debug, Default)]
pub struct BlocklistFilter {
    blocked: HashSet<(String, String)>,
}

impl BlocklistFilter {
    /// Create an empty blocklist.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Block one `(service, method)` pair.
    #[must_use]
    pub fn block(mut self, service: impl Into<String>, method: impl Into<String>) -> Self {
        self.blocked.insert((service.into(), method.into()));
        self
    }
}

impl Filter for BlocklistFilter {
    fn order(&self) -> i64 { 0 }

    fn apply(&self, request: &Request) -> Result<(), RpcError> {
        let key = (request.service.clone(), request.method.clone());
        if self.blocked.contains(&key) {
            return Err(StubError::Filtered(format!(
                "{}.{}",
                request.service, request.method
            ))
            .into());
        }
        Ok(())
    }
}

/// The filter chain plus the invoker it defers to.
pub struct Protocol {
    filters: Vec<Arc<dyn Filter>>,
    invoker: Arc<dyn Invoker>,
}

impl Default for Protocol {
    fn default() -> Self { Self::new(Arc::new(RpcInvoker::new())) }
}

impl Protocol {
    /// Create a pipeline around `invoker` with no filters.
    #[must_use]
    pub fn new(invoker: Arc<dyn Invoker>) -> Self {
        Self {
            filters: Vec::new(),
            invoker,
        }
    }

    /// Add a filter to the chain.
    #[must_use]
    pub fn with_filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Run the filters in descending order, then the invoker.
    ///
    /// # Errors
    /// Returns the first filter rejection, or whatever the invoker surfaces.
    pub async fn invoke(
        &self,
        request: &Request,
        connection: &dyn Connection,
        serializer: &dyn Serializer,
        write_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Value, RpcError> {
        let mut ordered: Vec<&Arc<dyn Filter>> = self.filters.iter().collect();
        ordered.sort_by_key(|filter| std::cmp::Reverse(filter.order()));
        for filter in ordered {
            filter.apply(request)?;
        }
        self.invoker
            .invoke(request, connection, serializer, write_timeout, read_timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::connection::{ReadTicket, WriteTicket};
    use crate::error::ConnectionError;

    struct NullConnection;

    #[async_trait]
    impl Connection for NullConnection {
        async fn write(
            &self,
            _body: Vec<u8>,
            _timeout: Option<Duration>,
        ) -> Result<(u32, WriteTicket), ConnectionError> {
            Ok((1, WriteTicket::ready(Ok(1))))
        }

        async fn read(&self, _transaction_id: u32) -> Result<ReadTicket, ConnectionError> {
            Ok(ReadTicket::ready(Err(ConnectionError::ReadAbort)))
        }

        fn close(&self) {}

        fn is_closing(&self) -> bool { false }

        fn is_closed(&self) -> bool { false }
    }

    struct RecordingFilter {
        order: i64,
        seen: Arc<Mutex<Vec<i64>>>,
    }

    impl Filter for RecordingFilter {
        fn order(&self) -> i64 { self.order }

        fn apply(&self, _request: &Request) -> Result<(), RpcError> {
            self.seen
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(self.order);
            Ok(())
        }
    }

    struct NoopInvoker;

    #[async_trait]
    impl Invoker for NoopInvoker {
        async fn invoke(
            &self,
            _request: &Request,
            _connection: &dyn Connection,
            _serializer: &dyn Serializer,
            _write_timeout: Duration,
            _read_timeout: Duration,
        ) -> Result<Value, RpcError> {
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn filters_run_in_descending_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let protocol = Protocol::new(Arc::new(NoopInvoker))
            .with_filter(Arc::new(RecordingFilter {
                order: 1,
                seen: Arc::clone(&seen),
            }))
            .with_filter(Arc::new(RecordingFilter {
                order: 10,
                seen: Arc::clone(&seen),
            }))
            .with_filter(Arc::new(RecordingFilter {
                order: 5,
                seen: Arc::clone(&seen),
            }));

        let request = Request::new("calc", "add");
        protocol
            .invoke(
                &request,
                &NullConnection,
                &crate::serializer::JsonSerializer,
                Duration::from_secs(1),
                Duration::from_secs(1),
            )
            .await
            .expect("invocation passes");
        assert_eq!(
            *seen.lock().unwrap_or_else(std::sync::PoisonError::into_inner),
            vec![10, 5, 1]
        );
    }

    #[tokio::test]
    async fn blocklist_rejects_before_the_invoker() {
        let protocol = Protocol::new(Arc::new(NoopInvoker))
            .with_filter(Arc::new(BlocklistFilter::new().block("admin", "drop")));

        let request = Request::new("admin", "drop");
        let outcome = protocol
            .invoke(
                &request,
                &NullConnection,
                &crate::serializer::JsonSerializer,
                Duration::from_secs(1),
                Duration::from_secs(1),
            )
            .await;
        assert!(matches!(outcome, Err(RpcError::Stub(StubError::Filtered(_)))));

        let allowed = Request::new("admin", "list");
        assert!(protocol
            .invoke(
                &allowed,
                &NullConnection,
                &crate::serializer::JsonSerializer,
                Duration::from_secs(1),
                Duration::from_secs(1),
            )
            .await
            .is_ok());
    }
}
