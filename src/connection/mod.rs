//! Client-side connections.
//!
//! A connection owns one TCP socket. [`SharedConnection`] multiplexes any
//! number of in-flight requests over it with a background writer and reader;
//! [`SimpleConnection`] performs one request at a time inline. Both hand out
//! completion tickets: the caller blocks on a ticket, not on the socket.

pub mod shared;
pub mod simple;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

pub use shared::SharedConnection;
pub use simple::SimpleConnection;

use crate::error::ConnectionError;

/// Stream type connections can be built over.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> StreamIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Producer of serialized heartbeat request bodies.
pub type HeartbeatFn = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

/// Completion of a queued write; resolves to the transaction id.
#[derive(Debug)]
pub struct WriteTicket {
    rx: oneshot::Receiver<Result<u32, ConnectionError>>,
}

impl WriteTicket {
    pub(crate) fn channel() -> (oneshot::Sender<Result<u32, ConnectionError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    pub(crate) fn ready(result: Result<u32, ConnectionError>) -> Self {
        let (tx, ticket) = Self::channel();
        let _ = tx.send(result);
        ticket
    }

    /// Wait until the byte-level write finished or failed.
    ///
    /// # Errors
    /// Returns [`ConnectionError::WriteTimeout`] when `timeout` elapses and
    /// [`ConnectionError::WriteAbort`] when the connection went away.
    pub async fn wait(self, timeout: Option<Duration>) -> Result<u32, ConnectionError> {
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.rx)
                .await
                .map_err(|_| ConnectionError::WriteTimeout)?,
            None => self.rx.await,
        };
        outcome.unwrap_or(Err(ConnectionError::WriteAbort))
    }
}

/// Completion of a requested read; resolves to the response body.
#[derive(Debug)]
pub struct ReadTicket {
    rx: oneshot::Receiver<Result<Vec<u8>, ConnectionError>>,
}

impl ReadTicket {
    pub(crate) fn channel() -> (oneshot::Sender<Result<Vec<u8>, ConnectionError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    pub(crate) fn ready(result: Result<Vec<u8>, ConnectionError>) -> Self {
        let (tx, ticket) = Self::channel();
        let _ = tx.send(result);
        ticket
    }

    /// Wait until the paired response arrived.
    ///
    /// # Errors
    /// Returns [`ConnectionError::ReadTimeout`] when `timeout` elapses and
    /// [`ConnectionError::ReadAbort`] when the connection went away.
    pub async fn wait(self, timeout: Option<Duration>) -> Result<Vec<u8>, ConnectionError> {
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.rx)
                .await
                .map_err(|_| ConnectionError::ReadTimeout)?,
            None => self.rx.await,
        };
        outcome.unwrap_or(Err(ConnectionError::ReadAbort))
    }
}

/// A client connection multiplexing framed messages over one socket.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Queue `body` for writing under `timeout`, allocating a transaction id.
    ///
    /// The call returns immediately; the ticket fires when the byte-level
    /// write finished or failed.
    ///
    /// # Errors
    /// Fails fast with [`ConnectionError::WriteAbort`] on a closing or closed
    /// connection and [`ConnectionError::MaxPendingWrites`] when the write
    /// queue is full.
    async fn write(
        &self,
        body: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<(u32, WriteTicket), ConnectionError>;

    /// Obtain the completion for the response to `transaction_id`.
    ///
    /// A response that already arrived resolves the ticket immediately.
    ///
    /// # Errors
    /// Fails fast with [`ConnectionError::ReadAbort`] on a closing or closed
    /// connection.
    async fn read(&self, transaction_id: u32) -> Result<ReadTicket, ConnectionError>;

    /// Close the connection and fail every outstanding completion. Idempotent.
    fn close(&self);

    /// Whether a close is in progress.
    fn is_closing(&self) -> bool;

    /// Whether the connection is fully closed.
    fn is_closed(&self) -> bool;
}

/// Tunables for a [`SharedConnection`].
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Capacity of the bounded write queue.
    pub max_pending_writes: usize,
    /// Capacity of the pending-read map.
    pub max_pending_reads: usize,
    /// Capacity of the map parking responses that arrived early.
    pub max_pooling_reads: usize,
    /// Write deadline applied when the caller passes none.
    pub write_timeout: Duration,
    /// Socket-level deadline for one framed write.
    pub io_timeout: Duration,
    /// Heartbeat injection interval; `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_pending_writes: 65535,
            max_pending_reads: 65535,
            max_pooling_reads: 65535,
            write_timeout: Duration::from_secs(30),
            io_timeout: Duration::from_secs(15),
            heartbeat_interval: None,
        }
    }
}

impl ConnectionSettings {
    /// Override the write queue capacity.
    #[must_use]
    pub const fn with_max_pending_writes(mut self, capacity: usize) -> Self {
        self.max_pending_writes = capacity;
        self
    }

    /// Override the pending-read map capacity.
    #[must_use]
    pub const fn with_max_pending_reads(mut self, capacity: usize) -> Self {
        self.max_pending_reads = capacity;
        self
    }

    /// Override the early-response map capacity.
    #[must_use]
    pub const fn with_max_pooling_reads(mut self, capacity: usize) -> Self {
        self.max_pooling_reads = capacity;
        self
    }

    /// Override the default write deadline.
    #[must_use]
    pub const fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Override the socket-level write deadline.
    #[must_use]
    pub const fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Enable heartbeats at the given interval.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }
}
