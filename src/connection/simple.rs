//! Single-request-at-a-time connection.
//!
//! Writes and reads happen inline on the caller's task, one exchange at a
//! time. The response must carry the transaction id of the write that
//! preceded it; any mismatch closes the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, error};

use super::{Connection, ReadTicket, StreamIo, WriteTicket};
use crate::error::{ConnectionError, TransportError};
use crate::transport::{BoxCodec, Frame, Transport, require_frame};
use crate::util::TransactionIds;

type FramedIo = Framed<Box<dyn StreamIo>, BoxCodec>;

/// Connection performing write-then-read inline, without background workers.
pub struct SimpleConnection {
    io: Mutex<Option<FramedIo>>,
    ids: TransactionIds,
    io_timeout: Duration,
    closing: AtomicBool,
    closed: AtomicBool,
}

impl SimpleConnection {
    /// Build a connection over an established stream.
    #[must_use]
    pub fn new(stream: Box<dyn StreamIo>, transport: &dyn Transport, io_timeout: Duration) -> Self {
        Self {
            io: Mutex::new(Some(Framed::new(stream, transport.client_codec()))),
            ids: TransactionIds::new(0),
            io_timeout,
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Connect a TCP stream and build a connection over it.
    ///
    /// # Errors
    /// Returns the connect failure, or a timed-out error when the connect
    /// did not finish within `io_timeout`.
    pub async fn connect<A>(
        addr: A,
        transport: &dyn Transport,
        io_timeout: Duration,
    ) -> std::io::Result<Self>
    where
        A: ToSocketAddrs,
    {
        let stream = tokio::time::timeout(io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")
            })??;
        stream.set_nodelay(true)?;
        Ok(Self::new(Box::new(stream), transport, io_timeout))
    }

    fn close_locked(&self, io: &mut Option<FramedIo>) {
        *io = None;
        self.closing.store(false, Ordering::Release);
        self.closed.store(true, Ordering::Release);
    }
}

#[async_trait]
impl Connection for SimpleConnection {
    async fn write(
        &self,
        body: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<(u32, WriteTicket), ConnectionError> {
        if self.is_closing() || self.is_closed() {
            return Err(ConnectionError::WriteAbort);
        }
        let transaction_id = self.ids.next();
        let mut guard = self.io.lock().await;
        let Some(framed) = guard.as_mut() else {
            return Ok((transaction_id, WriteTicket::ready(Err(ConnectionError::WriteAbort))));
        };

        let deadline = timeout.unwrap_or(self.io_timeout);
        let frame = Frame {
            transaction_id,
            body,
        };
        let result = match tokio::time::timeout(deadline, framed.send(frame)).await {
            Ok(Ok(())) => Ok(transaction_id),
            Err(_) => {
                self.close_locked(&mut guard);
                Err(ConnectionError::WriteTimeout)
            }
            Ok(Err(err)) => {
                error!(error = %err, "framed write failed");
                self.close_locked(&mut guard);
                Err(ConnectionError::WriteAbort)
            }
        };
        Ok((transaction_id, WriteTicket::ready(result)))
    }

    async fn read(&self, transaction_id: u32) -> Result<ReadTicket, ConnectionError> {
        let mut guard = self.io.lock().await;
        let Some(framed) = guard.as_mut() else {
            return Ok(ReadTicket::ready(Err(ConnectionError::ReadAbort)));
        };

        let result = match tokio::time::timeout(self.io_timeout, framed.next()).await {
            Err(_) => {
                self.close_locked(&mut guard);
                Err(ConnectionError::ReadTimeout)
            }
            Ok(next) => match require_frame(next) {
                Err(err @ TransportError::SocketAlreadyClosed) => {
                    debug!(error = %err, "remote closed the connection");
                    self.close_locked(&mut guard);
                    Err(ConnectionError::ReadAbort)
                }
                Err(err) => {
                    error!(error = %err, "framed read failed");
                    self.close_locked(&mut guard);
                    Err(ConnectionError::ReadAbort)
                }
                Ok(frame) => {
                    if frame.transaction_id == transaction_id {
                        Ok(frame.body)
                    } else {
                        error!(
                            expected = transaction_id,
                            received = frame.transaction_id,
                            "write and read must appear in pairs"
                        );
                        self.close_locked(&mut guard);
                        Err(ConnectionError::TransactionMismatch)
                    }
                }
            },
        };
        Ok(ReadTicket::ready(result))
    }

    fn close(&self) {
        if self.is_closed() || self.is_closing() {
            return;
        }
        self.closing.store(true, Ordering::Release);
        if let Ok(mut guard) = self.io.try_lock() {
            self.close_locked(&mut guard);
        } else {
            // An exchange is in flight; the flags stop further borrows and
            // the stream is dropped with the connection.
            self.closing.store(false, Ordering::Release);
            self.closed.store(true, Ordering::Release);
        }
    }

    fn is_closing(&self) -> bool { self.closing.load(Ordering::Acquire) }

    fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::transport::RecordTransport;

    #[tokio::test]
    async fn inline_exchange_round_trips() {
        let transport = RecordTransport::new();
        let (near, far) = duplex(16 * 1024);
        let connection =
            SimpleConnection::new(Box::new(near), &transport, Duration::from_secs(5));

        let echo = tokio::spawn(async move {
            let (read_half, write_half) = tokio::io::split(far);
            let transport = RecordTransport::new();
            let mut source = FramedRead::new(read_half, transport.server_codec());
            let mut sink = FramedWrite::new(write_half, transport.server_codec());
            let frame = source.next().await.expect("frame").expect("decodes");
            sink.send(frame).await.expect("echo");
        });

        let (transaction_id, write_ticket) = connection
            .write(b"ping".to_vec(), None)
            .await
            .expect("write accepted");
        assert_eq!(write_ticket.wait(None).await, Ok(transaction_id));
        let ticket = connection.read(transaction_id).await.expect("read accepted");
        assert_eq!(ticket.wait(None).await, Ok(b"ping".to_vec()));
        echo.await.expect("echo task");
    }

    #[tokio::test]
    async fn mismatched_transaction_id_is_fatal() {
        let transport = RecordTransport::new();
        let (near, far) = duplex(16 * 1024);
        let connection =
            SimpleConnection::new(Box::new(near), &transport, Duration::from_secs(5));

        let rogue = tokio::spawn(async move {
            let (read_half, write_half) = tokio::io::split(far);
            let transport = RecordTransport::new();
            let mut source = FramedRead::new(read_half, transport.server_codec());
            let mut sink = FramedWrite::new(write_half, transport.server_codec());
            let frame = source.next().await.expect("frame").expect("decodes");
            sink.send(Frame {
                transaction_id: frame.transaction_id + 1,
                body: frame.body,
            })
            .await
            .expect("reply");
        });

        let (transaction_id, _) = connection
            .write(b"ping".to_vec(), None)
            .await
            .expect("write accepted");
        let ticket = connection.read(transaction_id).await.expect("read accepted");
        assert_eq!(
            ticket.wait(None).await,
            Err(ConnectionError::TransactionMismatch)
        );
        assert!(connection.is_closed());
        rogue.await.expect("rogue task");
    }

    #[tokio::test]
    async fn remote_close_surfaces_as_read_abort() {
        let transport = RecordTransport::new();
        let (near, far) = duplex(1024);
        let connection =
            SimpleConnection::new(Box::new(near), &transport, Duration::from_secs(1));
        drop(far);
        let ticket = connection.read(1).await.expect("ticket");
        assert_eq!(ticket.wait(None).await, Err(ConnectionError::ReadAbort));
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn operations_after_close_abort() {
        let transport = RecordTransport::new();
        let (near, _far) = duplex(1024);
        let connection =
            SimpleConnection::new(Box::new(near), &transport, Duration::from_secs(1));
        connection.close();
        assert!(connection.is_closed());
        assert!(matches!(
            connection.write(b"x".to_vec(), None).await,
            Err(ConnectionError::WriteAbort)
        ));
        let ticket = connection.read(1).await.expect("ticket");
        assert_eq!(ticket.wait(None).await, Err(ConnectionError::ReadAbort));
    }
}
