//! Connection multiplexing arbitrarily many in-flight requests.
//!
//! Two background tasks share the socket: the writer drains a bounded queue
//! of pending writes and injects heartbeats while idle; the reader pairs
//! incoming frames with pending reads by transaction id, parking responses
//! that arrive before anyone asked for them. Close may race with any
//! operation; it is sequenced by a dedicated lock and guarantees every
//! outstanding completion is finished exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Notify, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, warn};

use super::{
    Connection,
    ConnectionSettings,
    HeartbeatFn,
    ReadTicket,
    StreamIo,
    WriteTicket,
};
use crate::error::{ConnectionError, TransportError};
use crate::transport::{Frame, Transport, require_frame};
use crate::util::{LruCache, StaticList, TimeUsed, TransactionIds};

/// A fifth outstanding heartbeat without a response kills the connection.
const MAX_OUTSTANDING_HEARTBEATS: usize = 4;

struct PendingWrite {
    body: Vec<u8>,
    done: oneshot::Sender<Result<u32, ConnectionError>>,
    transaction_id: u32,
    enqueued_at: Instant,
    timeout: Duration,
}

struct WriteBook {
    pending: StaticList<PendingWrite>,
}

struct ReadBook {
    pending: LruCache<u32, oneshot::Sender<Result<Vec<u8>, ConnectionError>>>,
    pooling: LruCache<u32, Vec<u8>>,
}

struct Inner {
    settings: ConnectionSettings,
    heartbeat: Option<HeartbeatFn>,
    ids: TransactionIds,
    writes: Mutex<WriteBook>,
    write_notify: Notify,
    reads: Mutex<ReadBook>,
    read_notify: Notify,
    heartbeats: Mutex<LruCache<u32, Instant>>,
    closing: AtomicBool,
    closed: AtomicBool,
    close_lock: Mutex<()>,
    shutdown: watch::Sender<bool>,
}

fn relock<'a, T>(
    result: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    result.unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn lock_writes(&self) -> MutexGuard<'_, WriteBook> { relock(self.writes.lock()) }

    fn lock_reads(&self) -> MutexGuard<'_, ReadBook> { relock(self.reads.lock()) }

    fn lock_heartbeats(&self) -> MutexGuard<'_, LruCache<u32, Instant>> {
        relock(self.heartbeats.lock())
    }

    fn is_shutting_down(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.is_shutting_down() {
            return;
        }
        let _guard = relock(self.close_lock.lock());
        if self.is_shutting_down() {
            return;
        }
        self.closing.store(true, Ordering::Release);

        // Stop both workers; dropping the halves closes the socket.
        let _ = self.shutdown.send(true);

        {
            let mut book = self.lock_writes();
            while let Ok(write) = book.pending.pop_left() {
                let _ = write.done.send(Err(ConnectionError::WriteAbort));
            }
        }
        self.write_notify.notify_one();

        {
            let mut book = self.lock_reads();
            while let Some((transaction_id, done)) = book.pending.pop_lru() {
                debug!(transaction_id, "aborting pending read");
                let _ = done.send(Err(ConnectionError::ReadAbort));
            }
            book.pooling.clear();
        }
        self.read_notify.notify_one();

        self.lock_heartbeats().clear();

        self.closed.store(true, Ordering::Release);
        self.closing.store(false, Ordering::Release);
    }
}

/// Connection sharing one socket between any number of borrowers.
pub struct SharedConnection {
    inner: Arc<Inner>,
}

impl SharedConnection {
    /// Build a connection over an established stream and spawn its workers.
    pub fn new<S>(
        stream: S,
        transport: &dyn Transport,
        settings: ConnectionSettings,
        heartbeat: Option<HeartbeatFn>,
    ) -> Self
    where
        S: StreamIo + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let source = FramedRead::new(read_half, transport.client_codec());
        let sink = FramedWrite::new(write_half, transport.client_codec());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            writes: Mutex::new(WriteBook {
                pending: StaticList::new(settings.max_pending_writes),
            }),
            write_notify: Notify::new(),
            reads: Mutex::new(ReadBook {
                pending: LruCache::new(settings.max_pending_reads),
                pooling: LruCache::new(settings.max_pooling_reads),
            }),
            read_notify: Notify::new(),
            heartbeats: Mutex::new(LruCache::new(MAX_OUTSTANDING_HEARTBEATS)),
            ids: TransactionIds::new(0),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_lock: Mutex::new(()),
            shutdown,
            settings,
            heartbeat,
        });

        tokio::spawn(writer_loop(Arc::clone(&inner), sink, shutdown_rx.clone()));
        tokio::spawn(reader_loop(Arc::clone(&inner), source, shutdown_rx));
        Self { inner }
    }

    /// Connect a TCP stream and build a connection over it.
    ///
    /// # Errors
    /// Returns the connect failure, or a timed-out error when the connect
    /// did not finish within the settings' I/O timeout.
    pub async fn connect<A>(
        addr: A,
        transport: &dyn Transport,
        settings: ConnectionSettings,
        heartbeat: Option<HeartbeatFn>,
    ) -> std::io::Result<Self>
    where
        A: ToSocketAddrs,
    {
        let stream = tokio::time::timeout(settings.io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")
            })??;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, transport, settings, heartbeat))
    }
}

#[async_trait]
impl Connection for SharedConnection {
    async fn write(
        &self,
        body: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<(u32, WriteTicket), ConnectionError> {
        let inner = &self.inner;
        let timeout = timeout.unwrap_or(inner.settings.write_timeout);
        let (done, ticket) = WriteTicket::channel();

        let transaction_id = {
            let mut book = inner.lock_writes();
            if inner.is_shutting_down() {
                return Err(ConnectionError::WriteAbort);
            }
            if book.pending.is_full() {
                return Err(ConnectionError::MaxPendingWrites);
            }
            let transaction_id = inner.ids.next();
            book.pending
                .push_back(PendingWrite {
                    body,
                    done,
                    transaction_id,
                    enqueued_at: Instant::now(),
                    timeout,
                })
                .map_err(|_| ConnectionError::MaxPendingWrites)?;
            transaction_id
        };

        inner.write_notify.notify_one();
        Ok((transaction_id, ticket))
    }

    async fn read(&self, transaction_id: u32) -> Result<ReadTicket, ConnectionError> {
        let inner = &self.inner;
        let mut book = inner.lock_reads();
        if inner.is_shutting_down() {
            return Err(ConnectionError::ReadAbort);
        }

        if let Some(body) = book.pooling.remove(&transaction_id) {
            return Ok(ReadTicket::ready(Ok(body)));
        }

        // Completions are single-consumer; a second read for a transaction
        // that is still pending (including a wrapped id colliding with an
        // old one) cannot share the first completion.
        if book.pending.contains(&transaction_id) {
            error!(transaction_id, "read requested twice for one transaction");
            return Err(ConnectionError::ReadAbort);
        }

        let (done, ticket) = ReadTicket::channel();
        if let Some((evicted_id, evicted)) = book.pending.insert(transaction_id, done) {
            warn!(transaction_id = evicted_id, "pending read displaced");
            let _ = evicted.send(Err(ConnectionError::MaxPendingReads));
        }
        drop(book);

        inner.read_notify.notify_one();
        Ok(ticket)
    }

    fn close(&self) { self.inner.close(); }

    fn is_closing(&self) -> bool { self.inner.closing.load(Ordering::Acquire) }

    fn is_closed(&self) -> bool { self.inner.closed.load(Ordering::Acquire) }
}

enum WriterStep {
    Exit,
    Idle,
    Write(PendingWrite),
}

fn next_writer_step(inner: &Inner) -> WriterStep {
    let mut book = inner.lock_writes();
    if inner.is_shutting_down() {
        return WriterStep::Exit;
    }
    match book.pending.pop_left() {
        Ok(write) => WriterStep::Write(write),
        Err(_) => WriterStep::Idle,
    }
}

/// Inject one heartbeat write, or report that too many are outstanding.
fn inject_heartbeat(inner: &Inner) -> HeartbeatOutcome {
    let Some(make_body) = inner.heartbeat.as_ref() else {
        return HeartbeatOutcome::Skipped;
    };
    let Some(interval) = inner.settings.heartbeat_interval else {
        return HeartbeatOutcome::Skipped;
    };

    let mut beats = inner.lock_heartbeats();
    if beats.len() >= MAX_OUTSTANDING_HEARTBEATS {
        return HeartbeatOutcome::TooManyMissing;
    }

    let mut book = inner.lock_writes();
    if !book.pending.is_empty() || book.pending.is_full() {
        return HeartbeatOutcome::Skipped;
    }
    let transaction_id = inner.ids.next();
    // The write completion of a heartbeat is unobserved; the reader clears
    // the heartbeat entry when the reply comes back.
    let (done, _unused) = oneshot::channel();
    if book
        .pending
        .push_back(PendingWrite {
            body: make_body(),
            done,
            transaction_id,
            enqueued_at: Instant::now(),
            timeout: interval,
        })
        .is_ok()
    {
        beats.insert(transaction_id, Instant::now());
        debug!(transaction_id, "heartbeat enqueued");
        HeartbeatOutcome::Injected
    } else {
        HeartbeatOutcome::Skipped
    }
}

enum HeartbeatOutcome {
    Injected,
    Skipped,
    TooManyMissing,
}

async fn writer_loop<S>(
    inner: Arc<Inner>,
    mut sink: FramedWrite<WriteHalf<S>, crate::transport::BoxCodec>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: StreamIo + 'static,
{
    let mut missing_too_many_heartbeats = false;
    let mut wake_reader = false;

    loop {
        if missing_too_many_heartbeats {
            error!("too many missed heartbeats, closing connection");
            inner.close();
            break;
        }
        if wake_reader {
            debug!("waking reader for a new heartbeat");
            inner.read_notify.notify_one();
            wake_reader = false;
        }

        let step = next_writer_step(&inner);
        let write = match step {
            WriterStep::Exit => break,
            WriterStep::Idle => {
                let idle_wait = inner
                    .settings
                    .heartbeat_interval
                    .map_or(Duration::MAX, |interval| interval / 2);
                tokio::select! {
                    () = inner.write_notify.notified() => {}
                    () = tokio::time::sleep(idle_wait) => {}
                    _ = shutdown.changed() => break,
                }
                if inner.is_shutting_down() {
                    break;
                }
                match inject_heartbeat(&inner) {
                    HeartbeatOutcome::Injected => wake_reader = true,
                    HeartbeatOutcome::TooManyMissing => missing_too_many_heartbeats = true,
                    HeartbeatOutcome::Skipped => {}
                }
                continue;
            }
            WriterStep::Write(write) => write,
        };

        if Instant::now() >= write.enqueued_at + write.timeout {
            let _ = write.done.send(Err(ConnectionError::WriteTimeout));
            continue;
        }

        let frame = Frame {
            transaction_id: write.transaction_id,
            body: write.body,
        };
        let sent = {
            let _watch = TimeUsed::watch("framed write", Duration::from_millis(10));
            tokio::time::timeout(inner.settings.io_timeout, sink.send(frame)).await
        };
        match sent {
            Ok(Ok(())) => {
                let _ = write.done.send(Ok(write.transaction_id));
            }
            Err(_) => {
                let _ = write.done.send(Err(ConnectionError::WriteTimeout));
                inner.close();
                break;
            }
            Ok(Err(err)) => {
                error!(error = %err, "framed write failed");
                let _ = write.done.send(Err(ConnectionError::WriteAbort));
                inner.close();
                break;
            }
        }
    }
    debug!("writer task exited");
}

async fn reader_loop<S>(
    inner: Arc<Inner>,
    mut source: FramedRead<ReadHalf<S>, crate::transport::BoxCodec>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: StreamIo + 'static,
{
    loop {
        if inner.is_shutting_down() {
            break;
        }

        let expecting = {
            let book = inner.lock_reads();
            !book.pending.is_empty() || !inner.lock_heartbeats().is_empty()
        };
        if !expecting {
            tokio::select! {
                () = inner.read_notify.notified() => {}
                _ = shutdown.changed() => break,
            }
            continue;
        }

        let next = tokio::select! {
            frame = source.next() => frame,
            _ = shutdown.changed() => break,
        };
        let frame = match require_frame(next) {
            Ok(frame) => frame,
            Err(err @ TransportError::SocketAlreadyClosed) => {
                debug!(error = %err, "remote closed the connection");
                inner.close();
                break;
            }
            Err(err) => {
                error!(error = %err, "framed read failed");
                inner.close();
                break;
            }
        };

        {
            let mut beats = inner.lock_heartbeats();
            if inner.is_shutting_down() {
                break;
            }
            if beats.remove(&frame.transaction_id).is_some() {
                debug!(
                    transaction_id = frame.transaction_id,
                    "heartbeat response received"
                );
                continue;
            }
        }

        let mut book = inner.lock_reads();
        if inner.is_shutting_down() {
            break;
        }
        if let Some(done) = book.pending.remove(&frame.transaction_id) {
            let _ = done.send(Ok(frame.body));
            continue;
        }
        if let Some((unclaimed_id, _)) = book.pooling.insert(frame.transaction_id, frame.body) {
            warn!(
                transaction_id = unclaimed_id,
                "parked response was never consumed"
            );
        }
    }
    debug!("reader task exited");
}

#[cfg(test)]
mod tests {
    use tokio::io::{DuplexStream, duplex};

    use super::*;
    use crate::transport::RecordTransport;

    /// Remote end of a duplex pair speaking the record framing.
    struct Peer {
        source: FramedRead<ReadHalf<DuplexStream>, crate::transport::BoxCodec>,
        sink: FramedWrite<WriteHalf<DuplexStream>, crate::transport::BoxCodec>,
    }

    fn wire_up(settings: ConnectionSettings) -> (SharedConnection, Peer) {
        let transport = RecordTransport::new();
        let (near, far) = duplex(64 * 1024);
        let connection = SharedConnection::new(near, &transport, settings, None);
        let (read_half, write_half) = tokio::io::split(far);
        let peer = Peer {
            source: FramedRead::new(read_half, transport.server_codec()),
            sink: FramedWrite::new(write_half, transport.server_codec()),
        };
        (connection, peer)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (connection, mut peer) = wire_up(ConnectionSettings::default());

        let (transaction_id, write_ticket) = connection
            .write(b"ping".to_vec(), None)
            .await
            .expect("write accepted");
        assert_eq!(transaction_id, 1);
        assert_eq!(write_ticket.wait(None).await, Ok(1));

        let request = peer
            .source
            .next()
            .await
            .expect("peer sees a frame")
            .expect("frame decodes");
        assert_eq!(request.body, b"ping".to_vec());

        let ticket = connection.read(transaction_id).await.expect("read accepted");
        peer.sink
            .send(Frame {
                transaction_id,
                body: b"pong".to_vec(),
            })
            .await
            .expect("peer replies");
        assert_eq!(ticket.wait(None).await, Ok(b"pong".to_vec()));
    }

    #[tokio::test]
    async fn early_response_parks_until_requested() {
        let (connection, mut peer) = wire_up(ConnectionSettings::default());

        let (transaction_id, write_ticket) = connection
            .write(b"a".to_vec(), None)
            .await
            .expect("write accepted");
        write_ticket.wait(None).await.expect("write done");
        let _request = peer.source.next().await.expect("frame").expect("decodes");

        // Reply before anyone asked; the reader must be expecting something,
        // so request a read for a different transaction first.
        let other = connection.read(9999).await.expect("read accepted");
        peer.sink
            .send(Frame {
                transaction_id,
                body: b"early".to_vec(),
            })
            .await
            .expect("peer replies");

        // Poll until the reader parked the response.
        let mut parked = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            if !connection.inner.lock_reads().pooling.is_empty() {
                parked = Some(());
                break;
            }
        }
        parked.expect("response parked in pooling reads");

        let ticket = connection.read(transaction_id).await.expect("read accepted");
        assert_eq!(ticket.wait(None).await, Ok(b"early".to_vec()));
        drop(other);
    }

    #[tokio::test]
    async fn close_aborts_everything_outstanding() {
        let (connection, peer) = wire_up(ConnectionSettings::default());

        let ticket = connection.read(42).await.expect("read accepted");
        connection.close();
        assert!(connection.is_closed());
        assert!(!connection.is_closing());
        assert_eq!(ticket.wait(None).await, Err(ConnectionError::ReadAbort));

        assert!(matches!(
            connection.write(b"late".to_vec(), None).await,
            Err(ConnectionError::WriteAbort)
        ));
        assert!(matches!(
            connection.read(1).await,
            Err(ConnectionError::ReadAbort)
        ));

        // Closing twice stays quiet.
        connection.close();
        assert!(connection.is_closed());
        drop(peer);
    }

    #[tokio::test]
    async fn full_write_queue_fails_fast() {
        let settings = ConnectionSettings::default().with_max_pending_writes(1);
        let transport = RecordTransport::new();
        // A tiny undrained duplex buffer keeps the first write in flight,
        // so the single queue slot stays occupied.
        let (near, _far) = duplex(16);
        let connection = SharedConnection::new(near, &transport, settings, None);

        let first = connection.write(vec![0u8; 64], None).await;
        assert!(first.is_ok());
        let mut saw_overflow = false;
        for _ in 0..50 {
            match connection.write(vec![0u8; 64], None).await {
                Err(ConnectionError::MaxPendingWrites) => {
                    saw_overflow = true;
                    break;
                }
                Ok(_) => tokio::task::yield_now().await,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(saw_overflow, "queue never reported overflow");
    }

    #[tokio::test]
    async fn remote_close_aborts_a_pending_read() {
        let (connection, peer) = wire_up(ConnectionSettings::default());

        let ticket = connection.read(5).await.expect("read accepted");
        // EOF at a frame boundary: the reader sees the socket as already
        // closed and tears the connection down.
        drop(peer);
        assert_eq!(
            ticket.wait(Some(Duration::from_secs(2))).await,
            Err(ConnectionError::ReadAbort)
        );
        for _ in 0..100 {
            if connection.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn double_read_for_a_pending_transaction_is_refused() {
        let (connection, peer) = wire_up(ConnectionSettings::default());
        let _first = connection.read(7).await.expect("first read accepted");
        assert!(matches!(
            connection.read(7).await,
            Err(ConnectionError::ReadAbort)
        ));
        drop(peer);
    }
}
