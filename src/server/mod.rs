//! Server runtime.
//!
//! One accept loop feeds per-connection runner tasks. Each accepted socket
//! gets a connection record in a server-wide LRU cache: the idle reaper
//! walks that cache from the least-recently-inserted end and closes
//! connections whose last activity is older than the idle limit. Blocking
//! methods leave the runtime for the worker pools; exported methods are
//! published to the registry when one is configured.

mod runner;
pub mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub use worker::WorkerPool;

use crate::exporter::Exporter;
use crate::registry::{ProviderUrl, RegisterEntrySet, Registry};
use crate::serializer::{JsonSerializer, Serializer};
use crate::transport::{RecordTransport, Transport};
use crate::util::{ConnectionIds, LruCache};

/// Liveness bookkeeping for one accepted connection.
pub(crate) struct ConnRecord {
    last_activity_ms: AtomicU64,
    epoch: Instant,
    close_signal: watch::Sender<bool>,
}

impl ConnRecord {
    fn new(epoch: Instant, close_signal: watch::Sender<bool>) -> Self {
        let record = Self {
            last_activity_ms: AtomicU64::new(0),
            epoch,
            close_signal,
        };
        record.touch();
        record
    }

    pub(crate) fn touch(&self) {
        let now = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_activity_ms.store(now, Ordering::Release);
    }

    fn idle_for(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.last_activity_ms.load(Ordering::Acquire)))
    }

    fn close(&self) { let _ = self.close_signal.send(true); }
}

struct Records {
    cache: Mutex<LruCache<u64, Arc<ConnRecord>>>,
    epoch: Instant,
}

impl Records {
    fn lock(&self) -> MutexGuard<'_, LruCache<u64, Arc<ConnRecord>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

fn default_worker_threads() -> usize {
    let cpus = std::thread::available_parallelism().map_or(2, std::num::NonZero::get);
    2 * cpus + 1
}

/// Builder for [`RpcServer`].
pub struct RpcServerBuilder {
    exporter: Option<Exporter>,
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn Serializer>,
    max_connections: usize,
    concurrent_requests_per_connection: usize,
    max_buffer_size: usize,
    worker_threads: Option<usize>,
    isolated_threads: Option<usize>,
    max_idle_time: Duration,
    registry: Option<Arc<dyn Registry>>,
    advertise: Option<String>,
}

impl Default for RpcServerBuilder {
    fn default() -> Self {
        Self {
            exporter: None,
            transport: Arc::new(RecordTransport::new()),
            serializer: Arc::new(JsonSerializer),
            max_connections: 15_000,
            concurrent_requests_per_connection: 10,
            max_buffer_size: 100 * 1024 * 1024,
            worker_threads: Some(default_worker_threads()),
            isolated_threads: None,
            max_idle_time: Duration::from_secs(8 * 60 * 60),
            registry: None,
            advertise: None,
        }
    }
}

impl RpcServerBuilder {
    /// Start a builder with the defaults.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Set the exported method table (required).
    #[must_use]
    pub fn with_exporter(mut self, exporter: Exporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Override the transport.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Override the serializer.
    #[must_use]
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Cap the number of concurrently accepted connections.
    #[must_use]
    pub const fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Cap the requests processed concurrently per connection.
    #[must_use]
    pub const fn with_concurrent_requests_per_connection(mut self, limit: usize) -> Self {
        self.concurrent_requests_per_connection = limit;
        self
    }

    /// Cap buffered body sizes, also published in register URLs.
    #[must_use]
    pub const fn with_max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.max_buffer_size = max_buffer_size;
        self
    }

    /// Size the worker pool; `None` disables it.
    #[must_use]
    pub const fn with_worker_threads(mut self, size: Option<usize>) -> Self {
        self.worker_threads = size;
        self
    }

    /// Size the isolated pool; `None` disables it.
    #[must_use]
    pub const fn with_isolated_threads(mut self, size: Option<usize>) -> Self {
        self.isolated_threads = size;
        self
    }

    /// Override the idle eviction limit.
    #[must_use]
    pub const fn with_max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.max_idle_time = max_idle_time;
        self
    }

    /// Publish exported methods to `registry` on start.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Publish `advertise` as the provider host instead of the bind address.
    #[must_use]
    pub fn with_advertise(mut self, advertise: impl Into<String>) -> Self {
        self.advertise = Some(advertise.into());
        self
    }

    /// Build the server.
    ///
    /// # Errors
    /// Fails without an exporter or when a worker pool cannot start.
    pub fn build(self) -> anyhow::Result<RpcServer> {
        let exporter = self.exporter.context("an exporter must be provided")?;
        let worker_pool = self
            .worker_threads
            .map(|size| WorkerPool::start(size, "rpc-worker"))
            .transpose()
            .context("failed to start the worker pool")?
            .map(Arc::new);
        let isolated_pool = self
            .isolated_threads
            .map(|size| WorkerPool::start(size, "rpc-isolated"))
            .transpose()
            .context("failed to start the isolated pool")?
            .map(Arc::new);

        let (shutdown, _) = watch::channel(false);
        Ok(RpcServer {
            exporter: Arc::new(exporter),
            transport: self.transport,
            serializer: self.serializer,
            max_connections: self.max_connections.max(1),
            concurrent_requests_per_connection: self.concurrent_requests_per_connection.max(1),
            max_buffer_size: self.max_buffer_size,
            max_idle_time: self.max_idle_time,
            registry: self.registry,
            advertise: self.advertise,
            worker_pool,
            isolated_pool,
            records: Arc::new(Records {
                cache: Mutex::new(LruCache::new(self.max_connections.max(1))),
                epoch: Instant::now(),
            }),
            current_connections: Arc::new(AtomicUsize::new(0)),
            connection_ids: ConnectionIds::new(),
            shutdown,
        })
    }
}

/// Handle that stops a serving [`RpcServer`].
#[derive(Clone)]
pub struct ShutdownHandle(watch::Sender<bool>);

impl ShutdownHandle {
    /// Ask the server to stop accepting and wind down.
    pub fn shutdown(&self) { let _ = self.0.send(true); }
}

/// The RPC server.
pub struct RpcServer {
    exporter: Arc<Exporter>,
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn Serializer>,
    max_connections: usize,
    concurrent_requests_per_connection: usize,
    max_buffer_size: usize,
    max_idle_time: Duration,
    registry: Option<Arc<dyn Registry>>,
    advertise: Option<String>,
    worker_pool: Option<Arc<WorkerPool>>,
    isolated_pool: Option<Arc<WorkerPool>>,
    records: Arc<Records>,
    current_connections: Arc<AtomicUsize>,
    connection_ids: ConnectionIds,
    shutdown: watch::Sender<bool>,
}

impl RpcServer {
    /// Obtain a handle that stops [`serve`](Self::serve).
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle { ShutdownHandle(self.shutdown.clone()) }

    /// Number of currently accepted connections.
    #[must_use]
    pub fn current_connections(&self) -> usize {
        self.current_connections.load(Ordering::Acquire)
    }

    async fn publish(&self, addr: std::net::SocketAddr) -> anyhow::Result<()> {
        let Some(registry) = &self.registry else {
            info!("no registry configured, skipping publication");
            return Ok(());
        };
        let host = self
            .advertise
            .clone()
            .unwrap_or_else(|| addr.ip().to_string());
        let node_data = serde_json::json!({ "pid": std::process::id() }).to_string();

        let mut entries = RegisterEntrySet::new();
        for (service, method) in self.exporter.iter_methods() {
            let url = ProviderUrl {
                transport: self.transport.name().to_owned(),
                host: host.clone(),
                port: addr.port(),
                service: service.to_owned(),
                method: method.to_owned(),
                serializer: self.serializer.name().to_owned(),
                max_buffer_size: self.max_buffer_size,
            };
            entries = entries.with_entry(url.encode(), node_data.clone());
        }
        registry
            .register(entries, true)
            .await
            .context("failed to publish exported methods")?;
        info!(methods = self.exporter.len(), "published exported methods");
        Ok(())
    }

    fn handle_accept(&self, socket: TcpStream, peer: std::net::SocketAddr, tasks: &mut JoinSet<()>) {
        if self.current_connections.load(Ordering::Acquire) >= self.max_connections {
            warn!(
                %peer,
                current = self.current_connections.load(Ordering::Acquire),
                "max connections reached, refusing"
            );
            return;
        }
        if let Err(err) = socket.set_nodelay(true) {
            debug!(error = %err, "failed to set TCP_NODELAY");
        }

        let connection_id = self.connection_ids.next();
        let (close_tx, close_rx) = watch::channel(false);
        let record = Arc::new(ConnRecord::new(self.records.epoch, close_tx));
        if let Some((displaced_id, displaced)) = self
            .records
            .lock()
            .insert(connection_id, Arc::clone(&record))
        {
            // Should not happen while accepts are limit-checked above.
            warn!(connection_id = displaced_id, "connection record displaced");
            displaced.close();
        }
        self.current_connections.fetch_add(1, Ordering::AcqRel);
        debug!(%peer, connection_id, "connection accepted");

        let ctx = runner::RunnerContext {
            transport: Arc::clone(&self.transport),
            serializer: Arc::clone(&self.serializer),
            exporter: Arc::clone(&self.exporter),
            worker_pool: self.worker_pool.clone(),
            isolated_pool: self.isolated_pool.clone(),
            record,
            concurrent_requests: self.concurrent_requests_per_connection,
            close_signal: close_rx,
        };
        let records = Arc::clone(&self.records);
        let counter = Arc::clone(&self.current_connections);
        tasks.spawn(async move {
            runner::run(ctx, socket).await;
            counter.fetch_sub(1, Ordering::AcqRel);
            records.lock().remove(&connection_id);
            debug!(%peer, connection_id, "connection closed");
        });
    }

    /// Accept and serve connections on `listener` until shut down.
    ///
    /// # Errors
    /// Fails when the listener address cannot be read or publication to the
    /// registry fails; accept errors are logged and survived.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        self.publish(local_addr).await?;

        let reaper = tokio::spawn(reap_idle(
            Arc::clone(&self.records),
            self.max_idle_time,
            self.shutdown.subscribe(),
        ));

        let mut shutdown = self.shutdown.subscribe();
        let mut tasks = JoinSet::new();
        info!(%local_addr, transport = self.transport.name(), "rpc server listening");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutdown requested");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => self.handle_accept(socket, peer, &mut tasks),
                    Err(err) => error!(error = %err, "accept error"),
                }
            }
        }

        // Wake every runner and wait for them to drain.
        for (_, record) in self.records.lock().iter() {
            record.close();
        }
        while tasks.join_next().await.is_some() {}
        reaper.abort();

        if let Some(registry) = &self.registry {
            registry.close().await;
        }
        if let Some(pool) = &self.worker_pool {
            pool.shutdown();
        }
        if let Some(pool) = &self.isolated_pool {
            pool.shutdown();
        }
        info!("rpc server stopped");
        Ok(())
    }
}

/// Close connections idle past `max_idle`.
///
/// Records sit in the cache in insertion order and are never promoted, so
/// the walk sees the oldest connections first and can stop at the first one
/// still inside the idle window, rescheduling for its remaining time.
async fn reap_idle(records: Arc<Records>, max_idle: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut wait = max_idle;
    loop {
        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => break,
        }

        wait = max_idle;
        let now_ms = records.now_ms();
        let mut idle = Vec::new();
        {
            let cache = records.lock();
            for (connection_id, record) in cache.iter() {
                let idle_for = record.idle_for(now_ms);
                if idle_for < max_idle {
                    wait = (max_idle - idle_for).max(Duration::from_millis(10));
                    break;
                }
                idle.push((*connection_id, Arc::clone(record)));
            }
        }
        for (connection_id, record) in idle {
            info!(connection_id, "closing idle connection");
            record.close();
        }
    }
    debug!("idle reaper exited");
}
