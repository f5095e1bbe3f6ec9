//! Connection pooling keyed by remote endpoint.
//!
//! The pool is an LRU cache of containers, one container per key, each
//! holding a fixed number of connections. The dedicate discipline hands a
//! connection to one borrower at a time through a blocking FIFO; the shared
//! discipline rotates many borrowers over the same connections. A borrowed
//! connection found closing or closed is replaced through the caller's
//! factory and the borrow retried.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::{PoolError, RpcError};
use crate::registry::Endpoint;
use crate::util::{CyclicCursor, LruCache};

/// Asynchronous factory producing fresh connections for a pool key.
pub type ConnectionFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn Connection>, RpcError>> + Send + Sync>;

/// Holder of the connections behind one pool key.
#[async_trait]
pub trait Container: Send + Sync {
    /// Create an empty container.
    fn new() -> Self
    where
        Self: Sized;

    /// Add a connection to the container.
    fn add(&self, connection: Arc<dyn Connection>);

    /// Borrow a connection according to the container discipline.
    ///
    /// # Errors
    /// Returns [`PoolError::NoAvailableConnection`] when nothing can be
    /// borrowed (immediately when `block` is false, after `timeout`
    /// otherwise).
    async fn acquire(
        &self,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn Connection>, PoolError>;

    /// Forget a connection that was found dead after a borrow.
    fn remove(&self, connection: &Arc<dyn Connection>);

    /// Return a borrowed connection.
    fn give_back(&self, connection: Arc<dyn Connection>);

    /// Take every connection out of the container.
    fn drain(&self) -> Vec<Arc<dyn Connection>>;
}

/// Blocking FIFO container: one borrower per connection at a time.
pub struct FifoContainer {
    queue: std::sync::Mutex<VecDeque<Arc<dyn Connection>>>,
    available: Notify,
}

impl FifoContainer {
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<dyn Connection>>> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Container for FifoContainer {
    fn new() -> Self {
        Self {
            queue: std::sync::Mutex::new(VecDeque::new()),
            available: Notify::new(),
        }
    }

    fn add(&self, connection: Arc<dyn Connection>) {
        self.lock().push_back(connection);
        self.available.notify_one();
    }

    async fn acquire(
        &self,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn Connection>, PoolError> {
        loop {
            if let Some(connection) = self.lock().pop_front() {
                return Ok(connection);
            }
            if !block {
                return Err(PoolError::NoAvailableConnection);
            }
            match timeout {
                Some(limit) => tokio::time::timeout(limit, self.available.notified())
                    .await
                    .map_err(|_| PoolError::NoAvailableConnection)?,
                None => self.available.notified().await,
            }
        }
    }

    fn remove(&self, _connection: &Arc<dyn Connection>) {
        // A borrowed connection is already out of the queue.
    }

    fn give_back(&self, connection: Arc<dyn Connection>) {
        self.lock().push_back(connection);
        self.available.notify_one();
    }

    fn drain(&self) -> Vec<Arc<dyn Connection>> { self.lock().drain(..).collect() }
}

/// Cyclic container: many borrowers share every connection round-robin.
pub struct CyclicContainer {
    rotation: std::sync::Mutex<CyclicCursor<Arc<dyn Connection>>>,
}

impl CyclicContainer {
    fn lock(&self) -> std::sync::MutexGuard<'_, CyclicCursor<Arc<dyn Connection>>> {
        self.rotation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Container for CyclicContainer {
    fn new() -> Self {
        Self {
            rotation: std::sync::Mutex::new(CyclicCursor::new()),
        }
    }

    fn add(&self, connection: Arc<dyn Connection>) { self.lock().push(connection); }

    async fn acquire(
        &self,
        _block: bool,
        _timeout: Option<Duration>,
    ) -> Result<Arc<dyn Connection>, PoolError> {
        self.lock()
            .next_cyclic()
            .cloned()
            .ok_or(PoolError::NoAvailableConnection)
    }

    fn remove(&self, connection: &Arc<dyn Connection>) {
        self.lock()
            .remove_where(|candidate| Arc::ptr_eq(candidate, connection));
    }

    fn give_back(&self, _connection: Arc<dyn Connection>) {
        // Shared borrowers never take connections out of the rotation.
    }

    fn drain(&self) -> Vec<Arc<dyn Connection>> { self.lock().drain_all() }
}

/// LRU cache of per-key connection containers.
pub struct LruConnectionPool<K, C> {
    state: tokio::sync::Mutex<LruCache<K, Arc<C>>>,
    connections_per_key: usize,
    closed: AtomicBool,
}

/// Pool handing each connection to one borrower at a time.
pub type DedicateLruConnectionPool<K> = LruConnectionPool<K, FifoContainer>;

/// Pool rotating many borrowers over shared connections.
pub type SharedLruConnectionPool<K> = LruConnectionPool<K, CyclicContainer>;

impl<K, C> LruConnectionPool<K, C>
where
    K: Hash + Eq + Clone + Send + Sync,
    C: Container,
{
    /// Create a pool for at most `pool_size` keys with `connections_per_key`
    /// connections behind each.
    #[must_use]
    pub fn new(pool_size: usize, connections_per_key: usize) -> Self {
        Self {
            state: tokio::sync::Mutex::new(LruCache::new(pool_size)),
            connections_per_key: connections_per_key.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether [`close`](Self::close) ran.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    async fn container_for(
        &self,
        key: &K,
        factory: &ConnectionFactory,
    ) -> Result<Arc<C>, PoolError> {
        let mut cache = self.state.lock().await;
        if self.is_closed() {
            return Err(PoolError::AlreadyClosed);
        }
        if let Some(container) = cache.get(key) {
            return Ok(Arc::clone(container));
        }

        let container = Arc::new(C::new());
        for _ in 0..self.connections_per_key {
            let connection = factory()
                .await
                .map_err(|err| PoolError::CreateConnection(err.to_string()))?;
            container.add(connection);
        }

        // The displaced key's connections are closed before replacement.
        if let Some(displaced) = cache.will_be_kicked_out().map(|(_, v)| Arc::clone(v)) {
            let connections = displaced.drain();
            info!(count = connections.len(), "closing connections of displaced pool key");
            for connection in connections {
                connection.close();
            }
        }
        cache.insert(key.clone(), Arc::clone(&container));
        Ok(container)
    }

    async fn acquire_live(
        &self,
        container: &Arc<C>,
        factory: &ConnectionFactory,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn Connection>, PoolError> {
        loop {
            let connection = container.acquire(block, timeout).await?;
            if connection.is_closing() || connection.is_closed() {
                debug!("replacing dead pooled connection");
                container.remove(&connection);
                let fresh = factory()
                    .await
                    .map_err(|err| PoolError::CreateConnection(err.to_string()))?;
                container.add(fresh);
                continue;
            }
            return Ok(connection);
        }
    }

    /// Borrow a connection for `key`, creating the containerful on first use.
    ///
    /// # Errors
    /// Returns [`PoolError::AlreadyClosed`] after [`close`](Self::close),
    /// [`PoolError::CreateConnection`] when the factory fails and
    /// [`PoolError::NoAvailableConnection`] when nothing can be borrowed.
    pub async fn get_connection(
        &self,
        key: &K,
        factory: &ConnectionFactory,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn Connection>, PoolError> {
        let container = self.container_for(key, factory).await?;
        self.acquire_live(&container, factory, block, timeout).await
    }

    /// Return a previously borrowed connection.
    pub async fn release_connection(&self, key: &K, connection: Arc<dyn Connection>) {
        if self.is_closed() {
            return;
        }
        let mut cache = self.state.lock().await;
        if let Some(container) = cache.get(key) {
            container.give_back(connection);
        }
    }

    /// Borrow a connection behind an RAII guard that returns it on drop.
    ///
    /// # Errors
    /// Same failure modes as [`get_connection`](Self::get_connection).
    pub async fn borrow(
        &self,
        key: &K,
        factory: &ConnectionFactory,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<PooledConnection<C>, PoolError> {
        let container = self.container_for(key, factory).await?;
        let connection = self
            .acquire_live(&container, factory, block, timeout)
            .await?;
        Ok(PooledConnection {
            container,
            connection: Some(connection),
        })
    }

    /// Close every pooled connection and refuse further borrows. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut cache = self.state.lock().await;
        for (_, container) in cache.iter() {
            for connection in container.drain() {
                connection.close();
            }
        }
        cache.clear();
        info!("connection pool closed");
    }
}

/// Borrowed connection that returns itself to its container on drop.
pub struct PooledConnection<C: Container> {
    container: Arc<C>,
    connection: Option<Arc<dyn Connection>>,
}

impl<C: Container> std::ops::Deref for PooledConnection<C> {
    type Target = Arc<dyn Connection>;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .unwrap_or_else(|| unreachable!("present until drop"))
    }
}

impl<C: Container> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.container.give_back(connection);
        }
    }
}

/// Object-safe pool interface used by the client facade.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Borrow a connection for `endpoint`.
    ///
    /// # Errors
    /// See [`LruConnectionPool::get_connection`].
    async fn get_connection(
        &self,
        endpoint: &Endpoint,
        factory: &ConnectionFactory,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn Connection>, PoolError>;

    /// Return a borrowed connection.
    async fn release_connection(&self, endpoint: &Endpoint, connection: Arc<dyn Connection>);

    /// Close the pool and everything in it.
    async fn close(&self);
}

#[async_trait]
impl<C> ConnectionPool for LruConnectionPool<Endpoint, C>
where
    C: Container + Send + Sync,
{
    async fn get_connection(
        &self,
        endpoint: &Endpoint,
        factory: &ConnectionFactory,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn Connection>, PoolError> {
        let container = self.container_for(endpoint, factory).await?;
        self.acquire_live(&container, factory, block, timeout).await
    }

    async fn release_connection(&self, endpoint: &Endpoint, connection: Arc<dyn Connection>) {
        if self.is_closed() {
            return;
        }
        let mut cache = self.state.lock().await;
        if let Some(container) = cache.get(endpoint) {
            container.give_back(connection);
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut cache = self.state.lock().await;
        for (_, container) in cache.iter() {
            for connection in container.drain() {
                connection.close();
            }
        }
        cache.clear();
        info!("connection pool closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::connection::{ReadTicket, WriteTicket};
    use crate::error::ConnectionError;

    /// Connection stub whose only behaviour is its liveness flags.
    #[derive(Default)]
    struct FakeConnection {
        closed: AtomicBool,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn write(
            &self,
            _body: Vec<u8>,
            _timeout: Option<Duration>,
        ) -> Result<(u32, WriteTicket), ConnectionError> {
            Ok((1, WriteTicket::ready(Ok(1))))
        }

        async fn read(&self, _transaction_id: u32) -> Result<ReadTicket, ConnectionError> {
            Ok(ReadTicket::ready(Ok(Vec::new())))
        }

        fn close(&self) { self.closed.store(true, Ordering::Release); }

        fn is_closing(&self) -> bool { false }

        fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }
    }

    fn fake_factory() -> (ConnectionFactory, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let factory: ConnectionFactory = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(Arc::new(FakeConnection::default()) as Arc<dyn Connection>) })
        });
        (factory, created)
    }

    #[tokio::test]
    async fn dedicate_pool_exhausts_and_recycles() {
        let pool: DedicateLruConnectionPool<&str> = LruConnectionPool::new(1, 2);
        let (factory, _) = fake_factory();
        let key = "1";

        let first = pool
            .get_connection(&key, &factory, true, None)
            .await
            .expect("first borrow");
        let second = pool
            .get_connection(&key, &factory, true, None)
            .await
            .expect("second borrow");
        assert!(!Arc::ptr_eq(&first, &second));

        assert!(matches!(
            pool.get_connection(&key, &factory, false, None).await,
            Err(PoolError::NoAvailableConnection)
        ));

        pool.release_connection(&key, Arc::clone(&first)).await;
        let third = pool
            .get_connection(&key, &factory, true, None)
            .await
            .expect("borrow after release");
        assert!(Arc::ptr_eq(&first, &third));
        pool.close().await;
    }

    #[tokio::test]
    async fn shared_pool_rotates_round_robin() {
        let pool: SharedLruConnectionPool<&str> = LruConnectionPool::new(1, 2);
        let (factory, _) = fake_factory();
        let key = "2";

        let a = pool
            .get_connection(&key, &factory, true, None)
            .await
            .expect("first");
        let b = pool
            .get_connection(&key, &factory, true, None)
            .await
            .expect("second");
        let c = pool
            .get_connection(&key, &factory, true, None)
            .await
            .expect("third");
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
        pool.close().await;
    }

    #[tokio::test]
    async fn closed_shared_connection_is_replaced() {
        let pool: SharedLruConnectionPool<&str> = LruConnectionPool::new(1, 1);
        let (factory, created) = fake_factory();
        let key = "4";

        let first = pool
            .get_connection(&key, &factory, true, None)
            .await
            .expect("first");
        first.close();
        let replacement = pool
            .get_connection(&key, &factory, true, None)
            .await
            .expect("replacement");
        assert!(!Arc::ptr_eq(&first, &replacement));
        assert_eq!(created.load(Ordering::SeqCst), 2);
        pool.close().await;
    }

    #[tokio::test]
    async fn guard_returns_the_borrow_on_drop() {
        let pool: DedicateLruConnectionPool<&str> = LruConnectionPool::new(1, 1);
        let (factory, _) = fake_factory();
        let key = "3";

        let first = {
            let guard = pool
                .borrow(&key, &factory, true, None)
                .await
                .expect("borrow");
            Arc::clone(&guard)
        };
        let second = pool
            .borrow(&key, &factory, true, None)
            .await
            .expect("borrow again");
        assert!(Arc::ptr_eq(&first, &second));
        drop(second);
        pool.close().await;
    }

    #[tokio::test]
    async fn displaced_key_closes_its_connections() {
        let pool: SharedLruConnectionPool<&str> = LruConnectionPool::new(1, 1);
        let (factory, _) = fake_factory();

        let first = pool
            .get_connection(&"a", &factory, true, None)
            .await
            .expect("key a");
        let _second = pool
            .get_connection(&"b", &factory, true, None)
            .await
            .expect("key b displaces a");
        assert!(first.is_closed());
        pool.close().await;
    }

    #[tokio::test]
    async fn closed_pool_refuses_borrows() {
        let pool: DedicateLruConnectionPool<&str> = LruConnectionPool::new(1, 1);
        let (factory, _) = fake_factory();
        pool.close().await;
        pool.close().await;
        assert!(matches!(
            pool.get_connection(&"k", &factory, true, None).await,
            Err(PoolError::AlreadyClosed)
        ));
    }
}
