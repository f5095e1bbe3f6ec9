//! Service registration and discovery.
//!
//! A server publishes each exported method as an ephemeral child of a base
//! path in the coordination service; the child's name is the percent-encoded
//! register URL. Clients discover providers by listing the same children,
//! parsing them and grouping by `(transport, "/service/method", serializer)`.
//! Re-registration after a session loss is driven by the session events: the
//! registrar re-creates every entry on each (re)connect.

pub mod coordination;
mod url;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub use self::coordination::{
    CoordinationClient,
    CoordinationError,
    CoordinationEvent,
    MemoryCoordination,
};
pub use self::url::{Endpoint, ProviderUrl};

use crate::error::RegistryError;
use crate::util::RetryPolicy;

/// The set of register URLs a server publishes, with their node data.
#[derive(Debug, Clone, Default)]
pub struct RegisterEntrySet {
    entries: BTreeMap<String, String>,
}

impl RegisterEntrySet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Add one entry: the encoded URL segment and its node data.
    #[must_use]
    pub fn with_entry(mut self, name: impl Into<String>, data: impl Into<String>) -> Self {
        self.entries.insert(name.into(), data.into());
        self
    }

    /// Iterate the entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.entries
            .iter()
            .map(|(name, data)| (name.as_str(), data.as_str()))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

type RemoteKey = (String, String, String);
type RemoteCache = HashMap<RemoteKey, Vec<Endpoint>>;

/// Publication and discovery of providers.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Publish `entries`, deleting stale nodes first when
    /// `delete_if_exists`. Keeps republishing on session re-establishment.
    ///
    /// # Errors
    /// Returns [`RegistryError::AlreadyStarted`] on a second call and a
    /// coordination failure when the initial publication fails.
    async fn register(
        &self,
        entries: RegisterEntrySet,
        delete_if_exists: bool,
    ) -> Result<(), RegistryError>;

    /// Start watching providers and maintaining the local cache.
    ///
    /// # Errors
    /// Returns [`RegistryError::AlreadyStarted`] on a second call and a
    /// coordination failure when the initial listing fails.
    async fn discovery(&self) -> Result<(), RegistryError>;

    /// Providers for `(service, method)` reachable over `transport` with
    /// `serializer`; may be empty.
    fn get_remotes(
        &self,
        service: &str,
        method: &str,
        transport: &str,
        serializer: &str,
    ) -> Vec<Endpoint>;

    /// Whether discovery has produced a non-empty cache.
    fn discovery_succeeded(&self) -> bool;

    /// Stop watching and drop the cache.
    async fn close(&self);
}

fn child_path(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}

async fn create_entries(
    client: &dyn CoordinationClient,
    base: &str,
    entries: &RegisterEntrySet,
    delete_if_exists: bool,
) -> Result<(), RegistryError> {
    for (name, data) in entries.iter() {
        let path = child_path(base, name);
        loop {
            match client.create_ephemeral(&path, data).await {
                Ok(()) => {
                    info!(path = %path, "registered provider");
                    break;
                }
                Err(CoordinationError::NodeExists) if delete_if_exists => {
                    info!(path = %path, "provider node exists, deleting it");
                    match client.delete(&path).await {
                        Ok(()) | Err(CoordinationError::NoNode) => {}
                        Err(err) => return Err(RegistryError::Coordination(err.to_string())),
                    }
                }
                Err(err) => return Err(RegistryError::Coordination(err.to_string())),
            }
        }
    }
    Ok(())
}

async fn load_remotes(
    client: &dyn CoordinationClient,
    base: &str,
) -> Result<RemoteCache, RegistryError> {
    let children = client
        .children(base)
        .await
        .map_err(|err| RegistryError::Coordination(err.to_string()))?;

    let mut cache: RemoteCache = HashMap::new();
    for child in children {
        let Some(decoded) = ProviderUrl::decode_segment(&child) else {
            debug!(child = %child, "skipping undecodable provider node");
            continue;
        };
        let Some(provider) = ProviderUrl::parse(&decoded) else {
            debug!(url = %decoded, "skipping unparseable provider node");
            continue;
        };
        let key = (
            provider.transport.clone(),
            provider.target_path(),
            provider.serializer.clone(),
        );
        cache.entry(key).or_default().push(provider.endpoint());
    }
    Ok(cache)
}

/// Registry backed by a coordination service session.
pub struct CoordinationRegistry {
    client: Arc<dyn CoordinationClient>,
    base: String,
    retry: RetryPolicy,
    cache: Arc<RwLock<RemoteCache>>,
    registrar: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinationRegistry {
    /// Create a registry rooted at `base`.
    ///
    /// # Errors
    /// Returns [`RegistryError::InvalidBasePath`] unless `base` starts with
    /// `/` and, except for the root itself, does not end with `/`.
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        base: impl Into<String>,
    ) -> Result<Self, RegistryError> {
        let base = base.into();
        if !base.starts_with('/') || (base != "/" && base.ends_with('/')) {
            return Err(RegistryError::InvalidBasePath(base));
        }
        Ok(Self {
            client,
            base,
            retry: RetryPolicy::new(100, Duration::from_secs(3)),
            cache: Arc::new(RwLock::new(HashMap::new())),
            registrar: Mutex::new(None),
            watcher: Mutex::new(None),
        })
    }

    /// Override the policy applied to republication after a reconnect.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn lock_task(
        slot: &Mutex<Option<JoinHandle<()>>>,
    ) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Registry for CoordinationRegistry {
    async fn register(
        &self,
        entries: RegisterEntrySet,
        delete_if_exists: bool,
    ) -> Result<(), RegistryError> {
        if Self::lock_task(&self.registrar).is_some() {
            return Err(RegistryError::AlreadyStarted);
        }

        // First pass inline so failures surface to the caller.
        create_entries(self.client.as_ref(), &self.base, &entries, delete_if_exists).await?;

        let client = Arc::clone(&self.client);
        let base = self.base.clone();
        let retry = self.retry.clone();
        let mut events = self.client.events();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(CoordinationEvent::Connected) => {
                        debug!("session re-established, republishing providers");
                        let outcome = retry
                            .run(
                                || create_entries(client.as_ref(), &base, &entries, delete_if_exists),
                                |_| true,
                            )
                            .await;
                        if let Err(err) = outcome {
                            error!(error = %err, "republication failed");
                        }
                    }
                    Ok(CoordinationEvent::ChildrenChanged(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "registrar lagged behind session events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *Self::lock_task(&self.registrar) = Some(handle);
        Ok(())
    }

    async fn discovery(&self) -> Result<(), RegistryError> {
        if Self::lock_task(&self.watcher).is_some() {
            return Err(RegistryError::AlreadyStarted);
        }

        let initial = load_remotes(self.client.as_ref(), &self.base).await?;
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = initial;

        let client = Arc::clone(&self.client);
        let base = self.base.clone();
        let cache = Arc::clone(&self.cache);
        let mut events = self.client.events();
        let handle = tokio::spawn(async move {
            loop {
                let relevant = match events.recv().await {
                    Ok(CoordinationEvent::Connected) => true,
                    Ok(CoordinationEvent::ChildrenChanged(path)) => path == base,
                    Err(broadcast::error::RecvError::Lagged(_)) => true,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !relevant {
                    continue;
                }
                match load_remotes(client.as_ref(), &base).await {
                    Ok(remotes) => {
                        debug!(groups = remotes.len(), "provider cache refreshed");
                        *cache.write().unwrap_or_else(PoisonError::into_inner) = remotes;
                    }
                    // A failed refresh keeps the previous cache in place.
                    Err(err) => error!(error = %err, "provider listing failed"),
                }
            }
        });
        *Self::lock_task(&self.watcher) = Some(handle);
        Ok(())
    }

    fn get_remotes(
        &self,
        service: &str,
        method: &str,
        transport: &str,
        serializer: &str,
    ) -> Vec<Endpoint> {
        let key = (
            transport.to_owned(),
            format!("/{service}/{method}"),
            serializer.to_owned(),
        );
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    fn discovery_succeeded(&self) -> bool {
        !self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    async fn close(&self) {
        if let Some(handle) = Self::lock_task(&self.registrar).take() {
            handle.abort();
        }
        if let Some(handle) = Self::lock_task(&self.watcher).take() {
            handle.abort();
        }
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("registry closed");
    }
}

/// Registry serving a fixed endpoint list, for deployments without a
/// coordination service.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    endpoints: Vec<Endpoint>,
}

impl StaticRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Add an endpoint served for every query.
    #[must_use]
    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.endpoints.push(Endpoint::new(host, port));
        self
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn register(
        &self,
        _entries: RegisterEntrySet,
        _delete_if_exists: bool,
    ) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn discovery(&self) -> Result<(), RegistryError> { Ok(()) }

    fn get_remotes(&self, _: &str, _: &str, _: &str, _: &str) -> Vec<Endpoint> {
        self.endpoints.clone()
    }

    fn discovery_succeeded(&self) -> bool { !self.endpoints.is_empty() }

    async fn close(&self) {}
}
