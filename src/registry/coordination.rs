//! Seam to the external coordination service.
//!
//! The registry consumes the coordination service through this trait: create
//! ephemeral children, delete them, list a path's children and observe
//! session events. Ephemeral nodes disappear with the session that created
//! them, which is what makes re-registration on reconnect sufficient.
//! [`MemoryCoordination`] is the in-process backend used by tests and
//! single-node deployments; it can simulate a session expiry.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

/// Failures reported by a coordination backend.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The node to create already exists.
    #[error("node already exists")]
    NodeExists,
    /// The addressed node does not exist.
    #[error("node does not exist")]
    NoNode,
    /// The session to the service was lost.
    #[error("connection to the coordination service lost")]
    ConnectionLoss,
    /// Backend-specific failure.
    #[error("{0}")]
    Backend(String),
}

/// Events observable on a coordination session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationEvent {
    /// The session connected or reconnected; ephemeral state may be gone.
    Connected,
    /// The children of a path changed.
    ChildrenChanged(String),
}

/// Client session to the coordination service.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Create an ephemeral node carrying `data`.
    ///
    /// # Errors
    /// Returns [`CoordinationError::NodeExists`] when the path is taken.
    async fn create_ephemeral(&self, path: &str, data: &str) -> Result<(), CoordinationError>;

    /// Delete a node.
    ///
    /// # Errors
    /// Returns [`CoordinationError::NoNode`] when the path does not exist.
    async fn delete(&self, path: &str) -> Result<(), CoordinationError>;

    /// List the names of a path's children.
    ///
    /// # Errors
    /// Returns a backend failure when the listing cannot be served.
    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError>;

    /// Subscribe to session and child-change events.
    fn events(&self) -> broadcast::Receiver<CoordinationEvent>;
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => "/",
    }
}

/// In-process coordination backend holding only ephemeral nodes.
pub struct MemoryCoordination {
    nodes: Mutex<BTreeMap<String, String>>,
    events: broadcast::Sender<CoordinationEvent>,
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            nodes: Mutex::new(BTreeMap::new()),
            events,
        }
    }
}

impl MemoryCoordination {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Announce the session to current subscribers.
    pub fn connect(&self) { let _ = self.events.send(CoordinationEvent::Connected); }

    /// Drop every ephemeral node and replay a reconnection, as a real
    /// session expiry would.
    pub fn expire_session(&self) {
        self.lock().clear();
        let _ = self.events.send(CoordinationEvent::Connected);
    }

    /// Read a node's data, mainly for assertions in tests.
    #[must_use]
    pub fn data(&self, path: &str) -> Option<String> { self.lock().get(path).cloned() }
}

#[async_trait]
impl CoordinationClient for MemoryCoordination {
    async fn create_ephemeral(&self, path: &str, data: &str) -> Result<(), CoordinationError> {
        {
            let mut nodes = self.lock();
            if nodes.contains_key(path) {
                return Err(CoordinationError::NodeExists);
            }
            nodes.insert(path.to_owned(), data.to_owned());
        }
        let _ = self
            .events
            .send(CoordinationEvent::ChildrenChanged(parent_of(path).to_owned()));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinationError> {
        {
            let mut nodes = self.lock();
            if nodes.remove(path).is_none() {
                return Err(CoordinationError::NoNode);
            }
        }
        let _ = self
            .events
            .send(CoordinationEvent::ChildrenChanged(parent_of(path).to_owned()));
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        let nodes = self.lock();
        let names = nodes
            .keys()
            .filter(|candidate| parent_of(candidate) == path)
            .filter_map(|candidate| candidate.rsplit_once('/').map(|(_, name)| name.to_owned()))
            .collect();
        Ok(names)
    }

    fn events(&self) -> broadcast::Receiver<CoordinationEvent> { self.events.subscribe() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_list_delete() {
        let backend = MemoryCoordination::new();
        backend
            .create_ephemeral("/providers/a", "{}")
            .await
            .expect("create a");
        backend
            .create_ephemeral("/providers/b", "{}")
            .await
            .expect("create b");
        assert!(matches!(
            backend.create_ephemeral("/providers/a", "{}").await,
            Err(CoordinationError::NodeExists)
        ));

        let mut children = backend.children("/providers").await.expect("list");
        children.sort();
        assert_eq!(children, vec!["a".to_owned(), "b".to_owned()]);

        backend.delete("/providers/a").await.expect("delete");
        assert!(matches!(
            backend.delete("/providers/a").await,
            Err(CoordinationError::NoNode)
        ));
    }

    #[tokio::test]
    async fn root_children_are_listed() {
        let backend = MemoryCoordination::new();
        backend.create_ephemeral("/a", "{}").await.expect("create");
        assert_eq!(backend.children("/").await.expect("list"), vec!["a".to_owned()]);
    }

    #[tokio::test]
    async fn expiry_drops_ephemerals_and_reconnects() {
        let backend = MemoryCoordination::new();
        let mut events = backend.events();
        backend.create_ephemeral("/p/a", "{}").await.expect("create");
        backend.expire_session();
        assert!(backend.children("/p").await.expect("list").is_empty());

        // create + expiry events, the latter ending in Connected
        let mut saw_connected = false;
        while let Ok(event) = events.try_recv() {
            saw_connected = matches!(event, CoordinationEvent::Connected);
        }
        assert!(saw_connected);
    }
}
