//! Load-balanced selection over registry results.

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;

use crate::registry::{Endpoint, Registry};

/// Strategy picking one provider out of the equivalent set.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Pick an endpoint for the target, `None` when no provider exists.
    fn pick(
        &self,
        service: &str,
        method: &str,
        transport: &str,
        serializer: &str,
    ) -> Option<Endpoint>;

    /// Close the underlying registry.
    async fn close(&self);
}

/// Uniformly random selection.
pub struct RandomCluster {
    registry: Arc<dyn Registry>,
}

impl RandomCluster {
    /// Create a strategy over `registry`.
    #[must_use]
    pub fn new(registry: Arc<dyn Registry>) -> Self { Self { registry } }
}

#[async_trait]
impl Cluster for RandomCluster {
    fn pick(
        &self,
        service: &str,
        method: &str,
        transport: &str,
        serializer: &str,
    ) -> Option<Endpoint> {
        let remotes = self
            .registry
            .get_remotes(service, method, transport, serializer);
        remotes.choose(&mut rand::thread_rng()).cloned()
    }

    async fn close(&self) { self.registry.close().await; }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticRegistry;

    #[test]
    fn empty_registry_yields_none() {
        let cluster = RandomCluster::new(Arc::new(StaticRegistry::new()));
        assert!(cluster.pick("calc", "add", "record", "json").is_none());
    }

    #[test]
    fn single_provider_is_always_picked() {
        let registry = StaticRegistry::new().with_endpoint("127.0.0.1", 9001);
        let cluster = RandomCluster::new(Arc::new(registry));
        for _ in 0..8 {
            assert_eq!(
                cluster.pick("calc", "add", "record", "json"),
                Some(Endpoint::new("127.0.0.1", 9001))
            );
        }
    }

    #[test]
    fn every_pick_comes_from_the_provider_set() {
        let registry = StaticRegistry::new()
            .with_endpoint("127.0.0.1", 9001)
            .with_endpoint("127.0.0.1", 9002);
        let cluster = RandomCluster::new(Arc::new(registry));
        for _ in 0..32 {
            let endpoint = cluster.pick("calc", "add", "record", "json").expect("provider");
            assert!(matches!(endpoint.port, 9001 | 9002));
        }
    }
}
