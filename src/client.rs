//! Client facade: one call to invoke a remote method.
//!
//! The client owns the whole invocation pipeline: cluster selection over the
//! registry, an endpoint-keyed connection pool, and the protocol chain down
//! to the invoker. Connections are created lazily through a TCP factory and
//! kept alive with the builtin heartbeat when an interval is configured.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::debug;

use crate::cluster::Cluster;
use crate::connection::{
    Connection,
    ConnectionSettings,
    HeartbeatFn,
    SharedConnection,
    SimpleConnection,
};
use crate::error::{PoolError, RemoteError, RpcError, StubError};
use crate::heartbeat::heartbeat_request;
use crate::message::{Message, Request, Value};
use crate::pool::{
    ConnectionFactory,
    ConnectionPool,
    DedicateLruConnectionPool,
    SharedLruConnectionPool,
};
use crate::protocol::Protocol;
use crate::registry::Endpoint;
use crate::serializer::Serializer;
use crate::transport::Transport;

/// Which pool discipline the client uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// Round-robin over shared multiplexed connections.
    Shared,
    /// One borrower per connection at a time.
    Dedicate,
}

/// Which connection flavour the factory produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Multiplexed connection with background workers.
    Shared,
    /// Inline single-exchange connection.
    Simple,
}

/// Client-side tunables.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Maximum number of endpoint keys pooled.
    pub pool_size: usize,
    /// Connections held behind each endpoint.
    pub connections_per_key: usize,
    /// Pool discipline.
    pub pool_mode: PoolMode,
    /// Connection flavour.
    pub connection_mode: ConnectionMode,
    /// TCP connect deadline.
    pub connect_timeout: Duration,
    /// Write deadline per invocation.
    pub write_timeout: Duration,
    /// Read deadline per invocation.
    pub read_timeout: Duration,
    /// Settings of each shared connection.
    pub connection: ConnectionSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            pool_size: 15,
            connections_per_key: 1,
            pool_mode: PoolMode::Shared,
            connection_mode: ConnectionMode::Shared,
            connect_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            connection: ConnectionSettings::default(),
        }
    }
}

impl ClientSettings {
    /// Override the pooled endpoint count.
    #[must_use]
    pub const fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Override the connection count per endpoint.
    #[must_use]
    pub const fn with_connections_per_key(mut self, connections_per_key: usize) -> Self {
        self.connections_per_key = connections_per_key;
        self
    }

    /// Override the pool discipline.
    #[must_use]
    pub const fn with_pool_mode(mut self, pool_mode: PoolMode) -> Self {
        self.pool_mode = pool_mode;
        self
    }

    /// Override the connection flavour.
    #[must_use]
    pub const fn with_connection_mode(mut self, connection_mode: ConnectionMode) -> Self {
        self.connection_mode = connection_mode;
        self
    }

    /// Override the connect deadline.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the write deadline.
    #[must_use]
    pub const fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Override the read deadline.
    #[must_use]
    pub const fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Override the shared connection settings.
    #[must_use]
    pub fn with_connection_settings(mut self, connection: ConnectionSettings) -> Self {
        self.connection = connection;
        self
    }
}

/// Builder for [`RpcClient`].
#[derive(Default)]
pub struct RpcClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    serializer: Option<Arc<dyn Serializer>>,
    cluster: Option<Arc<dyn Cluster>>,
    protocol: Option<Protocol>,
    settings: ClientSettings,
}

impl RpcClientBuilder {
    /// Set the transport.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the serializer.
    #[must_use]
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Set the cluster strategy.
    #[must_use]
    pub fn with_cluster(mut self, cluster: Arc<dyn Cluster>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Set the protocol pipeline; defaults to the bare invoker.
    #[must_use]
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Set the client settings.
    #[must_use]
    pub fn with_settings(mut self, settings: ClientSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Build the client.
    ///
    /// # Errors
    /// Returns [`StubError::Misconfigured`] when transport, serializer or
    /// cluster is missing, and a serializer failure when the heartbeat body
    /// cannot be encoded.
    pub fn build(self) -> Result<RpcClient, RpcError> {
        let transport = self
            .transport
            .ok_or(StubError::Misconfigured("transport"))?;
        let serializer = self
            .serializer
            .ok_or(StubError::Misconfigured("serializer"))?;
        let cluster = self.cluster.ok_or(StubError::Misconfigured("cluster"))?;
        let protocol = self.protocol.unwrap_or_default();
        let settings = self.settings;

        let heartbeat_body =
            Arc::new(serializer.encode(&Message::Request(heartbeat_request()))?);

        let pool: Box<dyn ConnectionPool> = match settings.pool_mode {
            PoolMode::Shared => Box::new(SharedLruConnectionPool::<Endpoint>::new(
                settings.pool_size,
                settings.connections_per_key,
            )),
            PoolMode::Dedicate => Box::new(DedicateLruConnectionPool::<Endpoint>::new(
                settings.pool_size,
                settings.connections_per_key,
            )),
        };

        Ok(RpcClient {
            transport,
            serializer,
            cluster,
            protocol,
            pool,
            settings,
            heartbeat_body,
        })
    }
}

/// Invokes remote methods as `client.invoke(service, method, ...)`.
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn Serializer>,
    cluster: Arc<dyn Cluster>,
    protocol: Protocol,
    pool: Box<dyn ConnectionPool>,
    settings: ClientSettings,
    heartbeat_body: Arc<Vec<u8>>,
}

impl RpcClient {
    /// Start building a client.
    #[must_use]
    pub fn builder() -> RpcClientBuilder { RpcClientBuilder::default() }

    fn connection_factory(&self, endpoint: &Endpoint) -> ConnectionFactory {
        let transport = Arc::clone(&self.transport);
        let address = endpoint.to_string();
        let settings = self.settings.clone();
        let heartbeat_body = Arc::clone(&self.heartbeat_body);
        Arc::new(move || -> BoxFuture<'static, Result<Arc<dyn Connection>, RpcError>> {
            let transport = Arc::clone(&transport);
            let address = address.clone();
            let settings = settings.clone();
            let heartbeat_body = Arc::clone(&heartbeat_body);
            Box::pin(async move {
                debug!(address = %address, "dialing provider");
                match settings.connection_mode {
                    ConnectionMode::Shared => {
                        let heartbeat: Option<HeartbeatFn> =
                            settings.connection.heartbeat_interval.map(|_| {
                                let body = Arc::clone(&heartbeat_body);
                                Arc::new(move || body.as_ref().clone()) as HeartbeatFn
                            });
                        let connection = SharedConnection::connect(
                            address.as_str(),
                            transport.as_ref(),
                            settings.connection.clone(),
                            heartbeat,
                        )
                        .await
                        .map_err(|err| PoolError::CreateConnection(err.to_string()))?;
                        Ok(Arc::new(connection) as Arc<dyn Connection>)
                    }
                    ConnectionMode::Simple => {
                        let connection = SimpleConnection::connect(
                            address.as_str(),
                            transport.as_ref(),
                            settings.connect_timeout,
                        )
                        .await
                        .map_err(|err| PoolError::CreateConnection(err.to_string()))?;
                        Ok(Arc::new(connection) as Arc<dyn Connection>)
                    }
                }
            })
        })
    }

    /// Invoke `service.method` with the given arguments.
    ///
    /// # Errors
    /// Returns [`RemoteError::NoRemoteServer`] when the cluster finds no
    /// provider, plus every pipeline failure mode.
    pub async fn invoke(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        meta: Option<Value>,
    ) -> Result<Value, RpcError> {
        let request = Request {
            service: service.to_owned(),
            method: method.to_owned(),
            args,
            kwargs,
            meta,
        };
        request.validate()?;

        let endpoint = self
            .cluster
            .pick(
                service,
                method,
                self.transport.name(),
                self.serializer.name(),
            )
            .ok_or(RemoteError::NoRemoteServer)?;

        let factory = self.connection_factory(&endpoint);
        let connection = self
            .pool
            .get_connection(&endpoint, &factory, true, Some(self.settings.connect_timeout))
            .await?;
        let outcome = self
            .protocol
            .invoke(
                &request,
                connection.as_ref(),
                self.serializer.as_ref(),
                self.settings.write_timeout,
                self.settings.read_timeout,
            )
            .await;
        self.pool.release_connection(&endpoint, connection).await;
        outcome
    }

    /// Invoke with positional arguments only.
    ///
    /// # Errors
    /// Same failure modes as [`invoke`](Self::invoke).
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        self.invoke(service, method, args, BTreeMap::new(), None).await
    }

    /// Close the pool and the cluster's registry.
    pub async fn close(&self) {
        self.pool.close().await;
        self.cluster.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::RandomCluster;
    use crate::registry::StaticRegistry;
    use crate::serializer::JsonSerializer;
    use crate::transport::RecordTransport;

    #[test]
    fn build_requires_the_core_collaborators() {
        let outcome = RpcClient::builder().build();
        assert!(matches!(
            outcome,
            Err(RpcError::Stub(StubError::Misconfigured("transport")))
        ));
    }

    #[tokio::test]
    async fn invoke_without_providers_reports_no_remote_server() {
        let client = RpcClient::builder()
            .with_transport(Arc::new(RecordTransport::new()))
            .with_serializer(Arc::new(JsonSerializer))
            .with_cluster(Arc::new(RandomCluster::new(Arc::new(StaticRegistry::new()))))
            .build()
            .expect("builds");
        let outcome = client.call("calc", "add", Vec::new()).await;
        assert!(matches!(
            outcome,
            Err(RpcError::Remote(RemoteError::NoRemoteServer))
        ));
        client.close().await;
    }

    #[tokio::test]
    async fn invoke_validates_the_request() {
        let client = RpcClient::builder()
            .with_transport(Arc::new(RecordTransport::new()))
            .with_serializer(Arc::new(JsonSerializer))
            .with_cluster(Arc::new(RandomCluster::new(Arc::new(
                StaticRegistry::new().with_endpoint("127.0.0.1", 1),
            ))))
            .build()
            .expect("builds");
        let outcome = client.call("", "add", Vec::new()).await;
        assert!(matches!(
            outcome,
            Err(RpcError::Remote(RemoteError::RequestValidate(_)))
        ));
        client.close().await;
    }
}
