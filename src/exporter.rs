//! Server-side registration table.
//!
//! Services register their methods explicitly: each entry maps a
//! `(service, method)` pair to an invocable plus the dispatch policy the
//! server applies to it. Async invocables run inline on the runtime;
//! blocking ones run on the worker pool, or on the isolated pool when the
//! method is flagged for isolation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::message::Value;

/// Arguments handed to an invocable.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: BTreeMap<String, Value>,
}

/// Async invocable run inline on the runtime.
pub type AsyncHandler =
    Arc<dyn Fn(CallArgs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Blocking invocable run on a worker pool.
pub type BlockingHandler = Arc<dyn Fn(CallArgs) -> anyhow::Result<Value> + Send + Sync>;

/// The callable registered behind a method name.
#[derive(Clone)]
pub enum Invocable {
    /// Cooperative; runs on the server runtime.
    Inline(AsyncHandler),
    /// Synchronous; must leave the runtime for a worker pool.
    Blocking(BlockingHandler),
}

/// Where the server executes a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// On the runtime itself.
    Inline,
    /// On the worker pool.
    Worker,
    /// On the isolated worker pool, when one is configured.
    Isolated,
}

/// One exported method.
#[derive(Clone)]
pub struct ExportedMethod {
    /// The registered callable.
    pub invocable: Invocable,
    /// The dispatch policy applied by the server.
    pub policy: DispatchPolicy,
}

/// Table of every exported method, keyed by service then method name.
#[derive(Default)]
pub struct Exporter {
    services: HashMap<String, HashMap<String, ExportedMethod>>,
}

impl Exporter {
    /// Create a table with the builtin heartbeat service installed.
    #[must_use]
    pub fn new() -> Self {
        let mut exporter = Self::empty();
        crate::heartbeat::install(&mut exporter);
        exporter
    }

    /// Create a table without the builtin heartbeat service.
    #[must_use]
    pub fn empty() -> Self { Self::default() }

    /// Start registering methods under `service`.
    pub fn service(&mut self, service: impl Into<String>) -> ServiceBuilder<'_> {
        ServiceBuilder {
            exporter: self,
            service: service.into(),
            cover: false,
        }
    }

    fn insert(&mut self, service: String, method: String, entry: ExportedMethod, cover: bool) {
        let methods = self.services.entry(service.clone()).or_default();
        if methods.contains_key(&method) {
            if !cover {
                warn!(service = %service, method = %method, "method already registered, keeping the first entry");
                return;
            }
            debug!(service = %service, method = %method, "replacing registered method");
        }
        methods.insert(method, entry);
    }

    /// Look up an exported method.
    #[must_use]
    pub fn get(&self, service: &str, method: &str) -> Option<&ExportedMethod> {
        self.services.get(service)?.get(method)
    }

    /// Iterate every `(service, method)` pair in the table.
    pub fn iter_methods(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.services.iter().flat_map(|(service, methods)| {
            methods
                .keys()
                .map(move |method| (service.as_str(), method.as_str()))
        })
    }

    /// Number of exported methods.
    #[must_use]
    pub fn len(&self) -> usize { self.services.values().map(HashMap::len).sum() }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Registration handle for one service.
pub struct ServiceBuilder<'a> {
    exporter: &'a mut Exporter,
    service: String,
    cover: bool,
}

impl ServiceBuilder<'_> {
    /// Let subsequent registrations replace existing entries instead of
    /// warning and keeping the first one.
    #[must_use]
    pub fn cover(mut self) -> Self {
        self.cover = true;
        self
    }

    /// Register an async method run inline on the runtime.
    pub fn inline<F, Fut>(self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |call| Box::pin(handler(call)));
        self.exporter.insert(
            self.service.clone(),
            method.into(),
            ExportedMethod {
                invocable: Invocable::Inline(handler),
                policy: DispatchPolicy::Inline,
            },
            self.cover,
        );
        self
    }

    /// Register a blocking method run on the worker pool.
    pub fn blocking<F>(self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CallArgs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.exporter.insert(
            self.service.clone(),
            method.into(),
            ExportedMethod {
                invocable: Invocable::Blocking(Arc::new(handler)),
                policy: DispatchPolicy::Worker,
            },
            self.cover,
        );
        self
    }

    /// Register a blocking method run on the isolated pool when configured.
    pub fn isolated<F>(self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CallArgs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.exporter.insert(
            self.service.clone(),
            method.into(),
            ExportedMethod {
                invocable: Invocable::Blocking(Arc::new(handler)),
                policy: DispatchPolicy::Isolated,
            },
            self.cover,
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::heartbeat::{HEARTBEAT_METHOD, HEARTBEAT_SERVICE};

    #[test]
    fn heartbeat_is_installed_by_default() {
        let exporter = Exporter::new();
        assert!(exporter.get(HEARTBEAT_SERVICE, HEARTBEAT_METHOD).is_some());
        assert!(Exporter::empty()
            .get(HEARTBEAT_SERVICE, HEARTBEAT_METHOD)
            .is_none());
    }

    #[test]
    fn registration_and_lookup() {
        let mut exporter = Exporter::empty();
        exporter
            .service("calc")
            .blocking("add", |_| Ok(json!(0)))
            .isolated("crunch", |_| Ok(json!(0)));

        let add = exporter.get("calc", "add").expect("registered");
        assert_eq!(add.policy, DispatchPolicy::Worker);
        let crunch = exporter.get("calc", "crunch").expect("registered");
        assert_eq!(crunch.policy, DispatchPolicy::Isolated);
        assert!(exporter.get("calc", "sub").is_none());
        assert!(exporter.get("other", "add").is_none());
        assert_eq!(exporter.len(), 2);
    }

    fn registered_value(exporter: &Exporter, service: &str, method: &str) -> Value {
        let entry = exporter.get(service, method).expect("registered");
        let Invocable::Blocking(handler) = &entry.invocable else {
            panic!("expected a blocking invocable");
        };
        handler(CallArgs::default()).expect("runs")
    }

    #[test]
    fn duplicate_registration_keeps_the_first_entry() {
        let mut exporter = Exporter::empty();
        exporter.service("calc").blocking("add", |_| Ok(json!(1)));
        exporter.service("calc").blocking("add", |_| Ok(json!(2)));

        assert_eq!(registered_value(&exporter, "calc", "add"), json!(1));
    }

    #[test]
    fn cover_replaces_the_existing_entry() {
        let mut exporter = Exporter::empty();
        exporter.service("calc").blocking("add", |_| Ok(json!(1)));
        exporter.service("calc").cover().blocking("add", |_| Ok(json!(2)));

        assert_eq!(registered_value(&exporter, "calc", "add"), json!(2));
        assert_eq!(exporter.len(), 1);
    }
}
