//! `spoked`: the standalone RPC daemon.
//!
//! Serves a small demonstration service set over the configured transport
//! and serializer. Configuration merges, in increasing precedence: built-in
//! defaults, `spoke.toml`, `SPOKE_`-prefixed environment variables and CLI
//! flags.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::error;
use tracing_subscriber::EnvFilter;

use spoke::exporter::Exporter;
use spoke::registry::{CoordinationRegistry, MemoryCoordination};
use spoke::serializer::{JsonSerializer, MsgpackSerializer, Serializer};
use spoke::server::RpcServerBuilder;
use spoke::transport::{HttpTransport, RecordTransport, Transport};

/// Runtime configuration of the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AppConfig {
    /// Listen address.
    bind: String,
    /// Wire framing: `record` or `http`.
    transport: String,
    /// Body encoding: `json` or `msgpack`.
    serializer: String,
    /// Maximum concurrently accepted connections.
    max_connections: usize,
    /// Requests processed concurrently per connection.
    concurrent_requests_per_connection: usize,
    /// Worker threads for blocking methods; zero picks the default size.
    worker_threads: usize,
    /// Threads of the isolated pool; zero disables it.
    isolated_threads: usize,
    /// Idle seconds before a connection is reaped.
    max_idle_secs: u64,
    /// Coordination base path; exported methods are published when set.
    registry_base: Option<String>,
    /// Host published to the registry instead of the bind address.
    advertise: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:7280".to_owned(),
            transport: "record".to_owned(),
            serializer: "json".to_owned(),
            max_connections: 15_000,
            concurrent_requests_per_connection: 10,
            worker_threads: 0,
            isolated_threads: 0,
            max_idle_secs: 8 * 60 * 60,
            registry_base: None,
            advertise: None,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "spoked", about = "RPC daemon")]
struct Cli {
    /// Listen address.
    #[arg(long)]
    bind: Option<String>,
    /// Wire framing: `record` or `http`.
    #[arg(long)]
    transport: Option<String>,
    /// Body encoding: `json` or `msgpack`.
    #[arg(long)]
    serializer: Option<String>,
    /// Coordination base path to publish exported methods under.
    #[arg(long)]
    registry_base: Option<String>,
    /// Host published to the registry.
    #[arg(long)]
    advertise: Option<String>,
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
        .merge(Toml::file("spoke.toml"))
        .merge(Env::prefixed("SPOKE_"))
        .extract()
        .context("failed to merge configuration")?;
    if let Some(bind) = &cli.bind {
        config.bind = bind.clone();
    }
    if let Some(transport) = &cli.transport {
        config.transport = transport.clone();
    }
    if let Some(serializer) = &cli.serializer {
        config.serializer = serializer.clone();
    }
    if let Some(registry_base) = &cli.registry_base {
        config.registry_base = Some(registry_base.clone());
    }
    if let Some(advertise) = &cli.advertise {
        config.advertise = Some(advertise.clone());
    }
    Ok(config)
}

fn select_transport(name: &str) -> Result<Arc<dyn Transport>> {
    match name {
        "record" => Ok(Arc::new(RecordTransport::new())),
        "http" => Ok(Arc::new(HttpTransport::new())),
        other => bail!("unknown transport: {other}"),
    }
}

fn select_serializer(name: &str) -> Result<Arc<dyn Serializer>> {
    match name {
        "json" => Ok(Arc::new(JsonSerializer)),
        "msgpack" => Ok(Arc::new(MsgpackSerializer)),
        other => bail!("unknown serializer: {other}"),
    }
}

fn demo_exporter() -> Exporter {
    let mut exporter = Exporter::new();
    exporter
        .service("echo")
        .inline("echo", |call| async move {
            Ok(call.args.first().cloned().unwrap_or(spoke::Value::Null))
        })
        .inline("reverse", |call| async move {
            let text = call
                .args
                .first()
                .and_then(|value| value.as_str())
                .unwrap_or_default();
            Ok(json!(text.chars().rev().collect::<String>()))
        });
    exporter.service("calc").blocking("add", |call| {
        let sum: f64 = call
            .args
            .iter()
            .filter_map(serde_json::Value::as_f64)
            .sum();
        Ok(json!(sum))
    });
    exporter
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    outcome = tokio::signal::ctrl_c() => {
                        if let Err(err) = outcome {
                            error!(error = %err, "failed to listen for Ctrl-C");
                        }
                    }
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                error!(error = %err, "failed to install the SIGTERM handler");
                if let Err(err) = tokio::signal::ctrl_c().await {
                    error!(error = %err, "failed to listen for Ctrl-C");
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl-C");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let mut builder = RpcServerBuilder::new()
        .with_exporter(demo_exporter())
        .with_transport(select_transport(&config.transport)?)
        .with_serializer(select_serializer(&config.serializer)?)
        .with_max_connections(config.max_connections)
        .with_concurrent_requests_per_connection(config.concurrent_requests_per_connection)
        .with_max_idle_time(Duration::from_secs(config.max_idle_secs));
    if config.worker_threads > 0 {
        builder = builder.with_worker_threads(Some(config.worker_threads));
    }
    if config.isolated_threads > 0 {
        builder = builder.with_isolated_threads(Some(config.isolated_threads));
    }
    if let Some(base) = &config.registry_base {
        // The in-process backend; a networked coordination client plugs in
        // through the same seam.
        let registry = CoordinationRegistry::new(Arc::new(MemoryCoordination::new()), base.clone())
            .with_context(|| format!("invalid registry base path {base}"))?;
        builder = builder.with_registry(Arc::new(registry));
    }
    if let Some(advertise) = &config.advertise {
        builder = builder.with_advertise(advertise.clone());
    }

    let server = builder.build()?;
    let handle = server.shutdown_handle();
    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;

    let serve = server.serve(listener);
    tokio::pin!(serve);
    tokio::select! {
        outcome = &mut serve => outcome?,
        () = shutdown_signal() => {
            handle.shutdown();
            serve.await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    fn bare_cli() -> Cli {
        Cli {
            bind: None,
            transport: None,
            serializer: None,
            registry_base: None,
            advertise: None,
        }
    }

    #[test]
    fn env_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.set_env("SPOKE_BIND", "127.0.0.1:8000");
            jail.set_env("SPOKE_SERIALIZER", "msgpack");
            let config = load_config(&bare_cli()).expect("load");
            assert_eq!(config.bind, "127.0.0.1:8000");
            assert_eq!(config.serializer, "msgpack");
            assert_eq!(config.transport, "record");
            Ok(())
        });
    }

    #[test]
    fn cli_overrides_env() {
        Jail::expect_with(|jail| {
            jail.set_env("SPOKE_BIND", "127.0.0.1:8000");
            let cli = Cli {
                bind: Some("0.0.0.0:9000".to_owned()),
                ..bare_cli()
            };
            let config = load_config(&cli).expect("load");
            assert_eq!(config.bind, "0.0.0.0:9000");
            Ok(())
        });
    }

    #[test]
    fn loads_from_the_dotfile() {
        Jail::expect_with(|jail| {
            jail.create_file("spoke.toml", "transport = \"http\"")?;
            let config = load_config(&bare_cli()).expect("load");
            assert_eq!(config.transport, "http");
            Ok(())
        });
    }

    #[test]
    fn registry_base_flows_through_env_and_cli() {
        Jail::expect_with(|jail| {
            jail.set_env("SPOKE_REGISTRY_BASE", "/rpc");
            let config = load_config(&bare_cli()).expect("load");
            assert_eq!(config.registry_base.as_deref(), Some("/rpc"));

            let cli = Cli {
                registry_base: Some("/providers".to_owned()),
                ..bare_cli()
            };
            let config = load_config(&cli).expect("load");
            assert_eq!(config.registry_base.as_deref(), Some("/providers"));
            Ok(())
        });
    }

    #[test]
    fn unknown_transport_is_rejected() {
        assert!(select_transport("record").is_ok());
        assert!(select_transport("http").is_ok());
        assert!(select_transport("carrier-pigeon").is_err());
    }
}
