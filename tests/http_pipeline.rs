//! Loopback integration over the HTTP framing.

use std::sync::Arc;

use serde_json::json;
use tokio::net::TcpListener;

use spoke::client::{ClientSettings, RpcClient};
use spoke::cluster::RandomCluster;
use spoke::exporter::Exporter;
use spoke::registry::StaticRegistry;
use spoke::serializer::JsonSerializer;
use spoke::server::RpcServerBuilder;
use spoke::transport::HttpTransport;

#[tokio::test]
async fn full_invocation_over_http_framing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let mut exporter = Exporter::new();
    exporter.service("echo").inline("upper", |call| async move {
        let text = call
            .args
            .first()
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        Ok(json!(text.to_uppercase()))
    });

    let server = RpcServerBuilder::new()
        .with_exporter(exporter)
        .with_transport(Arc::new(HttpTransport::new()))
        .with_serializer(Arc::new(JsonSerializer))
        .build()
        .expect("server builds");
    let handle = server.shutdown_handle();
    let server_task = tokio::spawn(async move { server.serve(listener).await });

    let registry = StaticRegistry::new().with_endpoint(addr.ip().to_string(), addr.port());
    let client = RpcClient::builder()
        .with_transport(Arc::new(HttpTransport::new()))
        .with_serializer(Arc::new(JsonSerializer))
        .with_cluster(Arc::new(RandomCluster::new(Arc::new(registry))))
        .with_settings(ClientSettings::default())
        .build()
        .expect("client builds");

    for text in ["hello", "wire", "framing"] {
        let value = client
            .call("echo", "upper", vec![json!(text)])
            .await
            .expect("invocation succeeds");
        assert_eq!(value, json!(text.to_uppercase()));
    }

    client.close().await;
    handle.shutdown();
    server_task
        .await
        .expect("server task")
        .expect("server exits cleanly");
}
