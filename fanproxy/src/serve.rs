//! `fanproxy serve`: wires a proxy node from its configuration and serves it over mutual TLS.
use anyhow::Context;
use fanproxy_core::config::{Config, TlsConfig};
use fanproxy_core::connect::AnyConnector;
use fanproxy_core::local::LocalBackends;
use fanproxy_core::methods::{MethodTable, load_descriptor_pool};
use fanproxy_core::proxy::Proxy;
use fanproxy_core::server::ProxyService;
use fanproxy_core::tls::{Credentials, FileCertificateProvider};
use fanproxy_core::tonic::service::Routes;
use fanproxy_core::tonic::transport::Server;
use std::path::Path;
use std::sync::Arc;
use tower::ServiceExt;
use tracing::{info, warn};

pub async fn run(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = Config::load(config_path).context("failed to load configuration")?;

    let descriptor_set = config
        .node
        .descriptor_set
        .as_deref()
        .context("`node.descriptor_set` is not configured")?;
    let pool = load_descriptor_pool(descriptor_set)
        .with_context(|| format!("failed to load {}", descriptor_set.display()))?;

    let methods = MethodTable::build(&pool, &config.aggregation);
    if methods.is_empty() {
        warn!("no method can be proxied, every call will be served locally");
    }
    info!(methods = methods.len(), "method table built");

    let provider = Arc::new(certificate_provider(&config.tls)?);
    let server_credentials = Credentials::mutual(provider.as_ref(), None)
        .context("failed to load the node certificate")?;

    let connector = AnyConnector::from_config(config.proxy.mode, &config.network, &config.local);
    let local = LocalBackends::from_config(&config.local);
    let proxy = Proxy::from_config(&config, methods, connector, provider);

    let service = ProxyService::new(proxy, local)
        .map_request(|req: http::Request<axum::body::Body>| req.map(fanproxy_core::tonic::body::Body::new));
    let routes = Routes::from(axum::Router::new().fallback_service(service));

    let listen = config.node.listen;
    info!(
        %listen,
        node = %config.node.name,
        mode = ?config.proxy.mode,
        "fanproxy starting"
    );

    Server::builder()
        .tls_config(server_credentials.server_tls_config())
        .context("invalid TLS configuration")?
        .add_routes(routes)
        .serve_with_shutdown(listen, shutdown_signal())
        .await
        .context("server error")?;

    info!("fanproxy stopped");
    Ok(())
}

fn certificate_provider(tls: &TlsConfig) -> anyhow::Result<FileCertificateProvider> {
    match (&tls.ca, &tls.cert, &tls.key) {
        (Some(ca), Some(cert), Some(key)) => Ok(FileCertificateProvider::new(ca, cert, key)),
        _ => anyhow::bail!("`[tls]` must set `ca`, `cert` and `key`"),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
