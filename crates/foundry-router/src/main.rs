//! foundry-router — hands each client the least loaded build agent.

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use foundry_api::RouterState;
use foundry_core::config::FoundryConfig;
use foundry_services::{store, AgentRouter, ServiceCatalog};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = FoundryConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FoundryConfig::default()
    });

    let store = store::connect(&config.store.endpoint)
        .await
        .context("cannot connect to registry store")?;
    let catalog = ServiceCatalog::new(store, config.registry.catalog_freshness());
    let listener_task = catalog
        .listen()
        .await
        .context("cannot subscribe to registry notifications")?;

    let state = RouterState {
        router: AgentRouter::new(catalog, config.router.overload_threshold),
        default_worker_port: config.router.default_worker_port,
    };
    let listener = TcpListener::bind(("0.0.0.0", config.router.listen_port))
        .await
        .with_context(|| format!("cannot listen on port {}", config.router.listen_port))?;

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown signal received");
    };
    foundry_api::serve(listener, foundry_api::router_app(state), shutdown).await?;

    listener_task.abort();
    Ok(())
}
