//! foundryd — build agent daemon.
//!
//! Accepts build requests, runs them through the local job queue, and keeps
//! this node's record alive in the service registry so the router can send
//! clients here.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use foundry_api::BuilderState;
use foundry_core::config::{cpu_count, hostname, FoundryConfig};
use foundry_core::ServiceRecord;
use foundry_services::notify::HttpEventPublisher;
use foundry_services::packager::CommandPackager;
use foundry_services::queue::LocalJobQueue;
use foundry_services::background::{publish_load, sweep_orphans};
use foundry_services::{store, AdmissionSettings, JobAdmissionController, ServiceRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = FoundryConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = FoundryConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FoundryConfig::default()
    });
    let builder = &config.builder;

    // ── Job pipeline ─────────────────────────────────────────────────────────

    let packager = CommandPackager::from_command(&builder.packager_command)
        .context("builder.packager_command is empty")?;
    let queue = LocalJobQueue::new(
        builder.queue_name(),
        builder.concurrency(),
        Arc::new(packager),
        builder.stage_dir.clone(),
        builder.temp_dir.clone(),
    );
    let publisher = Arc::new(HttpEventPublisher::new(&builder.notify_endpoint));
    let controller = JobAdmissionController::new(
        AdmissionSettings::from_config(builder),
        Arc::new(queue.clone()),
        publisher,
    );
    controller
        .prepare_dirs()
        .await
        .context("cannot prepare working directories")?;

    let listener = TcpListener::bind(("0.0.0.0", builder.listen_port))
        .await
        .with_context(|| format!("cannot listen on port {}", builder.listen_port))?;

    // ── Registry ─────────────────────────────────────────────────────────────

    let store = store::connect(&config.store.endpoint)
        .await
        .context("cannot connect to registry store")?;
    let registry = ServiceRegistry::new(store, config.registry.clone());

    let mut record = ServiceRecord::new(
        &builder.service_name,
        builder.advertised_host(),
        builder.listen_port,
        cpu_count() as u32,
    );
    record.hostname = hostname();
    let entry = Arc::new(
        registry
            .join(&builder.service_name, record)
            .await
            .context("cannot join service registry")?,
    );

    tracing::info!(
        queue = %queue.name(),
        concurrency = builder.concurrency(),
        endpoint = %entry.record().endpoint(),
        "build agent ready"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let load_task = tokio::spawn(publish_load(entry.clone(), controller.subscribe_load()));
    let sweep_task = tokio::spawn(sweep_orphans(controller.clone()));

    let mut server = {
        let mut stop = shutdown_tx.subscribe();
        let app = foundry_api::builder_app(BuilderState { controller });
        tokio::spawn(foundry_api::serve(listener, app, async move {
            let _ = stop.recv().await;
        }))
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();
    let server_exited = tokio::select! {
        _ = shutdown_rx.recv() => {
            tracing::info!("shutting down");
            false
        }
        r = &mut server => {
            tracing::error!("HTTP server exited: {:?}", r);
            true
        }
    };

    // Stop load updates before leaving so nothing rewrites the record, then
    // leave before draining so the router stops sending clients here.
    load_task.abort();
    sweep_task.abort();
    if let Err(e) = entry.leave().await {
        tracing::warn!(error = %e, "failed to leave registry, record will expire");
    }

    if !queue.shutdown(builder.shutdown_timeout()).await {
        tracing::warn!("jobs were cancelled at shutdown");
    }
    if !server_exited {
        let _ = server.await;
    }

    Ok(())
}
