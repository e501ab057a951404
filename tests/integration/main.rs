//! Foundry integration test harness.
//!
//! Every test runs build agents, a router and a notification relay inside
//! the test process, on 127.0.0.1 with OS-assigned ports, sharing one
//! in-memory registry store. Clients talk to them over real HTTP.
//!
//!   cargo test --test integration

mod builds;
mod routing;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use foundry_api::{BuilderState, RouterState};
use foundry_core::config::RegistryConfig;
use foundry_core::{Artifact, BuildEvent, JobDescriptor, JobDirs, ServiceRecord};
use foundry_services::background::publish_load;
use foundry_services::notify::HttpEventPublisher;
use foundry_services::packager::Packager;
use foundry_services::queue::LocalJobQueue;
use foundry_services::store::MemoryStore;
use foundry_services::{
    AdmissionSettings, AgentRouter, JobAdmissionController, RegistryEntry, ServiceCatalog,
    ServiceRegistry,
};

// ── Harness ───────────────────────────────────────────────────────────────────

static NEXT_ROOT: AtomicUsize = AtomicUsize::new(0);

/// Fresh scratch directory for one node.
pub fn scratch_dir(label: &str) -> PathBuf {
    let n = NEXT_ROOT.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!("foundry-it-{}-{}-{}", label, std::process::id(), n));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

async fn bind() -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

/// Poll `check` until it holds or ~5s pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

// ── Notification relay ────────────────────────────────────────────────────────

/// Stand-in for the relay that fans build events out to clients.
pub struct Relay {
    pub url: String,
    events: Arc<Mutex<Vec<(String, BuildEvent)>>>,
    _server: JoinHandle<()>,
}

type RelayEvents = Arc<Mutex<Vec<(String, BuildEvent)>>>;

async fn relay_publish(
    State(events): State<RelayEvents>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> StatusCode {
    let (Some(id), Some(event)) = (query.get("id"), BuildEvent::unframe(&body)) else {
        return StatusCode::BAD_REQUEST;
    };
    events.lock().unwrap().push((id.clone(), event));
    StatusCode::OK
}

impl Relay {
    pub async fn start() -> Result<Self> {
        let events: RelayEvents = Arc::default();
        let app = axum::Router::new()
            .route("/publish-build-event", post(relay_publish))
            .with_state(events.clone());
        let (listener, addr) = bind().await?;
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Self {
            url: format!("http://{addr}"),
            events,
            _server: server,
        })
    }

    pub fn events_for(&self, job_id: &str) -> Vec<BuildEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Wait until the job's terminal event arrived; returns every event.
    pub async fn wait_terminal(&self, job_id: &str) -> Vec<BuildEvent> {
        eventually(|| self.events_for(job_id).iter().any(BuildEvent::is_terminal)).await;
        self.events_for(job_id)
    }
}

// ── Packager double ───────────────────────────────────────────────────────────

/// Writes one artifact per job, or fails when the platform is "broken".
pub struct FakePackager {
    pub delay: Duration,
}

#[async_trait]
impl Packager for FakePackager {
    async fn package(
        &self,
        job: &JobDescriptor,
        dirs: &JobDirs,
        cancel: CancellationToken,
    ) -> Result<Vec<Artifact>, String> {
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = cancel.cancelled() => return Err("build cancelled".into()),
        }
        if job.platform == "broken" {
            return Err("Cannot find icon".into());
        }
        let file = format!("app-{}.bin", job.platform);
        tokio::fs::write(dirs.out_dir().join(&file), b"artifact")
            .await
            .map_err(|e| e.to_string())?;
        Ok(vec![Artifact {
            file,
            target: job.targets.first().map(|t| t.name.clone()),
            arch: None,
            safe_artifact_name: None,
            size: Some(8),
        }])
    }
}

// ── Nodes ─────────────────────────────────────────────────────────────────────

pub struct BuilderNode {
    pub url: String,
    pub root: PathBuf,
    pub controller: JobAdmissionController,
    pub entry: Arc<RegistryEntry>,
    _server: JoinHandle<()>,
    _load: JoinHandle<()>,
}

impl BuilderNode {
    pub async fn start(store: Arc<MemoryStore>, relay: &Relay, cpu_count: u32) -> Result<Self> {
        Self::start_with_delay(store, relay, cpu_count, Duration::from_millis(50)).await
    }

    /// Like `start`, with every build taking `delay`.
    pub async fn start_with_delay(
        store: Arc<MemoryStore>,
        relay: &Relay,
        cpu_count: u32,
        delay: Duration,
    ) -> Result<Self> {
        let root = scratch_dir("builder");
        let packager = Arc::new(FakePackager { delay });
        let queue = LocalJobQueue::new("build-test", 2, packager, root.join("stage"), root.join("tmp"));
        let settings = AdmissionSettings {
            stage_root: root.join("stage"),
            temp_root: root.join("tmp"),
            archive_prefix: None,
            orphan_ttl: Duration::from_secs(3600),
            orphan_check_interval: Duration::from_secs(60),
        };
        let controller = JobAdmissionController::new(
            settings,
            Arc::new(queue),
            Arc::new(HttpEventPublisher::new(&relay.url)),
        );
        controller.prepare_dirs().await?;

        let (listener, addr) = bind().await?;
        let registry = ServiceRegistry::new(store, RegistryConfig::default());
        let entry = Arc::new(
            registry
                .join("builder", ServiceRecord::new("builder", "127.0.0.1", addr.port(), cpu_count))
                .await
                .context("join")?,
        );
        let load = tokio::spawn(publish_load(entry.clone(), controller.subscribe_load()));

        let app = foundry_api::builder_app(BuilderState {
            controller: controller.clone(),
        });
        let server = tokio::spawn(async move {
            let _ = foundry_api::serve(listener, app, std::future::pending()).await;
        });

        Ok(Self {
            url: format!("http://{addr}"),
            root,
            controller,
            entry,
            _server: server,
            _load: load,
        })
    }

    /// Stage an upload the way the front proxy would.
    pub fn stage_archive(&self, name: &str) -> PathBuf {
        let path = self.root.join(format!("{name}.zst"));
        std::fs::write(&path, b"fake zstd archive").expect("stage archive");
        path
    }

    pub fn job_dirs(&self, job_id: &str) -> JobDirs {
        self.controller.job_dirs(job_id)
    }
}

pub struct RouterNode {
    pub url: String,
    pub catalog: ServiceCatalog,
    _server: JoinHandle<()>,
    _listener: JoinHandle<()>,
}

impl RouterNode {
    pub async fn start(store: Arc<MemoryStore>, overload_threshold: u32) -> Result<Self> {
        let catalog = ServiceCatalog::new(store, Duration::from_secs(60));
        let listener_task = catalog.listen().await?;
        let state = RouterState {
            router: AgentRouter::new(catalog.clone(), overload_threshold),
            default_worker_port: 443,
        };
        let (listener, addr) = bind().await?;
        let app = foundry_api::router_app(state);
        let server = tokio::spawn(async move {
            let _ = foundry_api::serve(listener, app, std::future::pending()).await;
        });
        Ok(Self {
            url: format!("http://{addr}"),
            catalog,
            _server: server,
            _listener: listener_task,
        })
    }
}

/// Ask the router for an agent; returns status and JSON body.
pub async fn find_agent(router: &RouterNode, path: &str) -> Result<(reqwest::StatusCode, serde_json::Value)> {
    let resp = reqwest::get(format!("{}{}", router.url, path)).await?;
    let status = resp.status();
    Ok((status, resp.json().await?))
}

pub fn endpoint_of(node: &BuilderNode) -> String {
    node.entry.record().endpoint()
}
