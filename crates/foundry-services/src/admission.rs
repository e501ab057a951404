//! Job admission — turns a build request into a queued job.
//!
//! The request is validated, given an id and handed to the queue. The
//! caller gets the id back as soon as the queue has accepted the job;
//! progress and the final result travel over the event publisher. Client
//! aborts are honoured at two checkpoints: before enqueue (the job is never
//! queued) and right after it (the job is discarded).
//!
//! Every admitted job is tracked until the client acknowledges that it
//! fetched the artifacts, or until the orphan TTL runs out. Both paths
//! remove the job's working directories.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use foundry_core::config::BuilderConfig;
use foundry_core::id::IdGenerator;
use foundry_core::job::ValidationError;
use foundry_core::{BuildEvent, JobDirs, RawBuildRequest};

use crate::notify::EventPublisher;
use crate::queue::{JobHandle, JobQueue, QueueError};

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Validation(ValidationError),
    #[error("{0}")]
    InternalInconsistency(String),
    #[error("cannot queue job: {0}")]
    Queue(QueueError),
    #[error("request aborted by client")]
    Aborted,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    pub stage_root: PathBuf,
    pub temp_root: PathBuf,
    pub archive_prefix: Option<PathBuf>,
    pub orphan_ttl: Duration,
    pub orphan_check_interval: Duration,
}

impl AdmissionSettings {
    pub fn from_config(config: &BuilderConfig) -> Self {
        Self {
            stage_root: config.stage_dir.clone(),
            temp_root: config.temp_dir.clone(),
            archive_prefix: config.archive_dir_prefix.clone(),
            orphan_ttl: config.orphan_ttl(),
            orphan_check_interval: config.orphan_check_interval(),
        }
    }
}

#[derive(Clone)]
pub struct JobAdmissionController {
    inner: Arc<Inner>,
}

struct Inner {
    settings: AdmissionSettings,
    queue: Arc<dyn JobQueue>,
    publisher: Arc<dyn EventPublisher>,
    ids: IdGenerator,
    state: Mutex<AdmissionState>,
    load: watch::Sender<u32>,
}

/// Orphan map and live-job counter share one lock so that enqueue,
/// settle, sweep and cleanup always see them consistent.
#[derive(Default)]
struct AdmissionState {
    orphans: HashMap<String, Instant>,
    live_jobs: u32,
    last_sweep: Option<Instant>,
}

impl JobAdmissionController {
    pub fn new(
        settings: AdmissionSettings,
        queue: Arc<dyn JobQueue>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let (load, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                settings,
                queue,
                publisher,
                ids: IdGenerator::new(),
                state: Mutex::new(AdmissionState::default()),
                load,
            }),
        }
    }

    pub fn settings(&self) -> &AdmissionSettings {
        &self.inner.settings
    }

    /// Jobs admitted and not yet settled.
    pub fn live_jobs(&self) -> u32 {
        self.inner.lock().live_jobs
    }

    /// Follows `live_jobs`.
    pub fn subscribe_load(&self) -> watch::Receiver<u32> {
        self.inner.load.subscribe()
    }

    /// Jobs whose directories are still tracked.
    pub fn tracked_jobs(&self) -> usize {
        self.inner.lock().orphans.len()
    }

    /// Working directories of `job_id`.
    pub fn job_dirs(&self, job_id: &str) -> JobDirs {
        let settings = &self.inner.settings;
        JobDirs::for_job(&settings.stage_root, &settings.temp_root, job_id)
    }

    /// Empty and recreate the working directory roots. Run once at startup,
    /// before any job is admitted: nothing tracks directories left over
    /// from a previous process.
    pub async fn prepare_dirs(&self) -> Result<(), AdmissionError> {
        let settings = &self.inner.settings;
        for root in [&settings.stage_root, &settings.temp_root] {
            match tokio::fs::remove_dir_all(root).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tokio::fs::create_dir_all(root).await?;
        }
        tracing::info!(
            stage = %settings.stage_root.display(),
            temp = %settings.temp_root.display(),
            "working directories prepared"
        );
        Ok(())
    }

    /// Admit one build request. Returns the job id once the job is queued.
    pub async fn admit(
        &self,
        raw: RawBuildRequest,
        cancel: &CancellationToken,
    ) -> Result<String, AdmissionError> {
        self.maybe_sweep().await;

        let settings = &self.inner.settings;
        let prefix = settings.archive_prefix.as_deref();
        let mut job = match raw.validate(prefix) {
            Ok(job) => job,
            Err(e) if e.is_client_error() => {
                tracing::warn!(error = %e, "rejected build request");
                if let Some(archive) = raw.archive_path(prefix) {
                    remove_archive(&archive).await;
                }
                return Err(AdmissionError::Validation(e));
            }
            Err(e) => {
                tracing::error!(error = %e, "build request without archive");
                return Err(AdmissionError::InternalInconsistency(e.to_string()));
            }
        };

        // The proxy stages the upload before calling us; an unreadable
        // archive is our inconsistency, not the client's.
        job.archive_size = match tokio::fs::metadata(&job.archive).await {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            Ok(_) => {
                tracing::error!(archive = %job.archive.display(), "staged archive is not a file");
                return Err(AdmissionError::InternalInconsistency(format!(
                    "Internal error: {} is not a file",
                    job.archive.display()
                )));
            }
            Err(e) => {
                tracing::error!(archive = %job.archive.display(), error = %e, "staged archive is not readable");
                remove_archive(&job.archive).await;
                return Err(AdmissionError::InternalInconsistency(format!(
                    "Internal error: cannot stat {}: {e}",
                    job.archive.display()
                )));
            }
        };

        let id = self.inner.ids.next_id();

        if cancel.is_cancelled() {
            tracing::warn!(job_id = %id, "client aborted before enqueue");
            remove_archive(&job.archive).await;
            return Err(AdmissionError::Aborted);
        }

        let archive = job.archive.clone();
        let handle = match self.inner.queue.enqueue(&id, job).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "cannot enqueue job");
                remove_archive(&archive).await;
                return Err(AdmissionError::Queue(e));
            }
        };

        if cancel.is_cancelled() {
            tracing::warn!(job_id = %id, "client aborted during enqueue, discarding job");
            if let Err(e) = self.inner.queue.discard(&id).await {
                tracing::error!(job_id = %id, error = %e, "cannot discard job");
            }
            return Err(AdmissionError::Aborted);
        }

        let live = {
            let mut state = self.inner.lock();
            state.orphans.insert(id.clone(), Instant::now());
            state.live_jobs += 1;
            state.live_jobs
        };
        self.inner.load.send_replace(live);
        tracing::info!(job_id = %id, live_jobs = live, "job admitted");

        tokio::spawn(report(self.inner.clone(), handle));
        Ok(id)
    }

    /// Client acknowledged it fetched everything: forget the job and delete
    /// its directories. Returns false for unknown (or already swept) jobs.
    pub async fn cleanup(&self, job_id: &str) -> bool {
        let tracked = self.inner.lock().orphans.remove(job_id).is_some();
        if tracked {
            self.inner.remove_dirs(job_id).await;
            tracing::info!(job_id = %job_id, "job directories cleaned up");
        }
        tracked
    }

    /// Delete directories of jobs older than the orphan TTL. Runs at most
    /// once per check interval; returns the number of jobs swept.
    pub async fn maybe_sweep(&self) -> usize {
        let settings = &self.inner.settings;
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut state = self.inner.lock();
            if let Some(last) = state.last_sweep {
                if now.duration_since(last) < settings.orphan_check_interval {
                    return 0;
                }
            }
            state.last_sweep = Some(now);
            let expired: Vec<String> = state
                .orphans
                .iter()
                .filter(|(_, created)| now.duration_since(**created) >= settings.orphan_ttl)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                state.orphans.remove(id);
            }
            expired
        };

        for id in &expired {
            self.inner.remove_dirs(id).await;
        }
        if expired.is_empty() {
            tracing::debug!("orphan sweep found nothing");
        } else {
            tracing::info!(count = expired.len(), "swept orphaned job directories");
        }
        expired.len()
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn job_settled(&self) {
        let live = {
            let mut state = self.lock();
            state.live_jobs = state.live_jobs.saturating_sub(1);
            state.live_jobs
        };
        self.load.send_replace(live);
    }

    async fn remove_dirs(&self, job_id: &str) {
        let dirs = JobDirs::for_job(&self.settings.stage_root, &self.settings.temp_root, job_id);
        for dir in [&dirs.project, &dirs.temp] {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(job_id = %job_id, error = %e, "cannot remove job directory"),
            }
        }
    }
}

/// Follow one job to its end: publish progress, release the live-job slot
/// and publish exactly one terminal event whatever the outcome.
async fn report(inner: Arc<Inner>, mut handle: JobHandle) {
    let id = handle.id().to_string();
    inner.publisher.publish(&id, &BuildEvent::added()).await;

    if handle.started().await {
        inner.publisher.publish(&id, &BuildEvent::started()).await;
    }

    let terminal = match handle.finished().await {
        Ok(outcome) => {
            tracing::info!(
                job_id = %id,
                ok = outcome.result.is_ok(),
                queue_ms = outcome.queue_ms,
                build_ms = outcome.build_ms,
                "job settled"
            );
            match outcome.result {
                Ok(files) => BuildEvent::Completed { files },
                Err(error) => BuildEvent::failed(error),
            }
        }
        Err(e) => {
            tracing::error!(job_id = %id, error = %e, "job failed in queue");
            BuildEvent::failed(format!("Internal error: {e}"))
        }
    };

    inner.job_settled();
    inner.publisher.publish(&id, &terminal).await;
}

async fn remove_archive(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(archive = %path.display(), error = %e, "cannot remove archive"),
    }
}
