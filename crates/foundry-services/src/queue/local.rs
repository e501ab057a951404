//! Local job queue — runs packaging jobs on this node with bounded
//! concurrency.
//!
//! Each enqueued job gets its own task that waits for a semaphore permit,
//! creates the job's working directories, runs the packager and settles the
//! job's ticket. The staged archive is removed once the job has run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use foundry_core::{Artifact, JobDescriptor, JobDirs, JobOutcome};

use super::{job_channel, JobHandle, JobQueue, JobTicket, QueueError};
use crate::packager::Packager;

#[derive(Clone)]
pub struct LocalJobQueue {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    permits: Arc<Semaphore>,
    packager: Arc<dyn Packager>,
    stage_root: PathBuf,
    temp_root: PathBuf,
    /// Jobs queued or running, keyed by id.
    jobs: DashMap<String, CancellationToken>,
    idle: Notify,
    closed: AtomicBool,
}

impl LocalJobQueue {
    pub fn new(
        name: impl Into<String>,
        concurrency: usize,
        packager: Arc<dyn Packager>,
        stage_root: PathBuf,
        temp_root: PathBuf,
    ) -> Self {
        let name = name.into();
        let concurrency = concurrency.max(1);
        tracing::info!(queue = %name, concurrency, "job queue started");
        Self {
            inner: Arc::new(Inner {
                name,
                permits: Arc::new(Semaphore::new(concurrency)),
                packager,
                stage_root,
                temp_root,
                jobs: DashMap::new(),
                idle: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Stop accepting jobs and wait for the ones in flight. Jobs still
    /// running after `timeout` are cancelled. Returns true if the queue
    /// drained in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.closed.store(true, Ordering::SeqCst);
        let inner = &self.inner;
        let drained = async {
            loop {
                let idle = inner.idle.notified();
                if inner.jobs.is_empty() {
                    break;
                }
                idle.await;
            }
        };
        if tokio::time::timeout(timeout, drained).await.is_ok() {
            tracing::info!(queue = %inner.name, "job queue drained");
            return true;
        }
        tracing::warn!(
            queue = %inner.name,
            remaining = inner.jobs.len(),
            "shutdown timeout, cancelling remaining jobs"
        );
        for job in inner.jobs.iter() {
            job.value().cancel();
        }
        false
    }
}

#[async_trait]
impl JobQueue for LocalJobQueue {
    async fn enqueue(&self, id: &str, job: JobDescriptor) -> Result<JobHandle, QueueError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let token = CancellationToken::new();
        if self.inner.jobs.insert(id.to_string(), token.clone()).is_some() {
            return Err(QueueError::Unavailable(format!("duplicate job id {id}")));
        }
        let (ticket, handle) = job_channel(id);
        tokio::spawn(run(self.inner.clone(), id.to_string(), job, ticket, token));
        Ok(handle)
    }

    async fn discard(&self, id: &str) -> Result<(), QueueError> {
        if let Some(token) = self.inner.jobs.get(id) {
            tracing::info!(queue = %self.inner.name, job_id = %id, "discarding job");
            token.cancel();
        }
        Ok(())
    }
}

async fn run(
    inner: Arc<Inner>,
    id: String,
    job: JobDescriptor,
    mut ticket: JobTicket,
    token: CancellationToken,
) {
    let enqueued_at = Instant::now();

    let permit = tokio::select! {
        permit = inner.permits.clone().acquire_owned() => permit.ok(),
        _ = token.cancelled() => None,
    };

    let outcome = match permit {
        Some(_permit) if !token.is_cancelled() => {
            ticket.mark_started();
            let queue_ms = enqueued_at.elapsed().as_millis() as u64;
            tracing::info!(queue = %inner.name, job_id = %id, queue_ms, "job started");

            let started_at = Instant::now();
            let result = execute(&inner, &id, &job, token).await;
            let build_ms = started_at.elapsed().as_millis() as u64;
            tracing::info!(
                queue = %inner.name,
                job_id = %id,
                ok = result.is_ok(),
                build_ms,
                "job finished"
            );
            Ok(JobOutcome {
                result,
                queue_ms,
                build_ms,
            })
        }
        _ => {
            tracing::info!(queue = %inner.name, job_id = %id, "job discarded before start");
            Ok(JobOutcome {
                result: Err("job was discarded".to_string()),
                queue_ms: enqueued_at.elapsed().as_millis() as u64,
                build_ms: 0,
            })
        }
    };

    if let Err(e) = tokio::fs::remove_file(&job.archive).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(job_id = %id, error = %e, "cannot remove archive");
        }
    }

    inner.jobs.remove(&id);
    inner.idle.notify_waiters();
    ticket.settle(outcome);
}

async fn execute(
    inner: &Inner,
    id: &str,
    job: &JobDescriptor,
    token: CancellationToken,
) -> Result<Vec<Artifact>, String> {
    let dirs = JobDirs::for_job(&inner.stage_root, &inner.temp_root, id);
    for dir in [dirs.out_dir(), dirs.temp.clone()] {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| format!("cannot create {}: {}", dir.display(), e))?;
    }
    inner.packager.package(job, &dirs, token).await
}
