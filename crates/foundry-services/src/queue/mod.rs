//! Job queue seam.
//!
//! A queue accepts a job descriptor and hands back a `JobHandle`: a single
//! awaitable settlement plus an optional "started" signal. The backend
//! keeps the matching `JobTicket` and resolves it exactly once.

mod local;

use async_trait::async_trait;
use tokio::sync::oneshot;

use foundry_core::{JobDescriptor, JobOutcome};

pub use self::local::LocalJobQueue;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("queue is shutting down")]
    Closed,
    #[error("job was lost by the queue")]
    Lost,
}

#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Queue a job under `id`. Returns once the queue has accepted it.
    async fn enqueue(&self, id: &str, job: JobDescriptor) -> Result<JobHandle, QueueError>;

    /// Withdraw a job. A job that has not started never runs; a running
    /// one is cancelled. Unknown ids are ignored.
    async fn discard(&self, id: &str) -> Result<(), QueueError>;
}

/// Client side of one queued job.
pub struct JobHandle {
    id: String,
    started: Option<oneshot::Receiver<()>>,
    settled: oneshot::Receiver<Result<JobOutcome, QueueError>>,
}

/// Backend side of one queued job.
pub struct JobTicket {
    started: Option<oneshot::Sender<()>>,
    settled: oneshot::Sender<Result<JobOutcome, QueueError>>,
}

/// Paired ticket and handle for a new job.
pub fn job_channel(id: &str) -> (JobTicket, JobHandle) {
    let (started_tx, started_rx) = oneshot::channel();
    let (settled_tx, settled_rx) = oneshot::channel();
    (
        JobTicket {
            started: Some(started_tx),
            settled: settled_tx,
        },
        JobHandle {
            id: id.to_string(),
            started: Some(started_rx),
            settled: settled_rx,
        },
    )
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait until the job starts. `false` if it settled without starting.
    pub async fn started(&mut self) -> bool {
        match self.started.take() {
            Some(rx) => rx.await.is_ok(),
            None => false,
        }
    }

    /// Wait for the settlement. A backend that drops the job without
    /// settling it yields `QueueError::Lost`.
    pub async fn finished(self) -> Result<JobOutcome, QueueError> {
        self.settled.await.unwrap_or(Err(QueueError::Lost))
    }
}

impl JobTicket {
    pub fn mark_started(&mut self) {
        if let Some(tx) = self.started.take() {
            let _ = tx.send(());
        }
    }

    pub fn settle(self, result: Result<JobOutcome, QueueError>) {
        // The handle may be gone already; nobody is left to tell.
        let _ = self.settled.send(result);
    }
}
