//! Background loops of a build agent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::admission::JobAdmissionController;
use crate::registry::RegistryEntry;

/// Mirror the live-job counter into the registry record so the router's
/// weight tracks this node's load. Ends when the controller is dropped.
pub async fn publish_load(entry: Arc<RegistryEntry>, mut load: watch::Receiver<u32>) {
    while load.changed().await.is_ok() {
        let job_count = *load.borrow_and_update();
        match entry.update_job_count(job_count).await {
            Ok(()) => tracing::debug!(job_count, "load published"),
            Err(e) => tracing::warn!(job_count, error = %e, "cannot publish load"),
        }
    }
}

/// Sweep orphaned job directories even when no requests arrive.
pub async fn sweep_orphans(controller: JobAdmissionController) {
    let period = controller
        .settings()
        .orphan_check_interval
        .max(Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        controller.maybe_sweep().await;
    }
}
