//! Build event notifications.
//!
//! Events go out through a relay (`POST {endpoint}/publish-build-event?id=`)
//! that fans them out to whoever is listening for the job. Delivery is
//! fire-and-forget: a failed POST is logged and dropped, it never fails the
//! job.

use std::sync::Mutex;

use async_trait::async_trait;

use foundry_core::BuildEvent;

#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
    async fn publish(&self, job_id: &str, event: &BuildEvent);
}

pub struct HttpEventPublisher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpEventPublisher {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, job_id: &str) -> String {
        // Job ids are [0-9a-z-]; nothing to escape.
        format!("{}/publish-build-event?id={}", self.endpoint, job_id)
    }
}

#[async_trait]
impl EventPublisher for HttpEventPublisher {
    async fn publish(&self, job_id: &str, event: &BuildEvent) {
        let body = match event.frame() {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "cannot encode build event");
                return;
            }
        };
        match self.client.post(self.url(job_id)).body(body).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(job_id = %job_id, terminal = event.is_terminal(), "build event published");
            }
            Ok(resp) => {
                tracing::warn!(job_id = %job_id, status = %resp.status(), "build event rejected");
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "cannot publish build event");
            }
        }
    }
}

/// Keeps every event in memory. Used in dev mode and tests.
#[derive(Default)]
pub struct MemoryPublisher {
    events: Mutex<Vec<(String, BuildEvent)>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published for `job_id`, oldest first.
    pub fn events_for(&self, job_id: &str) -> Vec<BuildEvent> {
        self.lock()
            .iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, BuildEvent)>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&self, job_id: &str, event: &BuildEvent) {
        tracing::debug!(job_id = %job_id, ?event, "build event");
        self.lock().push((job_id.to_string(), event.clone()));
    }
}
