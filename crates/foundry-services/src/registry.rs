//! Service registry — keeps one node's record alive in the store.
//!
//! `join` writes the record with a TTL and announces it; a background task
//! then extends the TTL shortly before it runs out. If the store has lost
//! the key (eviction, restart) or the extend call fails, the task recreates
//! the key after a short backoff and carries on. `leave` stops the task and
//! removes the record, once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use foundry_core::config::RegistryConfig;
use foundry_core::record::{JOIN_CHANNEL, LEAVE_CHANNEL};
use foundry_core::ServiceRecord;

use crate::store::{RegistryStore, StoreError};

#[derive(Clone)]
pub struct ServiceRegistry {
    store: Arc<dyn RegistryStore>,
    settings: RegistryConfig,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn RegistryStore>, settings: RegistryConfig) -> Self {
        Self { store, settings }
    }

    /// Publish `record` under `name` and start renewing its lease.
    pub async fn join(&self, name: &str, mut record: ServiceRecord) -> Result<RegistryEntry, StoreError> {
        record.name = name.to_string();
        let key = record.key();
        let value = encode(&record)?;

        self.store
            .set_and_publish(&key, &value, self.settings.lease_ttl(), JOIN_CHANNEL, &value)
            .await?;
        tracing::info!(key = %key, endpoint = %record.endpoint(), "joined service registry");

        let inner = Arc::new(EntryInner {
            key,
            record: Mutex::new(record),
            destroyed: AtomicBool::new(false),
            writes: tokio::sync::Mutex::new(()),
            renewal: Mutex::new(None),
        });
        let task = tokio::spawn(renew(self.clone(), inner.clone()));
        *lock(&inner.renewal) = Some(task);

        Ok(RegistryEntry {
            registry: self.clone(),
            inner,
        })
    }

    /// Remove the entry's record and announce the departure. Only the first
    /// call for a given entry touches the store.
    pub async fn leave(&self, entry: &RegistryEntry) -> Result<(), StoreError> {
        let inner = &entry.inner;
        let _writes = inner.writes.lock().await;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.stop_renewal();
        self.store
            .delete_and_publish(&inner.key, LEAVE_CHANNEL, &inner.key)
            .await?;
        tracing::info!(key = %inner.key, "left service registry");
        Ok(())
    }
}

// ── Entry ─────────────────────────────────────────────────────────────────────

struct EntryInner {
    key: String,
    record: Mutex<ServiceRecord>,
    destroyed: AtomicBool,
    /// Held across every check-then-write of the key, so no write can land
    /// after `leave` deleted it.
    writes: tokio::sync::Mutex<()>,
    renewal: Mutex<Option<JoinHandle<()>>>,
}

impl EntryInner {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn stop_renewal(&self) {
        if let Some(task) = lock(&self.renewal).take() {
            task.abort();
        }
    }

    fn encoded(&self) -> Result<String, StoreError> {
        encode(&lock(&self.record))
    }
}

/// Handle to a joined record. Dropping it stops renewal without removing
/// the record, which then expires on its own.
pub struct RegistryEntry {
    registry: ServiceRegistry,
    inner: Arc<EntryInner>,
}

impl RegistryEntry {
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn record(&self) -> ServiceRecord {
        lock(&self.inner.record).clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    pub async fn leave(&self) -> Result<(), StoreError> {
        self.registry.leave(self).await
    }

    /// Rewrite the record with a new job count and a fresh lease.
    /// No join notification is sent; the catalog picks it up on refresh.
    pub async fn update_job_count(&self, job_count: u32) -> Result<(), StoreError> {
        let _writes = self.inner.writes.lock().await;
        if self.inner.is_destroyed() {
            return Ok(());
        }
        let value = {
            let mut record = lock(&self.inner.record);
            record.job_count = job_count;
            encode(&record)?
        };
        self.registry
            .store
            .set_with_ttl(&self.inner.key, &value, self.registry.settings.lease_ttl())
            .await
    }
}

impl Drop for RegistryEntry {
    fn drop(&mut self) {
        self.inner.stop_renewal();
    }
}

// ── Renewal ───────────────────────────────────────────────────────────────────

async fn renew(registry: ServiceRegistry, inner: Arc<EntryInner>) {
    let settings = &registry.settings;
    let store = &registry.store;
    let interval = settings.renew_interval();

    loop {
        tokio::time::sleep(interval).await;
        if inner.is_destroyed() {
            return;
        }

        match store.expire(&inner.key, settings.lease_ttl()).await {
            Ok(true) => {
                tracing::debug!(key = %inner.key, "lease renewed");
                continue;
            }
            Ok(false) => tracing::warn!(key = %inner.key, "lease lost, recreating"),
            Err(e) => tracing::warn!(key = %inner.key, error = %e, "lease renewal failed, recreating"),
        }

        loop {
            tokio::time::sleep(settings.recreate_backoff()).await;
            let _writes = inner.writes.lock().await;
            if inner.is_destroyed() {
                return;
            }
            let result = match inner.encoded() {
                Ok(value) => store.set_with_ttl(&inner.key, &value, settings.lease_ttl()).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    tracing::info!(key = %inner.key, "lease recreated");
                    break;
                }
                Err(e) => tracing::warn!(key = %inner.key, error = %e, "lease recreate failed"),
            }
        }
    }
}

fn encode(record: &ServiceRecord) -> Result<String, StoreError> {
    serde_json::to_string(record).map_err(|e| StoreError::Codec(e.to_string()))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
