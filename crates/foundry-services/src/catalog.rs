//! Service catalog — cached view of every live record in the registry.
//!
//! Snapshots are rebuilt wholesale and shared as `Arc<Vec<_>>`. At most one
//! refresh runs at a time: callers that arrive while it is running await
//! the same shared future. Join/leave notifications drop the snapshot so
//! the next caller sees topology changes after a single round-trip.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use foundry_core::record::{JOIN_CHANNEL, KEY_PREFIX, LEAVE_CHANNEL};
use foundry_core::ServiceRecord;

use crate::store::{RegistryStore, StoreError, StoreMessage};

pub type Snapshot = Arc<Vec<ServiceRecord>>;

type Refresh = Shared<BoxFuture<'static, Result<Snapshot, StoreError>>>;

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct ServiceCatalog {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn RegistryStore>,
    freshness: Duration,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    snapshot: Option<(Snapshot, Instant)>,
    inflight: Option<Refresh>,
    /// Bumped on every invalidation; a refresh started under an older
    /// generation must not install its result.
    generation: u64,
}

impl ServiceCatalog {
    pub fn new(store: Arc<dyn RegistryStore>, freshness: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                freshness,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Every live service record. Served from cache while fresh.
    pub async fn get_services(&self) -> Result<Snapshot, StoreError> {
        let refresh = {
            let mut state = self.inner.lock();
            if let Some((snapshot, fetched_at)) = &state.snapshot {
                if fetched_at.elapsed() < self.inner.freshness {
                    return Ok(snapshot.clone());
                }
            }
            match &state.inflight {
                Some(refresh) => refresh.clone(),
                None => {
                    let refresh = self.start_refresh(state.generation);
                    state.inflight = Some(refresh.clone());
                    refresh
                }
            }
        };
        refresh.await
    }

    /// Drop the cached snapshot and detach any running refresh.
    pub fn invalidate(&self) {
        let mut state = self.inner.lock();
        state.generation += 1;
        state.snapshot = None;
        state.inflight = None;
    }

    pub fn is_cached(&self) -> bool {
        self.inner.lock().snapshot.is_some()
    }

    /// Subscribe to join/leave notifications and invalidate on each one.
    /// The initial subscription error is returned; later losses of the
    /// subscription are retried in the background.
    pub async fn listen(&self) -> Result<JoinHandle<()>, StoreError> {
        let mut messages = self
            .inner
            .store
            .subscribe(&[JOIN_CHANNEL, LEAVE_CHANNEL])
            .await?;
        let catalog = self.clone();

        Ok(tokio::spawn(async move {
            loop {
                while let Some(msg) = messages.recv().await {
                    catalog.handle_message(&msg);
                }
                tracing::warn!("catalog subscription lost, resubscribing");
                messages = loop {
                    tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
                    // anything may have changed while we were deaf
                    catalog.invalidate();
                    match catalog
                        .inner
                        .store
                        .subscribe(&[JOIN_CHANNEL, LEAVE_CHANNEL])
                        .await
                    {
                        Ok(rx) => break rx,
                        Err(e) => tracing::warn!(error = %e, "catalog resubscribe failed"),
                    }
                };
            }
        }))
    }

    /// Returns true if the message invalidated the snapshot.
    fn handle_message(&self, msg: &StoreMessage) -> bool {
        match msg.channel.as_str() {
            JOIN_CHANNEL => match ServiceRecord::parse(Some(&msg.payload)) {
                Some(record) => {
                    tracing::debug!(key = %record.key(), "service joined");
                    self.invalidate();
                    true
                }
                None => {
                    tracing::warn!(payload = %msg.payload, "ignoring malformed join notification");
                    false
                }
            },
            LEAVE_CHANNEL if msg.payload.starts_with(KEY_PREFIX) => {
                tracing::debug!(key = %msg.payload, "service left");
                self.invalidate();
                true
            }
            _ => {
                tracing::warn!(channel = %msg.channel, "ignoring unexpected notification");
                false
            }
        }
    }

    fn start_refresh(&self, generation: u64) -> Refresh {
        let inner = self.inner.clone();
        async move {
            let result = fetch(inner.store.as_ref()).await;
            if let Err(e) = &result {
                tracing::warn!(error = %e, "catalog refresh failed");
            }
            let mut state = inner.lock();
            if state.generation == generation {
                state.inflight = None;
                match &result {
                    Ok(snapshot) => state.snapshot = Some((snapshot.clone(), Instant::now())),
                    Err(_) => state.snapshot = None,
                }
            }
            result
        }
        .boxed()
        .shared()
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn fetch(store: &dyn RegistryStore) -> Result<Snapshot, StoreError> {
    let keys = store.keys(KEY_PREFIX).await?;
    let values = store.get_many(&keys).await?;
    // Keys that expired between KEYS and MGET come back empty.
    let records: Vec<ServiceRecord> = values
        .iter()
        .filter_map(|v| ServiceRecord::parse(v.as_deref()))
        .collect();
    tracing::debug!(keys = keys.len(), records = records.len(), "catalog refreshed");
    Ok(Arc::new(records))
}
