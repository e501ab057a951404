//! In-process registry store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use super::{RegistryStore, StoreError, StoreMessage};

const BUS_CAPACITY: usize = 256;

struct Slot {
    value: String,
    expires_at: Instant,
}

/// Key/value map with per-key expiry plus a broadcast bus for pub/sub.
///
/// Expiry follows `tokio::time`, so paused-clock tests can drive it.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Slot>>,
    bus: broadcast::Sender<StoreMessage>,
    offline: AtomicBool,
    key_scans: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            bus,
            offline: AtomicBool::new(false),
            key_scans: AtomicU64::new(0),
        }
    }

    /// Simulate an outage: every call fails with `Unavailable` while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Drop a key as if the store had evicted it.
    pub fn evict(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Current value of `key`, if live.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .filter(|slot| slot.expires_at > now)
            .map(|slot| slot.value.clone())
    }

    /// Number of `keys()` scans served so far.
    pub fn key_scans(&self) -> u64 {
        self.key_scans.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        // Every critical section is a single map op, so poisoning is harmless.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn publish(&self, channel: &str, message: &str) {
        // No subscribers is not an error.
        let _ = self.bus.send(StoreMessage {
            channel: channel.to_string(),
            payload: message.to_string(),
        });
    }

    fn insert(&self, key: &str, value: &str, ttl: Duration) {
        self.lock().insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn set_and_publish(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        channel: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        self.check_online()?;
        self.insert(key, value, ttl);
        self.publish(channel, message);
        Ok(())
    }

    async fn delete_and_publish(
        &self,
        key: &str,
        channel: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        self.check_online()?;
        self.lock().remove(key);
        self.publish(channel, message);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(slot) if slot.expires_at > now => {
                slot.expires_at = now + ttl;
                Ok(true)
            }
            Some(_) => {
                entries.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.check_online()?;
        self.insert(key, value, ttl);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        self.key_scans.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|_, slot| slot.expires_at > now);
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        self.check_online()?;
        Ok(keys.iter().map(|k| self.get(k)).collect())
    }

    async fn subscribe(
        &self,
        channels: &[&str],
    ) -> Result<mpsc::Receiver<StoreMessage>, StoreError> {
        self.check_online()?;
        let channels: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
        let mut bus = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(BUS_CAPACITY);

        tokio::spawn(async move {
            loop {
                match bus.recv().await {
                    Ok(msg) => {
                        if !channels.contains(&msg.channel) {
                            continue;
                        }
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "memory store subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}
