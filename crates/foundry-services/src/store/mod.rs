//! Registry store — the shared key/value + pub/sub backend behind the
//! service registry and catalog.
//!
//! Two backends: `RedisStore` for real deployments and `MemoryStore` for a
//! single process (dev mode and tests). Both honour key TTLs and deliver
//! published messages to every active subscriber.

mod memory;
mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store codec error: {0}")]
    Codec(String),
}

/// One message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

#[async_trait]
pub trait RegistryStore: Send + Sync + 'static {
    /// SET key value EX ttl + PUBLISH channel message, as one transaction.
    async fn set_and_publish(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        channel: &str,
        message: &str,
    ) -> Result<(), StoreError>;

    /// DEL key + PUBLISH channel message, as one transaction.
    async fn delete_and_publish(
        &self,
        key: &str,
        channel: &str,
        message: &str,
    ) -> Result<(), StoreError>;

    /// Extend the TTL of an existing key. `false` if the key is gone.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// SET key value EX ttl, no notification.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration)
        -> Result<(), StoreError>;

    /// All live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Values for `keys`, position for position. Missing keys yield `None`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    /// Subscribe to `channels`. The receiver closes when the subscription
    /// is lost.
    async fn subscribe(
        &self,
        channels: &[&str],
    ) -> Result<mpsc::Receiver<StoreMessage>, StoreError>;
}

/// Open the store named by `endpoint`: `memory` or a Redis address.
pub async fn connect(endpoint: &str) -> Result<Arc<dyn RegistryStore>, StoreError> {
    if endpoint.eq_ignore_ascii_case("memory") {
        tracing::info!("using in-memory registry store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let url = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("redis://{endpoint}")
    };
    let store = RedisStore::connect(&url).await?;
    tracing::info!(endpoint = %url, "connected to registry store");
    Ok(Arc::new(store))
}
