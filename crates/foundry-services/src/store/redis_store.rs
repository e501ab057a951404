//! Redis registry store.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::{RegistryStore, StoreError, StoreMessage};

const SUBSCRIPTION_BUFFER: usize = 256;

pub struct RedisStore {
    client: redis::Client,
    connection_manager: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(map_err)?;
        let connection_manager = redis::aio::ConnectionManager::new(client.clone())
            .await
            .map_err(map_err)?;
        Ok(Self {
            client,
            connection_manager,
        })
    }
}

fn map_err(e: redis::RedisError) -> StoreError {
    match e.kind() {
        redis::ErrorKind::TypeError => StoreError::Codec(e.to_string()),
        _ => StoreError::Unavailable(e.to_string()),
    }
}

/// Redis takes whole seconds; never round a lease down to zero.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Escape glob metacharacters so a prefix matches literally in KEYS.
fn glob_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

#[async_trait]
impl RegistryStore for RedisStore {
    async fn set_and_publish(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        channel: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection_manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SETEX")
            .arg(key)
            .arg(ttl_secs(ttl))
            .arg(value)
            .ignore()
            .cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn delete_and_publish(
        &self,
        key: &str,
        channel: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection_manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(key)
            .ignore()
            .cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection_manager.clone();
        let extended: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(extended == 1)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection_manager.clone();
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs(ttl))
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("KEYS")
            .arg(glob_prefix(prefix))
            .query_async(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection_manager.clone();
        redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn subscribe(
        &self,
        channels: &[&str],
    ) -> Result<mpsc::Receiver<StoreMessage>, StoreError> {
        // Pub/sub needs a dedicated connection; the manager is multiplexed.
        let mut pubsub = self.client.get_async_pubsub().await.map_err(map_err)?;
        for channel in channels {
            pubsub.subscribe(*channel).await.map_err(map_err)?;
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable pub/sub payload");
                        continue;
                    }
                };
                let message = StoreMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            tracing::debug!("redis subscription closed");
        });

        Ok(rx)
    }
}
