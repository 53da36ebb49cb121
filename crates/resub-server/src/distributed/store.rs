//! Shared key/value and pub/sub store used for cross-instance coordination.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur talking to the shared store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store command failed: {0}")]
    Command(String),

    #[error("Store subscribe failed: {0}")]
    Subscribe(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Pub/sub stream ended")]
    StreamEnded,
}

/// Redis-shaped store API. All writes are idempotent.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a value, expiring after `ttl` when given.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Delete a key; deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn set_add(&self, key: &str, members: &[String]) -> StoreResult<()>;

    async fn set_remove(&self, key: &str, members: &[String]) -> StoreResult<()>;

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()>;

    /// Messages published on `channel` after this call.
    async fn subscribe(&self, channel: &str) -> StoreResult<BoxStream<'static, String>>;
}

const CHANNEL_CAPACITY: usize = 1024;

/// In-process store for single-node runs and tests.
///
/// `set_available(false)` makes every call fail and ends open subscriptions,
/// which simulates a store outage.
pub struct MemoryStore {
    values: DashMap<String, (String, Option<Instant>)>,
    sets: DashMap<String, HashSet<String>>,
    channels: DashMap<String, broadcast::Sender<String>>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            sets: DashMap::new(),
            channels: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            // Dropping the senders ends every open subscription stream
            self.channels.clear();
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn check(&self) -> StoreResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".into()))
        }
    }

    fn channel(&self, name: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        let Some(entry) = self.values.get(key) else {
            return Ok(None);
        };
        let (value, expires_at) = entry.value();
        if expires_at.is_some_and(|at| at <= Instant::now()) {
            drop(entry);
            self.values.remove(key);
            return Ok(None);
        }
        Ok(Some(value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.check()?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.values
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check()?;
        self.values.remove(key);
        self.sets.remove(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, members: &[String]) -> StoreResult<()> {
        self.check()?;
        self.sets
            .entry(key.to_string())
            .or_default()
            .extend(members.iter().cloned());
        Ok(())
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> StoreResult<()> {
        self.check()?;
        if let Some(mut set) = self.sets.get_mut(key) {
            for member in members {
                set.remove(member);
            }
        }
        self.sets.remove_if(key, |_, set| set.is_empty());
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        Ok(self
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        self.check()?;
        // No subscribers is not an error
        let _ = self.channel(channel).send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<BoxStream<'static, String>> {
        self.check()?;
        let receiver = self.channel(channel).subscribe();
        Ok(BroadcastStream::new(receiver)
            .filter_map(|message| async move { message.ok() })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_expire() {
        let store = MemoryStore::new();
        store.set("k", "v", Some(Duration::from_millis(10))).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sets_and_idempotent_deletes() {
        let store = MemoryStore::new();
        store.set_add("s", &["a".into(), "b".into()]).await.unwrap();
        store.set_add("s", &["a".into()]).await.unwrap();
        store.set_remove("s", &["b".into(), "zz".into()]).await.unwrap();
        assert_eq!(store.set_members("s").await.unwrap(), vec!["a".to_string()]);

        store.delete("s").await.unwrap();
        store.delete("s").await.unwrap();
        assert!(store.set_members("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pubsub_delivers_after_subscribe() {
        let store = MemoryStore::new();
        let mut stream = store.subscribe("ch").await.unwrap();
        store.publish("ch", "hello").await.unwrap();
        assert_eq!(stream.next().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn outage_fails_calls_and_ends_streams() {
        let store = MemoryStore::new();
        let mut stream = store.subscribe("ch").await.unwrap();

        store.set_available(false);
        assert!(matches!(store.get("k").await, Err(StoreError::Unavailable(_))));
        assert!(store.publish("ch", "x").await.is_err());
        assert_eq!(stream.next().await, None);

        store.set_available(true);
        assert!(store.set("k", "v", None).await.is_ok());
    }
}
