//! Redis binding of [`SharedStore`].
//!
//! Commands go through a `deadpool-redis` pool. SUBSCRIBE needs a dedicated
//! connection, so every `subscribe` call opens its own `redis` pub/sub client.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::AsyncCommands;
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;

use super::store::{SharedStore, StoreError, StoreResult};

const POOL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RedisStore {
    pool: Pool,
    redis_url: String,
}

impl RedisStore {
    /// Build the connection pool. Connections are opened lazily, so this only
    /// fails on an invalid configuration.
    pub fn connect(redis_url: &str, pool_size: usize) -> StoreResult<Self> {
        let mut redis_config = Config::from_url(redis_url);
        let mut pool_config = PoolConfig::new(pool_size.max(1));
        pool_config.timeouts.wait = Some(POOL_TIMEOUT);
        pool_config.timeouts.create = Some(POOL_TIMEOUT);
        pool_config.timeouts.recycle = Some(POOL_TIMEOUT);
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            pool,
            redis_url: redis_url.to_string(),
        })
    }

    async fn conn(&self) -> StoreResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

fn command_error(e: deadpool_redis::redis::RedisError) -> StoreError {
    StoreError::Command(e.to_string())
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        conn.get::<_, Option<String>>(key)
            .await
            .map_err(command_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await
                .map_err(command_error),
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(command_error),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key).await.map_err(command_error)
    }

    async fn set_add(&self, key: &str, members: &[String]) -> StoreResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        conn.sadd::<_, _, ()>(key, members)
            .await
            .map_err(command_error)
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> StoreResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        conn.srem::<_, _, ()>(key, members)
            .await
            .map_err(command_error)
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        conn.smembers::<_, Vec<String>>(key)
            .await
            .map_err(command_error)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        conn.publish::<_, _, ()>(channel, message)
            .await
            .map_err(command_error)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<BoxStream<'static, String>> {
        let client = ::redis::Client::open(self.redis_url.as_str())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| StoreError::Subscribe(e.to_string()))?;

        Ok(pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping undecodable pub/sub message");
                        None
                    }
                }
            })
            .boxed())
    }
}
