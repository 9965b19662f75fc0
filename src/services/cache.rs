use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use uuid::Uuid;

/// Key holding the single-flight lock for a job.
pub fn job_lock_key(job_id: Uuid) -> String {
    format!("lock:job:{job_id}")
}

/// Key holding recognized text for an image. Content-addressed, so
/// byte-identical uploads share one entry.
pub fn ocr_cache_key(image_hash: &str) -> String {
    format!("ocr:{image_hash}")
}

/// Shared key-value store with TTLs and an atomic set-if-absent.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Returns `true` if the key was absent and is now set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Redis-backed [`SharedCache`].
pub struct RedisCache {
    client: redis::Client,
}

impl RedisCache {
    pub fn new(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CacheError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

/// Redis rejects `EX 0`; anything shorter than a second rounds up.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl SharedCache for RedisCache {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_namespaced() {
        let id = Uuid::nil();
        assert_eq!(job_lock_key(id), "lock:job:00000000-0000-0000-0000-000000000000");
        assert_eq!(ocr_cache_key("abc123"), "ocr:abc123");
    }

    #[test]
    fn test_sub_second_ttl_rounds_up() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(600)), 600);
    }
}
