use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::store::{BucketState, CounterStore};

/// Redis backend configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
        }
    }
}

/// Remote counter store backed by Redis. Counter mutations run as atomic
/// MULTI/EXEC pipelines; every command is bounded by the command timeout
/// and failures surface as `StoreUnavailable`.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    config: RedisConfig,
}

impl RedisCounterStore {
    /// Connect to Redis and verify the connection with a PING
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        info!("Connecting to Redis at {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            EngineError::StoreUnavailable(e.to_string())
        })?;

        let connection = tokio::time::timeout(
            config.connection_timeout,
            client.get_connection_manager(),
        )
        .await
        .map_err(|_| {
            warn!(
                "Timeout establishing Redis connection ({}s)",
                config.connection_timeout.as_secs()
            );
            EngineError::StoreUnavailable("timeout establishing Redis connection".to_string())
        })?
        .map_err(|e| {
            warn!("Failed to establish Redis connection: {}", e);
            EngineError::StoreUnavailable(e.to_string())
        })?;

        let store = Self { connection, config };
        store.health_check().await?;
        info!("Redis counter store initialized");
        Ok(store)
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        tokio::time::timeout(self.config.command_timeout, fut)
            .await
            .map_err(|_| EngineError::StoreUnavailable("Redis command timed out".to_string()))?
            .map_err(EngineError::from)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut conn = self.connection.clone();

        // SET NX seeds the key with its TTL only when absent, so later
        // increments never re-arm the expiry. Both commands run in one
        // MULTI/EXEC block.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(key)
            .arg(0)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .arg("NX")
            .ignore()
            .incr(key, 1u64);

        let (count,): (u64,) = self.bounded(pipe.query_async(&mut conn)).await?;
        Ok(count)
    }

    async fn get_bucket(&self, key: &str) -> Result<Option<BucketState>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = self.bounded(conn.get(key)).await?;
        Ok(raw.and_then(|json| decode_bucket(key, &json)))
    }

    async fn set_bucket(&self, key: &str, state: BucketState, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let json = serde_json::to_string(&state)?;
        let () = self
            .bounded(conn.pset_ex(key, json, ttl.as_millis() as u64))
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        self.bounded(redis::cmd("PING").query_async::<_, ()>(&mut conn))
            .await?;
        Ok(())
    }
}

/// A bucket payload that no longer decodes (corrupt write, legacy layout)
/// reads as absent so the algorithm rebuilds a fresh bucket, rather than
/// failing the decision.
fn decode_bucket(key: &str, json: &str) -> Option<BucketState> {
    match serde_json::from_str(json) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(key, error = %e, "Discarding undecodable bucket payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_bucket_roundtrip() {
        let state = BucketState::full(50.0, 0.001, 1_000);
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(decode_bucket("k", &json), Some(state));
    }

    #[test]
    fn test_corrupt_bucket_payload_reads_as_absent() {
        assert_eq!(decode_bucket("k", "not json"), None);
        assert_eq!(decode_bucket("k", "{\"tokens\":\"many\"}"), None);
        assert_eq!(decode_bucket("k", "{}"), None);
    }

    #[test]
    fn test_default_config() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.command_timeout, Duration::from_secs(1));
    }
}
