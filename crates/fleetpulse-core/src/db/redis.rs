//! Redis connections

use deadpool_redis::{Config as PoolConfig, Pool, PoolConfig as PoolSize, Runtime};
use tracing::info;

use crate::config::RedisConfig;
use crate::error::{Error, Result};

/// Redis connection pool plus the client used for dedicated connections
/// (pattern subscriptions and blocking stream reads).
#[derive(Clone)]
pub struct RedisPool {
    pool: Pool,
    client: redis::Client,
}

impl RedisPool {
    /// Create a new Redis connection pool and verify the server answers.
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;

        let mut cfg = PoolConfig::from_url(&config.url);
        cfg.pool = Some(PoolSize::new(config.max_connections));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Pool(e.to_string()))?;

        let redis = Self { pool, client };
        redis
            .health_check()
            .await
            .map_err(|e| Error::BrokerUnavailable(format!("{}: {e}", config.url)))?;

        info!(url = %config.url, "Connected to Redis");
        Ok(redis)
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Get the client for dedicated connections
    pub fn client(&self) -> &redis::Client {
        &self.client
    }
}
