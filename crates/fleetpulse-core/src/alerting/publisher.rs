//! Alert publishing to the broker

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use tracing::debug;

use crate::db::RedisPool;
use crate::error::{Error, Result};
use crate::models::AlertEvent;

/// Publishes alerts to the owner's topic without waiting for any consumer.
#[async_trait]
pub trait AlertPublisher: Send + Sync {
    /// Publish one alert
    async fn publish(&self, event: &AlertEvent) -> Result<()>;
}

/// Publishes alerts with Redis `PUBLISH`
#[derive(Clone)]
pub struct RedisAlertPublisher {
    pool: Pool,
}

impl RedisAlertPublisher {
    /// Create a publisher over the shared pool
    pub fn new(redis: &RedisPool) -> Self {
        Self {
            pool: redis.pool().clone(),
        }
    }
}

#[async_trait]
impl AlertPublisher for RedisAlertPublisher {
    async fn publish(&self, event: &AlertEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let topic = event.topic();

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| Error::BrokerUnavailable(e.to_string()))?;

        let receivers: i64 = conn
            .publish(&topic, payload)
            .await
            .map_err(|e| Error::BrokerUnavailable(e.to_string()))?;

        debug!(topic = %topic, receivers, "Alert published");
        Ok(())
    }
}
