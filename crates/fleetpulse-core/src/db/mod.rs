//! Database layer for FleetPulse
//!
//! Provides connections to PostgreSQL and Redis, and the collaborator
//! interfaces the pipeline consumes: device ownership, active rules and the
//! reading sink.

mod postgres;
mod redis;

pub use self::postgres::PgStore;
pub use self::redis::RedisPool;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::models::{Device, NotificationRule, OwnerId, TelemetryReading};

/// Resolves a device to its owner
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Find a device by id. A missing device is a lookup error.
    async fn find_device(&self, device_id: Uuid) -> Result<Device>;
}

/// Read-only access to notification rules
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Enabled rules belonging to `owner`
    async fn active_rules(&self, owner: &OwnerId) -> Result<Vec<NotificationRule>>;
}

/// Durable storage for readings
#[async_trait]
pub trait ReadingSink: Send + Sync {
    /// Persist one reading
    async fn persist(&self, reading: &TelemetryReading) -> Result<()>;
}

/// Database connections bundle
#[derive(Clone)]
pub struct Database {
    /// PostgreSQL store
    pub postgres: PgStore,
    /// Redis connection pool
    pub redis: RedisPool,
}

impl Database {
    /// Connect to both backends. Fails if either is unreachable.
    pub async fn new(config: &Config) -> Result<Self> {
        let redis = RedisPool::new(&config.redis).await?;
        let postgres = PgStore::new(&config.database).await?;

        Ok(Self { postgres, redis })
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        self.postgres.health_check().await?;
        self.redis.health_check().await?;
        Ok(())
    }
}
