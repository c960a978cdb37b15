//! Device simulator that feeds synthetic telemetry into the queue

use std::time::Duration;

use chrono::Utc;
use deadpool_redis::Pool;
use rand::Rng;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::db::RedisPool;
use crate::error::Result;
use crate::models::{TelemetryMessage, TelemetryMetrics};

use super::queue::PAYLOAD_FIELD;

/// Pushes one randomized heartbeat per device onto the stream every interval
pub struct Simulator {
    pool: Pool,
    stream: String,
    devices: Vec<Uuid>,
    interval: Duration,
}

impl Simulator {
    /// Create a simulator for the given devices
    pub fn new(redis: &RedisPool, stream: impl Into<String>, devices: Vec<Uuid>, interval: Duration) -> Self {
        Self {
            pool: redis.pool().clone(),
            stream: stream.into(),
            devices,
            interval,
        }
    }

    /// Produce a plausible heartbeat for `device_id`
    pub fn sample<R: Rng + ?Sized>(device_id: Uuid, rng: &mut R) -> TelemetryMessage {
        TelemetryMessage {
            device_id,
            metrics: TelemetryMetrics {
                cpu: rng.gen_range(0.0..100.0),
                ram: rng.gen_range(0.0..100.0),
                disk_free: rng.gen_range(0.0..100.0),
                temperature: rng.gen_range(20.0..80.0),
                latency: rng.gen_range(0..500),
                connectivity: rng.gen_range(0..=1),
            },
            boot_time: Utc::now() - chrono::Duration::seconds(rng.gen_range(0..86_400)),
        }
    }

    /// Push one heartbeat per device. Returns how many were enqueued.
    pub async fn publish_cycle(&self) -> Result<usize> {
        let mut conn = self.pool.get().await?;
        let mut sent = 0;

        for device_id in &self.devices {
            let body = serde_json::to_string(&Self::sample(*device_id, &mut rand::thread_rng()))?;
            match conn
                .xadd::<_, _, _, _, String>(&self.stream, "*", &[(PAYLOAD_FIELD, body)])
                .await
            {
                Ok(entry_id) => {
                    debug!(device_id = %device_id, entry_id = %entry_id, "Enqueued heartbeat");
                    sent += 1;
                }
                Err(e) => error!(device_id = %device_id, error = %e, "Failed to enqueue heartbeat"),
            }
        }

        Ok(sent)
    }

    /// Run cycles until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(devices = self.devices.len(), interval = ?self.interval, "Starting heartbeat simulator");
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.devices.is_empty() {
                info!("No devices configured, waiting");
                continue;
            }

            match self.publish_cycle().await {
                Ok(sent) => info!(sent, "Completed heartbeat cycle"),
                Err(e) => error!(error = %e, "Heartbeat cycle failed"),
            }
        }

        info!("Simulator stopped");
        Ok(())
    }
}
