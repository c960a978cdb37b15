//! Durable telemetry queue backed by a Redis Stream consumer group

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::QueueConfig;
use crate::db::RedisPool;
use crate::error::Result;

/// Stream entry field holding the JSON body
pub const PAYLOAD_FIELD: &str = "payload";

/// One message taken from the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Broker-assigned id, used for acknowledgement
    pub id: String,
    /// Raw JSON body
    pub body: Vec<u8>,
}

/// An at-least-once queue of telemetry messages
#[async_trait]
pub trait TelemetryQueue: Send {
    /// Wait for the next batch. An empty batch means the wait timed out.
    async fn receive(&mut self) -> Result<Vec<QueueMessage>>;

    /// Acknowledge a message so it is never redelivered
    async fn ack(&mut self, id: &str) -> Result<()>;
}

/// Where the next read starts: this consumer's pending list or new entries.
///
/// A pass over the pending list runs on start and again whenever
/// `interval` has elapsed since the previous pass completed.
#[derive(Debug)]
struct PendingReplay {
    /// Position in the pending list while a pass is in progress
    cursor: Option<String>,
    last_pass: Instant,
    interval: Duration,
}

impl PendingReplay {
    fn new(interval: Duration, now: Instant) -> Self {
        Self {
            cursor: Some("0".to_string()),
            last_pass: now,
            interval,
        }
    }

    /// Id to read the pending list from, or `None` to read new entries
    fn start(&mut self, now: Instant) -> Option<&str> {
        if self.cursor.is_none() && now.duration_since(self.last_pass) >= self.interval {
            self.cursor = Some("0".to_string());
        }
        self.cursor.as_deref()
    }

    /// Record the last id of a pending batch. Returns true once the pass is done.
    fn advance(&mut self, last_id: Option<&str>, now: Instant) -> bool {
        match last_id {
            Some(id) => {
                self.cursor = Some(id.to_string());
                false
            }
            None => {
                self.cursor = None;
                self.last_pass = now;
                true
            }
        }
    }
}

/// Reads telemetry from a Redis Stream through a consumer group.
///
/// Entries this consumer received but never acknowledged are read back on
/// start and then every `replay_interval`, so a reading whose persistence
/// failed is retried without a restart.
pub struct RedisStreamQueue {
    conn: ConnectionManager,
    config: QueueConfig,
    replay: PendingReplay,
}

impl RedisStreamQueue {
    /// Connect and make sure the stream and the consumer group exist
    pub async fn connect(redis: &RedisPool, config: QueueConfig) -> Result<Self> {
        let mut conn = ConnectionManager::new(redis.client().clone()).await?;

        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&config.stream, &config.group, "$")
            .await;
        match created {
            Ok(()) => info!(stream = %config.stream, group = %config.group, "Created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %config.stream, group = %config.group, "Consumer group exists");
            }
            Err(e) => return Err(e.into()),
        }

        let replay = PendingReplay::new(config.replay_interval, Instant::now());
        Ok(Self { conn, config, replay })
    }

    fn to_message(entry: StreamId) -> QueueMessage {
        let body = entry
            .get::<Vec<u8>>(PAYLOAD_FIELD)
            .unwrap_or_default();
        QueueMessage { id: entry.id, body }
    }
}

#[async_trait]
impl TelemetryQueue for RedisStreamQueue {
    async fn receive(&mut self) -> Result<Vec<QueueMessage>> {
        let mut options = StreamReadOptions::default()
            .group(&self.config.group, &self.config.consumer)
            .count(self.config.batch_size);

        let now = Instant::now();
        let (start, replaying) = match self.replay.start(now) {
            Some(cursor) => (cursor.to_string(), true),
            None => {
                let block_ms = usize::try_from(self.config.block.as_millis()).unwrap_or(usize::MAX);
                options = options.block(block_ms);
                (">".to_string(), false)
            }
        };

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.config.stream], &[&start], &options)
            .await?;

        let entries: Vec<StreamId> = reply
            .map(|r| r.keys.into_iter().flat_map(|key| key.ids).collect())
            .unwrap_or_default();

        if replaying && self.replay.advance(entries.last().map(|e| e.id.as_str()), now) {
            debug!(stream = %self.config.stream, "Pending entries replayed");
        }

        Ok(entries.into_iter().map(Self::to_message).collect())
    }

    async fn ack(&mut self, id: &str) -> Result<()> {
        let _: usize = self
            .conn
            .xack(&self.config.stream, &self.config.group, &[id])
            .await?;
        Ok(())
    }
}
