//! Telemetry ingestion
//!
//! Devices push heartbeats onto a durable queue. The ingestor takes them off
//! one by one, persists them and hands each reading to the rule evaluator.

mod ingestor;
mod queue;
mod simulator;

pub use ingestor::{DropReason, Outcome, TelemetryIngestor};
pub use queue::{QueueMessage, RedisStreamQueue, TelemetryQueue, PAYLOAD_FIELD};
pub use simulator::Simulator;
