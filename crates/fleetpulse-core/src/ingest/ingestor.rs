//! Telemetry consume loop

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerting::{Evaluation, RuleEvaluator};
use crate::config::AckPolicy;
use crate::db::{DeviceDirectory, ReadingSink};
use crate::models::{TelemetryMessage, TelemetryReading};

use super::queue::{QueueMessage, TelemetryQueue};

/// First delay after a failed queue read
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
/// Upper bound for the read retry delay
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Why a message was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Body was not a valid telemetry message
    Malformed,
    /// Device could not be resolved
    UnknownDevice,
    /// Reading could not be persisted
    PersistFailed,
}

impl DropReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::UnknownDevice => "unknown_device",
            Self::PersistFailed => "persist_failed",
        }
    }
}

/// What happened to one queue message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Persisted and evaluated
    Processed(Evaluation),
    /// Persisted, but rule evaluation failed
    EvaluationFailed,
    /// Discarded before evaluation
    Dropped(DropReason),
}

/// Consumes telemetry from a durable queue, persists it and runs rule
/// evaluation for every reading.
pub struct TelemetryIngestor<Q> {
    queue: Q,
    devices: Arc<dyn DeviceDirectory>,
    sink: Arc<dyn ReadingSink>,
    evaluator: RuleEvaluator,
    ack_policy: AckPolicy,
}

impl<Q: TelemetryQueue> TelemetryIngestor<Q> {
    /// Create a new ingestor
    pub fn new(
        queue: Q,
        devices: Arc<dyn DeviceDirectory>,
        sink: Arc<dyn ReadingSink>,
        evaluator: RuleEvaluator,
        ack_policy: AckPolicy,
    ) -> Self {
        Self {
            queue,
            devices,
            sink,
            evaluator,
            ack_policy,
        }
    }

    /// Consume until `shutdown` is cancelled.
    ///
    /// Per-message failures never end the loop. Queue read failures are
    /// retried with a bounded exponential backoff.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(ack_policy = ?self.ack_policy, "Telemetry ingestor started");
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let batch = tokio::select! {
                () = shutdown.cancelled() => break,
                batch = self.queue.receive() => batch,
            };

            match batch {
                Ok(messages) => {
                    backoff = INITIAL_BACKOFF;
                    for message in messages {
                        self.handle(message).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, retry_in = ?backoff, "Failed to read telemetry queue");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        info!("Telemetry ingestor stopped");
    }

    /// Process one message end to end
    pub async fn handle(&mut self, message: QueueMessage) -> Outcome {
        if self.ack_policy == AckPolicy::BeforePersist {
            self.ack(&message.id).await;
        }

        let parsed = match TelemetryMessage::from_slice(&message.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Discarding undecodable telemetry");
                return self.drop_message(&message.id, DropReason::Malformed).await;
            }
        };

        let device = match self.devices.find_device(parsed.device_id).await {
            Ok(device) => device,
            Err(e) => {
                warn!(device_id = %parsed.device_id, error = %e, "Discarding telemetry for unresolved device");
                return self.drop_message(&message.id, DropReason::UnknownDevice).await;
            }
        };

        let reading = TelemetryReading::received(parsed);
        if let Err(e) = self.sink.persist(&reading).await {
            error!(device_id = %reading.device_id, error = %e, "Failed to persist reading");
            // Left unacknowledged under after-persist; read back on the next pending pass.
            metrics::counter!("fleetpulse_telemetry_dropped_total", "reason" => DropReason::PersistFailed.as_str())
                .increment(1);
            return Outcome::Dropped(DropReason::PersistFailed);
        }

        if self.ack_policy == AckPolicy::AfterPersist {
            self.ack(&message.id).await;
        }
        metrics::counter!("fleetpulse_telemetry_processed_total").increment(1);

        match self.evaluator.evaluate(&reading, &device).await {
            Ok(evaluation) => {
                debug!(
                    device_id = %device.id,
                    device_sn = %device.serial,
                    matched = evaluation.matched,
                    "Processed telemetry"
                );
                Outcome::Processed(evaluation)
            }
            Err(e) => {
                error!(device_id = %device.id, error = %e, "Rule evaluation failed");
                Outcome::EvaluationFailed
            }
        }
    }

    /// Discard a message that can never succeed, acknowledging it so it is
    /// not redelivered.
    async fn drop_message(&mut self, id: &str, reason: DropReason) -> Outcome {
        if self.ack_policy == AckPolicy::AfterPersist {
            self.ack(id).await;
        }
        metrics::counter!("fleetpulse_telemetry_dropped_total", "reason" => reason.as_str())
            .increment(1);
        Outcome::Dropped(reason)
    }

    async fn ack(&mut self, id: &str) {
        if let Err(e) = self.queue.ack(id).await {
            warn!(message_id = %id, error = %e, "Failed to acknowledge telemetry");
        }
    }

    /// Give the queue back, consuming the ingestor
    pub fn into_queue(self) -> Q {
        self.queue
    }
}
