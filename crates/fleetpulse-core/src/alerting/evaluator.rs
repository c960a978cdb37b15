//! Rule evaluation engine

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::db::RuleStore;
use crate::error::Result;
use crate::models::{AlertEvent, Device, TelemetryReading};

use super::publisher::AlertPublisher;

/// Outcome of evaluating one reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// Enabled rules whose scope covers the device
    pub candidates: usize,
    /// Candidates whose conditions all held
    pub matched: usize,
    /// Matches the broker accepted
    pub published: usize,
}

/// Matches readings against the owner's active rules
#[derive(Clone)]
pub struct RuleEvaluator {
    rules: Arc<dyn RuleStore>,
    publisher: Arc<dyn AlertPublisher>,
}

impl RuleEvaluator {
    /// Create a new evaluator
    pub fn new(rules: Arc<dyn RuleStore>, publisher: Arc<dyn AlertPublisher>) -> Self {
        Self { rules, publisher }
    }

    /// Evaluate a persisted reading from `device`.
    ///
    /// Only the rule lookup can fail; publish failures are logged and the
    /// alert is dropped.
    pub async fn evaluate(&self, reading: &TelemetryReading, device: &Device) -> Result<Evaluation> {
        let rules = self.rules.active_rules(&device.owner).await?;
        let mut outcome = Evaluation::default();

        for rule in rules
            .iter()
            .filter(|rule| rule.enabled && rule.applies_to(device.id))
        {
            outcome.candidates += 1;

            if !rule.matches(&reading.metrics) {
                continue;
            }
            outcome.matched += 1;

            let event = AlertEvent::new(rule, device, reading);
            match self.publisher.publish(&event).await {
                Ok(()) => {
                    outcome.published += 1;
                    metrics::counter!("fleetpulse_alerts_published_total").increment(1);
                    info!(
                        owner = %event.user_id,
                        rule_id = %rule.id,
                        device_sn = %device.serial,
                        value = event.triggered_value,
                        "Alert published"
                    );
                }
                Err(e) => {
                    metrics::counter!("fleetpulse_alerts_publish_failed_total").increment(1);
                    warn!(
                        owner = %event.user_id,
                        rule_id = %rule.id,
                        error = %e,
                        "Failed to publish alert, dropping it"
                    );
                }
            }
        }

        debug!(
            device_id = %device.id,
            total = rules.len(),
            candidates = outcome.candidates,
            matched = outcome.matched,
            "Evaluated reading"
        );

        Ok(outcome)
    }
}
