//! Alert data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Device, NotificationRule, OwnerId, TelemetryMetrics, TelemetryReading};

/// An alert produced when a rule matches a reading.
///
/// Only ever exists as a message on the broker; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    /// The rule that matched
    #[serde(rename = "id")]
    pub rule_id: Uuid,

    /// Owner of the rule and the device
    pub user_id: OwnerId,

    /// Rule name
    pub name: String,

    /// Rule description
    pub description: String,

    /// Device that reported the reading
    pub device_id: Uuid,

    /// Device serial number
    pub device_sn: String,

    /// Reading value for the rule's first condition
    pub triggered_value: f64,

    /// Snapshot of the reading's metrics
    #[serde(rename = "heartbeat_data")]
    pub telemetry: TelemetryMetrics,

    /// When the alert was generated
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    /// Build the alert for a matched rule
    pub fn new(rule: &NotificationRule, device: &Device, reading: &TelemetryReading) -> Self {
        Self {
            rule_id: rule.id,
            user_id: device.owner.clone(),
            name: rule.name.clone(),
            description: rule.description.clone(),
            device_id: device.id,
            device_sn: device.serial.clone(),
            triggered_value: rule.triggered_value(&reading.metrics),
            telemetry: reading.metrics,
            timestamp: Utc::now(),
        }
    }

    /// Broker topic for this alert
    pub fn topic(&self) -> String {
        self.user_id.topic()
    }
}

/// The part of a broker payload the hub needs to route it
#[derive(Debug, Clone, Deserialize)]
pub struct AlertEnvelope {
    /// Recipient
    pub user_id: OwnerId,
}
