//! Telemetry data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::rule::Parameter;

/// Health metrics reported by a device in one heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMetrics {
    /// CPU usage in percent
    pub cpu: f64,
    /// RAM usage in percent
    pub ram: f64,
    /// Free disk space in percent
    pub disk_free: f64,
    /// Temperature in degrees Celsius
    pub temperature: f64,
    /// Round-trip latency in milliseconds
    pub latency: i64,
    /// 1 when the device has connectivity, 0 otherwise
    pub connectivity: i64,
}

impl TelemetryMetrics {
    /// Value of a rule parameter, `None` for parameters outside the fixed set
    #[allow(clippy::cast_precision_loss)]
    pub fn value(&self, parameter: Parameter) -> Option<f64> {
        match parameter {
            Parameter::Cpu => Some(self.cpu),
            Parameter::Ram => Some(self.ram),
            Parameter::DiskFree => Some(self.disk_free),
            Parameter::Temperature => Some(self.temperature),
            Parameter::Latency => Some(self.latency as f64),
            Parameter::Connectivity => Some(self.connectivity as f64),
            Parameter::Unknown => None,
        }
    }
}

/// Telemetry message as it arrives on the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryMessage {
    /// Reporting device
    pub device_id: Uuid,

    /// Reported metrics
    #[serde(flatten)]
    pub metrics: TelemetryMetrics,

    /// When the device last booted
    pub boot_time: DateTime<Utc>,
}

impl TelemetryMessage {
    /// Decode a queue message body
    pub fn from_slice(body: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// A persisted telemetry reading. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    /// Unique identifier assigned at ingestion
    pub id: Uuid,

    /// Reporting device
    pub device_id: Uuid,

    /// Reported metrics
    #[serde(flatten)]
    pub metrics: TelemetryMetrics,

    /// When the device last booted
    pub boot_time: DateTime<Utc>,

    /// When the platform received the reading
    pub received_at: DateTime<Utc>,
}

impl TelemetryReading {
    /// Stamp a queue message as received now
    pub fn received(message: TelemetryMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: message.device_id,
            metrics: message.metrics,
            boot_time: message.boot_time,
            received_at: Utc::now(),
        }
    }
}

/// A registered device, as known to the device-ownership collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Device identifier
    pub id: Uuid,
    /// Serial number
    pub serial: String,
    /// Owning user
    pub owner: super::OwnerId,
}
