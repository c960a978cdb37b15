//! Notification rule data model

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use super::{OwnerId, TelemetryMetrics};

/// Telemetry parameter a condition can test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    /// CPU usage
    Cpu,
    /// RAM usage
    Ram,
    /// Free disk space
    DiskFree,
    /// Temperature
    Temperature,
    /// Latency
    Latency,
    /// Connectivity flag
    Connectivity,
    /// Anything outside the fixed set; never satisfied
    #[serde(other)]
    Unknown,
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    /// Greater than
    #[serde(rename = ">")]
    Gt,
    /// Less than
    #[serde(rename = "<")]
    Lt,
    /// Greater than or equal to
    #[serde(rename = ">=")]
    Gte,
    /// Less than or equal to
    #[serde(rename = "<=")]
    Lte,
    /// Equal to
    #[serde(rename = "==")]
    Eq,
    /// Not equal to
    #[serde(rename = "!=")]
    Ne,
    /// Anything else; never satisfied
    #[serde(other)]
    Unsupported,
}

impl Operator {
    /// Compare `value` against `threshold`.
    ///
    /// Equality is exact floating-point equality.
    #[allow(clippy::float_cmp)]
    pub fn apply(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Lt => value < threshold,
            Self::Gte => value >= threshold,
            Self::Lte => value <= threshold,
            Self::Eq => value == threshold,
            Self::Ne => value != threshold,
            Self::Unsupported => false,
        }
    }
}

/// One comparison inside a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Parameter under test
    pub parameter: Parameter,
    /// Comparison operator
    pub operator: Operator,
    /// Threshold; `None` when the stored value was not a number
    #[serde(default, deserialize_with = "numeric_or_none")]
    pub value: Option<f64>,
}

impl Condition {
    /// Build a condition with a numeric threshold
    pub fn new(parameter: Parameter, operator: Operator, value: f64) -> Self {
        Self {
            parameter,
            operator,
            value: Some(value),
        }
    }

    /// Whether the condition holds for the given metrics
    pub fn holds(&self, metrics: &TelemetryMetrics) -> bool {
        let (Some(value), Some(threshold)) = (metrics.value(self.parameter), self.value) else {
            return false;
        };
        self.operator.apply(value, threshold)
    }
}

fn numeric_or_none<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_json::Value::deserialize(deserializer)?;
    Ok(raw.as_f64())
}

/// A notification rule owned by a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRule {
    /// Unique identifier
    pub id: Uuid,

    /// Owning user
    #[serde(rename = "user_id")]
    pub owner: OwnerId,

    /// Human-readable name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: String,

    /// Whether the rule is active
    pub enabled: bool,

    /// Conditions, all of which must hold
    pub conditions: Vec<Condition>,

    /// Devices in scope; empty means every device of the owner
    #[serde(default)]
    pub device_ids: Vec<Uuid>,
}

impl NotificationRule {
    /// Whether the rule covers the given device
    pub fn applies_to(&self, device_id: Uuid) -> bool {
        self.device_ids.is_empty() || self.device_ids.contains(&device_id)
    }

    /// Whether every condition holds. Stops at the first failing condition.
    pub fn matches(&self, metrics: &TelemetryMetrics) -> bool {
        self.conditions.iter().all(|c| c.holds(metrics))
    }

    /// Value reported as the trigger: the reading's value for the first
    /// condition with a recognised parameter, 0.0 if there is none.
    pub fn triggered_value(&self, metrics: &TelemetryMetrics) -> f64 {
        self.conditions
            .iter()
            .find_map(|c| metrics.value(c.parameter))
            .unwrap_or(0.0)
    }
}
