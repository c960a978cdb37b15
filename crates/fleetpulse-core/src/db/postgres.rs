//! PostgreSQL-backed collaborators

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, warn};
use uuid::Uuid;

use super::{DeviceDirectory, ReadingSink, RuleStore};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::models::{Condition, Device, NotificationRule, OwnerId, TelemetryReading};

/// PostgreSQL store for devices, rules and readings
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new PostgreSQL connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    uuid: Uuid,
    sn: String,
    user_id: Uuid,
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: Uuid,
    user_id: Uuid,
    name: String,
    description: Option<String>,
    enabled: bool,
    conditions: serde_json::Value,
    device_ids: Option<serde_json::Value>,
}

impl RuleRow {
    /// Decode the JSON columns. Rows that do not decode are skipped by the caller.
    fn into_rule(self) -> std::result::Result<NotificationRule, serde_json::Error> {
        let conditions: Vec<Condition> = serde_json::from_value(self.conditions)?;
        let device_ids: Vec<Uuid> = match self.device_ids {
            Some(serde_json::Value::Null) | None => Vec::new(),
            Some(raw) => serde_json::from_value(raw)?,
        };

        Ok(NotificationRule {
            id: self.id,
            owner: OwnerId::from(self.user_id),
            name: self.name,
            description: self.description.unwrap_or_default(),
            enabled: self.enabled,
            conditions,
            device_ids,
        })
    }
}

#[async_trait]
impl DeviceDirectory for PgStore {
    async fn find_device(&self, device_id: Uuid) -> Result<Device> {
        let row: Option<DeviceRow> =
            sqlx::query_as("SELECT uuid, sn, user_id FROM devices WHERE uuid = $1")
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| Error::lookup("device", device_id, e.to_string()))?;

        let row = row.ok_or_else(|| Error::lookup("device", device_id, "not found"))?;

        Ok(Device {
            id: row.uuid,
            serial: row.sn,
            owner: OwnerId::from(row.user_id),
        })
    }
}

#[async_trait]
impl RuleStore for PgStore {
    async fn active_rules(&self, owner: &OwnerId) -> Result<Vec<NotificationRule>> {
        let owner_uuid = Uuid::parse_str(owner.as_str())
            .map_err(|e| Error::lookup("owner", owner, e.to_string()))?;

        let rows: Vec<RuleRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, name, description, enabled, conditions, device_ids
            FROM notifications
            WHERE user_id = $1 AND enabled = true
            "#,
        )
        .bind(owner_uuid)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::lookup("rules", owner, e.to_string()))?;

        let rules = rows
            .into_iter()
            .filter_map(|row| {
                let rule_id = row.id;
                row.into_rule()
                    .map_err(|e| warn!(rule_id = %rule_id, error = %e, "Skipping undecodable rule"))
                    .ok()
            })
            .collect();

        Ok(rules)
    }
}

#[async_trait]
impl ReadingSink for PgStore {
    async fn persist(&self, reading: &TelemetryReading) -> Result<()> {
        let created_at: DateTime<Utc> = reading.received_at;

        sqlx::query(
            r#"
            INSERT INTO heartbeats (
                id, device_id, cpu, ram, disk_free, temperature,
                latency, connectivity, boot_time, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(reading.id)
        .bind(reading.device_id)
        .bind(reading.metrics.cpu)
        .bind(reading.metrics.ram)
        .bind(reading.metrics.disk_free)
        .bind(reading.metrics.temperature)
        .bind(reading.metrics.latency)
        .bind(reading.metrics.connectivity)
        .bind(reading.boot_time)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Operator, Parameter};
    use serde_json::json;

    fn row(conditions: serde_json::Value, device_ids: Option<serde_json::Value>) -> RuleRow {
        RuleRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "High CPU".to_string(),
            description: None,
            enabled: true,
            conditions,
            device_ids,
        }
    }

    #[test]
    fn test_rule_row_decodes() {
        let device = Uuid::new_v4();
        let rule = row(
            json!([{"parameter": "cpu", "operator": ">", "value": 70.0}]),
            Some(json!([device])),
        )
        .into_rule()
        .unwrap();

        assert_eq!(rule.conditions, vec![Condition::new(Parameter::Cpu, Operator::Gt, 70.0)]);
        assert_eq!(rule.device_ids, vec![device]);
        assert_eq!(rule.description, "");
    }

    #[test]
    fn test_null_scope_means_all_devices() {
        let rule = row(json!([]), Some(serde_json::Value::Null)).into_rule().unwrap();
        assert!(rule.device_ids.is_empty());
        assert!(rule.applies_to(Uuid::new_v4()));
    }

    #[test]
    fn test_malformed_conditions_fail() {
        assert!(row(json!({"parameter": "cpu"}), None).into_rule().is_err());
    }
}
