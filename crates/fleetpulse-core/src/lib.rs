//! # FleetPulse
//!
//! Real-time alert delivery for IoT device fleets.
//!
//! Devices push periodic heartbeats onto a durable queue. FleetPulse
//! persists each reading, evaluates the owner's notification rules against
//! it, publishes an alert per matching rule, and pushes those alerts to the
//! owner's live WebSocket connection.
//!
//! ## Architecture
//!
//! - **Ingest**: consumes telemetry from a Redis stream consumer group
//! - **Alerting**: rule evaluation and alert publishing over Redis pub/sub
//! - **Hub**: one live connection per owner, fed from the broker
//! - **API**: health check and the WebSocket upgrade endpoint
//!
//! ## Quick Start
//!
//! ```bash
//! # Run the pipeline
//! fleetpulse serve
//!
//! # Feed it synthetic heartbeats
//! fleetpulse simulate --devices <uuid>,<uuid>
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod alerting;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod hub;
pub mod ingest;
pub mod models;
pub mod service;

pub use config::Config;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::alerting::{AlertPublisher, RuleEvaluator};
    pub use crate::config::Config;
    pub use crate::db::Database;
    pub use crate::error::{Error, Result};
    pub use crate::hub::{ConnectionHub, HubHandle};
    pub use crate::ingest::TelemetryIngestor;
    pub use crate::models::*;
    pub use crate::service::Service;
}
