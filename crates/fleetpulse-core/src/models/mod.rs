//! Data models for FleetPulse

mod alert;
mod owner;
mod rule;
mod telemetry;

pub use alert::*;
pub use owner::*;
pub use rule::*;
pub use telemetry::*;
