//! Alerting for FleetPulse
//!
//! Matches readings against their owner's rules and publishes the resulting
//! alerts to per-owner broker topics.

mod evaluator;
mod publisher;

pub use evaluator::{Evaluation, RuleEvaluator};
pub use publisher::{AlertPublisher, RedisAlertPublisher};

/// Prefix of the per-owner alert topic
pub const TOPIC_PREFIX: &str = "notifications:";

/// Pattern matching every per-owner alert topic
pub const TOPIC_PATTERN: &str = "notifications:*";
