//! Error types for FleetPulse

use thiserror::Error;

use crate::models::OwnerId;

/// Result type alias using FleetPulse's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for FleetPulse operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error
    #[error("Redis pool error: {0}")]
    Pool(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A message body could not be decoded
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// A collaborator lookup failed or found nothing
    #[error("Lookup failed for {entity} {id}: {reason}")]
    Lookup {
        /// Kind of record looked up
        entity: &'static str,
        /// Identifier that was looked up
        id: String,
        /// What went wrong
        reason: String,
    },

    /// A reading could not be persisted
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The broker could not be reached
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// A live connection violated the wire protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A live connection could not keep up with its mailbox
    #[error("Backpressure exceeded for owner {0}")]
    Backpressure(OwnerId),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a lookup error
    pub fn lookup(entity: &'static str, id: impl ToString, reason: impl Into<String>) -> Self {
        Self::Lookup {
            entity,
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<deadpool_redis::PoolError> for Error {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Self::Pool(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_error_message() {
        let err = Error::lookup("device", "abc", "not found");
        assert_eq!(err.to_string(), "Lookup failed for device abc: not found");
    }

    #[test]
    fn test_backpressure_names_owner() {
        let err = Error::Backpressure(OwnerId::parse("42").unwrap());
        assert_eq!(err.to_string(), "Backpressure exceeded for owner 42");
    }

    #[test]
    fn test_io_error_converts() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken").into();
        assert!(matches!(err, Error::Io(_)));
    }
}
