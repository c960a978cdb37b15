//! Connection hub
//!
//! Keeps at most one live WebSocket connection per owner and routes alerts
//! received from the broker to the matching connection.
//!
//! A single coordinator task owns all writes to the connection table;
//! registrations and removals reach it over a channel. Delivery reads the
//! table directly and never waits on a slow client: a full mailbox gets the
//! connection dropped instead.

mod connection;
mod coordinator;
mod socket;
mod subscriber;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::{AlertEnvelope, OwnerId};

pub use connection::{Connection, ConnectionState, EnqueueError};
pub use socket::{read_loop, run_reader, run_writer, serve_socket, write_loop};
pub use subscriber::{forward, BrokerSubscriber};

use coordinator::{Command, Coordinator, Table};

/// Largest inbound frame accepted from a client, in bytes
pub const MAX_FRAME_SIZE: usize = 512;

/// A client that sends no pong for this long is dropped
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for a single write or flush
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the writer pings; well inside the read idle timeout
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Outbound messages buffered per connection
pub const MAILBOX_CAPACITY: usize = 256;

const COMMAND_CAPACITY: usize = 64;

/// Result of routing one broker payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the owner's connection
    Delivered(OwnerId),
    /// The owner has no live connection; the payload was dropped
    NoConnection(OwnerId),
    /// The owner's mailbox was full; the connection was removed
    Backpressure(OwnerId),
    /// The payload could not be routed
    Malformed,
}

/// Starts the hub coordinator
pub struct ConnectionHub;

impl ConnectionHub {
    /// Spawn the coordinator. It runs until `shutdown` is cancelled, then
    /// closes every connection.
    pub fn spawn(shutdown: CancellationToken) -> (HubHandle, JoinHandle<()>) {
        let table: Table = Arc::new(RwLock::new(HashMap::new()));
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);

        let coordinator = Coordinator::new(table.clone(), rx, shutdown.clone());
        let task = tokio::spawn(coordinator.run());

        (
            HubHandle {
                commands,
                table,
                shutdown,
            },
            task,
        )
    }
}

/// Cheap, cloneable access to a running hub
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
    table: Table,
    shutdown: CancellationToken,
}

impl HubHandle {
    /// Install `conn` as its owner's connection, evicting any previous one.
    ///
    /// Fails once the hub has shut down, or if `conn` was already closed.
    /// The caller is responsible for closing a rejected connection.
    pub async fn register(&self, conn: Arc<Connection>) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::internal("connection hub is shut down"));
        }

        let (done, ack) = oneshot::channel();
        self.commands
            .send(Command::Register { conn, done })
            .await
            .map_err(|_| Error::internal("connection hub is shut down"))?;

        match ack.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::internal("connection closed before registration")),
            Err(_) => Err(Error::internal("connection hub is shut down")),
        }
    }

    /// Remove `conn` if it is still its owner's connection, and close it.
    ///
    /// Safe to call any number of times, also after shutdown. Returns
    /// whether the table changed.
    pub async fn unregister(&self, conn: &Arc<Connection>) -> bool {
        let (done, ack) = oneshot::channel();
        let sent = self
            .commands
            .send(Command::Unregister {
                conn: conn.clone(),
                done,
            })
            .await;

        if sent.is_err() {
            conn.close();
            return false;
        }
        ack.await.unwrap_or_else(|_| {
            conn.close();
            false
        })
    }

    /// Stop the hub. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether shutdown has been requested
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of registered connections
    pub fn connection_count(&self) -> usize {
        self.table.read().len()
    }

    /// Whether `owner` has a registered connection
    pub fn contains(&self, owner: &OwnerId) -> bool {
        self.table.read().contains_key(owner)
    }

    /// The registered connection for `owner`, if any
    pub fn get(&self, owner: &OwnerId) -> Option<Arc<Connection>> {
        self.table.read().get(owner).cloned()
    }

    /// Route one broker payload to its owner's connection.
    ///
    /// Never blocks on the client. A payload whose owner cannot be read is
    /// dropped with a warning.
    pub async fn deliver(&self, payload: &str) -> Delivery {
        let owner = match serde_json::from_str::<AlertEnvelope>(payload) {
            Ok(envelope) => envelope.user_id,
            Err(e) => {
                warn!(error = %e, "Dropping alert without a routable user_id");
                metrics::counter!("fleetpulse_alerts_dropped_total", "reason" => "malformed").increment(1);
                return Delivery::Malformed;
            }
        };

        let Some(conn) = self.get(&owner) else {
            debug!(owner = %owner, "No connection for alert");
            metrics::counter!("fleetpulse_alerts_dropped_total", "reason" => "no_connection").increment(1);
            return Delivery::NoConnection(owner);
        };

        match conn.try_enqueue(payload.to_string()) {
            Ok(()) => Delivery::Delivered(owner),
            Err(EnqueueError::Full) => {
                let err = Error::Backpressure(owner.clone());
                warn!(conn_id = %conn.id(), error = %err, "Mailbox full, dropping slow client");
                metrics::counter!("fleetpulse_alerts_dropped_total", "reason" => "backpressure").increment(1);
                self.unregister(&conn).await;
                Delivery::Backpressure(owner)
            }
            Err(EnqueueError::Closed) => {
                metrics::counter!("fleetpulse_alerts_dropped_total", "reason" => "no_connection").increment(1);
                Delivery::NoConnection(owner)
            }
        }
    }
}

impl std::fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubHandle")
            .field("connections", &self.connection_count())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn owner(raw: &str) -> OwnerId {
        OwnerId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_register_then_deliver() {
        let (hub, _task) = ConnectionHub::spawn(CancellationToken::new());
        let (conn, mut rx) = Connection::new(owner("42"));
        hub.register(conn.clone()).await.unwrap();

        let payload = r#"{"user_id":42,"name":"hot"}"#;
        assert_eq!(hub.deliver(payload).await, Delivery::Delivered(owner("42")));
        assert_eq!(rx.recv().await.as_deref(), Some(payload));
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let (hub, _task) = ConnectionHub::spawn(CancellationToken::new());
        assert_eq!(hub.deliver("not json").await, Delivery::Malformed);
        assert_eq!(hub.deliver(r#"{"name":"x"}"#).await, Delivery::Malformed);
        assert_eq!(hub.deliver(r#"{"user_id":null}"#).await, Delivery::Malformed);
    }

    #[tokio::test]
    async fn test_register_after_shutdown_fails() {
        let shutdown = CancellationToken::new();
        let (hub, task) = ConnectionHub::spawn(shutdown.clone());
        hub.shutdown();
        task.await.unwrap();

        let (conn, _rx) = Connection::new(owner("a"));
        assert!(hub.register(conn.clone()).await.is_err());
        assert!(!hub.unregister(&conn).await);
        assert!(conn.is_closed());
    }
}
