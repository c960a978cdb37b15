//! The hub's central coordinator: the only writer of the connection table

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::models::OwnerId;

use super::connection::Connection;

/// Live connections by owner
pub(crate) type Table = Arc<RwLock<HashMap<OwnerId, Arc<Connection>>>>;

/// Table mutations, applied one at a time
pub(crate) enum Command {
    Register {
        conn: Arc<Connection>,
        done: oneshot::Sender<bool>,
    },
    Unregister {
        conn: Arc<Connection>,
        done: oneshot::Sender<bool>,
    },
}

pub(crate) struct Coordinator {
    table: Table,
    commands: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub(crate) fn new(
        table: Table,
        commands: mpsc::Receiver<Command>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            table,
            commands,
            shutdown,
        }
    }

    /// Apply commands until shutdown, then close every connection and exit.
    pub(crate) async fn run(mut self) {
        info!("Connection hub started");

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(Command::Register { conn, done }) => {
                        let _ = done.send(self.register(conn));
                    }
                    Some(Command::Unregister { conn, done }) => {
                        let _ = done.send(self.unregister(&conn));
                    }
                    None => break,
                },
            }
        }

        self.drain();
        info!("Connection hub stopped");
    }

    /// Install `conn`, evicting any live connection of the same owner first.
    fn register(&self, conn: Arc<Connection>) -> bool {
        if !conn.mark_registered() {
            debug!(owner = %conn.owner(), conn_id = %conn.id(), "Ignoring registration of a closed connection");
            return false;
        }

        let mut table = self.table.write();
        if let Some(existing) = table.remove(conn.owner()) {
            existing.close();
            info!(
                owner = %existing.owner(),
                conn_id = %existing.id(),
                connected_at = %existing.connected_at(),
                "Evicted previous connection"
            );
        }
        table.insert(conn.owner().clone(), conn.clone());
        let total = table.len();
        drop(table);

        record_total(total);
        info!(owner = %conn.owner(), conn_id = %conn.id(), total_clients = total, "Client registered");
        true
    }

    /// Remove `conn` if it is still the owner's current connection, then
    /// close it. Returns whether the table changed.
    fn unregister(&self, conn: &Arc<Connection>) -> bool {
        let mut table = self.table.write();
        let current = table
            .get(conn.owner())
            .is_some_and(|registered| Arc::ptr_eq(registered, conn));
        if current {
            table.remove(conn.owner());
        }
        let total = table.len();
        drop(table);

        conn.close();

        if current {
            record_total(total);
            info!(owner = %conn.owner(), conn_id = %conn.id(), total_clients = total, "Client unregistered");
        } else {
            debug!(owner = %conn.owner(), conn_id = %conn.id(), "Ignoring stale unregister");
        }
        current
    }

    fn drain(&mut self) {
        self.commands.close();
        let drained: Vec<Arc<Connection>> = self.table.write().drain().map(|(_, c)| c).collect();
        let count = drained.len();
        for conn in drained {
            conn.close();
        }
        record_total(0);
        info!(count, "Closed all connections");
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_total(total: usize) {
    metrics::gauge!("fleetpulse_connections").set(total as f64);
}
