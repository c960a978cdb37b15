//! A single live client connection

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::models::OwnerId;

use super::MAILBOX_CAPACITY;

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake done, not yet in the hub's table
    Connecting,
    /// Installed in the hub's table
    Registered,
    /// Resources are being released
    Closing,
    /// Socket and mailbox released
    Closed,
}

/// Why a message could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The mailbox is at capacity
    Full,
    /// The connection has been closed
    Closed,
}

/// A live connection: owner, bounded outbound mailbox, and a close signal
/// observed by the connection's reader and writer.
pub struct Connection {
    id: Uuid,
    owner: OwnerId,
    mailbox: Mutex<Option<mpsc::Sender<String>>>,
    state: Mutex<ConnectionState>,
    closed: CancellationToken,
    connected_at: DateTime<Utc>,
}

impl Connection {
    /// Create a connection with the default mailbox capacity.
    ///
    /// Returns the receiving half of the mailbox for the writer.
    pub fn new(owner: OwnerId) -> (Arc<Self>, mpsc::Receiver<String>) {
        Self::with_capacity(owner, MAILBOX_CAPACITY)
    }

    /// Create a connection with a custom mailbox capacity
    pub fn with_capacity(owner: OwnerId, capacity: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Self {
            id: Uuid::new_v4(),
            owner,
            mailbox: Mutex::new(Some(tx)),
            state: Mutex::new(ConnectionState::Connecting),
            closed: CancellationToken::new(),
            connected_at: Utc::now(),
        };
        (Arc::new(conn), rx)
    }

    /// Unique connection id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Owner of the connection
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// When the handshake completed
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Whether `close` has run
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// `Connecting -> Registered`. Fails for a connection in any other state.
    pub(crate) fn mark_registered(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Registered;
            true
        } else {
            false
        }
    }

    /// Queue a message without waiting
    pub fn try_enqueue(&self, payload: String) -> Result<(), EnqueueError> {
        let mailbox = self.mailbox.lock();
        let Some(sender) = mailbox.as_ref() else {
            return Err(EnqueueError::Closed);
        };
        sender.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Release the mailbox and signal the reader and writer to stop.
    ///
    /// Returns `true` for the call that actually closed the connection;
    /// every later call is a no-op returning `false`.
    pub fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Closing | ConnectionState::Closed => return false,
                ConnectionState::Connecting | ConnectionState::Registered => {
                    *state = ConnectionState::Closing;
                }
            }
        }

        drop(self.mailbox.lock().take());
        self.closed.cancel();

        *self.state.lock() = ConnectionState::Closed;
        true
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
