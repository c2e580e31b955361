use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::core::transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct ConnectionState {
    id: ConnectionId,
    client_id: String,
    stopping: AtomicBool,
}

/// The calling connection, threaded through every queue operation so
/// blocking paths can notice teardown and acks/sends can join a transaction.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    connection: Arc<ConnectionState>,
    transaction: Option<Arc<Transaction>>,
}

impl ConnectionContext {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            connection: Arc::new(ConnectionState {
                id: ConnectionId::new(),
                client_id: client_id.into(),
                stopping: AtomicBool::new(false),
            }),
            transaction: None,
        }
    }

    /// Context for work the broker does on its own behalf (expiry,
    /// dead-letter forwarding, admin moves).
    pub fn broker() -> Self {
        Self::new("broker")
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id
    }

    pub fn client_id(&self) -> &str {
        &self.connection.client_id
    }

    pub fn is_stopping(&self) -> bool {
        self.connection.stopping.load(Ordering::Acquire)
    }

    /// Mark the connection as going away. Shared by every clone.
    pub fn stop(&self) {
        self.connection.stopping.store(true, Ordering::Release);
    }

    /// Same connection, enlisted in `transaction`.
    pub fn with_transaction(&self, transaction: Arc<Transaction>) -> Self {
        Self {
            connection: self.connection.clone(),
            transaction: Some(transaction),
        }
    }

    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.transaction.as_ref()
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProducerId(String);

impl ProducerId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    /// Bytes the producer may have outstanding before it waits for acks.
    pub window_size: usize,
    /// The producer waits for an explicit reply to each send.
    pub response_required: bool,
}

impl ProducerInfo {
    pub fn new(producer_id: impl Into<String>) -> Self {
        Self {
            producer_id: ProducerId::new(producer_id),
            window_size: 0,
            response_required: false,
        }
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_response_required(mut self) -> Self {
        self.response_required = true;
        self
    }

    /// Producers that can absorb a late completion get deferred sends
    /// instead of blocking when a usage gate is full.
    pub fn supports_async_ack(&self) -> bool {
        self.window_size > 0 || self.response_required
    }
}
