use thiserror::Error;

use crate::core::context::ConnectionId;
use crate::core::store::StoreError;
use crate::core::transaction::TransactionId;

/// Errors surfaced by queue operations.
#[derive(Debug, Error)]
pub enum BlipError {
    /// A usage gate is saturated and the destination is configured to fail fast.
    #[error("usage limit reached on {usage} for destination {destination}")]
    ResourceAllocation { destination: String, usage: String },

    /// A blocking send was interrupted because its connection is going away.
    #[error("send aborted, connection {0} closed")]
    SendAborted(ConnectionId),

    /// Replayed dispatch decision references state this node does not have.
    #[error("slave broker out of sync with master: {0}")]
    OutOfSync(String),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("invalid acknowledgment: {0}")]
    InvalidAck(String),

    #[error("transaction {0} is not active")]
    TransactionNotActive(TransactionId),

    #[error("queue {0} is stopped")]
    QueueStopped(String),

    #[error("subscription rejected dispatch: {0}")]
    Subscription(String),
}

impl BlipError {
    /// True for the capacity errors a producer may retry later.
    pub fn is_resource_allocation(&self) -> bool {
        matches!(self, BlipError::ResourceAllocation { .. })
    }
}
