//! Persistence boundary.
//!
//! The queue only talks to [`MessageStore`]; any durable log can sit behind
//! it. [`MemoryMessageStore`] is the in-process implementation used by the
//! simulator and tests.

pub mod memory;

pub use memory::{MemoryMessageStore, MemoryPersistenceAdapter};

use std::fmt::Debug;
use std::sync::Arc;

use thiserror::Error;

use crate::core::message::{Message, MessageAck, MessageId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store corruption: {0}")]
    Corruption(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Receives messages streamed back out of a store in persisted order.
pub trait MessageRecoveryListener {
    /// Accept one recovered message. Returning `false` stops the recovery.
    fn recover_message(&mut self, message: Arc<Message>) -> bool;

    /// Whether the listener can take more. Recovery pauses (returns) as soon
    /// as this is `false`.
    fn has_space(&self) -> bool;
}

pub trait MessageStore: Send + Sync + Debug {
    fn destination(&self) -> &str;

    fn add_message(&self, message: &Message) -> Result<(), StoreError>;

    /// Remove the single message named by `ack.last_message_id`.
    fn remove_message(&self, ack: &MessageAck) -> Result<(), StoreError>;

    fn remove_all_messages(&self) -> Result<(), StoreError>;

    fn message_count(&self) -> Result<usize, StoreError>;

    /// Stream every stored message, oldest first.
    fn recover(&self, listener: &mut dyn MessageRecoveryListener) -> Result<(), StoreError>;

    /// Stream up to `max` messages with ids strictly greater than `after`,
    /// oldest first.
    fn recover_next_messages(
        &self,
        after: Option<MessageId>,
        max: usize,
        listener: &mut dyn MessageRecoveryListener,
    ) -> Result<(), StoreError>;

    fn get_message(&self, id: MessageId) -> Result<Option<Arc<Message>>, StoreError>;

    /// Highest id currently stored.
    fn last_message_id(&self) -> Result<Option<MessageId>, StoreError>;
}

/// Hands out one store per destination.
pub trait PersistenceAdapter: Send + Sync + Debug {
    fn create_queue_store(&self, destination: &str) -> Result<Arc<dyn MessageStore>, StoreError>;
}
