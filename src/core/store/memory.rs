use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::{MessageRecoveryListener, MessageStore, PersistenceAdapter, StoreError};
use crate::core::message::{Message, MessageAck, MessageId};

/// Ordered in-memory store. Messages are kept by id, so recovery order is
/// arrival order.
#[derive(Debug)]
pub struct MemoryMessageStore {
    destination: String,
    messages: Mutex<BTreeMap<MessageId, Arc<Message>>>,
    fail_adds: AtomicBool,
    fail_removes: AtomicBool,
}

impl MemoryMessageStore {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            messages: Mutex::new(BTreeMap::new()),
            fail_adds: AtomicBool::new(false),
            fail_removes: AtomicBool::new(false),
        }
    }

    /// Make subsequent appends fail with an I/O error.
    pub fn set_fail_adds(&self, fail: bool) {
        self.fail_adds.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent removals fail with an I/O error.
    pub fn set_fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.messages.lock().contains_key(&id)
    }

    fn injected(&self, flag: &AtomicBool, op: &str) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other(format!(
                "injected {op} failure on {}",
                self.destination
            ))));
        }
        Ok(())
    }
}

impl MessageStore for MemoryMessageStore {
    fn destination(&self) -> &str {
        &self.destination
    }

    fn add_message(&self, message: &Message) -> Result<(), StoreError> {
        self.injected(&self.fail_adds, "add")?;
        let id = message
            .id
            .ok_or_else(|| StoreError::Corruption("message has no broker-assigned id".into()))?;
        self.messages.lock().insert(id, Arc::new(message.clone()));
        Ok(())
    }

    fn remove_message(&self, ack: &MessageAck) -> Result<(), StoreError> {
        self.injected(&self.fail_removes, "remove")?;
        self.messages.lock().remove(&ack.last_message_id);
        Ok(())
    }

    fn remove_all_messages(&self) -> Result<(), StoreError> {
        self.messages.lock().clear();
        Ok(())
    }

    fn message_count(&self) -> Result<usize, StoreError> {
        Ok(self.messages.lock().len())
    }

    fn recover(&self, listener: &mut dyn MessageRecoveryListener) -> Result<(), StoreError> {
        self.recover_next_messages(None, usize::MAX, listener)
    }

    fn recover_next_messages(
        &self,
        after: Option<MessageId>,
        max: usize,
        listener: &mut dyn MessageRecoveryListener,
    ) -> Result<(), StoreError> {
        // Snapshot so the listener can call back into the queue freely.
        let batch: Vec<Arc<Message>> = {
            let messages = self.messages.lock();
            let lower = match after {
                Some(id) => Bound::Excluded(id),
                None => Bound::Unbounded,
            };
            messages
                .range((lower, Bound::Unbounded))
                .take(max)
                .map(|(_, m)| m.clone())
                .collect()
        };
        for message in batch {
            if !listener.has_space() || !listener.recover_message(message) {
                break;
            }
        }
        Ok(())
    }

    fn get_message(&self, id: MessageId) -> Result<Option<Arc<Message>>, StoreError> {
        Ok(self.messages.lock().get(&id).cloned())
    }

    fn last_message_id(&self) -> Result<Option<MessageId>, StoreError> {
        Ok(self.messages.lock().keys().next_back().copied())
    }
}

/// One [`MemoryMessageStore`] per destination, reused on lookup so a queue
/// recreated under the same name recovers its backlog.
#[derive(Debug, Default)]
pub struct MemoryPersistenceAdapter {
    stores: DashMap<String, Arc<MemoryMessageStore>>,
}

impl MemoryPersistenceAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, destination: &str) -> Option<Arc<MemoryMessageStore>> {
        self.stores.get(destination).map(|s| s.value().clone())
    }
}

impl PersistenceAdapter for MemoryPersistenceAdapter {
    fn create_queue_store(&self, destination: &str) -> Result<Arc<dyn MessageStore>, StoreError> {
        let store = self
            .stores
            .entry(destination.to_string())
            .or_insert_with(|| Arc::new(MemoryMessageStore::new(destination)))
            .clone();
        Ok(store)
    }
}
