//! Per-copy delivery state around a message body.
//!
//! A [`MessageReference`] is what the queue pages in, dispatches and acks.
//! The body is held while at least one holder (the queue's working set, a
//! consumer, a browser snapshot) counts the reference; the first holder
//! charges the message size to the memory gate and the last one releases it.
//! Persistent bodies with a backing store are released on the last decrement
//! and reloaded on demand.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::core::message::{current_timestamp, Message, MessageId};
use crate::core::store::MessageStore;
use crate::core::subscription::ConsumerId;
use crate::core::usage::Usage;

/// Who currently holds the dispatch lock on a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOwner {
    Consumer(ConsumerId),
    /// Administrative operations (remove/move matching) lock ahead of consumers.
    Broker,
}

pub struct MessageReference {
    id: MessageId,
    size: usize,
    persistent: bool,
    expiration: u64,
    priority: u8,
    group_id: Option<String>,
    group_sequence: i32,
    body: Mutex<Option<Arc<Message>>>,
    store: Option<Arc<dyn MessageStore>>,
    memory: Option<Arc<Usage>>,
    reference_count: AtomicU32,
    acked: AtomicBool,
    dropped: AtomicBool,
    group_first: AtomicBool,
    redelivery_counter: AtomicU32,
    lock_owner: Mutex<Option<LockOwner>>,
}

impl fmt::Debug for MessageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageReference")
            .field("id", &self.id)
            .field("persistent", &self.persistent)
            .field("reference_count", &self.reference_count())
            .field("acked", &self.is_acked())
            .field("dropped", &self.is_dropped())
            .field("redelivery_counter", &self.redelivery_counter())
            .field("lock_owner", &*self.lock_owner.lock())
            .finish()
    }
}

impl MessageReference {
    pub fn new(
        id: MessageId,
        message: Arc<Message>,
        store: Option<Arc<dyn MessageStore>>,
        memory: Option<Arc<Usage>>,
    ) -> Arc<Self> {
        debug_assert!(message.id.map_or(true, |m| m == id));
        Arc::new(Self {
            id,
            size: message.size(),
            persistent: message.persistent,
            expiration: message.expiration,
            priority: message.priority,
            group_id: message.group_id.clone(),
            group_sequence: message.group_sequence,
            redelivery_counter: AtomicU32::new(message.redelivery_counter),
            body: Mutex::new(Some(message)),
            store,
            memory,
            reference_count: AtomicU32::new(0),
            acked: AtomicBool::new(false),
            dropped: AtomicBool::new(false),
            group_first: AtomicBool::new(false),
            lock_owner: Mutex::new(None),
        })
    }

    #[inline]
    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    pub fn group_sequence(&self) -> i32 {
        self.group_sequence
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp())
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expiration != 0 && now_ms >= self.expiration
    }

    /// The message body, loading it from the store if it was released.
    pub fn message(&self) -> Option<Arc<Message>> {
        let mut body = self.body.lock();
        if let Some(message) = body.as_ref() {
            return Some(message.clone());
        }
        let store = self.store.as_ref()?;
        match store.get_message(self.id) {
            Ok(Some(message)) => {
                *body = Some(message.clone());
                Some(message)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(message_id = %self.id, error = %e, "failed to load message body from store");
                None
            }
        }
    }

    pub fn has_body(&self) -> bool {
        self.body.lock().is_some()
    }

    pub fn reference_count(&self) -> u32 {
        self.reference_count.load(Ordering::Acquire)
    }

    pub fn increment_reference_count(&self) -> u32 {
        let count = self.reference_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count == 1 {
            if let Some(memory) = &self.memory {
                memory.increase_usage(self.size as u64);
            }
        }
        count
    }

    pub fn decrement_reference_count(&self) -> u32 {
        let previous = self
            .reference_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(1))
            })
            .unwrap_or(0);
        if previous == 1 {
            if let Some(memory) = &self.memory {
                memory.decrease_usage(self.size as u64);
            }
            if self.persistent && self.store.is_some() {
                self.body.lock().take();
            }
        }
        previous.saturating_sub(1)
    }

    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }

    pub fn set_acked(&self, acked: bool) {
        self.acked.store(acked, Ordering::Release);
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    /// Mark the reference terminal and release the queue's hold on it.
    /// Returns `false` if it was already dropped.
    pub fn drop_reference(&self) -> bool {
        if self.dropped.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.decrement_reference_count();
        true
    }

    pub fn redelivery_counter(&self) -> u32 {
        self.redelivery_counter.load(Ordering::Acquire)
    }

    pub fn increment_redelivery_counter(&self) -> u32 {
        self.redelivery_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_group_first_for_consumer(&self) -> bool {
        self.group_first.load(Ordering::Acquire)
    }

    pub fn set_group_first_for_consumer(&self, first: bool) {
        self.group_first.store(first, Ordering::Release);
    }

    /// Take the dispatch lock. Re-locking by the current owner succeeds.
    pub fn lock(&self, owner: LockOwner) -> bool {
        let mut current = self.lock_owner.lock();
        match current.as_ref() {
            Some(existing) if *existing != owner => false,
            _ => {
                *current = Some(owner);
                true
            }
        }
    }

    pub fn unlock(&self) {
        self.lock_owner.lock().take();
    }

    pub fn lock_owner(&self) -> Option<LockOwner> {
        self.lock_owner.lock().clone()
    }

    pub fn is_locked_by(&self, consumer: &ConsumerId) -> bool {
        matches!(&*self.lock_owner.lock(), Some(LockOwner::Consumer(c)) if c == consumer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::{MemoryMessageStore, MessageStore};

    fn reference(memory: Option<Arc<Usage>>, store: Option<Arc<dyn MessageStore>>) -> Arc<MessageReference> {
        let id = MessageId::from_raw(1);
        let message = Arc::new(Message::new("payload").with_id(id));
        MessageReference::new(id, message, store, memory)
    }

    #[test]
    fn first_and_last_holder_drive_memory_usage() {
        let memory = Usage::unlimited("memory");
        let r = reference(Some(memory.clone()), None);
        let size = r.size() as u64;

        assert_eq!(r.increment_reference_count(), 1);
        assert_eq!(memory.usage(), size);
        assert_eq!(r.increment_reference_count(), 2);
        assert_eq!(memory.usage(), size);

        assert_eq!(r.decrement_reference_count(), 1);
        assert_eq!(memory.usage(), size);
        assert_eq!(r.decrement_reference_count(), 0);
        assert_eq!(memory.usage(), 0);
    }

    #[test]
    fn drop_releases_queue_hold_once() {
        let memory = Usage::unlimited("memory");
        let r = reference(Some(memory.clone()), None);
        r.increment_reference_count();

        assert!(r.drop_reference());
        assert!(!r.drop_reference());
        assert_eq!(r.reference_count(), 0);
        assert_eq!(memory.usage(), 0);
    }

    #[test]
    fn lock_is_exclusive_per_owner() {
        let r = reference(None, None);
        let a = LockOwner::Consumer(ConsumerId::new("a"));
        let b = LockOwner::Consumer(ConsumerId::new("b"));

        assert!(r.lock(a.clone()));
        assert!(r.lock(a.clone()));
        assert!(!r.lock(b.clone()));
        assert!(r.is_locked_by(&ConsumerId::new("a")));

        r.unlock();
        assert!(r.lock(b));
        assert!(!r.lock(LockOwner::Broker));
    }

    #[test]
    fn persistent_body_released_and_reloaded_from_store() {
        let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new("q"));
        let id = MessageId::from_raw(42);
        let message = Arc::new(Message::new("durable").with_id(id));
        store.add_message(&message).unwrap();

        let r = MessageReference::new(id, message, Some(store), None);
        r.increment_reference_count();
        r.decrement_reference_count();
        assert!(!r.has_body());

        let reloaded = r.message().expect("body should reload from store");
        assert_eq!(&reloaded.payload[..], b"durable");
    }
}
