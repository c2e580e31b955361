use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{MessageAudit, PendingCursor};
use crate::core::message::{Message, MessageId};
use crate::core::reference::MessageReference;
use crate::core::store::{MessageRecoveryListener, MessageStore, StoreError};
use crate::core::usage::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Persistent,
    Transient,
}

/// Cursor that keeps only a bounded batch of persistent messages resident
/// and pages the rest back in from the store on demand.
///
/// Non-persistent messages never reach the store, so they sit in their own
/// list for their whole stay and are charged to the temp gate meanwhile.
/// Iteration merges the two lists by id. While the cache is enabled every
/// persistent message past `last_cached_id` is resident; once one is spooled
/// instead, the cache stays off until a fill drains the store.
#[derive(Debug)]
pub struct StorePendingCursor {
    store: Arc<dyn MessageStore>,
    memory: Arc<Usage>,
    temp: Arc<Usage>,
    persistent: VecDeque<Arc<MessageReference>>,
    transient: VecDeque<Arc<MessageReference>>,
    persistent_pos: usize,
    transient_pos: usize,
    last_returned: Option<(Side, usize)>,
    /// Persistent messages not yet removed from the cursor, resident or not.
    persistent_size: usize,
    last_cached_id: Option<MessageId>,
    cache_enabled: bool,
    max_batch_size: usize,
    audit: MessageAudit,
}

impl StorePendingCursor {
    pub fn new(
        store: Arc<dyn MessageStore>,
        memory: Arc<Usage>,
        temp: Arc<Usage>,
        max_batch_size: usize,
        audit_depth: usize,
    ) -> Result<Self, StoreError> {
        let persistent_size = store.message_count()?;
        debug!(
            destination = store.destination(),
            stored = persistent_size,
            "store cursor opened"
        );
        Ok(Self {
            store,
            memory,
            temp,
            persistent: VecDeque::new(),
            transient: VecDeque::new(),
            persistent_pos: 0,
            transient_pos: 0,
            last_returned: None,
            persistent_size,
            last_cached_id: None,
            cache_enabled: persistent_size == 0,
            max_batch_size: max_batch_size.max(1),
            audit: MessageAudit::new(audit_depth),
        })
    }

    pub fn is_cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    /// Persistent references currently resident.
    pub fn cached_persistent(&self) -> usize {
        self.persistent.len()
    }

    fn cache(&mut self, reference: Arc<MessageReference>) {
        let id = reference.id();
        let index = self.persistent.partition_point(|r| r.id() < id);
        self.persistent.insert(index, reference);
        if index < self.persistent_pos {
            self.persistent_pos += 1;
        }
        if self.last_cached_id.map_or(true, |last| id > last) {
            self.last_cached_id = Some(id);
        }
    }

    /// Pull up to `want` persistent messages past `last_cached_id` out of the
    /// store.
    fn fill_batch(&mut self, want: usize) {
        if self.persistent.len() >= self.persistent_size {
            // Everything still pending is resident.
            self.cache_enabled = true;
            return;
        }
        if want == 0 {
            return;
        }

        let mut listener = BatchListener {
            messages: Vec::new(),
            memory: &self.memory,
            must_take_one: self.persistent_pos >= self.persistent.len(),
        };
        if let Err(e) = self
            .store
            .recover_next_messages(self.last_cached_id, want, &mut listener)
        {
            warn!(destination = self.store.destination(), error = %e, "failed to page messages in from store");
            return;
        }

        let recovered = listener.messages.len();
        for message in listener.messages {
            let Some(id) = message.id else {
                warn!(destination = self.store.destination(), "skipping stored message without id");
                continue;
            };
            if self.last_cached_id.is_some_and(|last| id <= last) {
                continue;
            }
            let reference = MessageReference::new(
                id,
                message,
                Some(self.store.clone()),
                Some(self.memory.clone()),
            );
            reference.increment_reference_count();
            self.cache(reference);
        }

        if recovered < want && !self.memory.is_full() {
            self.cache_enabled = true;
        }
    }

    /// Drop resident persistent references past `max_batch_size`, newest
    /// first; a later fill recovers them again.
    fn trim(&mut self) {
        let mut lowest_trimmed = None;
        while self.persistent.len() > self.max_batch_size {
            if let Some(reference) = self.persistent.pop_back() {
                lowest_trimmed = Some(reference.id());
                reference.decrement_reference_count();
            }
        }
        if let Some(lowest) = lowest_trimmed {
            self.last_cached_id = lowest.value().checked_sub(1).map(MessageId::from_raw);
            self.cache_enabled = false;
        }
    }

    fn pick(&self) -> Option<Side> {
        let p = self.persistent.get(self.persistent_pos);
        let t = self.transient.get(self.transient_pos);
        match (p, t) {
            (Some(p), Some(t)) if t.id() < p.id() => Some(Side::Transient),
            (Some(_), _) => Some(Side::Persistent),
            (None, Some(_)) => Some(Side::Transient),
            (None, None) => None,
        }
    }
}

struct BatchListener<'a> {
    messages: Vec<Arc<Message>>,
    memory: &'a Usage,
    must_take_one: bool,
}

impl MessageRecoveryListener for BatchListener<'_> {
    fn recover_message(&mut self, message: Arc<Message>) -> bool {
        self.messages.push(message);
        true
    }

    fn has_space(&self) -> bool {
        (self.must_take_one && self.messages.is_empty()) || !self.memory.is_full()
    }
}

impl PendingCursor for StorePendingCursor {
    fn add_message_last(&mut self, reference: Arc<MessageReference>) -> bool {
        if self.audit.is_duplicate(reference.id()) {
            reference.decrement_reference_count();
            return false;
        }

        if !reference.is_persistent() {
            self.temp.increase_usage(reference.size() as u64);
            let id = reference.id();
            let index = self.transient.partition_point(|r| r.id() < id);
            self.transient.insert(index, reference);
            if index < self.transient_pos {
                self.transient_pos += 1;
            }
            return true;
        }

        self.persistent_size += 1;
        if self.cache_enabled
            && self.persistent.len() < self.max_batch_size
            && !self.memory.is_full()
        {
            self.cache(reference);
        } else {
            if self.cache_enabled {
                debug!(destination = self.store.destination(), "store cursor cache disabled");
            }
            self.cache_enabled = false;
            reference.decrement_reference_count();
        }
        true
    }

    fn reset(&mut self) {
        self.persistent_pos = 0;
        self.transient_pos = 0;
        self.last_returned = None;
        let room = self.max_batch_size.saturating_sub(self.persistent.len());
        self.fill_batch(room);
    }

    fn has_next(&mut self) -> bool {
        if self.persistent_pos >= self.persistent.len() {
            self.fill_batch(self.max_batch_size);
        }
        self.pick().is_some()
    }

    fn next(&mut self) -> Option<Arc<MessageReference>> {
        if !self.has_next() {
            return None;
        }
        let side = self.pick()?;
        let reference = match side {
            Side::Persistent => {
                let r = self.persistent.get(self.persistent_pos)?.clone();
                self.last_returned = Some((side, self.persistent_pos));
                self.persistent_pos += 1;
                r
            }
            Side::Transient => {
                let r = self.transient.get(self.transient_pos)?.clone();
                self.last_returned = Some((side, self.transient_pos));
                self.transient_pos += 1;
                r
            }
        };
        Some(reference)
    }

    fn remove(&mut self) {
        match self.last_returned.take() {
            Some((Side::Persistent, index)) => {
                if self.persistent.remove(index).is_some() {
                    self.persistent_size = self.persistent_size.saturating_sub(1);
                }
                self.persistent_pos = index;
            }
            Some((Side::Transient, index)) => {
                if let Some(reference) = self.transient.remove(index) {
                    self.temp.decrease_usage(reference.size() as u64);
                }
                self.transient_pos = index;
            }
            None => {}
        }
    }

    fn rollback(&mut self, id: MessageId) {
        self.audit.rollback(id);
    }

    fn release(&mut self) {
        self.persistent_pos = 0;
        self.transient_pos = 0;
        self.last_returned = None;
        self.trim();
    }

    fn set_max_batch_size(&mut self, size: usize) {
        self.max_batch_size = size.max(1);
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn size(&self) -> usize {
        self.persistent_size + self.transient.len()
    }

    fn is_store_backed(&self) -> bool {
        true
    }
}
