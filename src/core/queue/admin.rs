use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use super::Queue;
use crate::core::error::BlipError;
use crate::core::filter::MessageFilter;
use crate::core::message::{Message, MessageId};
use crate::core::reference::{LockOwner, MessageReference};
use crate::core::statistics::DestinationStatistics;

impl Queue {
    /// Non-destructive view of the queue in id order: in-flight and pending
    /// messages, then up to `max_browse_page_size` more from the cursor.
    pub fn browse(&self) -> Vec<Arc<Message>> {
        self.collect_references(self.policy.max_browse_page_size)
            .into_iter()
            .filter(|r| !r.is_expired())
            .filter_map(|r| r.message())
            .collect()
    }

    /// Look one message up by id without consuming it.
    pub fn get_message(&self, id: MessageId) -> Option<Arc<Message>> {
        self.find_reference(id).and_then(|r| r.message())
    }

    fn find_reference(&self, id: MessageId) -> Option<Arc<MessageReference>> {
        let state = self.dispatch.lock();
        if let Some(reference) = state.working_set.get(&id) {
            return Some(reference.clone());
        }
        if let Some(reference) = state.pending.iter().find(|r| r.id() == id) {
            return Some(reference.clone());
        }
        let mut cursor = self.cursor.lock();
        cursor.reset();
        let mut found = None;
        while let Some(reference) = cursor.next() {
            if reference.id() == id {
                found = Some(reference);
                break;
            }
        }
        cursor.release();
        found
    }

    /// Remove every message, in flight or not. Later acks for purged
    /// messages are no-ops.
    pub fn purge(&self) -> Result<usize, BlipError> {
        let removed = self.visit_matching(&MessageFilter::all(), usize::MAX, |queue, r| {
            queue.remove_reference(r, false)
        })?;
        info!(queue = %self.name, removed, "purged");
        self.wakeup();
        Ok(removed)
    }

    /// Remove up to `max` matching messages. Messages a consumer holds are
    /// skipped.
    pub fn remove_matching_messages(&self, filter: &MessageFilter, max: usize) -> Result<usize, BlipError> {
        let removed = self.visit_matching(filter, max, |queue, r| queue.remove_reference(r, true))?;
        debug!(queue = %self.name, removed, "removed matching messages");
        self.wakeup();
        Ok(removed)
    }

    pub fn remove_message(&self, id: MessageId) -> Result<bool, BlipError> {
        let filter = MessageFilter::new(move |m| m.id == Some(id));
        Ok(self.remove_matching_messages(&filter, 1)? == 1)
    }

    /// Copy up to `max` matching messages to `dest`, leaving the originals.
    pub fn copy_matching_messages_to(
        &self,
        filter: &MessageFilter,
        dest: &Queue,
        max: usize,
    ) -> Result<usize, BlipError> {
        let copied = self.visit_matching(filter, max, |queue, r| queue.copy_reference(r, dest))?;
        debug!(queue = %self.name, dest = dest.name(), copied, "copied matching messages");
        dest.wakeup();
        Ok(copied)
    }

    pub fn copy_message_to(&self, id: MessageId, dest: &Queue) -> Result<bool, BlipError> {
        let filter = MessageFilter::new(move |m| m.id == Some(id));
        Ok(self.copy_matching_messages_to(&filter, dest, 1)? == 1)
    }

    /// Move up to `max` matching messages to `dest`. Messages a consumer
    /// holds are skipped.
    pub fn move_matching_messages_to(
        &self,
        filter: &MessageFilter,
        dest: &Queue,
        max: usize,
    ) -> Result<usize, BlipError> {
        let moved = self.visit_matching(filter, max, |queue, r| {
            if !r.lock(LockOwner::Broker) {
                return Ok(false);
            }
            let moved = queue
                .copy_reference(r, dest)
                .and_then(|copied| if copied { queue.remove_reference(r, true) } else { Ok(false) });
            // A reference that stays here must be dispatchable again.
            if !matches!(moved, Ok(true)) {
                r.unlock();
            }
            moved
        })?;
        debug!(queue = %self.name, dest = dest.name(), moved, "moved matching messages");
        dest.wakeup();
        self.wakeup();
        Ok(moved)
    }

    pub fn move_message_to(&self, id: MessageId, dest: &Queue) -> Result<bool, BlipError> {
        let filter = MessageFilter::new(move |m| m.id == Some(id));
        Ok(self.move_matching_messages_to(&filter, dest, 1)? == 1)
    }

    /// Page the whole backlog in, one page per pass, and run `action` on
    /// each matching live reference once. Stops after `max` successful
    /// actions or when a pass finds nothing new.
    fn visit_matching<F>(&self, filter: &MessageFilter, max: usize, mut action: F) -> Result<usize, BlipError>
    where
        F: FnMut(&Queue, &Arc<MessageReference>) -> Result<bool, BlipError>,
    {
        let mut visited: HashSet<MessageId> = HashSet::new();
        let mut count = 0;

        while count < max {
            let (batch, paged) = {
                let consumers = self.consumers.write();
                let (paged, _) = self.page_in(true, self.policy.max_page_size, &consumers);
                let paged_any = !paged.is_empty();
                let mut state = self.dispatch.lock();
                state.pending.extend(paged);
                let batch: Vec<Arc<MessageReference>> = state
                    .working_set
                    .values()
                    .chain(state.pending.iter())
                    .filter(|r| !visited.contains(&r.id()))
                    .cloned()
                    .collect();
                (batch, paged_any)
            };
            if batch.is_empty() && !paged {
                break;
            }

            for reference in batch {
                visited.insert(reference.id());
                if reference.is_dropped() || reference.is_acked() {
                    continue;
                }
                let matches = reference
                    .message()
                    .map(|m| filter.matches(&m))
                    .unwrap_or(false);
                if matches && action(self, &reference)? {
                    count += 1;
                    if count >= max {
                        break;
                    }
                }
            }
        }
        Ok(count)
    }

    /// Settle `reference` as removed by the broker. With `respect_locks`,
    /// references held by a consumer are left alone.
    fn remove_reference(&self, reference: &Arc<MessageReference>, respect_locks: bool) -> Result<bool, BlipError> {
        if reference.is_dropped() {
            return Ok(false);
        }
        if respect_locks && !reference.lock(LockOwner::Broker) {
            return Ok(false);
        }
        if let Err(e) = self.remove_from_store(reference, reference.id()) {
            if respect_locks {
                reference.unlock();
            }
            return Err(e);
        }
        reference.set_acked(true);
        DestinationStatistics::increment(&self.stats.dequeues);
        self.drop_message(reference);
        Ok(true)
    }

    fn copy_reference(&self, reference: &MessageReference, dest: &Queue) -> Result<bool, BlipError> {
        let Some(message) = reference.message() else {
            return Ok(false);
        };
        let copy = message.copy_for(dest.name());
        dest.enqueue_internal(copy)?;
        Ok(true)
    }
}
