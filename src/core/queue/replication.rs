use std::sync::Arc;

use tracing::{debug, trace};

use super::Queue;
use crate::core::error::BlipError;
use crate::core::message::MessageId;
use crate::core::reference::{LockOwner, MessageReference};
use crate::core::statistics::DestinationStatistics;
use crate::core::subscription::ConsumerId;

/// A master's record that it dispatched `message_id` to `consumer_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDispatchNotification {
    pub destination: String,
    pub consumer_id: ConsumerId,
    pub message_id: MessageId,
}

impl MessageDispatchNotification {
    pub fn new(destination: impl Into<String>, consumer_id: ConsumerId, message_id: MessageId) -> Self {
        Self {
            destination: destination.into(),
            consumer_id,
            message_id,
        }
    }
}

impl Queue {
    /// Replay a master's dispatch on this replica: find the message wherever
    /// it sits and hand it to the named consumer.
    ///
    /// A notification for a consumer this replica does not know is ignored.
    /// One for a message the replica cannot find, or that another consumer
    /// already holds, means the replica has diverged.
    pub fn process_dispatch_notification(
        &self,
        notification: &MessageDispatchNotification,
    ) -> Result<(), BlipError> {
        if notification.destination != self.name {
            return Err(BlipError::OutOfSync(format!(
                "dispatch notification for {} delivered to {}",
                notification.destination, self.name
            )));
        }

        let consumers = self.consumers.write();
        let Some(sub) = consumers.find(&notification.consumer_id).cloned() else {
            debug!(
                queue = %self.name,
                consumer = %notification.consumer_id,
                message_id = %notification.message_id,
                "dispatch notification for unknown consumer ignored"
            );
            return Ok(());
        };

        let id = notification.message_id;
        let mut state = self.dispatch.lock();

        if let Some(reference) = state.working_set.get(&id) {
            if reference.is_locked_by(&notification.consumer_id) {
                trace!(queue = %self.name, message_id = %id, "dispatch already applied");
                return Ok(());
            }
            return Err(BlipError::OutOfSync(format!(
                "message {id} on {} is already dispatched to another consumer",
                self.name
            )));
        }

        let reference = match state.pending.iter().position(|r| r.id() == id) {
            Some(pos) => state.pending.remove(pos),
            None => self.take_from_cursor(id)?,
        };
        let Some(reference) = reference else {
            return Err(BlipError::OutOfSync(format!(
                "message {id} from dispatch notification not found on {}",
                self.name
            )));
        };

        if !reference.lock(LockOwner::Consumer(notification.consumer_id.clone())) {
            state.pending.push_front(reference);
            return Err(BlipError::OutOfSync(format!(
                "message {id} on {} is locked by another owner",
                self.name
            )));
        }
        if let Err(e) = sub.add(reference.clone()) {
            reference.unlock();
            state.pending.push_front(reference);
            return Err(e);
        }

        DestinationStatistics::increment(&self.stats.dispatched);
        DestinationStatistics::increment(&self.stats.inflight);
        state.working_set.insert(id, reference);
        trace!(queue = %self.name, message_id = %id, consumer = %notification.consumer_id, "replayed dispatch");
        Ok(())
    }

    /// Pull `id` out of the cursor. A memory cursor may have skipped stored
    /// messages at recovery, so those are read back from the store.
    fn take_from_cursor(&self, id: MessageId) -> Result<Option<Arc<MessageReference>>, BlipError> {
        {
            let mut cursor = self.cursor.lock();
            cursor.reset();
            let mut found = None;
            while let Some(reference) = cursor.next() {
                if reference.id() == id {
                    cursor.remove();
                    found = Some(reference);
                    break;
                }
            }
            cursor.release();
            if found.is_some() || cursor.is_store_backed() {
                return Ok(found);
            }
        }

        let Some(store) = &self.store else {
            return Ok(None);
        };
        let Some(message) = store.get_message(id)? else {
            return Ok(None);
        };
        let reference = MessageReference::new(
            id,
            message,
            Some(store.clone()),
            Some(self.usage.memory.clone()),
        );
        reference.increment_reference_count();
        self.usage.store.increase_usage(reference.size() as u64);
        DestinationStatistics::increment(&self.stats.enqueues);
        DestinationStatistics::increment(&self.stats.messages);
        debug!(queue = %self.name, message_id = %id, "loaded notified message from store");
        Ok(Some(reference))
    }
}
