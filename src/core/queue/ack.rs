use std::sync::Arc;

use tracing::{debug, trace};

use super::Queue;
use crate::core::context::ConnectionContext;
use crate::core::error::BlipError;
use crate::core::message::MessageAck;
use crate::core::reference::MessageReference;
use crate::core::statistics::DestinationStatistics;
use crate::core::subscription::Subscription;
use crate::core::transaction::TransactionCallbacks;

impl Queue {
    /// Settle one dispatched reference covered by `ack`.
    ///
    /// Returns `false` when the reference was already settled. Outside a
    /// transaction the store removal happens first and a failure leaves the
    /// message untouched; inside one, removal and counters move at commit
    /// and a rollback makes the message deliverable again. Poison acks also
    /// copy the message to the dead-letter queue.
    ///
    /// The queue is not woken here; the subscription does that once it has
    /// freed its slot.
    pub fn acknowledge(
        &self,
        context: &ConnectionContext,
        sub: &dyn Subscription,
        ack: &MessageAck,
        reference: &Arc<MessageReference>,
    ) -> Result<bool, BlipError> {
        if ack.destination != self.name {
            return Err(BlipError::InvalidAck(format!(
                "ack for {} delivered to queue {}",
                ack.destination, self.name
            )));
        }
        if !ack.covers(reference.id()) {
            return Err(BlipError::InvalidAck(format!(
                "message {} is outside the acknowledged range ending at {}",
                reference.id(),
                ack.last_message_id
            )));
        }
        if reference.is_acked() || reference.is_dropped() {
            return Ok(false);
        }

        match context.transaction() {
            None => {
                self.settle(reference, ack)?;
                trace!(queue = %self.name, consumer = %sub.consumer_id(), message_id = %reference.id(), "acknowledged");
            }
            Some(tx) => {
                let queue = self
                    .handle()
                    .ok_or_else(|| BlipError::QueueStopped(self.name.clone()))?;
                reference.set_acked(true);

                let on_rollback = {
                    let queue = queue.clone();
                    let reference = reference.clone();
                    move || {
                        reference.set_acked(false);
                        queue.wakeup();
                    }
                };
                let committed = reference.clone();
                let ack = ack.clone();
                let registered = tx.add_synchronization(TransactionCallbacks::new(
                    move || {
                        // The message is still in flight if removal fails and
                        // must stay acknowledgeable.
                        if let Err(e) = queue.settle(&committed, &ack) {
                            committed.set_acked(false);
                            return Err(e);
                        }
                        queue.wakeup();
                        Ok(())
                    },
                    on_rollback,
                ));
                if let Err(e) = registered {
                    reference.set_acked(false);
                    return Err(e);
                }
                debug!(queue = %self.name, consumer = %sub.consumer_id(), message_id = %reference.id(), transaction = %tx.id(), "ack enlisted in transaction");
            }
        }
        Ok(true)
    }

    /// Remove from the store, count the dequeue and drop the queue's hold.
    /// Poison acks reach the dead-letter queue only once the removal has
    /// gone through, so a retried ack cannot dead-letter twice.
    fn settle(&self, reference: &Arc<MessageReference>, ack: &MessageAck) -> Result<(), BlipError> {
        if reference.is_dropped() {
            return Ok(());
        }
        self.remove_from_store(reference, reference.id())?;
        if ack.is_poison() {
            let cause = ack.poison_cause.as_deref().unwrap_or("poison ack");
            self.dead_letter(reference, cause);
            self.cursor.lock().rollback(reference.id());
        }
        reference.set_acked(true);
        DestinationStatistics::increment(&self.stats.dequeues);
        self.drop_message(reference);
        Ok(())
    }
}
