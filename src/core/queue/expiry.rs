use std::sync::Arc;

use tracing::{debug, warn};

use super::Queue;
use crate::core::reference::MessageReference;
use crate::core::statistics::DestinationStatistics;

impl Queue {
    /// Sweep the pending-dispatch list and the head of the cursor for
    /// expired messages. Returns how many expired.
    ///
    /// In-flight messages are left to their consumer; the scan never keeps
    /// more than one cursor page of references around.
    pub fn expire_messages(&self) -> usize {
        let expired = {
            let _consumers = self.consumers.write();
            let mut expired: Vec<Arc<MessageReference>> = Vec::new();
            {
                let mut state = self.dispatch.lock();
                state.pending.retain(|reference| {
                    if reference.is_expired() && !reference.is_acked() {
                        expired.push(reference.clone());
                        false
                    } else {
                        true
                    }
                });
            }
            {
                let mut cursor = self.cursor.lock();
                cursor.reset();
                let mut scanned = 0;
                while scanned < self.policy.max_expire_page_size && cursor.has_next() {
                    let Some(reference) = cursor.next() else {
                        break;
                    };
                    scanned += 1;
                    if reference.is_expired() {
                        cursor.remove();
                        expired.push(reference);
                    }
                }
                cursor.release();
            }
            for reference in &expired {
                self.expire_reference(reference);
            }
            expired.len()
        };

        if expired > 0 {
            debug!(queue = %self.name, expired, "expiry sweep");
        }
        self.wakeup();
        expired
    }

    /// Settle an expired reference: expired count, store removal, optional
    /// dead-lettering of durable messages. Never counted as a dequeue and
    /// never wakes the queue.
    pub(super) fn expire_reference(&self, reference: &Arc<MessageReference>) {
        if reference.is_dropped() || reference.is_acked() {
            return;
        }
        if reference.is_persistent() && self.policy.dead_letter_expired {
            self.dead_letter(reference, "expired");
        }
        if let Err(e) = self.remove_from_store(reference, reference.id()) {
            warn!(queue = %self.name, message_id = %reference.id(), error = %e, "failed to remove expired message from store");
        }
        DestinationStatistics::increment(&self.stats.expired);
        self.drop_message(reference);
        debug!(queue = %self.name, message_id = %reference.id(), "message expired");
    }
}
