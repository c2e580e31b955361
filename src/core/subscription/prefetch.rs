use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{ConsumerInfo, Delivery, Subscription};
use crate::core::context::ConnectionContext;
use crate::core::error::BlipError;
use crate::core::message::{AckKind, MessageAck};
use crate::core::queue::Queue;
use crate::core::reference::MessageReference;
use crate::core::transaction::TransactionCallbacks;

/// A competing consumer with a prefetch window.
///
/// Dispatched references stay in `dispatched` (and keep a reference count)
/// until acknowledged, so a disconnect can hand them back for redelivery.
#[derive(Debug)]
pub struct PrefetchSubscription {
    info: ConsumerInfo,
    dispatched: Mutex<Vec<Arc<MessageReference>>>,
    sender: flume::Sender<Delivery>,
    closed: AtomicBool,
}

impl PrefetchSubscription {
    pub fn new(info: ConsumerInfo) -> (Arc<Self>, flume::Receiver<Delivery>) {
        let (tx, rx) = flume::unbounded();
        let sub = Arc::new(Self {
            info,
            dispatched: Mutex::new(Vec::new()),
            sender: tx,
            closed: AtomicBool::new(false),
        });
        (sub, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Ids of dispatched, unacknowledged messages in dispatch order.
    pub fn dispatched_ids(&self) -> Vec<crate::core::message::MessageId> {
        self.dispatched.lock().iter().map(|r| r.id()).collect()
    }

    /// Acknowledge the in-flight messages covered by `ack` against `queue`.
    ///
    /// Returns how many messages the ack settled. An ack that matches
    /// nothing in flight, or whose count disagrees with the range, is
    /// rejected.
    pub fn acknowledge(
        self: &Arc<Self>,
        context: &ConnectionContext,
        queue: &Queue,
        ack: &MessageAck,
    ) -> Result<usize, BlipError> {
        let matched: Vec<Arc<MessageReference>> = self
            .dispatched
            .lock()
            .iter()
            .filter(|r| ack.covers(r.id()))
            .cloned()
            .collect();

        if matched.is_empty() {
            return Err(BlipError::InvalidAck(format!(
                "consumer {} has no in-flight message matching ack up to {}",
                self.info.consumer_id, ack.last_message_id
            )));
        }
        if ack.kind == AckKind::Standard && matched.len() != ack.message_count {
            return Err(BlipError::InvalidAck(format!(
                "ack for {} messages up to {} matched {} in flight on consumer {}",
                ack.message_count,
                ack.last_message_id,
                matched.len(),
                self.info.consumer_id
            )));
        }

        for reference in &matched {
            if !queue.acknowledge(context, self.as_ref(), ack, reference)? {
                // Settled by the broker already (purged, expired) or by a
                // transaction still in progress.
                if reference.is_dropped() {
                    self.release(reference);
                }
                continue;
            }
            match context.transaction() {
                None => self.release(reference),
                Some(tx) => {
                    let sub = Arc::clone(self);
                    let r = Arc::clone(reference);
                    let handle = queue.handle();
                    tx.add_synchronization(TransactionCallbacks::new(
                        move || {
                            // Settlement runs first at commit; a failed one
                            // leaves the message dispatched to this consumer.
                            if r.is_dropped() {
                                sub.release(&r);
                            }
                            if let Some(queue) = handle {
                                queue.wakeup();
                            }
                            Ok(())
                        },
                        || {},
                    ))?;
                }
            }
        }

        trace!(consumer = %self.info.consumer_id, settled = matched.len(), "acknowledged");
        queue.wakeup();
        Ok(matched.len())
    }

    fn release(&self, reference: &Arc<MessageReference>) {
        let mut dispatched = self.dispatched.lock();
        if let Some(pos) = dispatched.iter().position(|r| Arc::ptr_eq(r, reference)) {
            dispatched.remove(pos);
            reference.decrement_reference_count();
        }
    }
}

impl Subscription for PrefetchSubscription {
    fn info(&self) -> &ConsumerInfo {
        &self.info
    }

    fn add(&self, reference: Arc<MessageReference>) -> Result<(), BlipError> {
        if self.is_closed() {
            return Err(BlipError::Subscription(format!(
                "consumer {} is closed",
                self.info.consumer_id
            )));
        }
        let delivery = Delivery::from_reference(&self.info.consumer_id, &reference)?;

        let mut dispatched = self.dispatched.lock();
        self.sender.send(delivery).map_err(|_| {
            BlipError::Subscription(format!(
                "consumer {} receiver dropped",
                self.info.consumer_id
            ))
        })?;
        reference.increment_reference_count();
        dispatched.push(reference);
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.dispatched.lock().len() >= self.info.prefetch_size
    }

    fn count_before_full(&self) -> usize {
        self.info
            .prefetch_size
            .saturating_sub(self.dispatched.lock().len())
    }

    fn remove(&self) -> Vec<Arc<MessageReference>> {
        self.closed.store(true, Ordering::Release);
        let in_flight = std::mem::take(&mut *self.dispatched.lock());
        for reference in &in_flight {
            reference.decrement_reference_count();
        }
        debug!(
            consumer = %self.info.consumer_id,
            in_flight = in_flight.len(),
            "prefetch subscription removed"
        );
        in_flight
    }

    fn in_flight(&self) -> usize {
        self.dispatched.lock().len()
    }
}
