use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::Queue;
use crate::core::context::{ConnectionContext, ProducerInfo};
use crate::core::error::BlipError;
use crate::core::message::{Message, MessageId};
use crate::core::reference::MessageReference;
use crate::core::statistics::DestinationStatistics;
use crate::core::transaction::TransactionCallbacks;
use crate::core::usage::Usage;

/// Longest single wait of a blocked producer before it re-checks its
/// connection and the overall timeout.
const BLOCKED_SEND_POLL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum SendOutcome {
    /// Stored and queued (or enlisted in the caller's transaction).
    Accepted(MessageId),
    /// Parked until a usage gate reopens; resolve with [`SendReceipt::wait`].
    Deferred(SendReceipt),
    /// Already expired on arrival and discarded.
    Expired,
}

impl SendOutcome {
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            SendOutcome::Accepted(id) => Some(*id),
            _ => None,
        }
    }
}

/// Completion of a deferred send.
#[derive(Debug)]
pub struct SendReceipt {
    destination: String,
    rx: oneshot::Receiver<Result<MessageId, BlipError>>,
}

impl SendReceipt {
    pub async fn wait(self) -> Result<MessageId, BlipError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(BlipError::QueueStopped(self.destination)),
        }
    }
}

pub(super) struct DeferredSend {
    context: ConnectionContext,
    message: Message,
    reply: oneshot::Sender<Result<MessageId, BlipError>>,
}

impl DeferredSend {
    pub(super) fn complete(self, result: Result<MessageId, BlipError>) {
        // The producer may have given up on the receipt.
        let _ = self.reply.send(result);
    }
}

impl Queue {
    /// Accept a message from a producer.
    ///
    /// When producer flow control is on and a usage gate is full the send
    /// fails fast (`send_fail_if_no_space`), is parked for producers that
    /// can take a late completion, or blocks until space frees up, the
    /// connection closes, or the configured timeout passes. A producer that
    /// can be parked also queues behind any sends still parked, so its
    /// messages keep their order.
    pub async fn send(
        &self,
        context: &ConnectionContext,
        producer: &ProducerInfo,
        mut message: Message,
    ) -> Result<SendOutcome, BlipError> {
        if self.is_stopped() {
            return Err(BlipError::QueueStopped(self.name.clone()));
        }
        message.destination = self.name.clone();

        if message.is_expired() {
            debug!(
                queue = %self.name,
                producer = %producer.producer_id,
                "dropping message that expired before it was queued"
            );
            return Ok(SendOutcome::Expired);
        }

        if self.policy.producer_flow_control {
            let gate = self.full_gate(&message);
            let can_park = producer.supports_async_ack() && !context.in_transaction();
            if let Some(gate) = &gate {
                if self.policy.send_fail_if_no_space {
                    return Err(self.resource_error(gate));
                }
                DestinationStatistics::increment(&self.stats.blocked_sends);
            }

            // Sends parked earlier go first even when the gate has reopened
            // but the queue has not drained them yet.
            let unparked = {
                let mut deferred = self.deferred.lock();
                if can_park && (gate.is_some() || !deferred.is_empty()) {
                    if self.is_stopped() {
                        return Err(BlipError::QueueStopped(self.name.clone()));
                    }
                    let (tx, rx) = oneshot::channel();
                    deferred.push_back(DeferredSend {
                        context: context.clone(),
                        message,
                        reply: tx,
                    });
                    Err(rx)
                } else {
                    Ok(message)
                }
            };
            message = match unparked {
                Ok(message) => message,
                Err(rx) => {
                    match &gate {
                        Some(gate) => {
                            debug!(queue = %self.name, producer = %producer.producer_id, usage = gate.name(), "send parked until space frees");
                            self.watch_for_space(gate);
                        }
                        None => {
                            debug!(queue = %self.name, producer = %producer.producer_id, "send parked behind earlier deferred sends");
                            self.wakeup();
                        }
                    }
                    return Ok(SendOutcome::Deferred(SendReceipt {
                        destination: self.name.clone(),
                        rx,
                    }));
                }
            };

            if gate.is_some() {
                self.wait_for_space(context, producer, &message).await?;
            }
        }

        let id = self.accept(context, message)?;
        self.wakeup();
        Ok(SendOutcome::Accepted(id))
    }

    /// Queue a message on the broker's behalf. Skips flow control and does
    /// not wake the queue.
    pub(crate) fn enqueue_internal(&self, mut message: Message) -> Result<MessageId, BlipError> {
        if self.is_stopped() {
            return Err(BlipError::QueueStopped(self.name.clone()));
        }
        message.destination = self.name.clone();
        let id = self.assign_id(&mut message);
        self.store_and_add(id, message)?;
        Ok(id)
    }

    fn assign_id(&self, message: &mut Message) -> MessageId {
        *message.id.get_or_insert_with(|| self.ids.next_id())
    }

    /// Store and queue now, or at commit when the context is transacted.
    fn accept(&self, context: &ConnectionContext, mut message: Message) -> Result<MessageId, BlipError> {
        let id = self.assign_id(&mut message);
        match context.transaction() {
            None => self.store_and_add(id, message)?,
            Some(tx) => {
                let queue = self
                    .handle()
                    .ok_or_else(|| BlipError::QueueStopped(self.name.clone()))?;
                let name = self.name.clone();
                tx.add_synchronization(TransactionCallbacks::new(
                    move || {
                        queue.store_and_add(id, message)?;
                        queue.wakeup();
                        Ok(())
                    },
                    move || trace!(queue = %name, message_id = %id, "transacted send rolled back"),
                ))?;
            }
        }
        Ok(id)
    }

    /// Persist (when durable) and append to the cursor under the cursor
    /// lock, so the store and cursor see sends in the same order.
    fn store_and_add(&self, id: MessageId, message: Message) -> Result<(), BlipError> {
        let message = Arc::new(message);
        let added = {
            let mut cursor = self.cursor.lock();
            if message.persistent {
                if let Some(store) = &self.store {
                    store.add_message(&message)?;
                    self.usage.store.increase_usage(message.size() as u64);
                }
            }
            let reference = MessageReference::new(
                id,
                message,
                self.store.clone(),
                Some(self.usage.memory.clone()),
            );
            reference.increment_reference_count();
            cursor.add_message_last(reference)
        };

        if !added {
            debug!(queue = %self.name, message_id = %id, "duplicate send ignored");
            return Ok(());
        }

        DestinationStatistics::increment(&self.stats.enqueues);
        DestinationStatistics::increment(&self.stats.messages);
        if self.stats.consumers.load(Ordering::Relaxed) == 0 {
            trace!(queue = %self.name, message_id = %id, "queued with no consumers attached");
        }
        Ok(())
    }

    /// The first saturated gate this message is subject to.
    fn full_gate(&self, message: &Message) -> Option<Arc<Usage>> {
        if self.usage.memory.is_full() {
            return Some(self.usage.memory.clone());
        }
        if message.persistent && self.store.is_some() && self.usage.store.is_full() {
            return Some(self.usage.store.clone());
        }
        if !message.persistent && self.store_cursor && self.usage.temp.is_full() {
            return Some(self.usage.temp.clone());
        }
        None
    }

    fn resource_error(&self, gate: &Usage) -> BlipError {
        BlipError::ResourceAllocation {
            destination: self.name.clone(),
            usage: gate.name().to_string(),
        }
    }

    async fn wait_for_space(
        &self,
        context: &ConnectionContext,
        producer: &ProducerInfo,
        message: &Message,
    ) -> Result<(), BlipError> {
        let started = Instant::now();
        let timeout = self.policy.send_fail_if_no_space_after_timeout();
        loop {
            let Some(gate) = self.full_gate(message) else {
                return Ok(());
            };
            if context.is_stopping() {
                return Err(BlipError::SendAborted(context.connection_id()));
            }
            if self.is_stopped() {
                return Err(BlipError::QueueStopped(self.name.clone()));
            }
            let mut wait = BLOCKED_SEND_POLL;
            if let Some(timeout) = timeout {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    return Err(self.resource_error(&gate));
                }
                wait = wait.min(timeout - elapsed);
            }
            self.warn_blocked_producer(producer, &gate);
            gate.wait_for_space(wait).await;
        }
    }

    fn warn_blocked_producer(&self, producer: &ProducerInfo, gate: &Usage) {
        let interval = self.policy.blocked_producer_warning_interval();
        let mut last = self.last_blocked_warning.lock();
        if last.is_some_and(|at| at.elapsed() < interval) {
            return;
        }
        *last = Some(Instant::now());
        warn!(
            queue = %self.name,
            producer = %producer.producer_id,
            usage = gate.name(),
            percent = gate.percent_usage(),
            "usage limit reached, producer blocked until space frees"
        );
    }

    /// Arrange a wake-up for when `gate` reopens. At most one callback is
    /// outstanding per queue.
    fn watch_for_space(&self, gate: &Usage) {
        if self.space_callback_armed.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = self.self_ref.clone();
        let registered = gate.notify_when_not_full(Box::new(move || {
            if let Some(queue) = weak.upgrade() {
                queue.space_callback_armed.store(false, Ordering::Release);
                queue.wakeup_detached();
            }
        }));
        if !registered {
            self.space_callback_armed.store(false, Ordering::Release);
            self.wakeup_detached();
        }
    }

    /// Feed parked sends back in while the gates have room.
    pub(super) fn drain_deferred_sends(&self) {
        // The parked list stays locked across each accept, so a new send
        // that finds it empty is ordered after every send drained before it.
        let mut deferred = self.deferred.lock();
        loop {
            let gate = match deferred.front() {
                None => return,
                Some(send) => self.full_gate(&send.message),
            };
            if let Some(gate) = gate {
                drop(deferred);
                self.watch_for_space(&gate);
                return;
            }

            let Some(send) = deferred.pop_front() else {
                return;
            };
            if send.context.is_stopping() {
                let connection = send.context.connection_id();
                send.complete(Err(BlipError::SendAborted(connection)));
                continue;
            }
            let DeferredSend {
                context,
                message,
                reply,
            } = send;
            let result = self.accept(&context, message);
            if let Err(e) = &result {
                warn!(queue = %self.name, error = %e, "deferred send failed");
            }
            let _ = reply.send(result);
        }
    }
}
