#![allow(dead_code)]

use std::sync::{Arc, Once};

use blipq::config::QueuePolicy;
use blipq::core::context::{ConnectionContext, ProducerInfo};
use blipq::core::message::{Message, MessageAck, MessageId};
use blipq::core::queue::Queue;
use blipq::core::subscription::{ConsumerId, ConsumerInfo, Delivery, PrefetchSubscription};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = blipq::logging::init_logging();
    });
}

/// Default policy without the periodic expiry timer.
pub fn policy() -> QueuePolicy {
    QueuePolicy {
        expire_messages_period_ms: 0,
        ..QueuePolicy::default()
    }
}

pub fn queue(name: &str, policy: QueuePolicy) -> Arc<Queue> {
    init_logging();
    let queue = Queue::builder(name).policy(policy).build().unwrap();
    queue.start().unwrap();
    queue
}

pub struct TestConsumer {
    pub id: ConsumerId,
    pub sub: Arc<PrefetchSubscription>,
    pub rx: flume::Receiver<Delivery>,
    pub context: ConnectionContext,
}

impl TestConsumer {
    pub fn attach(queue: &Queue, info: ConsumerInfo) -> Self {
        let context = ConnectionContext::new(format!("client-{}", info.consumer_id));
        let id = info.consumer_id.clone();
        let (sub, rx) = PrefetchSubscription::new(info);
        queue.add_subscription(&context, sub.clone()).unwrap();
        Self { id, sub, rx, context }
    }

    pub fn new(queue: &Queue, id: &str, prefetch: usize) -> Self {
        Self::attach(queue, ConsumerInfo::new(id, prefetch))
    }

    /// Everything delivered so far.
    pub fn drain(&self) -> Vec<Delivery> {
        self.rx.try_iter().collect()
    }

    pub fn drain_ids(&self) -> Vec<MessageId> {
        self.drain().into_iter().map(|d| d.message_id).collect()
    }

    pub fn ack(&self, queue: &Queue, id: MessageId) -> usize {
        let ack = MessageAck::individual(queue.name(), self.id.clone(), id);
        self.sub.acknowledge(&self.context, queue, &ack).unwrap()
    }

    pub fn detach(&self, queue: &Queue) {
        queue
            .remove_subscription(&self.context, &self.id, None)
            .unwrap();
    }
}

pub async fn send(queue: &Queue, body: &str) -> MessageId {
    send_message(queue, Message::new(body.to_string())).await
}

pub async fn send_message(queue: &Queue, message: Message) -> MessageId {
    let context = ConnectionContext::new("producer");
    let producer = ProducerInfo::new("producer");
    queue
        .send(&context, &producer, message)
        .await
        .unwrap()
        .message_id()
        .expect("send accepted")
}

pub fn send_blocking(queue: &Queue, body: &str) -> MessageId {
    futures::executor::block_on(send(queue, body))
}
