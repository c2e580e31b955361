mod common;

use std::sync::Arc;

use blipq::config::UsageConfig;
use blipq::core::message::MessageId;
use blipq::core::queue::{MessageDispatchNotification, Queue};
use blipq::core::store::MemoryMessageStore;
use blipq::core::subscription::ConsumerId;
use blipq::core::usage::SystemUsage;
use blipq::BlipError;
use common::{policy, send_blocking, TestConsumer};

fn slave(name: &str) -> Arc<Queue> {
    common::init_logging();
    let q = Queue::builder(name).policy(policy()).build().unwrap();
    q.set_slave(true);
    q.start().unwrap();
    q
}

fn notify(q: &Queue, consumer: &str, id: MessageId) -> Result<(), BlipError> {
    q.process_dispatch_notification(&MessageDispatchNotification::new(
        q.name(),
        ConsumerId::new(consumer),
        id,
    ))
}

#[test]
fn slave_only_dispatches_what_it_is_told() {
    let q = slave("replica");
    let c1 = TestConsumer::new(&q, "c1", 10);
    let c2 = TestConsumer::new(&q, "c2", 10);
    let ids: Vec<_> = (0..3).map(|i| send_blocking(&q, &format!("m{i}"))).collect();
    assert!(c1.drain_ids().is_empty());
    assert!(c2.drain_ids().is_empty());

    notify(&q, "c2", ids[1]).unwrap();
    notify(&q, "c1", ids[2]).unwrap();
    assert_eq!(c2.drain_ids(), vec![ids[1]]);
    assert_eq!(c1.drain_ids(), vec![ids[2]]);
    assert_eq!(q.in_flight_count(), 2);
    assert_eq!(q.pending_count(), 1);

    // Replaying the same decision is harmless.
    notify(&q, "c2", ids[1]).unwrap();
    assert!(c2.drain_ids().is_empty());
}

#[test]
fn leaving_slave_mode_resumes_normal_dispatch() {
    let q = slave("promoted");
    let c = TestConsumer::new(&q, "c", 10);
    let ids: Vec<_> = (0..2).map(|i| send_blocking(&q, &format!("m{i}"))).collect();
    assert!(c.drain_ids().is_empty());

    q.set_slave(false);
    assert_eq!(c.drain_ids(), ids);
}

#[test]
fn unknown_consumer_is_ignored() {
    let q = slave("unknown-consumer");
    let id = send_blocking(&q, "m");
    notify(&q, "ghost", id).unwrap();
    assert_eq!(q.in_flight_count(), 0);
    assert_eq!(q.pending_count(), 1);
}

#[test]
fn missing_message_is_out_of_sync() {
    let q = slave("diverged");
    let _c = TestConsumer::new(&q, "c", 10);
    send_blocking(&q, "m");
    assert!(matches!(
        notify(&q, "c", MessageId::from_raw(424_242)),
        Err(BlipError::OutOfSync(_))
    ));
}

#[test]
fn message_held_by_another_consumer_is_out_of_sync() {
    let q = slave("double-dispatch");
    let _c1 = TestConsumer::new(&q, "c1", 10);
    let _c2 = TestConsumer::new(&q, "c2", 10);
    let id = send_blocking(&q, "m");
    notify(&q, "c1", id).unwrap();
    assert!(matches!(notify(&q, "c2", id), Err(BlipError::OutOfSync(_))));
}

#[test]
fn wrong_destination_is_out_of_sync() {
    let q = slave("here");
    let notification =
        MessageDispatchNotification::new("elsewhere", ConsumerId::new("c"), MessageId::from_raw(1));
    assert!(matches!(
        q.process_dispatch_notification(&notification),
        Err(BlipError::OutOfSync(_))
    ));
}

#[test]
fn messages_left_in_the_store_are_loaded_on_demand() {
    common::init_logging();
    let store = Arc::new(MemoryMessageStore::new("spilled"));
    let ids: Vec<_> = {
        let master = Queue::builder("spilled")
            .policy(policy())
            .store(store.clone())
            .build()
            .unwrap();
        master.start().unwrap();
        (0..3).map(|i| send_blocking(&master, &format!("m{i}"))).collect()
    };

    // Room for a single message, so recovery stops after the first.
    let usage = SystemUsage::from_config(&UsageConfig {
        memory_limit_bytes: 50,
        ..UsageConfig::default()
    });
    let q = Queue::builder("spilled")
        .policy(policy())
        .usage(usage)
        .store(store.clone())
        .build()
        .unwrap();
    q.set_slave(true);
    q.start().unwrap();
    assert_eq!(q.pending_count(), 1);

    let c = TestConsumer::new(&q, "c", 10);
    notify(&q, "c", ids[2]).unwrap();
    assert_eq!(c.drain_ids(), vec![ids[2]]);
    assert_eq!(q.in_flight_count(), 1);
}
