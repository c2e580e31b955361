mod common;

use std::collections::HashSet;

use blipq::config::QueuePolicy;
use blipq::core::subscription::ConsumerInfo;
use common::{policy, queue, send_blocking, TestConsumer};

#[test]
fn competing_consumers_take_turns() {
    let q = queue("rr", policy());
    let c1 = TestConsumer::new(&q, "c1", 10);
    let c2 = TestConsumer::new(&q, "c2", 10);

    let ids: Vec<_> = (0..4).map(|i| send_blocking(&q, &format!("m{i}"))).collect();

    assert_eq!(c1.drain_ids(), vec![ids[0], ids[2]]);
    assert_eq!(c2.drain_ids(), vec![ids[1], ids[3]]);
    assert_eq!(q.in_flight_count(), 4);
    assert_eq!(q.stats().dispatched, 4);
}

#[test]
fn backlog_spills_over_to_a_consumer_with_room() {
    let q = queue("backlog", policy());
    let ids: Vec<_> = (0..4).map(|i| send_blocking(&q, &format!("m{i}"))).collect();
    assert_eq!(q.pending_count(), 4);

    let c1 = TestConsumer::new(&q, "c1", 2);
    assert_eq!(c1.drain_ids(), vec![ids[0], ids[1]]);
    assert_eq!(q.pending_count(), 2);

    let c2 = TestConsumer::new(&q, "c2", 2);
    assert_eq!(c2.drain_ids(), vec![ids[2], ids[3]]);
    assert_eq!(q.pending_count(), 0);
}

#[test]
fn ack_frees_a_prefetch_slot() {
    let q = queue("prefetch", policy());
    let c1 = TestConsumer::new(&q, "c1", 1);
    let ids: Vec<_> = (0..3).map(|i| send_blocking(&q, &format!("m{i}"))).collect();

    assert_eq!(c1.drain_ids(), vec![ids[0]]);
    assert_eq!(c1.ack(&q, ids[0]), 1);
    assert_eq!(c1.drain_ids(), vec![ids[1]]);
    assert_eq!(c1.ack(&q, ids[1]), 1);
    assert_eq!(c1.drain_ids(), vec![ids[2]]);
}

#[test]
fn lazy_dispatch_waits_for_enough_consumers() {
    let q = queue(
        "lazy",
        QueuePolicy {
            lazy_dispatch: true,
            consumers_before_dispatch_starts: 2,
            ..policy()
        },
    );
    let ids: Vec<_> = (0..3).map(|i| send_blocking(&q, &format!("m{i}"))).collect();

    let c1 = TestConsumer::new(&q, "c1", 1);
    assert!(c1.drain_ids().is_empty(), "dispatch must wait for the second consumer");

    let c2 = TestConsumer::new(&q, "c2", 1);
    assert_eq!(c1.drain_ids(), vec![ids[0]]);
    assert_eq!(c2.drain_ids(), vec![ids[1]]);
    // Lazy paging only pulls what the consumers can take.
    assert_eq!(q.pending_count(), 1);

    c1.ack(&q, ids[0]);
    assert_eq!(c1.drain_ids(), vec![ids[2]]);
    assert!(c2.drain_ids().is_empty());
}

#[test]
fn exclusive_consumer_gets_everything_until_it_leaves() {
    let q = queue("exclusive", policy());
    let shared = TestConsumer::new(&q, "shared", 10);
    let owner = TestConsumer::attach(&q, ConsumerInfo::new("owner", 10).exclusive());
    assert_eq!(q.exclusive_consumer().map(|c| c.to_string()), Some("owner".into()));

    let ids: Vec<_> = (0..3).map(|i| send_blocking(&q, &format!("m{i}"))).collect();
    assert_eq!(owner.drain_ids(), ids);
    assert!(shared.drain_ids().is_empty());

    owner.detach(&q);
    assert!(q.exclusive_consumer().is_none());
    let redelivered = shared.drain();
    assert_eq!(redelivered.iter().map(|d| d.message_id).collect::<Vec<_>>(), ids);
    assert!(redelivered.iter().all(|d| d.redelivery_counter == 1));
}

#[test]
fn higher_priority_exclusive_consumer_takes_over() {
    let q = queue("exclusive-priority", policy());
    let low = TestConsumer::attach(&q, ConsumerInfo::new("low", 10).exclusive());
    let first = send_blocking(&q, "m0");
    assert_eq!(low.drain_ids(), vec![first]);

    let high = TestConsumer::attach(&q, ConsumerInfo::new("high", 10).exclusive().with_priority(5));
    assert_eq!(q.exclusive_consumer().map(|c| c.to_string()), Some("high".into()));

    let second = send_blocking(&q, "m1");
    assert_eq!(high.drain_ids(), vec![second]);
    assert!(low.drain_ids().is_empty());
}

#[test]
fn all_consumers_exclusive_by_default_keeps_the_first_owner() {
    let q = queue(
        "all-exclusive",
        QueuePolicy {
            all_consumers_exclusive_by_default: true,
            ..policy()
        },
    );
    let a = TestConsumer::new(&q, "a", 10);
    let b = TestConsumer::new(&q, "b", 10);
    let ids: Vec<_> = (0..3).map(|i| send_blocking(&q, &format!("m{i}"))).collect();

    assert_eq!(a.drain_ids(), ids);
    assert!(b.drain_ids().is_empty());
}

#[test]
fn higher_priority_consumers_are_tried_first() {
    let q = queue("priority", policy());
    let low = TestConsumer::new(&q, "low", 10);
    let high = TestConsumer::attach(&q, ConsumerInfo::new("high", 1).with_priority(9));

    let ids: Vec<_> = (0..3).map(|i| send_blocking(&q, &format!("m{i}"))).collect();
    assert_eq!(high.drain_ids(), vec![ids[0]]);
    assert_eq!(low.drain_ids(), vec![ids[1], ids[2]]);
}

#[test]
fn strict_order_dispatch_does_not_rotate() {
    let q = queue(
        "strict",
        QueuePolicy {
            strict_order_dispatch: true,
            ..policy()
        },
    );
    let c1 = TestConsumer::new(&q, "c1", 2);
    let c2 = TestConsumer::new(&q, "c2", 2);
    let ids: Vec<_> = (0..3).map(|i| send_blocking(&q, &format!("m{i}"))).collect();

    assert_eq!(c1.drain_ids(), vec![ids[0], ids[1]]);
    assert_eq!(c2.drain_ids(), vec![ids[2]]);
}

#[test]
fn selectors_route_matching_messages() {
    use blipq::core::filter::MessageFilter;
    use blipq::core::message::Message;

    let q = queue("selectors", policy());
    let red = TestConsumer::attach(
        &q,
        ConsumerInfo::new("red", 10).with_selector(MessageFilter::property_equals("color", "red")),
    );
    let blue = TestConsumer::attach(
        &q,
        ConsumerInfo::new("blue", 10).with_selector(MessageFilter::property_equals("color", "blue")),
    );

    let r = futures::executor::block_on(common::send_message(&q, Message::new("r").with_property("color", "red")));
    let b = futures::executor::block_on(common::send_message(&q, Message::new("b").with_property("color", "blue")));
    let g = futures::executor::block_on(common::send_message(&q, Message::new("g").with_property("color", "green")));

    assert_eq!(red.drain_ids(), vec![r]);
    assert_eq!(blue.drain_ids(), vec![b]);
    // Nobody wants green; it waits without blocking the others.
    assert_eq!(q.pending_count(), 1);
    assert!(q.browse().iter().any(|m| m.id == Some(g)));
}

#[test]
fn detached_consumer_messages_are_redelivered_in_order() {
    let q = queue("redelivery", policy());
    let c1 = TestConsumer::new(&q, "c1", 10);
    let ids: Vec<_> = (0..3).map(|i| send_blocking(&q, &format!("m{i}"))).collect();
    assert_eq!(c1.drain_ids(), ids);
    c1.ack(&q, ids[1]);

    let c2 = TestConsumer::new(&q, "c2", 10);
    c1.detach(&q);

    let redelivered = c2.drain();
    assert_eq!(
        redelivered.iter().map(|d| d.message_id).collect::<Vec<_>>(),
        vec![ids[0], ids[2]]
    );
    assert!(redelivered.iter().all(|d| d.redelivery_counter == 1));

    let stats = q.stats();
    assert_eq!(stats.redelivered, 2);
    assert_eq!(stats.consumers, 1);
    assert_eq!(stats.inflight, 2);
    assert!(stats.is_balanced());
}

#[test]
fn redelivery_counter_only_moves_for_delivered_messages() {
    let q = queue("last-delivered", policy());
    let c1 = TestConsumer::new(&q, "c1", 10);
    let ids: Vec<_> = (0..3).map(|i| send_blocking(&q, &format!("m{i}"))).collect();
    c1.drain();

    let c2 = TestConsumer::new(&q, "c2", 10);
    q.remove_subscription(&c1.context, &c1.id, Some(ids[0])).unwrap();

    let counters: Vec<_> = c2.drain().iter().map(|d| d.redelivery_counter).collect();
    assert_eq!(counters, vec![1, 0, 0]);
}

#[test]
fn every_message_is_dispatched_once_across_many_consumers() {
    let q = queue("fairness", policy());
    let consumers: Vec<_> = (0..5)
        .map(|i| TestConsumer::new(&q, &format!("c{i}"), 1000))
        .collect();
    let sent: HashSet<_> = (0..100).map(|i| send_blocking(&q, &format!("m{i}"))).collect();

    let mut seen = HashSet::new();
    for consumer in &consumers {
        let ids = consumer.drain_ids();
        assert_eq!(ids.len(), 20);
        for id in ids {
            assert!(seen.insert(id), "{id} dispatched twice");
        }
    }
    assert_eq!(seen, sent);
}

#[test]
fn duplicate_consumer_ids_are_rejected() {
    let q = queue("dupes", policy());
    let _c1 = TestConsumer::new(&q, "c1", 1);
    let (again, _rx) = blipq::core::subscription::PrefetchSubscription::new(ConsumerInfo::new("c1", 1));
    let context = blipq::core::context::ConnectionContext::new("other");
    assert!(q.add_subscription(&context, again).is_err());
    assert_eq!(q.consumer_count(), 1);
}

#[test]
fn small_pages_are_pulled_as_consumers_free_up() {
    let q = queue(
        "paging",
        QueuePolicy {
            max_page_size: 2,
            ..policy()
        },
    );
    let ids: Vec<_> = (1..=5).map(|i| send_blocking(&q, &format!("m{i}"))).collect();

    let c1 = TestConsumer::new(&q, "c1", 1);
    let c2 = TestConsumer::new(&q, "c2", 1);
    assert_eq!(c1.drain_ids(), vec![ids[0]]);
    assert_eq!(c2.drain_ids(), vec![ids[1]]);
    // Without lazy dispatch the pending list is topped up to the page size.
    assert_eq!(q.pending_count(), 3);
    assert_eq!(q.paged_in_pending_count(), 1);

    c1.ack(&q, ids[0]);
    assert_eq!(c1.drain_ids(), vec![ids[2]]);
    assert!(c2.drain_ids().is_empty());
    assert_eq!(q.pending_count(), 2);
    assert_eq!(q.paged_in_pending_count(), 1);
}

#[test]
fn lazy_paging_pulls_only_what_consumers_can_take() {
    let q = queue(
        "lazy-paging",
        QueuePolicy {
            max_page_size: 2,
            lazy_dispatch: true,
            consumers_before_dispatch_starts: 2,
            ..policy()
        },
    );
    let ids: Vec<_> = (1..=5).map(|i| send_blocking(&q, &format!("m{i}"))).collect();

    let c1 = TestConsumer::new(&q, "c1", 1);
    assert!(c1.drain_ids().is_empty());
    let c2 = TestConsumer::new(&q, "c2", 1);
    assert_eq!(c1.drain_ids(), vec![ids[0]]);
    assert_eq!(c2.drain_ids(), vec![ids[1]]);
    assert_eq!(q.paged_in_pending_count(), 0);
    assert_eq!(q.pending_count(), 3);

    c1.ack(&q, ids[0]);
    assert_eq!(c1.drain_ids(), vec![ids[2]]);
    assert!(c2.drain_ids().is_empty());
    assert_eq!(q.paged_in_pending_count(), 0);
    assert_eq!(q.pending_count(), 2);
}
