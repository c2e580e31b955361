mod common;

use std::sync::Arc;
use std::time::Duration;

use blipq::config::{QueuePolicy, UsageConfig};
use blipq::core::context::{ConnectionContext, ProducerInfo};
use blipq::core::message::Message;
use blipq::core::queue::{Queue, SendOutcome};
use blipq::core::store::MemoryMessageStore;
use blipq::core::task::TokioTaskRunnerFactory;
use blipq::core::usage::SystemUsage;
use blipq::BlipError;
use common::{policy, TestConsumer};

/// 100 byte payload, 164 bytes charged once the fixed overhead is added.
fn body() -> Message {
    Message::new(vec![b'x'; 100])
}

fn limited(name: &str, policy: QueuePolicy, memory_limit_bytes: u64) -> Arc<Queue> {
    common::init_logging();
    let usage = SystemUsage::from_config(&UsageConfig {
        memory_limit_bytes,
        ..UsageConfig::default()
    });
    let q = Queue::builder(name).policy(policy).usage(usage).build().unwrap();
    q.start().unwrap();
    q
}

async fn send(q: &Queue, context: &ConnectionContext, producer: &ProducerInfo) -> Result<SendOutcome, BlipError> {
    q.send(context, producer, body()).await
}

#[tokio::test]
async fn fail_fast_rejects_without_storing_or_counting() {
    let q = limited(
        "fail-fast",
        QueuePolicy {
            send_fail_if_no_space: true,
            ..policy()
        },
        200,
    );
    let context = ConnectionContext::new("p");
    let producer = ProducerInfo::new("p");

    send(&q, &context, &producer).await.unwrap();
    send(&q, &context, &producer).await.unwrap();
    let rejected = send(&q, &context, &producer).await;

    match rejected {
        Err(BlipError::ResourceAllocation { destination, usage }) => {
            assert_eq!(destination, "fail-fast");
            assert_eq!(usage, "memory");
        }
        other => panic!("expected a resource allocation error, got {other:?}"),
    }
    let stats = q.stats();
    assert_eq!(stats.enqueues, 2);
    assert_eq!(stats.messages, 2);
    assert_eq!(q.pending_count(), 2);
}

#[tokio::test]
async fn flow_control_off_accepts_past_the_limit() {
    let q = limited(
        "no-flow-control",
        QueuePolicy {
            producer_flow_control: false,
            send_fail_if_no_space: true,
            ..policy()
        },
        100,
    );
    let context = ConnectionContext::new("p");
    let producer = ProducerInfo::new("p");
    for _ in 0..3 {
        send(&q, &context, &producer).await.unwrap();
    }
    assert_eq!(q.stats().enqueues, 3);
}

#[tokio::test]
async fn blocked_send_resumes_once_an_ack_frees_memory() {
    let q = limited("blocking", policy(), 200);
    let c = TestConsumer::new(&q, "c", 10);
    let context = ConnectionContext::new("p");
    let producer = ProducerInfo::new("p");

    let first = send(&q, &context, &producer).await.unwrap().message_id().unwrap();
    send(&q, &context, &producer).await.unwrap();
    assert!(q.usage().memory.is_full());

    let blocked = {
        let q = q.clone();
        let (context, producer) = (context.clone(), producer.clone());
        tokio::spawn(async move { send(&q, &context, &producer).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());
    assert_eq!(q.stats().blocked_sends, 1);

    c.ack(&q, first);
    let outcome = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .expect("send still blocked")
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Accepted(_)));
    assert_eq!(q.stats().enqueues, 3);
}

#[tokio::test]
async fn blocked_send_aborts_when_the_connection_closes() {
    let q = limited("abort", policy(), 100);
    let context = ConnectionContext::new("p");
    let producer = ProducerInfo::new("p");
    send(&q, &context, &producer).await.unwrap();

    let blocked = {
        let q = q.clone();
        let (context, producer) = (context.clone(), producer.clone());
        tokio::spawn(async move { send(&q, &context, &producer).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    context.stop();

    let result = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .expect("send never noticed the closed connection")
        .unwrap();
    match result {
        Err(BlipError::SendAborted(connection)) => assert_eq!(connection, context.connection_id()),
        other => panic!("expected SendAborted, got {other:?}"),
    }
    assert_eq!(q.stats().enqueues, 1);
}

#[tokio::test]
async fn blocked_send_gives_up_after_the_timeout() {
    let q = limited(
        "timeout",
        QueuePolicy {
            send_fail_if_no_space_after_timeout_ms: 100,
            ..policy()
        },
        100,
    );
    let context = ConnectionContext::new("p");
    let producer = ProducerInfo::new("p");
    send(&q, &context, &producer).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), send(&q, &context, &producer))
        .await
        .expect("timeout not honoured");
    assert!(matches!(result, Err(BlipError::ResourceAllocation { .. })));
}

#[tokio::test]
async fn windowed_producer_gets_a_deferred_send() {
    let q = limited("deferred", policy(), 200);
    let c = TestConsumer::new(&q, "c", 10);
    let context = ConnectionContext::new("p");
    let producer = ProducerInfo::new("p").with_window_size(64 * 1024);

    let first = send(&q, &context, &producer).await.unwrap().message_id().unwrap();
    send(&q, &context, &producer).await.unwrap();

    let receipt = match send(&q, &context, &producer).await.unwrap() {
        SendOutcome::Deferred(receipt) => receipt,
        other => panic!("expected a deferred send, got {other:?}"),
    };
    assert_eq!(q.stats().enqueues, 2);

    c.ack(&q, first);
    let id = tokio::time::timeout(Duration::from_secs(5), receipt.wait())
        .await
        .expect("deferred send never completed")
        .unwrap();

    let delivered: Vec<_> = c.drain_ids();
    assert!(delivered.contains(&id));
    assert_eq!(q.stats().enqueues, 3);
}

#[tokio::test]
async fn stopping_the_queue_fails_parked_sends() {
    let q = limited("stop-deferred", policy(), 100);
    let context = ConnectionContext::new("p");
    let producer = ProducerInfo::new("p").with_response_required();
    send(&q, &context, &producer).await.unwrap();

    let SendOutcome::Deferred(receipt) = send(&q, &context, &producer).await.unwrap() else {
        panic!("expected a deferred send");
    };
    q.stop();
    assert!(matches!(receipt.wait().await, Err(BlipError::QueueStopped(_))));
}

#[tokio::test]
async fn store_gate_only_applies_to_persistent_messages() {
    common::init_logging();
    let usage = SystemUsage::from_config(&UsageConfig {
        store_limit_bytes: 200,
        ..UsageConfig::default()
    });
    let q = Queue::builder("store-gate")
        .policy(QueuePolicy {
            send_fail_if_no_space: true,
            ..policy()
        })
        .usage(usage)
        .store(Arc::new(MemoryMessageStore::new("store-gate")))
        .build()
        .unwrap();
    q.start().unwrap();
    let context = ConnectionContext::new("p");
    let producer = ProducerInfo::new("p");

    send(&q, &context, &producer).await.unwrap();
    send(&q, &context, &producer).await.unwrap();
    match send(&q, &context, &producer).await {
        Err(BlipError::ResourceAllocation { usage, .. }) => assert_eq!(usage, "store"),
        other => panic!("expected the store gate to reject, got {other:?}"),
    }

    let transient = q.send(&context, &producer, body().non_persistent()).await.unwrap();
    assert!(matches!(transient, SendOutcome::Accepted(_)));
}

#[tokio::test]
async fn expired_messages_are_dropped_on_arrival() {
    let q = common::queue("expired-on-send", policy());
    let outcome = q
        .send(
            &ConnectionContext::new("p"),
            &ProducerInfo::new("p"),
            Message::new("late").with_expiration(1),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Expired));
    let stats = q.stats();
    assert_eq!(stats.enqueues, 0);
    assert_eq!(stats.expired, 0);
}

#[tokio::test]
async fn parked_sends_keep_their_order_after_space_frees() {
    common::init_logging();
    let usage = SystemUsage::from_config(&UsageConfig {
        memory_limit_bytes: 300,
        ..UsageConfig::default()
    });
    let q = Queue::builder("deferred-order")
        .policy(policy())
        .usage(usage)
        .task_runners(Arc::new(TokioTaskRunnerFactory::current().unwrap()))
        .build()
        .unwrap();
    q.start().unwrap();
    let context = ConnectionContext::new("p");
    let producer = ProducerInfo::new("p").with_window_size(64 * 1024);
    let numbered = |n: &str| body().with_property("n", n);

    for n in ["1", "2"] {
        let outcome = q.send(&context, &producer, numbered(n)).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Accepted(_)));
    }
    let SendOutcome::Deferred(third) = q.send(&context, &producer, numbered("3")).await.unwrap() else {
        panic!("expected the third send to be parked");
    };

    // Space is back, but the queue has not run to drain the parked send.
    assert_eq!(q.purge().unwrap(), 2);
    assert!(!q.usage().memory.is_full());
    let SendOutcome::Deferred(fourth) = q.send(&context, &producer, numbered("4")).await.unwrap() else {
        panic!("expected the fourth send to queue behind the parked one");
    };

    let third = tokio::time::timeout(Duration::from_secs(5), third.wait())
        .await
        .expect("parked send never completed")
        .unwrap();
    let fourth = tokio::time::timeout(Duration::from_secs(5), fourth.wait())
        .await
        .expect("parked send never completed")
        .unwrap();
    assert!(third < fourth);

    let order: Vec<_> = q
        .browse()
        .iter()
        .filter_map(|m| m.property("n").map(str::to_string))
        .collect();
    assert_eq!(order, vec!["3", "4"]);
    q.stop();
}
