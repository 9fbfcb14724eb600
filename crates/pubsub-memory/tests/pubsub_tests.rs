//! End-to-end publish/subscribe tests over the in-memory stream log.

use std::collections::HashSet;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use proven_pubsub::{
    DefaultMarshaler, EntryId, Error, Fields, GroupStart, Message, PAYLOAD_FIELD, Publisher,
    PublisherConfig, ReceivedMessage, StreamLog, StreamPublisher, StreamSubscriber, Subscriber, SubscriberConfig,
};
use proven_pubsub_memory::MemoryStreamLog;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

const GROUP: &str = "test-consumer-group";
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn config(consumer: &str) -> SubscriberConfig {
    SubscriberConfig {
        consumer: consumer.to_string(),
        consumer_group: GROUP.to_string(),
        block_time: Some(Duration::from_millis(20)),
        retry_base_delay: Some(Duration::from_millis(10)),
        retry_max_delay: Some(Duration::from_millis(50)),
        ..Default::default()
    }
}

fn publisher(log: &MemoryStreamLog) -> StreamPublisher<MemoryStreamLog, DefaultMarshaler> {
    StreamPublisher::new(log.clone(), DefaultMarshaler, PublisherConfig::default())
}

fn subscriber(
    log: &MemoryStreamLog,
    config: SubscriberConfig,
) -> StreamSubscriber<MemoryStreamLog, DefaultMarshaler> {
    StreamSubscriber::new(log.clone(), DefaultMarshaler, config).unwrap()
}

async fn publish_all(log: &MemoryStreamLog, topic: &str, count: usize) {
    let publisher = publisher(log);

    for i in 0..count {
        publisher
            .publish(topic, Message::from_payload(format!("test{i}")))
            .await
            .unwrap();
    }
}

async fn recv(receiver: &mut mpsc::Receiver<ReceivedMessage>) -> ReceivedMessage {
    timeout(RECV_TIMEOUT, receiver.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("subscription closed")
}

async fn assert_closed(receiver: &mut mpsc::Receiver<ReceivedMessage>) {
    let next = timeout(RECV_TIMEOUT, receiver.recv())
        .await
        .expect("timed out waiting for the subscription to close");

    assert!(next.is_none());
}

fn payload(received: &ReceivedMessage) -> String {
    String::from_utf8_lossy(received.message().payload()).into_owned()
}

#[tokio::test]
#[traced_test]
async fn test_subscriber_receives_and_acks_all() {
    let log = MemoryStreamLog::new();
    publish_all(&log, "test-topic1", 50).await;

    let subscriber = subscriber(&log, config("consumer1"));
    let mut receiver = subscriber
        .subscribe("test-topic1", CancellationToken::new())
        .await
        .unwrap();

    for i in 0..50 {
        let received = recv(&mut receiver).await;

        assert_eq!(payload(&received), format!("test{i}"));
        assert_eq!(received.handle().topic(), "test-topic1");
        assert_eq!(received.handle().consumer_group(), GROUP);

        received.ack().await.unwrap();
    }

    assert!(log.pending("test-topic1", GROUP, EntryId::MIN, 100).await.unwrap().is_empty());

    subscriber.close().await.unwrap();
    assert_closed(&mut receiver).await;
}

#[tokio::test]
async fn test_message_identity_survives_transport() {
    let log = MemoryStreamLog::new();
    let publisher = publisher(&log);

    let sent = Message::new("0b7a5c5e-4a1b-4b86-9d0b-8f7fa4b7c9a1", "hello")
        .with_metadata_entry("trace_id", "abc")
        .with_metadata_entry("origin", "tests");
    publisher.publish("orders", sent.clone()).await.unwrap();
    publisher
        .publish("orders", Message::from_payload("generated"))
        .await
        .unwrap();

    let subscriber = subscriber(&log, config("consumer1"));
    let mut receiver = subscriber
        .subscribe("orders", CancellationToken::new())
        .await
        .unwrap();

    let first = recv(&mut receiver).await;
    assert_eq!(first.message(), &sent);

    let second = recv(&mut receiver).await;
    assert!(!second.message().uuid().is_empty());
    assert!(second.message().metadata().is_empty());

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_restart_replays_unacked_first() {
    let log = MemoryStreamLog::new();
    publish_all(&log, "restart", 5).await;

    let first = subscriber(&log, config("consumer1"));
    let mut receiver = first
        .subscribe("restart", CancellationToken::new())
        .await
        .unwrap();

    recv(&mut receiver).await.ack().await.unwrap();
    let _unacked = recv(&mut receiver).await;
    first.close().await.unwrap();

    let restarted = subscriber(&log, config("consumer1"));
    let mut receiver = restarted
        .subscribe("restart", CancellationToken::new())
        .await
        .unwrap();

    let publisher = publisher(&log);
    for i in 0..2 {
        publisher
            .publish("restart", Message::from_payload(format!("late{i}")))
            .await
            .unwrap();
    }

    // The unacknowledged entry comes back first, then everything after it in
    // order, including entries published while the consumer was down.
    let expected = (1..5)
        .map(|i| format!("test{i}"))
        .chain((0..2).map(|i| format!("late{i}")));
    for want in expected {
        let received = recv(&mut receiver).await;
        assert_eq!(payload(&received), want);
        received.ack().await.unwrap();
    }

    assert!(log.pending("restart", GROUP, EntryId::MIN, 100).await.unwrap().is_empty());
    restarted.close().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn test_idle_entries_claimed_by_other_consumer() {
    let log = MemoryStreamLog::new();
    publish_all(&log, "claims", 3).await;

    let stalled = subscriber(&log, config("consumer1"));
    let mut stalled_receiver = stalled
        .subscribe("claims", CancellationToken::new())
        .await
        .unwrap();
    for _ in 0..3 {
        recv(&mut stalled_receiver).await;
    }

    let rescuer = subscriber(
        &log,
        SubscriberConfig {
            claim_interval: Some(Duration::from_millis(50)),
            max_idle_time: Some(Duration::from_millis(100)),
            ..config("consumer2")
        },
    );
    let mut receiver = rescuer
        .subscribe("claims", CancellationToken::new())
        .await
        .unwrap();

    for i in 0..3 {
        let received = recv(&mut receiver).await;
        assert_eq!(payload(&received), format!("test{i}"));
        received.ack().await.unwrap();
    }

    assert!(log.pending("claims", GROUP, EntryId::MIN, 100).await.unwrap().is_empty());

    rescuer.close().await.unwrap();
    stalled.close().await.unwrap();
}

#[tokio::test]
async fn test_idle_entries_claimed_past_first_pending_page() {
    let log = MemoryStreamLog::new();
    publish_all(&log, "paged-claims", 3).await;

    log.create_group("paged-claims", GROUP, GroupStart::Beginning)
        .await
        .unwrap();
    // The first two entries stay pending with the live consumer, the last one
    // with a consumer that never comes back.
    let own = log
        .read_new("paged-claims", GROUP, "consumer2", 2, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(own.len(), 2);
    let abandoned = log
        .read_new("paged-claims", GROUP, "consumer1", 1, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(abandoned.len(), 1);

    let subscriber = subscriber(
        &log,
        SubscriberConfig {
            claim_interval: Some(Duration::from_millis(30)),
            claim_batch_size: Some(2),
            max_idle_time: Some(Duration::from_millis(50)),
            ..config("consumer2")
        },
    );
    let mut receiver = subscriber
        .subscribe("paged-claims", CancellationToken::new())
        .await
        .unwrap();

    // Own pending entries are replayed first and left unacknowledged, so they
    // fill the first page of every claim sweep.
    assert_eq!(payload(&recv(&mut receiver).await), "test0");
    assert_eq!(payload(&recv(&mut receiver).await), "test1");

    let claimed = recv(&mut receiver).await;
    assert_eq!(payload(&claimed), "test2");
    assert_eq!(claimed.handle().entry_id(), abandoned[0].id);

    let pending = log.pending("paged-claims", GROUP, EntryId::MIN, 10).await.unwrap();
    assert_eq!(pending.len(), 3);
    assert!(pending.iter().all(|entry| entry.consumer == "consumer2"));

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_group_members_share_entries() {
    let log = MemoryStreamLog::new();

    let first = subscriber(&log, config("consumer1"));
    let second = subscriber(&log, config("consumer2"));
    let mut first_receiver = first
        .subscribe("shared", CancellationToken::new())
        .await
        .unwrap();
    let mut second_receiver = second
        .subscribe("shared", CancellationToken::new())
        .await
        .unwrap();

    publish_all(&log, "shared", 20).await;

    let mut seen = HashSet::new();
    while seen.len() < 20 {
        let received = tokio::select! {
            received = recv(&mut first_receiver) => received,
            received = recv(&mut second_receiver) => received,
        };

        assert!(seen.insert(payload(&received)), "duplicate delivery");
        received.ack().await.unwrap();
    }

    assert!(log.pending("shared", GROUP, EntryId::MIN, 100).await.unwrap().is_empty());

    first.close().await.unwrap();
    second.close().await.unwrap();
}

#[tokio::test]
async fn test_double_ack_is_idempotent() {
    let log = MemoryStreamLog::new();
    publish_all(&log, "acks", 1).await;

    let subscriber = subscriber(&log, config("consumer1"));
    let mut receiver = subscriber
        .subscribe("acks", CancellationToken::new())
        .await
        .unwrap();

    let received = recv(&mut receiver).await;
    assert!(!received.handle().is_acked());

    received.ack().await.unwrap();
    received.ack().await.unwrap();
    assert!(received.handle().is_acked());
    subscriber.close().await.unwrap();

    // The acknowledged entry is not replayed to the same consumer on restart.
    let restarted = StreamSubscriber::new(log.clone(), DefaultMarshaler, config("consumer1")).unwrap();
    let mut receiver = restarted
        .subscribe("acks", CancellationToken::new())
        .await
        .unwrap();
    publisher(&log)
        .publish("acks", Message::from_payload("fresh"))
        .await
        .unwrap();

    let next = recv(&mut receiver).await;
    assert_eq!(payload(&next), "fresh");
    next.ack().await.unwrap();

    restarted.close().await.unwrap();
}

#[tokio::test]
async fn test_nack_redelivers() {
    let log = MemoryStreamLog::new();
    publish_all(&log, "nacks", 1).await;

    let subscriber = subscriber(
        &log,
        SubscriberConfig {
            nack_resend_sleep: Some(Duration::from_millis(50)),
            ..config("consumer1")
        },
    );
    let mut receiver = subscriber
        .subscribe("nacks", CancellationToken::new())
        .await
        .unwrap();

    let received = recv(&mut receiver).await;
    let entry_id = received.handle().entry_id();
    let uuid = received.message().uuid().to_string();
    received.nack();

    let redelivered = recv(&mut receiver).await;
    assert_eq!(redelivered.handle().entry_id(), entry_id);
    assert_eq!(redelivered.message().uuid(), uuid);

    redelivered.ack().await.unwrap();
    assert!(log.pending("nacks", GROUP, EntryId::MIN, 10).await.unwrap().is_empty());

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_delete_on_ack_removes_entries() {
    let log = MemoryStreamLog::new();
    publish_all(&log, "deleted", 2).await;

    let subscriber = subscriber(
        &log,
        SubscriberConfig {
            delete_on_ack: true,
            ..config("consumer1")
        },
    );
    let mut receiver = subscriber
        .subscribe("deleted", CancellationToken::new())
        .await
        .unwrap();

    for _ in 0..2 {
        recv(&mut receiver).await.ack().await.unwrap();
    }

    assert!(log.is_empty("deleted").await);
    subscriber.close().await.unwrap();

    // Deleted entries are gone for every group, not just acknowledged.
    let other = StreamSubscriber::new(
        log.clone(),
        DefaultMarshaler,
        SubscriberConfig {
            consumer_group: "other-group".to_string(),
            ..config("consumer1")
        },
    )
    .unwrap();
    let mut receiver = other
        .subscribe("deleted", CancellationToken::new())
        .await
        .unwrap();

    assert!(
        timeout(Duration::from_millis(200), receiver.recv())
            .await
            .is_err()
    );

    other.close().await.unwrap();
}

#[tokio::test]
async fn test_retained_entries_visible_to_new_group() {
    let log = MemoryStreamLog::new();
    publish_all(&log, "retained", 2).await;

    let subscriber = subscriber(&log, config("consumer1"));
    let mut receiver = subscriber
        .subscribe("retained", CancellationToken::new())
        .await
        .unwrap();
    for _ in 0..2 {
        recv(&mut receiver).await.ack().await.unwrap();
    }
    subscriber.close().await.unwrap();

    assert_eq!(log.len("retained").await, 2);

    let late = StreamSubscriber::new(
        log.clone(),
        DefaultMarshaler,
        SubscriberConfig {
            consumer_group: "other-group".to_string(),
            ..config("consumer1")
        },
    )
    .unwrap();
    let mut receiver = late
        .subscribe("retained", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(payload(&recv(&mut receiver).await), "test0");
    assert_eq!(payload(&recv(&mut receiver).await), "test1");

    late.close().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn test_undecodable_entries_are_dead_lettered() {
    let log = MemoryStreamLog::new();
    let publisher = publisher(&log);

    publisher
        .publish("poison", Message::from_payload("before"))
        .await
        .unwrap();
    log.append(
        "poison",
        Fields::from([(PAYLOAD_FIELD.to_string(), Bytes::from_static(b"no uuid"))]),
        None,
    )
    .await
    .unwrap();
    publisher
        .publish("poison", Message::from_payload("after"))
        .await
        .unwrap();

    let subscriber = subscriber(
        &log,
        SubscriberConfig {
            dead_letter_topic: Some("poison-dlq".to_string()),
            ..config("consumer1")
        },
    );
    let mut receiver = subscriber
        .subscribe("poison", CancellationToken::new())
        .await
        .unwrap();

    let before = recv(&mut receiver).await;
    assert_eq!(payload(&before), "before");
    before.ack().await.unwrap();

    let after = recv(&mut receiver).await;
    assert_eq!(payload(&after), "after");
    after.ack().await.unwrap();

    assert_eq!(log.len("poison-dlq").await, 1);
    assert!(log.pending("poison", GROUP, EntryId::MIN, 10).await.unwrap().is_empty());

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_removed_group_closes_subscription() {
    let log = MemoryStreamLog::new();
    publish_all(&log, "vanishing", 1).await;

    let subscriber = subscriber(&log, config("consumer1"));
    let mut receiver = subscriber
        .subscribe("vanishing", CancellationToken::new())
        .await
        .unwrap();

    let received = recv(&mut receiver).await;
    assert!(log.destroy_group("vanishing", GROUP).await);

    // Nothing is pending once the group is gone, so acknowledging is a no-op.
    received.ack().await.unwrap();
    assert!(received.handle().is_acked());
    assert_closed(&mut receiver).await;

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_cancel_closes_subscription_only() {
    let log = MemoryStreamLog::new();
    let subscriber = subscriber(&log, config("consumer1"));

    let cancel = CancellationToken::new();
    let mut cancelled = subscriber.subscribe("first", cancel.clone()).await.unwrap();
    let mut other = subscriber
        .subscribe("second", CancellationToken::new())
        .await
        .unwrap();

    cancel.cancel();
    assert_closed(&mut cancelled).await;

    publish_all(&log, "second", 1).await;
    assert_eq!(payload(&recv(&mut other).await), "test0");

    // A cancelled topic may be subscribed again.
    let mut resubscribed = subscriber
        .subscribe("first", CancellationToken::new())
        .await
        .unwrap();
    publish_all(&log, "first", 1).await;
    assert_eq!(payload(&recv(&mut resubscribed).await), "test0");

    subscriber.close().await.unwrap();
    assert_closed(&mut other).await;
    assert_closed(&mut resubscribed).await;
}

#[tokio::test]
async fn test_duplicate_subscription_rejected() {
    let log = MemoryStreamLog::new();
    let subscriber = subscriber(&log, config("consumer1"));

    let _receiver = subscriber
        .subscribe("topic", CancellationToken::new())
        .await
        .unwrap();

    assert_matches!(
        subscriber.subscribe("topic", CancellationToken::new()).await,
        Err(Error::AlreadySubscribed(topic)) if topic == "topic"
    );

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_closed_subscriber_and_publisher() {
    let log = MemoryStreamLog::new();

    let publisher = publisher(&log);
    publisher.close().await.unwrap();
    publisher.close().await.unwrap();
    assert_matches!(
        publisher
            .publish("topic", Message::from_payload("late"))
            .await,
        Err(Error::Closed)
    );

    let subscriber = subscriber(&log, config("consumer1"));
    subscriber.close().await.unwrap();
    subscriber.close().await.unwrap();
    assert_matches!(
        subscriber.subscribe("topic", CancellationToken::new()).await,
        Err(Error::Closed)
    );
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let log = MemoryStreamLog::new();

    assert_matches!(
        StreamSubscriber::new(log.clone(), DefaultMarshaler, config("")),
        Err(Error::Config(_))
    );
    assert_matches!(
        StreamSubscriber::new(
            log.clone(),
            DefaultMarshaler,
            SubscriberConfig {
                block_time: Some(Duration::ZERO),
                ..config("consumer1")
            }
        ),
        Err(Error::Config(_))
    );
    assert_matches!(
        StreamSubscriber::new(
            log,
            DefaultMarshaler,
            SubscriberConfig {
                block_time: Some(Duration::MAX),
                ..config("consumer1")
            }
        ),
        Err(Error::Config(_))
    );
}

#[tokio::test]
async fn test_publish_transport_error() {
    let log = MemoryStreamLog::new();
    log.set_unavailable(true);

    assert_matches!(
        publisher(&log)
            .publish("topic", Message::from_payload("lost"))
            .await,
        Err(Error::Transport(_))
    );
}

#[tokio::test]
#[traced_test]
async fn test_subscription_survives_outage() {
    let log = MemoryStreamLog::new();
    let subscriber = subscriber(&log, config("consumer1"));
    let mut receiver = subscriber
        .subscribe("flaky", CancellationToken::new())
        .await
        .unwrap();

    log.set_unavailable(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    log.set_unavailable(false);

    publish_all(&log, "flaky", 1).await;
    assert_eq!(payload(&recv(&mut receiver).await), "test0");

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_publisher_trims_topic() {
    let log = MemoryStreamLog::new();
    let publisher = StreamPublisher::new(
        log.clone(),
        DefaultMarshaler,
        PublisherConfig {
            default_max_len: Some(3),
            ..Default::default()
        },
    );

    for i in 0..10 {
        publisher
            .publish("bounded", Message::from_payload(format!("test{i}")))
            .await
            .unwrap();
    }

    assert_eq!(log.len("bounded").await, 3);
}
