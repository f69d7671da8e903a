//! Integration tests for the assured publisher
//!
//! These run the publisher against the in-memory broker and drive its failure
//! paths with the broker's fault injection: nacks, held confirmations, killed
//! channels and missing exchanges.

use amqp_worker::{
    create_queue, pop, AssuredPublisher, BrokerChannel, BrokerConnection, ConfirmOutcome,
    ConfirmationReport, InMemoryBroker, InMemoryConnection, PublishError, PublisherConfig,
    SubscriberSpec,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use test_utils::{assertions::*, eventually, init_test_tracing, TestDataBuilder};
use tokio::sync::watch;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    broker: InMemoryBroker,
    spec: Arc<SubscriberSpec>,
    publisher: AssuredPublisher<InMemoryConnection>,
    reports: Arc<Mutex<Vec<ConfirmationReport>>>,
    cancel: watch::Sender<bool>,
}

fn fast_config() -> PublisherConfig {
    PublisherConfig::new()
        .with_name("publisher_test")
        .with_backoff(Duration::from_millis(10), Duration::from_millis(50))
}

/// Publisher plus declared topology named after the test
async fn harness(test_name: &str, config: PublisherConfig) -> Harness {
    init_test_tracing();
    let names = TestDataBuilder::from_test_name(test_name);
    let broker = InMemoryBroker::new();
    let spec = Arc::new(SubscriberSpec::new(
        names.exchange("events"),
        names.queue("messages"),
        names.routing_key("messages"),
    ));

    let (cancel, cancel_rx) = watch::channel(false);
    let publisher = AssuredPublisher::new(broker.connect(), config, cancel_rx);

    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    publisher.set_confirmation_handler(move |report| sink.lock().push(report.clone()));

    let channel = publisher.channel().await.unwrap();
    create_queue(channel.as_ref(), &spec).await.unwrap();

    Harness {
        broker,
        spec,
        publisher,
        reports,
        cancel,
    }
}

/// Pop everything left in the spec's queue
async fn drain(broker: &InMemoryBroker, spec: &SubscriberSpec) -> Vec<String> {
    let channel = broker.connect().open_channel().await.unwrap();
    let mut bodies = Vec::new();
    while let Some(delivery) = pop(&channel, spec).await.unwrap() {
        bodies.push(delivery.body_str());
    }
    channel.close().await.unwrap();
    bodies
}

fn outcomes(reports: &Mutex<Vec<ConfirmationReport>>) -> Vec<ConfirmOutcome> {
    reports.lock().iter().map(|r| r.outcome).collect()
}

// ============================================================================
// Implicit waiting
// ============================================================================

#[tokio::test]
async fn test_publish_then_pop_returns_the_message() {
    let h = harness("test_publish_then_pop_returns_the_message", fast_config()).await;

    assert!(h.publisher.publish("Test Message", h.spec.clone()).await);
    assert_eq!(h.publisher.pending_count(), 0);

    let channel = h.broker.connect().open_channel().await.unwrap();
    let delivery = assert_some(pop(&channel, &h.spec).await.unwrap(), "queued message");
    assert_eq!(delivery.body_str(), "Test Message");
    assert!(pop(&channel, &h.spec).await.unwrap().is_none());
}

#[tokio::test]
async fn test_try_publish_reports_confirmed_sequence() {
    let h = harness("test_try_publish_reports_confirmed_sequence", fast_config()).await;

    let first = h.publisher.try_publish("one", h.spec.clone()).await.unwrap();
    let second = h.publisher.try_publish("two", h.spec.clone()).await.unwrap();

    assert!(first.confirmed);
    assert_eq!(first.delivery_tag, 1);
    assert_eq!(second.delivery_tag, 2);
    assert_eq!(outcomes(&h.reports), vec![ConfirmOutcome::Acked; 2]);
}

#[tokio::test]
async fn test_close_between_publishes_restarts_sequences() {
    let h = harness(
        "test_close_between_publishes_restarts_sequences",
        fast_config(),
    )
    .await;
    h.publisher.disable_republishing();

    for _ in 0..10 {
        assert!(h.publisher.publish("cycle", h.spec.clone()).await);
        h.publisher.close().await.unwrap();
    }

    let reports = h.reports.lock().clone();
    assert_eq!(reports.len(), 10);
    for report in &reports {
        assert_eq!(report.delivery_tag, 1);
        assert_eq!(report.outcome, ConfirmOutcome::Acked);
        assert_eq!(report.attempts, 1);
    }
    assert_eq!(h.broker.queue_depth(&h.spec.queue), Some(10));
}

#[tokio::test]
async fn test_nack_without_republishing_fails_publish() {
    let h = harness(
        "test_nack_without_republishing_fails_publish",
        fast_config(),
    )
    .await;
    h.publisher.disable_republishing();
    h.broker.nack_next(1);

    let result = h.publisher.try_publish("refused", h.spec.clone()).await;
    assert!(
        matches!(result, Err(PublishError::NotConfirmed(ConfirmOutcome::Nacked))),
        "Expected Nacked, got {:?}",
        result
    );
    assert_eq!(h.broker.queue_depth(&h.spec.queue), Some(0));
}

// ============================================================================
// Explicit waiting
// ============================================================================

#[tokio::test]
async fn test_explicit_publish_returns_before_confirmation() {
    let h = harness(
        "test_explicit_publish_returns_before_confirmation",
        fast_config(),
    )
    .await;
    h.publisher.set_explicit_waiting();
    h.broker.hold_confirms();

    let published = tokio::time::timeout(TIMEOUT, h.publisher.publish("early", h.spec.clone()))
        .await
        .unwrap();
    assert!(published);
    assert_eq!(h.publisher.pending_count(), 1);

    let waiting = tokio::time::timeout(
        Duration::from_millis(50),
        h.publisher.wait_for_all_confirmations(),
    )
    .await;
    assert!(waiting.is_err(), "Confirmation should still be held");

    h.broker.release_confirms();
    let drained = tokio::time::timeout(TIMEOUT, h.publisher.wait_for_all_confirmations())
        .await
        .unwrap();
    assert!(drained);
    assert_eq!(h.publisher.pending_count(), 0);
    assert_eq!(outcomes(&h.reports), vec![ConfirmOutcome::Acked]);
}

#[tokio::test]
async fn test_cancel_unblocks_wait_for_all_confirmations() {
    let h = harness(
        "test_cancel_unblocks_wait_for_all_confirmations",
        fast_config(),
    )
    .await;
    h.publisher.set_explicit_waiting();
    h.broker.hold_confirms();

    assert!(h.publisher.publish("stuck", h.spec.clone()).await);

    let publisher = h.publisher.clone();
    let waiter = tokio::spawn(async move { publisher.wait_for_all_confirmations().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.cancel.send(true).unwrap();
    let drained = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(!drained);
    assert_eq!(h.publisher.pending_count(), 1);
}

#[tokio::test]
async fn test_cumulative_ack_settles_every_covered_message() {
    let h = harness(
        "test_cumulative_ack_settles_every_covered_message",
        fast_config(),
    )
    .await;
    h.publisher.set_explicit_waiting();
    h.broker.hold_confirms();

    for i in 0..5 {
        assert!(h.publisher.publish(format!("m{}", i), h.spec.clone()).await);
    }
    assert_eq!(h.publisher.pending_count(), 5);

    h.broker.release_confirms_cumulative();
    let drained = tokio::time::timeout(TIMEOUT, h.publisher.wait_for_all_confirmations())
        .await
        .unwrap();
    assert!(drained);

    let mut tags: Vec<u64> = h.reports.lock().iter().map(|r| r.delivery_tag).collect();
    tags.sort_unstable();
    assert_eq!(tags, vec![1, 2, 3, 4, 5]);
    assert!(h.reports.lock().iter().all(ConfirmationReport::is_ack));
}

// ============================================================================
// Republishing
// ============================================================================

#[tokio::test]
async fn test_nack_burst_is_republished() {
    let h = harness("test_nack_burst_is_republished", fast_config()).await;
    h.publisher.set_explicit_waiting();
    h.broker.nack_next(5);

    let names = TestDataBuilder::from_test_name("test_nack_burst_is_republished");
    let payloads = names.payloads("burst", 15);
    for payload in &payloads {
        assert!(h.publisher.publish(payload.clone(), h.spec.clone()).await);
    }

    let drained = tokio::time::timeout(TIMEOUT, h.publisher.wait_for_all_confirmations())
        .await
        .unwrap();
    assert!(drained);

    let received = drain(&h.broker, &h.spec).await;
    assert_contains_all(&received, &payloads, "republished payloads");
    assert_eq!(h.broker.stats().confirmed_nacks, 5);
    assert_eq!(outcomes(&h.reports), vec![ConfirmOutcome::Acked; 15]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_killed_channel_is_replayed_on_a_new_one() {
    let h = harness(
        "test_killed_channel_is_replayed_on_a_new_one",
        fast_config(),
    )
    .await;
    h.publisher.set_explicit_waiting();

    let names = TestDataBuilder::from_test_name("test_killed_channel_is_replayed_on_a_new_one");
    let payloads = names.payloads("replay", 40);
    let (before, after) = payloads.split_at(20);

    h.broker.hold_confirms();
    for payload in before {
        assert!(h.publisher.publish(payload.clone(), h.spec.clone()).await);
    }
    assert!(h.broker.kill_channels("connection reset") >= 1);
    h.broker.release_confirms();

    for payload in after {
        assert!(h.publisher.publish(payload.clone(), h.spec.clone()).await);
    }

    let drained = tokio::time::timeout(TIMEOUT, h.publisher.wait_for_all_confirmations())
        .await
        .unwrap();
    assert!(drained);

    // Killed publishes were routed before the kill, so duplicates are expected
    let received = drain(&h.broker, &h.spec).await;
    assert!(received.len() >= payloads.len());
    assert_contains_all(&received, &payloads, "replayed payloads");
    assert!(h.broker.stats().channels_opened >= 2);
    assert!(h.reports.lock().iter().all(ConfirmationReport::is_ack));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_exchange_is_replayed_once_declared() {
    let names = TestDataBuilder::from_test_name("test_missing_exchange_is_replayed_once_declared");
    let h = harness(
        "test_missing_exchange_is_replayed_once_declared",
        fast_config().with_max_attempts(100),
    )
    .await;
    h.publisher.set_explicit_waiting();

    let late = SubscriberSpec::new(
        names.exchange("late"),
        names.queue("late"),
        names.routing_key("late"),
    );
    let admin = h.broker.connect().open_channel().await.unwrap();

    let published = h.publisher.try_publish("late message", late.clone()).await;
    assert!(published.is_ok(), "Expected acceptance, got {:?}", published);
    assert!(!h.broker.exchange_exists(&late.exchange));

    // Let a few replays hit the missing exchange
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.publisher.pending_count(), 1);

    // Keep replays out while the topology is half declared
    h.broker.refuse_channels(true);
    let quiet = eventually(TIMEOUT, || async { h.broker.open_channels() == 1 }).await;
    assert!(quiet, "Publisher channel should be gone");

    create_queue(&admin, &late).await.unwrap();
    h.broker.refuse_channels(false);

    let drained = tokio::time::timeout(TIMEOUT, h.publisher.wait_for_all_confirmations())
        .await
        .unwrap();
    assert!(drained);

    let delivery = assert_some(pop(&admin, &late).await.unwrap(), "late message");
    assert_eq!(delivery.body_str(), "late message");

    let reports = h.reports.lock().clone();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, ConfirmOutcome::Acked);
    assert!(reports[0].attempts >= 2);
}

#[tokio::test]
async fn test_channel_loss_without_republishing_is_reported() {
    let h = harness(
        "test_channel_loss_without_republishing_is_reported",
        fast_config(),
    )
    .await;
    h.publisher.set_explicit_waiting();
    h.publisher.disable_republishing();
    h.broker.hold_confirms();

    assert!(h.publisher.publish("a", h.spec.clone()).await);
    assert!(h.publisher.publish("b", h.spec.clone()).await);
    h.broker.kill_channels("connection reset");

    let drained = tokio::time::timeout(TIMEOUT, h.publisher.wait_for_all_confirmations())
        .await
        .unwrap();
    assert!(drained);
    assert_eq!(outcomes(&h.reports), vec![ConfirmOutcome::ChannelLost; 2]);
    assert_eq!(h.broker.stats().published, 2);
}

#[tokio::test]
async fn test_close_abandons_unconfirmed_messages() {
    let h = harness("test_close_abandons_unconfirmed_messages", fast_config()).await;
    h.publisher.set_explicit_waiting();
    h.broker.hold_confirms();

    for i in 0..3 {
        assert!(h.publisher.publish(format!("m{}", i), h.spec.clone()).await);
    }
    h.publisher.close().await.unwrap();

    let drained = tokio::time::timeout(TIMEOUT, h.publisher.wait_for_all_confirmations())
        .await
        .unwrap();
    assert!(drained);
    assert_eq!(outcomes(&h.reports), vec![ConfirmOutcome::Abandoned; 3]);

    // Nothing was republished
    h.broker.release_confirms();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.broker.stats().published, 3);
}
