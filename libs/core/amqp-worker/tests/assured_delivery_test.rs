//! End-to-end delivery through publisher and subscriber pool
//!
//! Publishes a large batch in explicit waiting mode while a pool consumes it,
//! killing every channel at regular intervals with confirms still in flight.

use amqp_worker::{
    create_queue, AssuredPublisher, ConfirmOutcome, Delivery, DeliveryHandler, HandlerOutcome,
    InMemoryBroker, PublisherConfig, SubscriberConfig, SubscriberPool, SubscriberRegistry,
    SubscriberSpec,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_utils::{eventually, init_test_tracing, TestDataBuilder};
use tokio::sync::watch;

const MESSAGES: usize = 10_000;
const KILL_EVERY: usize = 999;
const HOLD_BEFORE_KILL: usize = 10;
const TIMEOUT: Duration = Duration::from_secs(60);

/// Distinct bodies plus a count of every delivery, duplicates included
#[derive(Default)]
struct DistinctBodies {
    bodies: Mutex<HashSet<String>>,
    deliveries: AtomicUsize,
}

impl DistinctBodies {
    fn distinct(&self) -> usize {
        self.bodies.lock().len()
    }
}

#[async_trait]
impl DeliveryHandler for DistinctBodies {
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        self.bodies.lock().insert(delivery.body_str());
        HandlerOutcome::Accept
    }

    fn name(&self) -> &'static str {
        "distinct_bodies"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_message_arrives_despite_repeated_channel_loss() {
    init_test_tracing();
    let names =
        TestDataBuilder::from_test_name("test_every_message_arrives_despite_repeated_channel_loss");
    let broker = InMemoryBroker::new();
    let spec = Arc::new(
        SubscriberSpec::new(
            names.exchange("events"),
            names.queue("assured"),
            names.routing_key("assured"),
        )
        .with_concurrency(5),
    );

    let (_cancel, cancel_rx) = watch::channel(false);
    let config = PublisherConfig::new()
        .with_name("assured_delivery_test")
        .with_backoff(Duration::from_millis(5), Duration::from_millis(20));
    let publisher = AssuredPublisher::new(broker.connect(), config, cancel_rx);
    publisher.set_explicit_waiting();

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = outcomes.clone();
    publisher.set_confirmation_handler(move |report| sink.lock().push(report.outcome));

    let channel = publisher.channel().await.unwrap();
    create_queue(channel.as_ref(), &spec).await.unwrap();

    let handler = Arc::new(DistinctBodies::default());
    let mut registry = SubscriberRegistry::new();
    registry.register_arc(spec.as_ref().clone(), handler.clone());

    let pool_config = SubscriberConfig::new()
        .with_consumer_prefix("assured_delivery_test")
        .with_reconnect_backoff(Duration::from_millis(5), Duration::from_millis(20));
    let pool = SubscriberPool::new(broker.connect(), pool_config);
    pool.start(&registry).await.unwrap();

    for i in 0..MESSAGES {
        if i % KILL_EVERY == KILL_EVERY - HOLD_BEFORE_KILL {
            // Leave the next few publishes unconfirmed when the channel dies
            broker.hold_confirms();
        }
        if i != 0 && i % KILL_EVERY == 0 {
            assert!(broker.kill_channels("connection reset") > 0);
            broker.release_confirms();
        }
        assert!(publisher.publish(format!("message-{i}"), spec.clone()).await);
    }

    assert!(
        publisher.wait_for_all_confirmations().await,
        "Publisher still has {} pending",
        publisher.pending_count()
    );

    let done = eventually(TIMEOUT, || async { handler.distinct() == MESSAGES }).await;
    assert!(done, "Received {} of {} distinct", handler.distinct(), MESSAGES);
    pool.close().await;
    publisher.close().await.unwrap();

    let bodies = handler.bodies.lock().clone();
    assert_eq!(bodies.len(), MESSAGES);
    assert!(bodies.contains("message-0"));
    assert!(bodies.contains(&format!("message-{}", MESSAGES - 1)));
    assert!(handler.deliveries.load(Ordering::SeqCst) >= MESSAGES);

    let outcomes = outcomes.lock().clone();
    assert_eq!(outcomes.len(), MESSAGES);
    assert!(outcomes.iter().all(|outcome| *outcome == ConfirmOutcome::Acked));

    let stats = broker.stats();
    assert!(stats.channels_opened > (2 * (MESSAGES / KILL_EVERY)) as u64);
    assert_eq!(stats.protocol_errors, 0);
}
