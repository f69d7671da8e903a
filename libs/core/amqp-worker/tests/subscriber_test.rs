//! Integration tests for the subscriber pool
//!
//! Messages are published with an assured publisher and consumed back through
//! the pool against the in-memory broker.

use amqp_worker::{
    create_queue, handler_fn, AssuredPublisher, Delivery, DeliveryHandler,
    HandlerOutcome, InMemoryBroker, PublisherConfig, SubscriberConfig, SubscriberPool,
    SubscriberRegistry, SubscriberSpec,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_utils::{assertions::*, eventually, init_test_tracing, TestDataBuilder};
use tokio::sync::watch;

const TIMEOUT: Duration = Duration::from_secs(5);

fn pool_config() -> SubscriberConfig {
    SubscriberConfig::new()
        .with_consumer_prefix("subscriber_test")
        .with_reconnect_backoff(Duration::from_millis(10), Duration::from_millis(50))
}

fn spec_for(names: &TestDataBuilder, suffix: &str) -> SubscriberSpec {
    SubscriberSpec::new(
        names.exchange("events"),
        names.queue(suffix),
        names.routing_key(suffix),
    )
}

/// Declare `spec` and publish every payload to it, waiting for confirms
async fn seed(broker: &InMemoryBroker, spec: &SubscriberSpec, payloads: &[String]) {
    let (_cancel, cancel_rx) = watch::channel(false);
    let publisher = AssuredPublisher::new(broker.connect(), PublisherConfig::new(), cancel_rx);
    let channel = publisher.channel().await.unwrap();
    create_queue(channel.as_ref(), spec).await.unwrap();

    let spec = Arc::new(spec.clone());
    for payload in payloads {
        assert!(publisher.publish(payload.clone(), spec.clone()).await);
    }
    publisher.close().await.unwrap();
}

/// Records bodies and the highest number of concurrent calls
#[derive(Default)]
struct RecordingHandler {
    delay: Duration,
    current: AtomicUsize,
    max_concurrent: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl RecordingHandler {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn count(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl DeliveryHandler for RecordingHandler {
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        self.seen.lock().push(delivery.body_str());

        self.current.fetch_sub(1, Ordering::SeqCst);
        HandlerOutcome::Accept
    }

    fn name(&self) -> &'static str {
        "recording_handler"
    }
}

fn counting(name: &'static str, counter: Arc<AtomicUsize>) -> impl DeliveryHandler {
    handler_fn(name, move |_delivery: Delivery| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Accept
        }
    })
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_bounds_parallel_handlers() {
    init_test_tracing();
    let names = TestDataBuilder::from_test_name("test_concurrency_bounds_parallel_handlers");
    let broker = InMemoryBroker::new();
    let spec = spec_for(&names, "parallel").with_concurrency(5);
    let payloads = names.payloads("work", 20);
    seed(&broker, &spec, &payloads).await;

    let handler = Arc::new(RecordingHandler::with_delay(Duration::from_millis(30)));
    let mut registry = SubscriberRegistry::new();
    registry.register_arc(spec.clone(), handler.clone());

    let pool = SubscriberPool::new(broker.connect(), pool_config());
    pool.start(&registry).await.unwrap();

    let done = eventually(TIMEOUT, || async { handler.count() == payloads.len() }).await;
    assert!(done, "Handled {} of {}", handler.count(), payloads.len());

    let max = handler.max_concurrent.load(Ordering::SeqCst);
    assert!(max <= 5, "Saw {} concurrent handlers", max);
    assert!(max > 1, "Handlers never overlapped");

    pool.close().await;
    pool.close().await;
    assert!(!pool.is_running().await);

    let seen = handler.seen.lock().clone();
    assert_contains_all(&seen, &payloads, "handled payloads");

    let stats = broker.stats();
    assert_eq!(stats.protocol_errors, 0);
    assert_eq!(stats.acked, 20);
    assert_eq!(broker.unacked(), 0);
    assert_eq!(broker.queue_depth(&spec.queue), Some(0));
}

#[tokio::test]
async fn test_close_waits_for_in_flight_delivery() {
    init_test_tracing();
    let names = TestDataBuilder::from_test_name("test_close_waits_for_in_flight_delivery");
    let broker = InMemoryBroker::new();
    let spec = spec_for(&names, "slow");
    seed(&broker, &spec, &names.payloads("slow", 1)).await;

    let started = Arc::new(AtomicUsize::new(0));
    let started_in_handler = started.clone();
    let mut registry = SubscriberRegistry::new();
    registry.register(
        spec.clone(),
        handler_fn("slow_handler", move |_delivery: Delivery| {
            let started = started_in_handler.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                HandlerOutcome::Accept
            }
        }),
    );

    let pool = SubscriberPool::new(broker.connect(), pool_config());
    pool.start(&registry).await.unwrap();

    let running = eventually(TIMEOUT, || async { started.load(Ordering::SeqCst) == 1 }).await;
    assert!(running);

    tokio::time::timeout(TIMEOUT, pool.close()).await.unwrap();

    assert_eq!(broker.stats().acked, 1);
    assert_eq!(broker.unacked(), 0);
    assert_eq!(broker.queue_depth(&spec.queue), Some(0));
    assert_eq!(broker.open_channels(), 0);
}

// ============================================================================
// Handler outcomes
// ============================================================================

#[tokio::test]
async fn test_rejected_delivery_is_requeued_and_redelivered() {
    init_test_tracing();
    let names = TestDataBuilder::from_test_name("test_rejected_delivery_is_requeued_and_redelivered");
    let broker = InMemoryBroker::new();
    let spec = spec_for(&names, "retry").with_concurrency(2);
    let payloads = names.payloads("retry", 5);
    seed(&broker, &spec, &payloads).await;

    let accepted = Arc::new(Mutex::new(Vec::new()));
    let sink = accepted.clone();
    let mut registry = SubscriberRegistry::new();
    registry.register(
        spec.clone(),
        handler_fn("second_time_lucky", move |delivery: Delivery| {
            let sink = sink.clone();
            async move {
                if !delivery.redelivered {
                    return HandlerOutcome::Reject;
                }
                sink.lock().push(delivery.body_str());
                HandlerOutcome::Accept
            }
        }),
    );

    let pool = SubscriberPool::new(broker.connect(), pool_config());
    pool.start(&registry).await.unwrap();

    let done = eventually(TIMEOUT, || async { accepted.lock().len() == payloads.len() }).await;
    assert!(done);
    pool.close().await;

    let accepted = accepted.lock().clone();
    assert_contains_all(&accepted, &payloads, "redelivered payloads");

    let stats = broker.stats();
    assert_eq!(stats.nacked, 5);
    assert_eq!(stats.acked, 5);
    assert_eq!(stats.protocol_errors, 0);
}

#[tokio::test]
async fn test_handler_panic_does_not_stop_the_loop() {
    init_test_tracing();
    let names = TestDataBuilder::from_test_name("test_handler_panic_does_not_stop_the_loop");
    let broker = InMemoryBroker::new();
    let spec = spec_for(&names, "panic");
    let payloads = vec![
        "boom".to_string(),
        "after-1".to_string(),
        "after-2".to_string(),
    ];
    seed(&broker, &spec, &payloads).await;

    let accepted = Arc::new(Mutex::new(Vec::new()));
    let sink = accepted.clone();
    let mut registry = SubscriberRegistry::new();
    registry.register(
        spec.clone(),
        handler_fn("panics_once", move |delivery: Delivery| {
            let sink = sink.clone();
            async move {
                if delivery.body_str() == "boom" && !delivery.redelivered {
                    panic!("handler blew up on first delivery");
                }
                sink.lock().push(delivery.body_str());
                HandlerOutcome::Accept
            }
        }),
    );

    let pool = SubscriberPool::new(broker.connect(), pool_config());
    pool.start(&registry).await.unwrap();

    let done = eventually(TIMEOUT, || async { accepted.lock().len() == 3 }).await;
    assert!(done, "Loop stopped after the panic");
    pool.close().await;

    let accepted = accepted.lock().clone();
    assert_contains_all(&accepted, &payloads, "payloads after panic");
    assert_eq!(broker.stats().nacked, 1);
    assert_eq!(broker.unacked(), 0);
}

// ============================================================================
// Registry
// ============================================================================

#[tokio::test]
async fn test_reregistering_a_spec_replaces_only_its_handler() {
    init_test_tracing();
    let names = TestDataBuilder::from_test_name("test_reregistering_a_spec_replaces_only_its_handler");
    let broker = InMemoryBroker::new();
    let orders = spec_for(&names, "orders");
    let invoices = spec_for(&names, "invoices");
    seed(&broker, &orders, &names.payloads("order", 1)).await;
    seed(&broker, &invoices, &names.payloads("invoice", 1)).await;

    let first = Arc::new(AtomicUsize::new(0));
    let replaced = Arc::new(AtomicUsize::new(0));
    let replacement = Arc::new(AtomicUsize::new(0));

    let mut registry = SubscriberRegistry::new();
    registry
        .register(orders.clone(), counting("orders", first.clone()))
        .register(invoices.clone(), counting("invoices_old", replaced.clone()))
        .register(invoices.clone(), counting("invoices_new", replacement.clone()));
    assert_eq!(registry.len(), 2);

    let pool = SubscriberPool::new(broker.connect(), pool_config());
    pool.start(&registry).await.unwrap();

    let done = eventually(TIMEOUT, || async {
        first.load(Ordering::SeqCst) == 1 && replacement.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(done);
    pool.close().await;

    assert_eq!(replaced.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Reconnection
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_consumer_reconnects_after_channel_loss() {
    init_test_tracing();
    let names = TestDataBuilder::from_test_name("test_consumer_reconnects_after_channel_loss");
    let broker = InMemoryBroker::new();
    let spec = spec_for(&names, "reconnect").with_concurrency(2);
    seed(&broker, &spec, &names.payloads("before", 2)).await;

    let handler = Arc::new(RecordingHandler::default());
    let mut registry = SubscriberRegistry::new();
    registry.register_arc(spec.clone(), handler.clone());

    let pool = SubscriberPool::new(broker.connect(), pool_config());
    pool.start(&registry).await.unwrap();

    let first = eventually(TIMEOUT, || async { broker.stats().acked == 2 }).await;
    assert!(first);

    assert_eq!(broker.kill_channels("connection reset"), 2);

    let reopened = eventually(TIMEOUT, || async { broker.open_channels() == 2 }).await;
    assert!(reopened, "Consumers did not reopen their channels");

    let after = names.payloads("after", 3);
    seed(&broker, &spec, &after).await;

    let done = eventually(TIMEOUT, || async { broker.stats().acked == 5 }).await;
    assert!(done, "Handled {} of 5", handler.count());
    assert!(pool.is_running().await);
    pool.close().await;

    let seen = handler.seen.lock().clone();
    assert_contains_all(&seen, &after, "payloads after reconnect");
    assert!(broker.stats().channels_opened >= 5);
}
