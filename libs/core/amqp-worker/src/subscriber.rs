//! Subscriber worker pool.
//!
//! Handlers are registered per `SubscriberSpec` in a `SubscriberRegistry`.
//! `SubscriberPool::start` runs `concurrency` consumer loops per spec; each loop
//! owns its own channel with the configured prefetch:
//!
//! ```text
//! Idle ──▶ Receiving ──▶ Handling ──▶ Acking / Nacking ──▶ Idle
//!                                            │
//!                         shutdown ──▶ Stopped (after the current cycle)
//! ```
//!
//! Accept acks the delivery. Reject, or a panicking handler, nacks it with
//! requeue. A loop whose channel dies reopens it with exponential backoff.

use crate::channel::{BrokerChannel, BrokerConnection, DeliveryStream};
use crate::config::SubscriberConfig;
use crate::delivery::Delivery;
use crate::error::{BrokerError, SubscriberError};
use crate::handler::{DeliveryHandler, HandlerOutcome};
use crate::metrics::SubscriberMetrics;
use crate::topology::SubscriberSpec;
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Specs and the handlers that process their queues
#[derive(Default, Clone)]
pub struct SubscriberRegistry {
    entries: Vec<(Arc<SubscriberSpec>, Arc<dyn DeliveryHandler>)>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `spec`.
    ///
    /// Registering an equal spec again replaces its handler; other specs are
    /// left untouched.
    pub fn register<H>(&mut self, spec: SubscriberSpec, handler: H) -> &mut Self
    where
        H: DeliveryHandler + 'static,
    {
        self.register_arc(spec, Arc::new(handler))
    }

    /// Register a shared handler for `spec`
    pub fn register_arc(
        &mut self,
        spec: SubscriberSpec,
        handler: Arc<dyn DeliveryHandler>,
    ) -> &mut Self {
        match self.entries.iter_mut().find(|(s, _)| **s == spec) {
            Some(entry) => {
                debug!(queue = %spec.queue, handler = handler.name(), "Replacing handler");
                entry.1 = handler;
            }
            None => self.entries.push((Arc::new(spec), handler)),
        }
        self
    }

    /// Handler registered for an exact spec
    pub fn handler_for(&self, spec: &SubscriberSpec) -> Option<&Arc<dyn DeliveryHandler>> {
        self.entries
            .iter()
            .find(|(s, _)| s.as_ref() == spec)
            .map(|(_, handler)| handler)
    }

    pub fn specs(&self) -> impl Iterator<Item = &SubscriberSpec> {
        self.entries.iter().map(|(spec, _)| spec.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

/// Runs consumer loops for every registered spec.
pub struct SubscriberPool<C: BrokerConnection> {
    connection: Arc<C>,
    config: SubscriberConfig,
    running: Mutex<Option<Running>>,
}

impl<C: BrokerConnection> SubscriberPool<C> {
    pub fn new(connection: C, config: SubscriberConfig) -> Self {
        Self {
            connection: Arc::new(connection),
            config,
            running: Mutex::new(None),
        }
    }

    /// Start `concurrency` consumer loops per registered spec.
    ///
    /// Every loop's channel is opened before this returns, so broker errors
    /// surface here and nothing is left running on failure.
    pub async fn start(&self, registry: &SubscriberRegistry) -> Result<(), SubscriberError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SubscriberError::AlreadyRunning);
        }

        for spec in registry.specs() {
            spec.validate().map_err(SubscriberError::InvalidSpec)?;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut opened = Vec::new();

        for (spec, handler) in &registry.entries {
            for index in 0..spec.concurrency {
                let consumer = ConsumerLoop {
                    connection: self.connection.clone(),
                    spec: spec.clone(),
                    handler: handler.clone(),
                    config: self.config.clone(),
                    index,
                    metrics: SubscriberMetrics::new(spec.queue.clone(), handler.name()),
                };

                match consumer.open().await {
                    Ok((channel, deliveries)) => opened.push((consumer, channel, deliveries)),
                    Err(err) => {
                        error!(queue = %spec.queue, error = %err, "Failed to start consumer");
                        for (_, channel, _) in opened {
                            let _ = channel.close().await;
                        }
                        return Err(err.into());
                    }
                }
            }
        }

        let mut tasks = JoinSet::new();
        for (consumer, channel, deliveries) in opened {
            tasks.spawn(consumer.run(channel, deliveries, shutdown_rx.clone()));
        }

        info!(
            specs = registry.len(),
            consumers = tasks.len(),
            "Subscribers started"
        );

        *running = Some(Running { shutdown_tx, tasks });
        Ok(())
    }

    /// Stop every loop after its current delivery is settled, then close
    /// the channels. Calling it again is a no-op.
    pub async fn close(&self) {
        let Some(mut running) = self.running.lock().await.take() else {
            return;
        };

        info!(consumers = running.tasks.len(), "Stopping subscribers");
        let _ = running.shutdown_tx.send(true);

        while let Some(result) = running.tasks.join_next().await {
            if let Err(err) = result {
                error!(error = %err, "Consumer task failed");
            }
        }

        info!("Subscribers stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

struct ConsumerLoop<C: BrokerConnection> {
    connection: Arc<C>,
    spec: Arc<SubscriberSpec>,
    handler: Arc<dyn DeliveryHandler>,
    config: SubscriberConfig,
    index: usize,
    metrics: SubscriberMetrics,
}

impl<C: BrokerConnection> ConsumerLoop<C> {
    async fn open(&self) -> Result<(C::Channel, DeliveryStream), BrokerError> {
        let channel = self.connection.open_channel().await?;
        let consumer_tag = format!(
            "{}-{}-{}-{}",
            self.config.consumer_prefix,
            self.spec.queue,
            self.index,
            Uuid::new_v4().simple()
        );

        let deliveries = match channel.qos(self.config.prefetch).await {
            Ok(()) => channel.consume(&self.spec.queue, &consumer_tag).await,
            Err(err) => Err(err),
        };

        match deliveries {
            Ok(deliveries) => Ok((channel, deliveries)),
            Err(err) => {
                let _ = channel.close().await;
                Err(err)
            }
        }
    }

    async fn run(
        self,
        mut channel: C::Channel,
        mut deliveries: DeliveryStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(
            queue = %self.spec.queue,
            index = self.index,
            channel_id = channel.id(),
            "Consumer loop running"
        );

        'consume: loop {
            let next = tokio::select! {
                biased;

                _ = stopped(&mut shutdown) => break 'consume,
                next = deliveries.next() => next,
            };

            if let Some(delivery) = next {
                self.handle(&channel, delivery).await;
                continue;
            }

            warn!(
                queue = %self.spec.queue,
                index = self.index,
                channel_id = channel.id(),
                "Delivery stream ended, reconnecting"
            );

            let mut attempt = 0u32;
            loop {
                let delay = self.config.reconnect_backoff_for(attempt);
                tokio::select! {
                    biased;

                    _ = stopped(&mut shutdown) => break 'consume,
                    _ = tokio::time::sleep(delay) => {}
                }

                match self.open().await {
                    Ok((new_channel, new_deliveries)) => {
                        self.metrics.reconnected();
                        info!(
                            queue = %self.spec.queue,
                            index = self.index,
                            channel_id = new_channel.id(),
                            attempts = attempt + 1,
                            "Consumer reconnected"
                        );
                        channel = new_channel;
                        deliveries = new_deliveries;
                        break;
                    }
                    Err(err) => {
                        warn!(
                            queue = %self.spec.queue,
                            error = %err,
                            category = %err.category(),
                            delay_ms = delay.as_millis() as u64,
                            "Consumer reconnect failed"
                        );
                        attempt = attempt.saturating_add(1);
                    }
                }
            }
        }

        if let Err(err) = channel.close().await {
            debug!(error = %err, "Consumer channel already closed");
        }
        debug!(queue = %self.spec.queue, index = self.index, "Consumer loop stopped");
    }

    async fn handle(&self, channel: &C::Channel, delivery: Delivery) {
        let tag = delivery.delivery_tag;
        self.metrics.received();
        self.metrics.in_flight(1.0);

        if delivery.redelivered {
            debug!(queue = %self.spec.queue, delivery_tag = tag, "Handling redelivered message");
        }

        let start = Instant::now();
        let outcome = AssertUnwindSafe(self.handler.handle(&delivery))
            .catch_unwind()
            .await;
        let duration = start.elapsed();
        self.metrics.in_flight(-1.0);

        let settled = match outcome {
            Ok(HandlerOutcome::Accept) => {
                self.metrics.handled(true, duration);
                channel.ack(tag).await
            }
            Ok(HandlerOutcome::Reject) => {
                self.metrics.handled(false, duration);
                debug!(queue = %self.spec.queue, delivery_tag = tag, "Delivery rejected, requeueing");
                channel.nack(tag, true).await
            }
            Err(panic) => {
                self.metrics.handler_panicked();
                warn!(
                    queue = %self.spec.queue,
                    handler = self.handler.name(),
                    delivery_tag = tag,
                    panic = %panic_message(panic.as_ref()),
                    "Handler panicked, requeueing"
                );
                channel.nack(tag, true).await
            }
        };

        if let Err(err) = settled {
            // The broker requeues it when the channel goes away
            warn!(
                queue = %self.spec.queue,
                delivery_tag = tag,
                error = %err,
                "Failed to settle delivery"
            );
        }
    }
}

/// Resolves once shutdown is requested or the pool is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
