//! In-memory broker.
//!
//! Implements the channel contract with AMQP 0-9-1 semantics that matter to
//! the publisher and the subscriber pool:
//!
//! - topic/direct/fanout exchanges, durable flags checked on redeclare
//! - publish sequences per channel, confirms emitted in publish order
//! - publishing to a missing exchange kills the channel (404) without a confirm
//! - delivery tags per channel, requeue on nack and on channel close
//!
//! Fault injection (`nack_next`, `hold_confirms`, `kill_channels`,
//! `refuse_channels`) drives the failure paths in tests.

use crate::channel::{
    BrokerChannel, BrokerConnection, Confirmation, ConfirmationStream, DeliveryStream,
    ExchangeKind,
};
use crate::delivery::Delivery;
use crate::error::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// Counters exposed for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub channels_opened: u64,
    pub published: u64,
    pub confirmed_acks: u64,
    pub confirmed_nacks: u64,
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub requeued: u64,
    /// Acks/nacks for unknown delivery tags (double settles)
    pub protocol_errors: u64,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    exchange: String,
    routing_key: String,
    payload: Bytes,
    redelivered: bool,
}

struct Exchange {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<(String, String)>,
}

struct Queue {
    durable: bool,
    messages: VecDeque<QueuedMessage>,
    notify: Arc<Notify>,
}

struct ChannelState {
    open: Arc<AtomicBool>,
    closed_tx: watch::Sender<bool>,
    confirms: Option<mpsc::UnboundedSender<Confirmation>>,
    held: Vec<Confirmation>,
    next_publish_seq: u64,
    next_delivery_tag: u64,
    unacked: HashMap<u64, (String, QueuedMessage)>,
    prefetch: u16,
    settled: Arc<Notify>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    channels: HashMap<u64, ChannelState>,
    nack_next: u32,
    hold_confirms: bool,
    refuse_channels: bool,
    stats: BrokerStats,
}

impl BrokerState {
    fn push(&mut self, queue: &str, message: QueuedMessage, front: bool) {
        if let Some(q) = self.queues.get_mut(queue) {
            if front {
                q.messages.push_front(message);
            } else {
                q.messages.push_back(message);
            }
            q.notify.notify_waiters();
        }
    }

    /// Close a channel: requeue its unacked deliveries, end its streams.
    fn shutdown_channel(&mut self, id: u64, reason: &str) -> bool {
        let Some(channel) = self.channels.remove(&id) else {
            return false;
        };

        channel.open.store(false, Ordering::SeqCst);
        let _ = channel.closed_tx.send(true);
        channel.settled.notify_waiters();

        let mut requeued: Vec<_> = channel.unacked.into_iter().collect();
        requeued.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, (queue, mut message)) in requeued {
            message.redelivered = true;
            self.stats.requeued += 1;
            self.push(&queue, message, true);
        }

        debug!(channel_id = id, reason = %reason, "Channel shut down");
        true
    }

    fn route(&self, exchange: &Exchange, routing_key: &str) -> Vec<String> {
        let mut targets: Vec<String> = exchange
            .bindings
            .iter()
            .filter(|(_, pattern)| match exchange.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => pattern == routing_key,
                ExchangeKind::Topic => topic_matches(pattern, routing_key),
            })
            .map(|(queue, _)| queue.clone())
            .collect();
        targets.dedup();
        targets
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        vec![]
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &key)
}

/// Shared in-memory broker. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_channel_id: Arc<AtomicU64>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a connection handle to this broker.
    pub fn connect(&self) -> InMemoryConnection {
        InMemoryConnection {
            broker: self.clone(),
        }
    }

    /// Nack the next `count` publishes instead of routing them.
    pub fn nack_next(&self, count: u32) {
        self.state.lock().nack_next = count;
    }

    /// Buffer confirmations instead of emitting them.
    pub fn hold_confirms(&self) {
        self.state.lock().hold_confirms = true;
    }

    /// Emit every buffered confirmation and stop buffering.
    pub fn release_confirms(&self) {
        let mut state = self.state.lock();
        state.hold_confirms = false;
        for channel in state.channels.values_mut() {
            let held = std::mem::take(&mut channel.held);
            if let Some(confirms) = &channel.confirms {
                for confirmation in held {
                    let _ = confirms.send(confirmation);
                }
            }
        }
    }

    /// Like `release_confirms`, but a run of held acks is emitted as one
    /// cumulative ack for its last sequence.
    pub fn release_confirms_cumulative(&self) {
        let mut state = self.state.lock();
        state.hold_confirms = false;
        for channel in state.channels.values_mut() {
            let held = std::mem::take(&mut channel.held);
            let Some(confirms) = &channel.confirms else {
                continue;
            };

            let mut run_end = None;
            for confirmation in held {
                if confirmation.ack {
                    run_end = Some(confirmation.delivery_tag);
                    continue;
                }
                if let Some(tag) = run_end.take() {
                    let _ = confirms.send(Confirmation::ack(tag).multiple());
                }
                let _ = confirms.send(confirmation);
            }
            if let Some(tag) = run_end {
                let _ = confirms.send(Confirmation::ack(tag).multiple());
            }
        }
    }

    /// Make `open_channel` fail until called again with `false`.
    pub fn refuse_channels(&self, refuse: bool) {
        self.state.lock().refuse_channels = refuse;
    }

    /// Kill every open channel as a connection drop would.
    ///
    /// Confirmations not yet emitted are lost. Returns the number of channels killed.
    pub fn kill_channels(&self, reason: &str) -> usize {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in &ids {
            state.shutdown_channel(*id, reason);
        }
        warn!(count = ids.len(), reason = %reason, "Killed channels");
        ids.len()
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    /// Ready (not unacked) messages in a queue.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state.lock().queues.get(name).map(|q| q.messages.len())
    }

    /// Deliveries handed out and not yet settled, across all channels.
    pub fn unacked(&self) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    pub fn stats(&self) -> BrokerStats {
        self.state.lock().stats
    }

    fn open(&self) -> Result<InMemoryChannel, BrokerError> {
        let mut state = self.state.lock();
        if state.refuse_channels {
            return Err(BrokerError::ConnectionClosed(
                "connection refused channel open".to_string(),
            ));
        }

        let id = self.next_channel_id.fetch_add(1, Ordering::SeqCst) + 1;
        let open = Arc::new(AtomicBool::new(true));
        let (closed_tx, closed_rx) = watch::channel(false);

        state.channels.insert(
            id,
            ChannelState {
                open: open.clone(),
                closed_tx,
                confirms: None,
                held: Vec::new(),
                next_publish_seq: 0,
                next_delivery_tag: 0,
                unacked: HashMap::new(),
                prefetch: u16::MAX,
                settled: Arc::new(Notify::new()),
            },
        );
        state.stats.channels_opened += 1;

        debug!(channel_id = id, "Opened channel");

        Ok(InMemoryChannel {
            id,
            broker: self.clone(),
            open,
            closed_rx,
        })
    }
}

/// Connection to an `InMemoryBroker`.
#[derive(Clone)]
pub struct InMemoryConnection {
    broker: InMemoryBroker,
}

impl InMemoryConnection {
    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    type Channel = InMemoryChannel;

    async fn open_channel(&self) -> Result<InMemoryChannel, BrokerError> {
        self.broker.open()
    }
}

/// Channel on an `InMemoryBroker`.
pub struct InMemoryChannel {
    id: u64,
    broker: InMemoryBroker,
    open: Arc<AtomicBool>,
    closed_rx: watch::Receiver<bool>,
}

impl InMemoryChannel {
    fn closed(&self) -> BrokerError {
        BrokerError::channel_closed(format!("channel {} is closed", self.id))
    }

    fn take_next(
        &self,
        state: &mut BrokerState,
        queue: &str,
    ) -> Result<Option<Delivery>, BrokerError> {
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(BrokerError::queue_not_found(queue));
        };
        let Some(message) = q.messages.pop_front() else {
            return Ok(None);
        };

        let Some(channel) = state.channels.get_mut(&self.id) else {
            // Put it back; the channel vanished under us
            q.messages.push_front(message);
            return Err(self.closed());
        };

        channel.next_delivery_tag += 1;
        let tag = channel.next_delivery_tag;
        let delivery = Delivery::new(
            tag,
            message.exchange.clone(),
            message.routing_key.clone(),
            message.payload.clone(),
        )
        .redelivered(message.redelivered);
        channel.unacked.insert(tag, (queue.to_string(), message));
        state.stats.delivered += 1;

        Ok(Some(delivery))
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn confirm_select(&self) -> Result<ConfirmationStream, BrokerError> {
        let mut state = self.broker.state.lock();
        let channel = state.channels.get_mut(&self.id).ok_or_else(|| self.closed())?;
        if channel.confirms.is_some() {
            return Err(BrokerError::Protocol(
                "confirm mode already enabled".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        channel.confirms = Some(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<u64, BrokerError> {
        let mut guard = self.broker.state.lock();
        let state = &mut *guard;

        let channel = state.channels.get_mut(&self.id).ok_or_else(|| self.closed())?;
        channel.next_publish_seq += 1;
        let sequence = channel.next_publish_seq;

        let routed = state
            .exchanges
            .get(exchange)
            .map(|target| state.route(target, routing_key));
        let Some(queues) = routed else {
            // Asynchronous channel error, as a real broker would raise it
            warn!(
                channel_id = self.id,
                exchange = %exchange,
                "NOT_FOUND - no exchange, closing channel"
            );
            state.shutdown_channel(self.id, "NOT_FOUND - no exchange");
            return Ok(sequence);
        };

        state.stats.published += 1;

        let ack = if state.nack_next > 0 {
            state.nack_next -= 1;
            false
        } else {
            true
        };

        if ack {
            if queues.is_empty() {
                debug!(exchange = %exchange, routing_key = %routing_key, "Unroutable message dropped");
            }
            for queue in queues {
                state.push(
                    &queue,
                    QueuedMessage {
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                        payload: payload.clone(),
                        redelivered: false,
                    },
                    false,
                );
            }
            state.stats.confirmed_acks += 1;
        } else {
            state.stats.confirmed_nacks += 1;
        }

        let hold = state.hold_confirms;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            if let Some(confirms) = &channel.confirms {
                let confirmation = Confirmation {
                    delivery_tag: sequence,
                    ack,
                    multiple: false,
                };
                if hold {
                    channel.held.push(confirmation);
                } else {
                    let _ = confirms.send(confirmation);
                }
            }
        }

        Ok(sequence)
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        let channel = state.channels.get_mut(&self.id).ok_or_else(|| self.closed())?;
        channel.prefetch = if prefetch_count == 0 {
            u16::MAX
        } else {
            prefetch_count
        };
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        {
            let state = self.broker.state.lock();
            if !state.channels.contains_key(&self.id) {
                return Err(self.closed());
            }
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::queue_not_found(queue));
            }
        }

        info!(
            channel_id = self.id,
            queue = %queue,
            consumer_tag = %consumer_tag,
            "Consumer started"
        );

        let consumer = ConsumerCursor {
            channel: InMemoryChannel {
                id: self.id,
                broker: self.broker.clone(),
                open: self.open.clone(),
                closed_rx: self.closed_rx.clone(),
            },
            queue: queue.to_string(),
        };

        Ok(futures::stream::unfold(consumer, |mut cursor| async move {
            cursor.next().await.map(|delivery| (delivery, cursor))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut guard = self.broker.state.lock();
        let state = &mut *guard;
        let channel = state.channels.get_mut(&self.id).ok_or_else(|| self.closed())?;

        if channel.unacked.remove(&delivery_tag).is_none() {
            state.stats.protocol_errors += 1;
            return Err(BrokerError::Protocol(format!(
                "unknown delivery tag {}",
                delivery_tag
            )));
        }
        channel.settled.notify_waiters();
        state.stats.acked += 1;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut guard = self.broker.state.lock();
        let state = &mut *guard;
        let channel = state.channels.get_mut(&self.id).ok_or_else(|| self.closed())?;

        let Some((queue, mut message)) = channel.unacked.remove(&delivery_tag) else {
            state.stats.protocol_errors += 1;
            return Err(BrokerError::Protocol(format!(
                "unknown delivery tag {}",
                delivery_tag
            )));
        };
        channel.settled.notify_waiters();
        state.stats.nacked += 1;

        if requeue {
            message.redelivered = true;
            state.stats.requeued += 1;
            state.push(&queue, message, true);
        }
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self.broker.state.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(self.closed());
        }
        self.take_next(&mut state, queue)
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(self.closed());
        }

        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.durable != durable => {
                Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent arg for exchange '{}': kind={} durable={}",
                    name, existing.kind, existing.durable
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(self.closed());
        }

        match state.queues.get(name) {
            Some(existing) if existing.durable != durable => {
                Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent arg 'durable' for queue '{}'",
                    name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    Queue {
                        durable,
                        messages: VecDeque::new(),
                        notify: Arc::new(Notify::new()),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(self.closed());
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::queue_not_found(queue));
        }

        let target = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::exchange_not_found(exchange))?;
        let binding = (queue.to_string(), routing_key.to_string());
        if !target.bindings.contains(&binding) {
            target.bindings.push(binding);
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, BrokerError> {
        let mut state = self.broker.state.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(self.closed());
        }

        let Some(queue) = state.queues.remove(name) else {
            return Ok(0);
        };
        for exchange in state.exchanges.values_mut() {
            exchange.bindings.retain(|(q, _)| q != name);
        }
        queue.notify.notify_waiters();
        Ok(queue.messages.len() as u32)
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(self.closed());
        }
        state.exchanges.remove(name);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        if state.shutdown_channel(self.id, "closed by client") {
            debug!(channel_id = self.id, "Channel closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn id(&self) -> u64 {
        self.id
    }
}

/// Pull side of a consumer: hands out one delivery per poll.
struct ConsumerCursor {
    channel: InMemoryChannel,
    queue: String,
}

enum Step {
    Ready(Delivery),
    Wait(Arc<Notify>, Arc<Notify>),
    Done,
}

impl ConsumerCursor {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            if *self.channel.closed_rx.borrow() {
                return None;
            }

            let step = {
                let mut state = self.channel.broker.state.lock();
                let Some(channel) = state.channels.get(&self.channel.id) else {
                    return None;
                };
                let settled = channel.settled.clone();
                let below_prefetch = channel.unacked.len() < channel.prefetch as usize;

                let queue = state
                    .queues
                    .get(&self.queue)
                    .map(|q| (q.notify.clone(), q.messages.is_empty()));

                match queue {
                    None => Step::Done,
                    Some((notify, empty)) if !below_prefetch || empty => {
                        Step::Wait(notify, settled)
                    }
                    Some(_) => match self.channel.take_next(&mut state, &self.queue) {
                        Ok(Some(delivery)) => Step::Ready(delivery),
                        Ok(None) => continue,
                        Err(_) => Step::Done,
                    },
                }
            };

            match step {
                Step::Ready(delivery) => return Some(delivery),
                Step::Done => {
                    debug!(queue = %self.queue, "Consumer stream ended");
                    return None;
                }
                Step::Wait(queue_notify, settled) => {
                    let queued = queue_notify.notified();
                    let freed = settled.notified();
                    tokio::pin!(queued, freed);
                    queued.as_mut().enable();
                    freed.as_mut().enable();

                    // Re-check after registering so a push between the check and
                    // the registration is not missed
                    if self.has_work() {
                        continue;
                    }

                    let mut closed = self.channel.closed_rx.clone();
                    tokio::select! {
                        _ = &mut queued => {}
                        _ = &mut freed => {}
                        _ = closed.changed() => {}
                    }
                }
            }
        }
    }

    fn has_work(&self) -> bool {
        let state = self.channel.broker.state.lock();
        let Some(channel) = state.channels.get(&self.channel.id) else {
            return true;
        };
        match state.queues.get(&self.queue) {
            None => true,
            Some(queue) => {
                !queue.messages.is_empty() && channel.unacked.len() < channel.prefetch as usize
            }
        }
    }
}
