//! Assured publisher.
//!
//! Every message published through `AssuredPublisher` ends in exactly one
//! outcome: acked by the broker, or failed and reported. Nacked messages and
//! messages stranded on a dead channel are republished on a fresh channel
//! until they are acked or run out of attempts.
//!
//! ```text
//! publish ──▶ channel.publish ──▶ tracker[generation].record
//!                                        │
//!          listener(generation) ◀── confirmations
//!            ack  ──▶ report Acked
//!            nack ──▶ republish on current channel (or report Nacked)
//!            end  ──▶ replay leftovers with backoff (or ChannelLost / Abandoned)
//! ```
//!
//! Each channel instance gets its own tracker and listener, keyed by a
//! generation number, because sequences restart at 1 on every channel.
//! All tracker mutations happen under one `tokio::sync::Mutex`.

use crate::channel::{BrokerChannel, BrokerConnection, Confirmation, ConfirmationStream};
use crate::config::PublisherConfig;
use crate::error::{BrokerError, PublishError};
use crate::metrics::PublisherMetrics;
use crate::topology::SubscriberSpec;
use crate::tracker::{
    ConfirmOutcome, ConfirmationReport, ConfirmationTracker, OutboundMessage, PendingConfirmation,
    Untracked,
};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Observer invoked once per resolved message
pub type ConfirmationHandler = Arc<dyn Fn(&ConfirmationReport) + Send + Sync>;

/// Result of an accepted publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    /// Sequence of the first publish attempt
    pub delivery_tag: u64,
    /// `true` when the call waited for and received the broker ack
    pub confirmed: bool,
}

struct ActiveChannel<Ch> {
    channel: Arc<Ch>,
    generation: u64,
}

impl<Ch> Clone for ActiveChannel<Ch> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            generation: self.generation,
        }
    }
}

struct PublisherState<Ch> {
    current: Option<ActiveChannel<Ch>>,
    /// One tracker per channel instance still able to emit confirmations
    trackers: BTreeMap<u64, ConfirmationTracker>,
    /// Entries between channels, waiting for replay
    orphans: Vec<PendingConfirmation>,
    replaying: bool,
    next_generation: u64,
}

impl<Ch> PublisherState<Ch> {
    fn pending_count(&self) -> usize {
        self.trackers
            .values()
            .map(ConfirmationTracker::pending_count)
            .sum::<usize>()
            + self.orphans.len()
    }
}

enum Resubmit {
    Accepted,
    Settled,
    Deferred(PendingConfirmation),
}

struct Inner<C: BrokerConnection> {
    connection: C,
    config: PublisherConfig,
    state: Mutex<PublisherState<C::Channel>>,
    pending_tx: watch::Sender<usize>,
    cancel: watch::Receiver<bool>,
    handler: RwLock<Option<ConfirmationHandler>>,
    republishing: AtomicBool,
    explicit_waiting: AtomicBool,
    metrics: PublisherMetrics,
}

/// Publisher that tracks broker confirmations and republishes failures.
///
/// Cheap to clone; clones share channels, trackers and settings.
pub struct AssuredPublisher<C: BrokerConnection> {
    inner: Arc<Inner<C>>,
}

impl<C: BrokerConnection> Clone for AssuredPublisher<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: BrokerConnection> AssuredPublisher<C> {
    /// Create a publisher. No channel is opened until the first publish.
    ///
    /// `cancel` unblocks waiters when it turns `true`; it never stops the
    /// confirmation listeners.
    pub fn new(connection: C, config: PublisherConfig, cancel: watch::Receiver<bool>) -> Self {
        let (pending_tx, _) = watch::channel(0);
        let metrics = PublisherMetrics::new(config.name.clone());

        Self {
            inner: Arc::new(Inner {
                connection,
                config,
                state: Mutex::new(PublisherState {
                    current: None,
                    trackers: BTreeMap::new(),
                    orphans: Vec::new(),
                    replaying: false,
                    next_generation: 1,
                }),
                pending_tx,
                cancel,
                handler: RwLock::new(None),
                republishing: AtomicBool::new(true),
                explicit_waiting: AtomicBool::new(false),
                metrics,
            }),
        }
    }

    /// Return from `publish` as soon as the channel accepts the message
    pub fn set_explicit_waiting(&self) {
        self.inner.explicit_waiting.store(true, Ordering::SeqCst);
    }

    /// Report nacks and channel losses instead of republishing
    pub fn disable_republishing(&self) {
        self.inner.republishing.store(false, Ordering::SeqCst);
    }

    /// Install the confirmation observer.
    ///
    /// It runs while the publisher lock is held; it must be quick and must
    /// not call back into the publisher.
    pub fn set_confirmation_handler<F>(&self, handler: F)
    where
        F: Fn(&ConfirmationReport) + Send + Sync + 'static,
    {
        *self.inner.handler.write() = Some(Arc::new(handler));
    }

    /// Messages published and not yet resolved, those awaiting replay included
    pub fn pending_count(&self) -> usize {
        *self.inner.pending_tx.borrow()
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.inner.config
    }

    /// Publish and report success as a bool.
    ///
    /// In implicit mode (the default) this waits for the final outcome. In
    /// explicit mode it returns `true` once the channel accepted the message.
    pub async fn publish(
        &self,
        payload: impl Into<Bytes>,
        spec: impl Into<Arc<SubscriberSpec>>,
    ) -> bool {
        let spec = spec.into();
        match self.try_publish(payload, spec.clone()).await {
            Ok(_) => true,
            Err(err) => {
                warn!(
                    exchange = %spec.exchange,
                    routing_key = %spec.routing_key,
                    error = %err,
                    "Publish failed"
                );
                false
            }
        }
    }

    /// Publish and return the detailed result.
    ///
    /// A synchronous rejection leaves nothing tracked and is not retried.
    pub async fn try_publish(
        &self,
        payload: impl Into<Bytes>,
        spec: impl Into<Arc<SubscriberSpec>>,
    ) -> Result<Published, PublishError> {
        let payload = payload.into();
        let spec = spec.into();
        let inner = &self.inner;

        let (waiter, confirmed) = if inner.explicit_waiting.load(Ordering::SeqCst) {
            (None, None)
        } else {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        };

        let delivery_tag = {
            let mut state = inner.state.lock().await;
            let active = inner
                .ensure_channel(&mut state)
                .await
                .map_err(PublishError::Rejected)?;

            let sequence = match active
                .channel
                .publish(&spec.exchange, &spec.routing_key, payload.clone())
                .await
            {
                Ok(sequence) => sequence,
                Err(err) => {
                    inner.metrics.rejected(&spec.exchange);
                    return Err(PublishError::Rejected(err));
                }
            };

            let mut message = OutboundMessage::new(payload, spec.clone());
            message.attempts = 1;
            if let Some(waiter) = waiter {
                message = message.with_waiter(waiter);
            }

            inner.metrics.published(&spec.exchange);
            debug!(
                channel_id = active.channel.id(),
                sequence,
                exchange = %spec.exchange,
                routing_key = %spec.routing_key,
                "Published message"
            );

            inner
                .track(&mut state, &active, sequence, message)
                .map_err(|refused| PublishError::Tracker(refused.error))?;
            sequence
        };

        let Some(confirmed) = confirmed else {
            return Ok(Published {
                delivery_tag,
                confirmed: false,
            });
        };

        tokio::select! {
            biased;

            _ = cancelled(inner.cancel.clone()) => {
                debug!(sequence = delivery_tag, "Stopped waiting for confirmation");
                Err(PublishError::Cancelled)
            }
            outcome = confirmed => match outcome {
                Ok(ConfirmOutcome::Acked) => Ok(Published {
                    delivery_tag,
                    confirmed: true,
                }),
                Ok(outcome) => Err(PublishError::NotConfirmed(outcome)),
                Err(_) => Err(PublishError::NotConfirmed(ConfirmOutcome::Abandoned)),
            },
        }
    }

    /// Wait until nothing is pending.
    ///
    /// Returns `false` if the cancellation signal fires first.
    pub async fn wait_for_all_confirmations(&self) -> bool {
        let mut pending = self.inner.pending_tx.subscribe();

        tokio::select! {
            biased;

            _ = cancelled(self.inner.cancel.clone()) => {
                debug!(
                    pending = self.pending_count(),
                    "Cancelled while waiting for confirmations"
                );
                false
            }
            drained = async { pending.wait_for(|count| *count == 0).await.is_ok() } => drained,
        }
    }

    /// Close the current channel.
    ///
    /// Confirmations the broker already emitted are still processed; anything
    /// else pending on that channel is reported `Abandoned`. The next publish
    /// opens a new channel.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock().await;
        let Some(active) = state.current.take() else {
            return Ok(());
        };

        if let Some(tracker) = state.trackers.get_mut(&active.generation) {
            tracker.set_abandon_on_close();
        }

        info!(
            channel_id = active.channel.id(),
            generation = active.generation,
            "Closing publisher channel"
        );
        active.channel.close().await
    }

    /// The live channel, opened if needed. Useful for declaring topology.
    pub async fn channel(&self) -> Result<Arc<C::Channel>, BrokerError> {
        let mut state = self.inner.state.lock().await;
        let active = self.inner.ensure_channel(&mut state).await?;
        Ok(active.channel)
    }
}

impl<C: BrokerConnection> Inner<C> {
    fn republishing(&self) -> bool {
        self.republishing.load(Ordering::SeqCst)
    }

    async fn ensure_channel(
        self: &Arc<Self>,
        state: &mut PublisherState<C::Channel>,
    ) -> Result<ActiveChannel<C::Channel>, BrokerError> {
        if let Some(active) = &state.current {
            if active.channel.is_open() {
                return Ok(active.clone());
            }
        }

        if let Some(dead) = state.current.take() {
            // Its listener sweeps the tracker once the confirmation stream ends
            debug!(
                channel_id = dead.channel.id(),
                generation = dead.generation,
                "Replacing dead publisher channel"
            );
        }

        let channel = self.connection.open_channel().await?;
        let confirms = match channel.confirm_select().await {
            Ok(confirms) => confirms,
            Err(err) => {
                let _ = channel.close().await;
                return Err(err);
            }
        };

        let generation = state.next_generation;
        state.next_generation += 1;
        state.trackers.insert(generation, ConfirmationTracker::new());

        let active = ActiveChannel {
            channel: Arc::new(channel),
            generation,
        };
        state.current = Some(active.clone());

        self.metrics.channel_opened();
        info!(
            publisher = %self.config.name,
            channel_id = active.channel.id(),
            generation,
            "Opened publisher channel"
        );

        tokio::spawn(self.clone().listen(generation, confirms));
        Ok(active)
    }

    fn track(
        self: &Arc<Self>,
        state: &mut PublisherState<C::Channel>,
        active: &ActiveChannel<C::Channel>,
        sequence: u64,
        message: OutboundMessage,
    ) -> Result<(), Untracked> {
        let result = match state.trackers.get_mut(&active.generation) {
            Some(tracker) => tracker.record(sequence, message),
            None => {
                // Swept already; replay like any other leftover
                state.orphans.push(PendingConfirmation { sequence, message });
                self.schedule_replay(state);
                Ok(())
            }
        };

        if let Err(refused) = &result {
            error!(
                channel_id = active.channel.id(),
                sequence,
                error = %refused.error,
                "Tracker rejected sequence"
            );
        }

        self.refresh_pending(state);
        result
    }

    fn listen(
        self: Arc<Self>,
        generation: u64,
        mut confirms: ConfirmationStream,
    ) -> BoxFuture<'static, ()> {
        async move {
            while let Some(confirmation) = confirms.next().await {
                let mut state = self.state.lock().await;
                self.on_confirmation(&mut state, generation, confirmation)
                    .await;
            }

            let mut state = self.state.lock().await;
            self.on_channel_end(&mut state, generation);
        }
        .boxed()
    }

    async fn on_confirmation(
        self: &Arc<Self>,
        state: &mut PublisherState<C::Channel>,
        generation: u64,
        confirmation: Confirmation,
    ) {
        let Some(tracker) = state.trackers.get_mut(&generation) else {
            debug!(generation, "Confirmation for swept channel");
            return;
        };
        let abandoned = tracker.abandons_on_close();
        let entries = tracker.resolve(&confirmation);

        for entry in entries {
            if confirmation.ack {
                debug!(generation, sequence = entry.sequence, "Message acked");
                self.settle(entry, ConfirmOutcome::Acked);
            } else if abandoned {
                self.settle(entry, ConfirmOutcome::Abandoned);
            } else if !self.republishing() {
                warn!(generation, sequence = entry.sequence, "Message nacked");
                self.settle(entry, ConfirmOutcome::Nacked);
            } else {
                warn!(
                    generation,
                    sequence = entry.sequence,
                    attempts = entry.message.attempts,
                    "Message nacked, republishing"
                );
                if let Resubmit::Deferred(entry) = self.resubmit(state, entry, "nack").await {
                    state.orphans.push(entry);
                    self.schedule_replay(state);
                }
            }
        }

        self.refresh_pending(state);
    }

    fn on_channel_end(self: &Arc<Self>, state: &mut PublisherState<C::Channel>, generation: u64) {
        let Some(mut tracker) = state.trackers.remove(&generation) else {
            return;
        };
        if state
            .current
            .as_ref()
            .is_some_and(|active| active.generation == generation)
        {
            state.current = None;
        }

        let leftovers = tracker.drain();
        if leftovers.is_empty() {
            debug!(generation, "Publisher channel ended with nothing pending");
        } else if tracker.abandons_on_close() {
            info!(
                generation,
                count = leftovers.len(),
                "Abandoning unconfirmed messages of closed channel"
            );
            for entry in leftovers {
                self.settle(entry, ConfirmOutcome::Abandoned);
            }
        } else if !self.republishing() {
            warn!(
                generation,
                count = leftovers.len(),
                "Publisher channel lost with unconfirmed messages"
            );
            for entry in leftovers {
                self.settle(entry, ConfirmOutcome::ChannelLost);
            }
        } else {
            warn!(
                generation,
                count = leftovers.len(),
                "Publisher channel lost, replaying unconfirmed messages"
            );
            state.orphans.extend(leftovers);
            self.schedule_replay(state);
        }

        self.refresh_pending(state);
    }

    /// Publish a tracked entry again on the current channel.
    async fn resubmit(
        self: &Arc<Self>,
        state: &mut PublisherState<C::Channel>,
        entry: PendingConfirmation,
        reason: &'static str,
    ) -> Resubmit {
        if !self.republishing() {
            self.settle(entry, ConfirmOutcome::ChannelLost);
            return Resubmit::Settled;
        }
        if entry.message.attempts >= self.config.max_attempts {
            warn!(
                sequence = entry.sequence,
                attempts = entry.message.attempts,
                "Giving up on message"
            );
            self.settle(entry, ConfirmOutcome::RetriesExhausted);
            return Resubmit::Settled;
        }

        let active = match self.ensure_channel(state).await {
            Ok(active) => active,
            Err(err) => {
                warn!(error = %err, category = %err.category(), "Cannot open channel for republish");
                return Resubmit::Deferred(entry);
            }
        };

        let PendingConfirmation {
            sequence: previous,
            mut message,
        } = entry;
        message.attempts += 1;

        match active
            .channel
            .publish(
                &message.spec.exchange,
                &message.spec.routing_key,
                message.payload.clone(),
            )
            .await
        {
            Ok(sequence) => {
                self.metrics.republished(reason);
                debug!(
                    channel_id = active.channel.id(),
                    previous,
                    sequence,
                    attempts = message.attempts,
                    "Republished message"
                );
                match self.track(state, &active, sequence, message) {
                    Ok(()) => Resubmit::Accepted,
                    Err(refused) => {
                        self.report(refused.settle(ConfirmOutcome::Untracked));
                        Resubmit::Settled
                    }
                }
            }
            Err(err) => {
                warn!(
                    channel_id = active.channel.id(),
                    previous,
                    error = %err,
                    "Republish rejected"
                );
                Resubmit::Deferred(PendingConfirmation {
                    sequence: previous,
                    message,
                })
            }
        }
    }

    fn schedule_replay(self: &Arc<Self>, state: &mut PublisherState<C::Channel>) {
        if state.replaying {
            return;
        }
        state.replaying = true;
        tokio::spawn(self.clone().replay());
    }

    fn replay(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            let mut round = 0u32;

            loop {
                let delay = {
                    let mut state = self.state.lock().await;
                    let Some(fewest) = state.orphans.iter().map(|e| e.message.attempts).min()
                    else {
                        state.replaying = false;
                        return;
                    };
                    self.config
                        .backoff_for(round.max(fewest.saturating_sub(1)))
                };

                tokio::time::sleep(delay).await;

                let mut state = self.state.lock().await;
                let entries = std::mem::take(&mut state.orphans);
                let mut progressed = false;

                for entry in entries {
                    match self.resubmit(&mut state, entry, "channel_lost").await {
                        Resubmit::Deferred(entry) => state.orphans.push(entry),
                        Resubmit::Accepted | Resubmit::Settled => progressed = true,
                    }
                }

                self.refresh_pending(&state);
                round = if progressed { 0 } else { round.saturating_add(1) };
            }
        }
        .boxed()
    }

    fn settle(&self, entry: PendingConfirmation, outcome: ConfirmOutcome) {
        self.report(entry.settle(outcome));
    }

    fn report(&self, report: ConfirmationReport) {
        self.metrics.confirmed(report.outcome);

        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(&report);
        }
    }

    fn refresh_pending(&self, state: &PublisherState<C::Channel>) {
        let count = state.pending_count();
        self.pending_tx.send_replace(count);
        self.metrics.pending(count);
    }
}

/// Resolves once `cancel` turns true; never resolves if its sender is gone.
async fn cancelled(mut cancel: watch::Receiver<bool>) {
    let fired = cancel.wait_for(|cancelled| *cancelled).await.is_ok();
    if !fired {
        std::future::pending::<()>().await;
    }
}
