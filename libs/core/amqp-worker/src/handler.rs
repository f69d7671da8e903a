//! Delivery handler trait for subscriber loops.

use crate::delivery::Delivery;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;

/// What a subscriber loop does with a delivery after the handler ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Acknowledge the delivery
    Accept,
    /// Negatively acknowledge and requeue it
    Reject,
}

impl HandlerOutcome {
    pub fn is_accept(&self) -> bool {
        matches!(self, HandlerOutcome::Accept)
    }
}

impl From<bool> for HandlerOutcome {
    fn from(accepted: bool) -> Self {
        if accepted {
            HandlerOutcome::Accept
        } else {
            HandlerOutcome::Reject
        }
    }
}

/// Delivery handler trait.
///
/// Implement this to process messages from a subscribed queue. The same
/// handler instance is shared by every consumer loop of its spec, so it runs
/// concurrently when the spec's concurrency is above 1.
///
/// A panic inside `handle` is contained by the loop and the delivery is
/// requeued.
///
/// # Example
///
/// ```rust,ignore
/// use amqp_worker::{Delivery, DeliveryHandler, HandlerOutcome};
/// use async_trait::async_trait;
///
/// struct OrderHandler {
///     store: Arc<OrderStore>,
/// }
///
/// #[async_trait]
/// impl DeliveryHandler for OrderHandler {
///     async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
///         match delivery.json::<Order>() {
///             Ok(order) => self.store.save(order).await.is_ok().into(),
///             Err(_) => HandlerOutcome::Reject,
///         }
///     }
///
///     fn name(&self) -> &'static str {
///         "order_handler"
///     }
/// }
/// ```
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Process one delivery.
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome;

    /// Handler name, used for logging and metrics labels.
    fn name(&self) -> &'static str {
        "delivery_handler"
    }
}

/// Adapter turning an async closure into a `DeliveryHandler`
pub struct HandlerFn<F, Fut> {
    name: &'static str,
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as a named handler.
///
/// The closure receives an owned `Delivery` so the returned future does not
/// borrow from the loop.
pub fn handler_fn<F, Fut>(name: &'static str, f: F) -> HandlerFn<F, Fut>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send,
{
    HandlerFn {
        name,
        f,
        _future: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> DeliveryHandler for HandlerFn<F, Fut>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send,
{
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        (self.f)(delivery.clone()).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Accepts everything.
#[derive(Debug, Clone, Default)]
pub struct AcceptAll;

#[async_trait]
impl DeliveryHandler for AcceptAll {
    async fn handle(&self, _delivery: &Delivery) -> HandlerOutcome {
        HandlerOutcome::Accept
    }

    fn name(&self) -> &'static str {
        "accept_all"
    }
}
