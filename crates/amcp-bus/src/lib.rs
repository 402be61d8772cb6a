#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **amcp-bus** – Topic-based pub/sub event bus for the AMCP mesh.
//!
//! This crate provides the [`EventBus`] abstraction every mesh component
//! communicates through, plus the in-process [`InMemoryBus`] implementation.
//! Routing is hierarchical: subscriptions carry a [`TopicPattern`] and every
//! published event is enqueued for each subscription whose pattern matches
//! the event topic.
//!
//! Delivery semantics follow the event's [`DeliveryOptions`]:
//!
//! - `FireAndForget` / `AtMostOnce`: one attempt, failures are dropped.
//! - `AtLeastOnce` (default): handler failures are retried with exponential
//!   backoff; exhausted retries route the event to
//!   `sys.deadletter.{topic}`.
//! - `ExactlyOnce`: at-least-once plus a per-subscription deduplication
//!   window over recently seen event ids.
//!
//! Each subscription owns a bounded priority queue and a worker task.
//! Publishing blocks (up to the event's `timeout_millis`) when a matching
//! subscription's queue is full, then fails with [`BusError::Overloaded`].
//! Handler errors never escape into the bus; they are logged with the
//! event's correlation ids and handled per delivery mode.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use amcp_types::{well_known, Event, TopicError, TopicPattern};

mod delivery;
mod subscription;

pub use subscription::{SubscribeOptions, SubscriptionHandle};

use subscription::Subscription;

/// Default soft cap on a subscription's queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Default parallel handler invocations per unordered subscription.
pub const DEFAULT_SUBSCRIPTION_CONCURRENCY: usize = 16;

/// Default grace period for draining queues on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Errors surfaced by bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// `publish` was called before `start`.
    #[error("bus has not been started")]
    NotStarted,
    /// The bus is draining or stopped.
    #[error("bus is shut down")]
    ShutDown,
    /// A matching subscription's queue stayed full past the publish timeout.
    #[error("subscription {subscriber:?} overloaded, queue full past timeout")]
    Overloaded {
        /// Subscriber whose queue rejected the event.
        subscriber: String,
    },
    /// The subscription pattern failed validation.
    #[error(transparent)]
    InvalidPattern(#[from] TopicError),
    /// `unsubscribe` was handed a handle the bus does not know.
    #[error("unknown subscription {0}")]
    UnknownSubscription(u64),
}

/// Handler invoked for every event delivered to a subscription.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one delivered event.
    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Core event bus abstraction.
///
/// The in-process [`InMemoryBus`] is the baseline; the trait is the seam a
/// future distributed bus plugs into. All implementations must be
/// thread-safe. Publish failures surface through the returned future, never
/// as panics.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event to every subscription whose pattern matches the
    /// event topic. Resolves once the event is enqueued everywhere (or the
    /// delivery mode does not require it); blocks under backpressure up to
    /// the event's `timeout_millis`.
    async fn publish(&self, event: Event) -> Result<(), BusError>;

    /// Register a subscription. The bus exclusively owns the subscription
    /// record; the returned handle is a non-owning cancellation token.
    fn subscribe(
        &self,
        subscriber: &str,
        pattern: TopicPattern,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, BusError>;

    /// Cancel a subscription.
    fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), BusError>;

    /// Begin accepting publishes.
    fn start(&self) -> Result<(), BusError>;

    /// Stop accepting publishes, drain queues up to the configured grace
    /// period, then cancel remaining handlers and release subscriptions.
    async fn shutdown(&self) -> Result<(), BusError>;
}

/// Tunables for the in-memory bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Soft cap per subscription queue.
    pub queue_capacity: usize,
    /// Parallel handler invocations per unordered subscription.
    pub subscription_concurrency: usize,
    /// Whether exhausted retries route events to `sys.deadletter.{topic}`.
    pub deadletter_enabled: bool,
    /// Grace period for draining queues on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            subscription_concurrency: DEFAULT_SUBSCRIPTION_CONCURRENCY,
            deadletter_enabled: true,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_DRAINING: u8 = 2;
const STATE_STOPPED: u8 = 3;

pub(crate) struct BusInner {
    config: BusConfig,
    state: AtomicU8,
    subscriptions: DashMap<u64, Arc<Subscription>>,
    next_subscription_id: AtomicU64,
    /// Global publish sequence; breaks priority ties FIFO.
    sequence: AtomicU64,
}

impl BusInner {
    /// Enqueue `event` for every matching subscription. `internal` routing
    /// (dead-letters) is allowed while draining; external publishes are not.
    pub(crate) async fn route(&self, event: Event, internal: bool) -> Result<(), BusError> {
        match self.state.load(Ordering::Acquire) {
            STATE_CREATED => return Err(BusError::NotStarted),
            STATE_RUNNING => {}
            STATE_DRAINING if internal => {}
            _ => return Err(BusError::ShutDown),
        }

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let matching: Vec<Arc<Subscription>> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().pattern().matches(event.topic()))
            .map(|entry| entry.value().clone())
            .collect();

        if matching.is_empty() {
            debug!(topic = event.topic(), event_id = event.id(), "no matching subscriptions");
            return Ok(());
        }

        let publish_timeout = Duration::from_millis(event.delivery().timeout_millis);
        for subscription in matching {
            match timeout(publish_timeout, subscription.enqueue(event.clone(), seq)).await {
                Ok(Ok(())) => {}
                Ok(Err(_closed)) => {
                    // Subscription cancelled between snapshot and enqueue.
                    debug!(
                        subscriber = subscription.subscriber(),
                        "subscription closed during publish"
                    );
                }
                Err(_elapsed) => {
                    warn!(
                        subscriber = subscription.subscriber(),
                        topic = event.topic(),
                        "publish timed out against full subscription queue"
                    );
                    return Err(BusError::Overloaded {
                        subscriber: subscription.subscriber().to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub(crate) fn deadletter_enabled(&self) -> bool {
        self.config.deadletter_enabled
    }
}

/// In-process, topic-routed event bus.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<BusInner>,
}

impl InMemoryBus {
    /// Create a bus with the given configuration. The bus must be
    /// [`start`](EventBus::start)ed before it accepts publishes.
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                state: AtomicU8::new(STATE_CREATED),
                subscriptions: DashMap::new(),
                next_subscription_id: AtomicU64::new(1),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    /// Create and immediately start a bus with default configuration.
    pub fn started() -> Self {
        let bus = Self::new(BusConfig::default());
        // Cannot fail from the Created state.
        let _ = EventBus::start(&bus);
        bus
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, event: Event) -> Result<(), BusError> {
        self.inner.route(event, false).await
    }

    fn subscribe(
        &self,
        subscriber: &str,
        pattern: TopicPattern,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, BusError> {
        if self.inner.state.load(Ordering::Acquire) >= STATE_DRAINING {
            return Err(BusError::ShutDown);
        }
        let id = self.inner.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let subscription = Subscription::spawn(
            id,
            subscriber.to_string(),
            pattern.clone(),
            handler,
            options.resolve(&self.inner.config),
            Arc::downgrade(&self.inner),
        );
        self.inner.subscriptions.insert(id, subscription);
        debug!(subscriber, pattern = pattern.as_str(), id, "subscription registered");
        Ok(SubscriptionHandle::new(id, subscriber.to_string(), pattern))
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), BusError> {
        match self.inner.subscriptions.remove(&handle.id()) {
            Some((_, subscription)) => {
                subscription.cancel();
                debug!(id = handle.id(), "subscription cancelled");
                Ok(())
            }
            None => Err(BusError::UnknownSubscription(handle.id())),
        }
    }

    fn start(&self) -> Result<(), BusError> {
        match self.inner.state.compare_exchange(
            STATE_CREATED,
            STATE_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                info!("event bus started");
                Ok(())
            }
            Err(STATE_RUNNING) => Ok(()),
            Err(_) => Err(BusError::ShutDown),
        }
    }

    async fn shutdown(&self) -> Result<(), BusError> {
        let prior = self.inner.state.swap(STATE_DRAINING, Ordering::AcqRel);
        if prior >= STATE_DRAINING {
            return Ok(());
        }
        info!(grace_secs = self.inner.config.shutdown_grace.as_secs(), "event bus draining");

        let deadline = tokio::time::Instant::now() + self.inner.config.shutdown_grace;
        loop {
            let drained = self
                .inner
                .subscriptions
                .iter()
                .all(|entry| entry.value().is_drained());
            if drained {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("shutdown grace period elapsed with undelivered events");
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        for entry in self.inner.subscriptions.iter() {
            entry.value().cancel();
        }
        self.inner.subscriptions.clear();
        self.inner.state.store(STATE_STOPPED, Ordering::Release);
        info!("event bus stopped");
        Ok(())
    }
}

/// Build the dead-letter event for an undeliverable event.
pub(crate) fn deadletter_event(original: &Event, error: &str, attempts: u32) -> Option<Event> {
    if well_known::is_deadletter_topic(original.topic()) {
        return None;
    }
    let topic = well_known::deadletter_topic(original.topic());
    let mut event = Event::new(topic, original.payload().clone(), original.sender().clone())
        .ok()?
        .with_delivery(amcp_types::DeliveryOptions::fire_and_forget())
        .with_metadata("amcporiginaltopic", serde_json::json!(original.topic()))
        .with_metadata("amcporiginalid", serde_json::json!(original.id()))
        .with_metadata("amcperror", serde_json::json!(error))
        .with_metadata("amcpattempts", serde_json::json!(attempts));
    if let Some(correlation_id) = original.correlation_id() {
        event = event.with_correlation_id(correlation_id);
    }
    if let Some(trace_id) = original.trace_id() {
        event = event.with_trace_id(trace_id);
    }
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use amcp_types::{AgentId, EventPayload};
    use serde_json::json;

    fn event(topic: &str) -> Event {
        Event::new(topic, EventPayload::raw(json!({})), AgentId::system()).unwrap()
    }

    #[tokio::test]
    async fn publish_before_start_fails() {
        let bus = InMemoryBus::default();
        let err = bus.publish(event("a.b")).await.unwrap_err();
        assert!(matches!(err, BusError::NotStarted));
    }

    #[tokio::test]
    async fn publish_after_shutdown_fails_with_typed_error() {
        let bus = InMemoryBus::started();
        bus.shutdown().await.unwrap();
        let err = bus.publish(event("a.b")).await.unwrap_err();
        assert!(matches!(err, BusError::ShutDown));
    }

    #[tokio::test]
    async fn unsubscribe_unknown_handle_fails() {
        let bus = InMemoryBus::started();
        let handle = bus
            .subscribe(
                "a",
                TopicPattern::parse("x.*").unwrap(),
                handler_fn(|_| async { Ok(()) }),
                SubscribeOptions::default(),
            )
            .unwrap();
        bus.unsubscribe(&handle).unwrap();
        assert!(matches!(
            bus.unsubscribe(&handle),
            Err(BusError::UnknownSubscription(_))
        ));
    }

    #[test]
    fn deadletter_event_never_recurses() {
        let original = event("sys.deadletter.weather.request");
        assert!(deadletter_event(&original, "boom", 3).is_none());

        let original = event("weather.request").with_correlation_id("c1");
        let dl = deadletter_event(&original, "boom", 3).unwrap();
        assert_eq!(dl.topic(), "sys.deadletter.weather.request");
        assert_eq!(dl.correlation_id(), Some("c1"));
        assert_eq!(dl.metadata()["amcpattempts"], json!(3));
    }
}
