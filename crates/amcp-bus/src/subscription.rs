//! Subscription records and their worker tasks.
//!
//! The bus exclusively owns every [`Subscription`]; subscribers only keep a
//! [`SubscriptionHandle`] for cancellation. Each subscription runs one
//! worker task that dequeues by priority (FIFO within a priority) and
//! delivers per the event's delivery mode.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{AcquireError, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use amcp_types::{Event, TopicPattern};

use crate::delivery::{retry_backoff, DedupCache};
use crate::{deadletter_event, BusConfig, BusInner, EventHandler};

/// Per-subscription options. `None` fields fall back to the bus defaults.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Serialize handler invocations in publish order. An ordered
    /// subscription dequeues strictly FIFO; event priority is ignored.
    pub ordered: bool,
    /// Override the bus-wide parallelism bound for this subscription.
    pub concurrency: Option<usize>,
    /// Override the bus-wide queue capacity for this subscription.
    pub queue_capacity: Option<usize>,
}

impl SubscribeOptions {
    /// Options for an ordered (strict FIFO) subscription.
    pub fn ordered() -> Self {
        Self {
            ordered: true,
            ..Self::default()
        }
    }

    pub(crate) fn resolve(&self, config: &BusConfig) -> ResolvedOptions {
        ResolvedOptions {
            ordered: self.ordered,
            concurrency: self
                .concurrency
                .unwrap_or(config.subscription_concurrency)
                .max(1),
            queue_capacity: self.queue_capacity.unwrap_or(config.queue_capacity).max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
    pub ordered: bool,
    pub concurrency: usize,
    pub queue_capacity: usize,
}

/// Non-owning cancellation handle returned by `subscribe`.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: u64,
    subscriber: String,
    pattern: TopicPattern,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: u64, subscriber: String, pattern: TopicPattern) -> Self {
        Self {
            id,
            subscriber,
            pattern,
        }
    }

    /// Bus-internal subscription id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Subscriber this handle belongs to.
    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    /// Pattern the subscription routes on.
    pub fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }
}

struct QueuedEvent {
    event: Event,
    seq: u64,
    effective_priority: u8,
    /// Capacity permit released when the event is dequeued.
    _permit: OwnedSemaphorePermit,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    // Max-heap: higher priority pops first, FIFO (lower seq) within a
    // priority.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.effective_priority
            .cmp(&other.effective_priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct Subscription {
    id: u64,
    subscriber: String,
    pattern: TopicPattern,
    handler: Arc<dyn EventHandler>,
    options: ResolvedOptions,
    queue: Mutex<BinaryHeap<QueuedEvent>>,
    capacity: Arc<Semaphore>,
    concurrency: Arc<Semaphore>,
    dedup: Mutex<DedupCache>,
    notify: Notify,
    cancel: CancellationToken,
    in_flight: AtomicUsize,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Create the subscription and spawn its worker task.
    pub(crate) fn spawn(
        id: u64,
        subscriber: String,
        pattern: TopicPattern,
        handler: Arc<dyn EventHandler>,
        options: ResolvedOptions,
        bus: Weak<BusInner>,
    ) -> Arc<Self> {
        let subscription = Arc::new(Self {
            id,
            subscriber,
            pattern,
            handler,
            capacity: Arc::new(Semaphore::new(options.queue_capacity)),
            concurrency: Arc::new(Semaphore::new(options.concurrency)),
            options,
            queue: Mutex::new(BinaryHeap::new()),
            dedup: Mutex::new(DedupCache::default()),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            in_flight: AtomicUsize::new(0),
            bus,
        });
        let worker = subscription.clone();
        tokio::spawn(async move { worker.run().await });
        subscription
    }

    pub(crate) fn subscriber(&self) -> &str {
        &self.subscriber
    }

    pub(crate) fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }

    /// Block until queue space is available, then enqueue.
    pub(crate) async fn enqueue(&self, event: Event, seq: u64) -> Result<(), AcquireError> {
        let permit = self.capacity.clone().acquire_owned().await?;
        let effective_priority = if self.options.ordered {
            // Strict FIFO: collapse priorities so seq alone orders the heap.
            0
        } else {
            event.delivery().clamped_priority()
        };
        self.queue
            .lock()
            .expect("subscription queue lock poisoned")
            .push(QueuedEvent {
                event,
                seq,
                effective_priority,
                _permit: permit,
            });
        self.notify.notify_one();
        Ok(())
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
        self.capacity.close();
    }

    /// Queue empty and no handler running.
    pub(crate) fn is_drained(&self) -> bool {
        let queue_empty = self
            .queue
            .lock()
            .expect("subscription queue lock poisoned")
            .is_empty();
        queue_empty && self.in_flight.load(Ordering::Acquire) == 0
    }

    fn pop(&self) -> Option<QueuedEvent> {
        self.queue
            .lock()
            .expect("subscription queue lock poisoned")
            .pop()
    }

    async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.notify.notified() => {}
            }
            while let Some(queued) = self.pop() {
                if self.cancel.is_cancelled() {
                    return;
                }
                let event = queued.event;
                drop(queued._permit);

                if event.delivery().mode.deduplicates() {
                    let duplicate = self
                        .dedup
                        .lock()
                        .expect("dedup lock poisoned")
                        .observe(event.id());
                    if duplicate {
                        debug!(
                            subscriber = self.subscriber.as_str(),
                            event_id = event.id(),
                            "suppressing duplicate delivery"
                        );
                        continue;
                    }
                }

                self.in_flight.fetch_add(1, Ordering::AcqRel);
                let serialize = self.options.ordered || event.delivery().ordered;
                if serialize {
                    self.clone().deliver(event).await;
                } else {
                    let permit = match self.concurrency.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    let subscription = self.clone();
                    tokio::spawn(async move {
                        let cancelled = subscription.cancel.clone();
                        tokio::select! {
                            _ = cancelled.cancelled() => {
                                subscription.in_flight.fetch_sub(1, Ordering::AcqRel);
                            }
                            _ = subscription.clone().deliver(event) => {}
                        }
                        drop(permit);
                    });
                }
            }
        }
    }

    /// Invoke the handler, applying the event's retry policy; exhausted
    /// retries route to the dead-letter topic. Decrements `in_flight` on
    /// completion.
    async fn deliver(self: Arc<Self>, event: Event) {
        let mode = event.delivery().mode;
        let max_attempts = if mode.retries_on_failure() {
            event.delivery().max_retries.saturating_add(1)
        } else {
            1
        };

        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match self.handler.handle(event.clone()).await {
                Ok(()) => {
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
                Err(e) => {
                    last_error = format!("{e:#}");
                    warn!(
                        subscriber = self.subscriber.as_str(),
                        subscription = self.id,
                        topic = event.topic(),
                        event_id = event.id(),
                        correlation_id = event.correlation_id().unwrap_or(""),
                        trace_id = event.trace_id().unwrap_or(""),
                        attempt,
                        max_attempts,
                        error = last_error.as_str(),
                        "event handler failed"
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(retry_backoff(attempt)).await;
                    }
                }
            }
        }

        if mode.retries_on_failure() {
            self.route_to_deadletter(&event, &last_error, max_attempts).await;
        }
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    async fn route_to_deadletter(&self, event: &Event, error: &str, attempts: u32) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        if !bus.deadletter_enabled() {
            return;
        }
        let Some(deadletter) = deadletter_event(event, error, attempts) else {
            return;
        };
        error!(
            topic = event.topic(),
            event_id = event.id(),
            correlation_id = event.correlation_id().unwrap_or(""),
            attempts,
            "delivery exhausted retries, routing to dead-letter topic"
        );
        if let Err(e) = bus.route(deadletter, true).await {
            error!(error = %e, "failed to publish dead-letter event");
        }
    }
}
