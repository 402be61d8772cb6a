//! Per-event delivery policy.

use serde::{Deserialize, Serialize};

/// Default publish/backpressure timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MILLIS: u64 = 30_000;

/// Default number of redelivery attempts after the first failure.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default event priority (mid-range of 1..=10).
pub const DEFAULT_PRIORITY: u8 = 5;

/// Lowest allowed priority.
pub const MIN_PRIORITY: u8 = 1;

/// Highest allowed priority.
pub const MAX_PRIORITY: u8 = 10;

/// Delivery guarantee requested by the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMode {
    /// Enqueue once; no retry, no acknowledgement.
    FireAndForget,
    /// Enqueue once; drop on handler failure.
    AtMostOnce,
    /// Retry on handler failure up to `max_retries`, then dead-letter.
    AtLeastOnce,
    /// [`AtLeastOnce`](Self::AtLeastOnce) semantics plus a per-subscription
    /// deduplication window over recently seen event ids (bounded to the
    /// last 10 000 ids with a 10 minute TTL). Duplicate redeliveries inside
    /// the window are suppressed; outside it this degrades to at-least-once.
    ExactlyOnce,
}

impl DeliveryMode {
    /// Whether handler failures are retried under this mode.
    pub fn retries_on_failure(self) -> bool {
        matches!(self, Self::AtLeastOnce | Self::ExactlyOnce)
    }

    /// Whether deliveries are deduplicated by event id.
    pub fn deduplicates(self) -> bool {
        matches!(self, Self::ExactlyOnce)
    }
}

/// Delivery options attached to every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOptions {
    /// Requested delivery guarantee.
    pub mode: DeliveryMode,
    /// Serialize handler invocations for this event's subscription.
    pub ordered: bool,
    /// Publish/backpressure timeout in milliseconds.
    pub timeout_millis: u64,
    /// Redelivery attempts after the first failure.
    pub max_retries: u32,
    /// Hint that the event should survive process restarts. The in-process
    /// bus ignores it; distributed implementations may not.
    pub persistent: bool,
    /// Dequeue priority, 1 (lowest) to 10 (highest).
    pub priority: u8,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::AtLeastOnce,
            ordered: false,
            timeout_millis: DEFAULT_TIMEOUT_MILLIS,
            max_retries: DEFAULT_MAX_RETRIES,
            persistent: false,
            priority: DEFAULT_PRIORITY,
        }
    }
}

impl DeliveryOptions {
    /// Options for one-way notifications nobody waits on.
    pub fn fire_and_forget() -> Self {
        Self {
            mode: DeliveryMode::FireAndForget,
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Clamp the priority into the valid 1..=10 range.
    pub fn clamped_priority(&self) -> u8 {
        self.priority.clamp(MIN_PRIORITY, MAX_PRIORITY)
    }

    /// Validate field ranges.
    pub fn validate(&self) -> Result<(), String> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(format!(
                "priority {} outside {}..={}",
                self.priority, MIN_PRIORITY, MAX_PRIORITY
            ));
        }
        if self.timeout_millis == 0 {
            return Err("timeoutMillis must be positive".to_string());
        }
        Ok(())
    }
}
