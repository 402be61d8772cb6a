//! Retry backoff and exactly-once deduplication.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use rand::Rng;

/// First-retry backoff.
pub(crate) const RETRY_BASE: Duration = Duration::from_millis(100);

/// Backoff ceiling.
pub(crate) const RETRY_CAP: Duration = Duration::from_secs(5);

/// Jitter applied to every backoff, as a fraction of the delay.
const JITTER_FRACTION: f64 = 0.2;

/// Ids remembered per subscription under exactly-once delivery.
pub(crate) const DEDUP_CAPACITY: usize = 10_000;

/// How long a remembered id suppresses duplicates.
pub(crate) const DEDUP_TTL: Duration = Duration::from_secs(600);

/// Exponential backoff with ±20 % jitter for redelivery `attempt` (1-based).
pub(crate) fn retry_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let raw_millis = (RETRY_BASE.as_millis() as u64).saturating_mul(1u64 << exponent);
    let capped = raw_millis.min(RETRY_CAP.as_millis() as u64);
    let jitter = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
    Duration::from_millis(((capped as f64) * jitter) as u64)
}

/// Bounded, TTL-expiring set of recently seen event ids.
pub(crate) struct DedupCache {
    capacity: usize,
    ttl: Duration,
    seen: HashMap<String, Instant>,
    order: VecDeque<String>,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEDUP_CAPACITY, DEDUP_TTL)
    }
}

impl DedupCache {
    pub(crate) fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `id`; returns true if it was already seen inside the TTL.
    pub(crate) fn observe(&mut self, id: &str) -> bool {
        let now = Instant::now();
        self.prune(now);
        if let Some(seen_at) = self.seen.get(id) {
            if now.duration_since(*seen_at) < self.ttl {
                return true;
            }
        }
        self.seen.insert(id.to_string(), now);
        self.order.push_back(id.to_string());
        while self.seen.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            } else {
                break;
            }
        }
        false
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.order.front() {
            match self.seen.get(front) {
                Some(seen_at) if now.duration_since(*seen_at) >= self.ttl => {
                    let id = self.order.pop_front().expect("front checked above");
                    self.seen.remove(&id);
                }
                // Entry refreshed or already evicted.
                None => {
                    self.order.pop_front();
                }
                _ => break,
            }
        }
    }
}
