#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **amcp-correlation** – Per-request correlation tracking for the AMCP mesh.
//!
//! Every logical request (and every task dispatched for it) gets a
//! [`CorrelationContext`] keyed by its correlation id. The tracker owns the
//! contexts, resolves the "fire a task and await its reply" pattern through
//! [`CorrelationTracker::await_result`], and runs a background sweeper that
//! times out expired contexts and evicts terminal ones after a retention
//! window.
//!
//! ## Race resolution
//!
//! A completion racing the timeout sweeper is resolved **first-writer-wins**:
//! the state moves out of `Pending` exactly once, under a single guarded
//! transition, and every later transition attempt is a no-op. A context that
//! completes a tick before the sweeper observes its expiry therefore resolves
//! `Completed`, consistently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default sweeper cadence.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(1_000);

/// Default retention of terminal contexts, to absorb late replies.
pub const DEFAULT_RETAIN: Duration = Duration::from_secs(60);

/// Errors surfaced by tracker operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CorrelationError {
    /// No context registered under the id.
    #[error("unknown correlation id {0:?}")]
    Unknown(String),
    /// A context with this id already exists.
    #[error("correlation id {0:?} already registered")]
    Duplicate(String),
    /// The context timed out before a result arrived.
    #[error("correlation {0:?} timed out")]
    TimedOut(String),
    /// The context was cancelled.
    #[error("correlation {0:?} cancelled")]
    Cancelled(String),
    /// The context failed.
    #[error("correlation {id:?} failed: {error}")]
    Failed {
        /// Correlation id.
        id: String,
        /// Failure description.
        error: String,
    },
    /// `await_result`'s own wait deadline expired before the context
    /// reached a terminal state.
    #[error("wait for correlation {0:?} expired")]
    WaitExpired(String),
}

/// Lifecycle of a correlation context. `Pending` transitions to exactly one
/// terminal state; later transition attempts are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorrelationState {
    /// Awaiting a result.
    Pending,
    /// A result arrived in time.
    Completed,
    /// The timeout expired first.
    TimedOut,
    /// An error was recorded.
    Failed,
    /// The request was cancelled.
    Cancelled,
}

impl CorrelationState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

#[derive(Debug, Clone)]
enum Terminal {
    Completed(Value),
    Failed(String),
    TimedOut,
    Cancelled,
}

impl Terminal {
    fn state(&self) -> CorrelationState {
        match self {
            Self::Completed(_) => CorrelationState::Completed,
            Self::Failed(_) => CorrelationState::Failed,
            Self::TimedOut => CorrelationState::TimedOut,
            Self::Cancelled => CorrelationState::Cancelled,
        }
    }
}

/// Immutable snapshot of a correlation context.
#[derive(Debug, Clone)]
pub struct CorrelationContext {
    /// Correlation id.
    pub correlation_id: String,
    /// Request category (e.g. `"orchestration"`, `"task"`).
    pub request_type: String,
    /// Context captured at creation.
    pub initial_context: HashMap<String, Value>,
    /// Timeout in seconds from creation.
    pub timeout_seconds: u64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Current state.
    pub state: CorrelationState,
    /// Result recorded on completion.
    pub result: Option<Value>,
    /// Error recorded on failure.
    pub error: Option<String>,
}

struct ContextEntry {
    correlation_id: String,
    request_type: String,
    initial_context: HashMap<String, Value>,
    timeout_seconds: u64,
    created_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    /// Guarded slot: `None` while pending, set exactly once.
    terminal: Mutex<Option<Terminal>>,
    /// Timestamp of the terminal transition, for retention.
    terminal_at: Mutex<Option<DateTime<Utc>>>,
    watch_tx: watch::Sender<Option<CorrelationState>>,
    cancel: CancellationToken,
}

impl ContextEntry {
    /// Single atomic transition out of `Pending`. Returns false if a
    /// terminal state was already recorded (first writer wins).
    fn transition(&self, terminal: Terminal) -> bool {
        let mut slot = self.terminal.lock().expect("terminal slot lock poisoned");
        if slot.is_some() {
            return false;
        }
        let state = terminal.state();
        *slot = Some(terminal);
        drop(slot);
        *self.terminal_at.lock().expect("terminal_at lock poisoned") = Some(Utc::now());
        let _ = self.watch_tx.send(Some(state));
        if matches!(state, CorrelationState::Cancelled | CorrelationState::TimedOut) {
            self.cancel.cancel();
        }
        true
    }

    fn state(&self) -> CorrelationState {
        self.terminal
            .lock()
            .expect("terminal slot lock poisoned")
            .as_ref()
            .map(Terminal::state)
            .unwrap_or(CorrelationState::Pending)
    }

    fn snapshot(&self) -> CorrelationContext {
        let slot = self.terminal.lock().expect("terminal slot lock poisoned");
        let (state, result, error) = match slot.as_ref() {
            None => (CorrelationState::Pending, None, None),
            Some(Terminal::Completed(value)) => {
                (CorrelationState::Completed, Some(value.clone()), None)
            }
            Some(Terminal::Failed(message)) => {
                (CorrelationState::Failed, None, Some(message.clone()))
            }
            Some(Terminal::TimedOut) => (CorrelationState::TimedOut, None, None),
            Some(Terminal::Cancelled) => (CorrelationState::Cancelled, None, None),
        };
        CorrelationContext {
            correlation_id: self.correlation_id.clone(),
            request_type: self.request_type.clone(),
            initial_context: self.initial_context.clone(),
            timeout_seconds: self.timeout_seconds,
            created_at: self.created_at,
            state,
            result,
            error,
        }
    }

    fn outcome(&self) -> Option<Result<Value, CorrelationError>> {
        let slot = self.terminal.lock().expect("terminal slot lock poisoned");
        slot.as_ref().map(|terminal| match terminal {
            Terminal::Completed(value) => Ok(value.clone()),
            Terminal::Failed(message) => Err(CorrelationError::Failed {
                id: self.correlation_id.clone(),
                error: message.clone(),
            }),
            Terminal::TimedOut => Err(CorrelationError::TimedOut(self.correlation_id.clone())),
            Terminal::Cancelled => Err(CorrelationError::Cancelled(self.correlation_id.clone())),
        })
    }
}

/// Tracker tunables.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Sweeper cadence.
    pub sweep_interval: Duration,
    /// Retention of terminal contexts before eviction.
    pub retain: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            retain: DEFAULT_RETAIN,
        }
    }
}

/// Owns every live correlation context and the timeout sweeper.
#[derive(Clone)]
pub struct CorrelationTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    config: TrackerConfig,
    contexts: DashMap<String, Arc<ContextEntry>>,
    shutdown: CancellationToken,
}

impl CorrelationTracker {
    /// Create a tracker and spawn its timeout sweeper.
    pub fn new(config: TrackerConfig) -> Self {
        let inner = Arc::new(TrackerInner {
            config,
            contexts: DashMap::new(),
            shutdown: CancellationToken::new(),
        });
        let sweeper = inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = sweeper.shutdown.cancelled() => break,
                    _ = ticker.tick() => sweeper.sweep(),
                }
            }
        });
        Self { inner }
    }

    /// Register a context with a fresh root cancellation token.
    pub fn create(
        &self,
        correlation_id: impl Into<String>,
        request_type: impl Into<String>,
        initial_context: HashMap<String, Value>,
        timeout_seconds: u64,
    ) -> Result<CorrelationContext, CorrelationError> {
        self.create_with_token(
            correlation_id,
            request_type,
            initial_context,
            timeout_seconds,
            CancellationToken::new(),
        )
    }

    /// Register a child context whose cancellation token is linked to the
    /// parent's: cancelling the parent cancels the child.
    pub fn create_child(
        &self,
        parent_id: &str,
        correlation_id: impl Into<String>,
        request_type: impl Into<String>,
        initial_context: HashMap<String, Value>,
        timeout_seconds: u64,
    ) -> Result<CorrelationContext, CorrelationError> {
        let parent = self
            .inner
            .contexts
            .get(parent_id)
            .ok_or_else(|| CorrelationError::Unknown(parent_id.to_string()))?;
        let token = parent.cancel.child_token();
        drop(parent);
        self.create_with_token(correlation_id, request_type, initial_context, timeout_seconds, token)
    }

    fn create_with_token(
        &self,
        correlation_id: impl Into<String>,
        request_type: impl Into<String>,
        initial_context: HashMap<String, Value>,
        timeout_seconds: u64,
        cancel: CancellationToken,
    ) -> Result<CorrelationContext, CorrelationError> {
        let correlation_id = correlation_id.into();
        let created_at = Utc::now();
        let (watch_tx, _) = watch::channel(None);
        let entry = Arc::new(ContextEntry {
            correlation_id: correlation_id.clone(),
            request_type: request_type.into(),
            initial_context,
            timeout_seconds,
            created_at,
            deadline: created_at + chrono::Duration::seconds(timeout_seconds as i64),
            terminal: Mutex::new(None),
            terminal_at: Mutex::new(None),
            watch_tx,
            cancel,
        });
        let snapshot = entry.snapshot();
        match self.inner.contexts.entry(correlation_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(CorrelationError::Duplicate(correlation_id))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry);
                debug!(correlation_id, timeout_seconds, "correlation registered");
                Ok(snapshot)
            }
        }
    }

    /// Record a successful result. Returns false if the context was already
    /// terminal (or unknown); the existing outcome is untouched.
    pub fn complete(&self, correlation_id: &str, result: Value) -> bool {
        self.transition(correlation_id, Terminal::Completed(result))
    }

    /// Record a failure.
    pub fn fail(&self, correlation_id: &str, error: impl Into<String>) -> bool {
        self.transition(correlation_id, Terminal::Failed(error.into()))
    }

    /// Cancel the context and its cancellation token (and thereby every
    /// child token).
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.transition(correlation_id, Terminal::Cancelled)
    }

    fn transition(&self, correlation_id: &str, terminal: Terminal) -> bool {
        match self.inner.contexts.get(correlation_id) {
            Some(entry) => {
                let applied = entry.transition(terminal);
                if !applied {
                    debug!(correlation_id, "ignoring transition on terminal correlation");
                }
                applied
            }
            None => {
                warn!(correlation_id, "transition on unknown correlation");
                false
            }
        }
    }

    /// Snapshot a context.
    pub fn get(&self, correlation_id: &str) -> Option<CorrelationContext> {
        self.inner
            .contexts
            .get(correlation_id)
            .map(|entry| entry.snapshot())
    }

    /// Number of contexts still pending.
    pub fn active_count(&self) -> usize {
        self.inner
            .contexts
            .iter()
            .filter(|entry| entry.value().state() == CorrelationState::Pending)
            .count()
    }

    /// Cancellation token bound to a context, for aborting in-flight work.
    pub fn cancellation_token(&self, correlation_id: &str) -> Option<CancellationToken> {
        self.inner
            .contexts
            .get(correlation_id)
            .map(|entry| entry.cancel.clone())
    }

    /// Await the context's terminal state, up to `wait`.
    ///
    /// Resolves with the recorded result, or with the corresponding
    /// [`CorrelationError`] if the context failed, timed out, or was
    /// cancelled. If `wait` elapses first, returns
    /// [`CorrelationError::WaitExpired`] without touching the context.
    pub async fn await_result(
        &self,
        correlation_id: &str,
        wait: Duration,
    ) -> Result<Value, CorrelationError> {
        let entry = self
            .inner
            .contexts
            .get(correlation_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| CorrelationError::Unknown(correlation_id.to_string()))?;

        if let Some(outcome) = entry.outcome() {
            return outcome;
        }

        let mut rx = entry.watch_tx.subscribe();
        let wait_result = tokio::time::timeout(wait, async {
            loop {
                if rx.borrow_and_update().is_some() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;

        match wait_result {
            Ok(()) => entry
                .outcome()
                .unwrap_or_else(|| Err(CorrelationError::Unknown(correlation_id.to_string()))),
            Err(_) => Err(CorrelationError::WaitExpired(correlation_id.to_string())),
        }
    }

    /// Stop the sweeper. Contexts remain queryable.
    pub fn shutdown(&self) {
        info!("correlation tracker shutting down");
        self.inner.shutdown.cancel();
    }
}

impl TrackerInner {
    /// One sweeper pass: time out expired pending contexts, evict terminal
    /// contexts past retention.
    fn sweep(&self) {
        let now = Utc::now();
        let mut expired = Vec::new();
        let mut evict = Vec::new();

        for entry in self.contexts.iter() {
            let ctx = entry.value();
            match ctx.state() {
                CorrelationState::Pending => {
                    if now >= ctx.deadline {
                        expired.push(ctx.clone());
                    }
                }
                _ => {
                    let terminal_at = ctx
                        .terminal_at
                        .lock()
                        .expect("terminal_at lock poisoned")
                        .unwrap_or(now);
                    let retain =
                        chrono::Duration::from_std(self.config.retain).unwrap_or_default();
                    if now - terminal_at >= retain {
                        evict.push(ctx.correlation_id.clone());
                    }
                }
            }
        }

        for ctx in expired {
            // First-writer-wins: a completion that landed since the scan
            // makes this a no-op.
            if ctx.transition(Terminal::TimedOut) {
                warn!(
                    correlation_id = ctx.correlation_id.as_str(),
                    timeout_seconds = ctx.timeout_seconds,
                    "correlation timed out"
                );
            }
        }
        for correlation_id in evict {
            self.contexts.remove(&correlation_id);
            debug!(correlation_id, "terminal correlation evicted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracker() -> CorrelationTracker {
        CorrelationTracker::new(TrackerConfig {
            sweep_interval: Duration::from_millis(100),
            retain: Duration::from_secs(60),
        })
    }

    #[tokio::test]
    async fn test_pending_context_times_out() {
        let tracker = tracker();
        tracker.create("c1", "test", HashMap::new(), 1).unwrap();
        assert_eq!(tracker.active_count(), 1);

        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let ctx = tracker.get("c1").unwrap();
        assert_eq!(ctx.state, CorrelationState::TimedOut);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn test_completion_records_result() {
        let tracker = tracker();
        tracker.create("c2", "test", HashMap::new(), 10).unwrap();
        assert!(tracker.complete("c2", json!({"ok": true})));

        let ctx = tracker.get("c2").unwrap();
        assert_eq!(ctx.state, CorrelationState::Completed);
        assert_eq!(ctx.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_terminal_transition_happens_once() {
        let tracker = tracker();
        tracker.create("c3", "test", HashMap::new(), 10).unwrap();

        assert!(tracker.complete("c3", json!(1)));
        assert!(!tracker.fail("c3", "too late"));
        assert!(!tracker.cancel("c3"));

        let ctx = tracker.get("c3").unwrap();
        assert_eq!(ctx.state, CorrelationState::Completed);
        assert_eq!(ctx.result, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_await_result_resolves_on_completion() {
        let tracker = tracker();
        tracker.create("c4", "test", HashMap::new(), 10).unwrap();

        let waiter = tracker.clone();
        let task = tokio::spawn(async move {
            waiter.await_result("c4", Duration::from_secs(2)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracker.complete("c4", json!("done"));

        assert_eq!(task.await.unwrap().unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_await_result_sees_timeout() {
        let tracker = tracker();
        tracker.create("c5", "test", HashMap::new(), 1).unwrap();

        let result = tracker.await_result("c5", Duration::from_secs(3)).await;
        assert_eq!(result, Err(CorrelationError::TimedOut("c5".to_string())));
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let tracker = tracker();
        tracker.create("c6", "test", HashMap::new(), 10).unwrap();
        assert_eq!(
            tracker
                .create("c6", "test", HashMap::new(), 10)
                .unwrap_err(),
            CorrelationError::Duplicate("c6".to_string())
        );
        // The original registration is untouched.
        assert_eq!(tracker.active_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelling_parent_cancels_child_token() {
        let tracker = tracker();
        tracker.create("root", "request", HashMap::new(), 30).unwrap();
        tracker
            .create_child("root", "root.t1", "task", HashMap::new(), 15)
            .unwrap();

        let child_token = tracker.cancellation_token("root.t1").unwrap();
        assert!(!child_token.is_cancelled());

        tracker.cancel("root");
        assert!(child_token.is_cancelled());
    }

    #[tokio::test]
    async fn test_terminal_contexts_are_evicted_after_retention() {
        let tracker = CorrelationTracker::new(TrackerConfig {
            sweep_interval: Duration::from_millis(50),
            retain: Duration::from_millis(100),
        });
        tracker.create("c7", "test", HashMap::new(), 10).unwrap();
        tracker.complete("c7", json!(null));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(tracker.get("c7").is_none());
    }
}
