//! Component health and performance metrics.
//!
//! The monitor tracks per-component health levels, per-agent heartbeat
//! ages, and tagged counters/gauges. Health degradations past the alert
//! threshold produce an [`Alert`] that is handed to every registered
//! handler and, when a bus is attached, published on
//! `sys.alert.{component}`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use amcp_bus::EventBus;
use amcp_types::{well_known, AgentId, Event, EventPayload};

/// Health level of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthLevel {
    /// Operating normally.
    Healthy,
    /// Operating with reduced capacity or elevated errors.
    Degraded,
    /// Not operating.
    Unhealthy,
    /// No data yet.
    Unknown,
}

/// Alert raised when a component crosses the alert threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    /// Component that degraded.
    pub component: String,
    /// New health level.
    pub level: HealthLevel,
    /// Human-readable explanation.
    pub message: String,
    /// When the alert fired.
    pub timestamp: DateTime<Utc>,
}

/// Pluggable alert sink.
pub trait AlertHandler: Send + Sync {
    /// Receive one alert.
    fn on_alert(&self, alert: &Alert);
}

impl<F> AlertHandler for F
where
    F: Fn(&Alert) + Send + Sync,
{
    fn on_alert(&self, alert: &Alert) {
        self(alert)
    }
}

#[derive(Debug, Clone)]
struct ComponentHealth {
    level: HealthLevel,
    detail: String,
    updated_at: DateTime<Utc>,
}

/// Metric identity: name plus sorted tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricKey {
    /// Metric name (dotted, e.g. `orchestrator.requests.total`).
    pub name: String,
    /// Sorted tag map.
    pub tags: BTreeMap<String, String>,
}

impl MetricKey {
    /// Key without tags.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Attach a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Tracks health levels, heartbeat ages, and numeric metrics.
pub struct HealthMonitor {
    components: DashMap<String, ComponentHealth>,
    heartbeats: DashMap<String, DateTime<Utc>>,
    counters: DashMap<MetricKey, u64>,
    gauges: DashMap<MetricKey, f64>,
    handlers: RwLock<Vec<Arc<dyn AlertHandler>>>,
    bus: RwLock<Option<Arc<dyn EventBus>>>,
    /// Alerts fire at this level or worse.
    alert_threshold: HealthLevel,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthLevel::Degraded)
    }
}

impl HealthMonitor {
    /// Create a monitor alerting at `alert_threshold` or worse.
    pub fn new(alert_threshold: HealthLevel) -> Self {
        Self {
            components: DashMap::new(),
            heartbeats: DashMap::new(),
            counters: DashMap::new(),
            gauges: DashMap::new(),
            handlers: RwLock::new(Vec::new()),
            bus: RwLock::new(None),
            alert_threshold,
        }
    }

    /// Publish alerts on `sys.alert.{component}` through this bus.
    pub async fn attach_bus(&self, bus: Arc<dyn EventBus>) {
        *self.bus.write().await = Some(bus);
    }

    /// Register an alert handler.
    pub async fn add_alert_handler(&self, handler: Arc<dyn AlertHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Record a component's health; threshold breaches raise an alert.
    pub async fn set_component_health(
        &self,
        component: impl Into<String>,
        level: HealthLevel,
        detail: impl Into<String>,
    ) {
        let component = component.into();
        let detail = detail.into();
        let previous = self.components.insert(
            component.clone(),
            ComponentHealth {
                level,
                detail: detail.clone(),
                updated_at: Utc::now(),
            },
        );

        let breached = matches!(level, HealthLevel::Degraded | HealthLevel::Unhealthy)
            && level >= self.alert_threshold;
        let changed = previous.map(|p| p.level != level).unwrap_or(true);
        if breached && changed {
            self.raise_alert(Alert {
                component,
                level,
                message: detail,
                timestamp: Utc::now(),
            })
            .await;
        }
    }

    /// Current health of a component.
    pub fn component_health(&self, component: &str) -> HealthLevel {
        self.components
            .get(component)
            .map(|entry| entry.level)
            .unwrap_or(HealthLevel::Unknown)
    }

    /// Worst health level across all components.
    pub fn overall_health(&self) -> HealthLevel {
        self.components
            .iter()
            .map(|entry| entry.value().level)
            .max()
            .unwrap_or(HealthLevel::Unknown)
    }

    /// Record an agent heartbeat observation.
    pub fn record_heartbeat(&self, agent_id: &str) {
        self.heartbeats.insert(agent_id.to_string(), Utc::now());
    }

    /// Seconds since the agent's last observed heartbeat.
    pub fn heartbeat_age_secs(&self, agent_id: &str) -> Option<i64> {
        self.heartbeats
            .get(agent_id)
            .map(|seen| (Utc::now() - *seen).num_seconds())
    }

    /// Increment a counter.
    pub fn increment(&self, key: MetricKey) {
        self.increment_by(key, 1);
    }

    /// Increment a counter by `delta`.
    pub fn increment_by(&self, key: MetricKey, delta: u64) {
        *self.counters.entry(key).or_insert(0) += delta;
    }

    /// Set a gauge.
    pub fn set_gauge(&self, key: MetricKey, value: f64) {
        self.gauges.insert(key, value);
    }

    /// Read a counter.
    pub fn counter(&self, key: &MetricKey) -> u64 {
        self.counters.get(key).map(|v| *v).unwrap_or(0)
    }

    /// Read a gauge.
    pub fn gauge(&self, key: &MetricKey) -> Option<f64> {
        self.gauges.get(key).map(|v| *v)
    }

    async fn raise_alert(&self, alert: Alert) {
        warn!(
            component = alert.component.as_str(),
            level = ?alert.level,
            message = alert.message.as_str(),
            "health alert"
        );
        for handler in self.handlers.read().await.iter() {
            handler.on_alert(&alert);
        }

        let bus = self.bus.read().await.clone();
        if let Some(bus) = bus {
            let topic = well_known::alert_topic(&alert.component);
            match Event::new(
                topic,
                EventPayload::raw(json!({
                    "component": alert.component,
                    "level": alert.level,
                    "message": alert.message,
                    "timestamp": alert.timestamp.to_rfc3339(),
                })),
                AgentId::system(),
            ) {
                Ok(event) => {
                    if let Err(e) = bus.publish(event).await {
                        debug!(error = %e, "failed to publish health alert");
                    }
                }
                Err(e) => debug!(error = %e, "failed to build health alert event"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_threshold_breach_raises_alert_once() {
        let monitor = HealthMonitor::default();
        let seen: Arc<Mutex<Vec<Alert>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        monitor
            .add_alert_handler(Arc::new(move |alert: &Alert| {
                sink.lock().unwrap().push(alert.clone());
            }))
            .await;

        monitor
            .set_component_health("bus", HealthLevel::Healthy, "ok")
            .await;
        monitor
            .set_component_health("bus", HealthLevel::Degraded, "queue backlog")
            .await;
        // Unchanged level must not re-alert.
        monitor
            .set_component_health("bus", HealthLevel::Degraded, "queue backlog")
            .await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].component, "bus");
        assert_eq!(seen[0].level, HealthLevel::Degraded);
    }

    #[tokio::test]
    async fn test_overall_health_is_worst_component() {
        let monitor = HealthMonitor::default();
        assert_eq!(monitor.overall_health(), HealthLevel::Unknown);

        monitor
            .set_component_health("bus", HealthLevel::Healthy, "ok")
            .await;
        monitor
            .set_component_health("llm", HealthLevel::Unhealthy, "endpoint down")
            .await;
        assert_eq!(monitor.overall_health(), HealthLevel::Unhealthy);
        assert_eq!(monitor.component_health("bus"), HealthLevel::Healthy);
        assert_eq!(monitor.component_health("nope"), HealthLevel::Unknown);
    }

    #[tokio::test]
    async fn test_counters_and_gauges_with_tags() {
        let monitor = HealthMonitor::default();
        let ok = MetricKey::named("tasks.total").with_tag("outcome", "success");
        let failed = MetricKey::named("tasks.total").with_tag("outcome", "failed");

        monitor.increment(ok.clone());
        monitor.increment(ok.clone());
        monitor.increment(failed.clone());
        monitor.set_gauge(MetricKey::named("queue.depth"), 42.0);

        assert_eq!(monitor.counter(&ok), 2);
        assert_eq!(monitor.counter(&failed), 1);
        assert_eq!(monitor.gauge(&MetricKey::named("queue.depth")), Some(42.0));
    }

    #[tokio::test]
    async fn test_heartbeat_ages() {
        let monitor = HealthMonitor::default();
        assert!(monitor.heartbeat_age_secs("a").is_none());
        monitor.record_heartbeat("a");
        assert!(monitor.heartbeat_age_secs("a").unwrap() <= 1);
    }
}
