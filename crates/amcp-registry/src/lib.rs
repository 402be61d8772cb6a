#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **amcp-registry** – Capability directory for the AMCP mesh.
//!
//! The registry is the orchestrator's view of who can do what. It is driven
//! entirely by bus events: agents announce themselves on
//! `agent.register.**`, report liveness on `agent.heartbeat.**`, and leave
//! on `agent.unregister.**`. Discovery requests on `agent.discover.**` are
//! answered on the reply topic named in the request.
//!
//! Liveness: an agent that misses the stale window is marked stale; a
//! second consecutive miss removes its record.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use amcp_bus::{handler_fn, EventBus, SubscribeOptions, SubscriptionHandle};
use amcp_types::{
    well_known, AgentId, CapabilityRecord, CapabilityRegistration, Event, EventPayload, Heartbeat,
    TopicPattern,
};

/// Default interval between liveness sweeps.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default window after which a silent agent is considered stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(120);

/// Registry tunables.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Liveness sweep cadence.
    pub heartbeat_interval: Duration,
    /// Window after which a silent agent is marked stale.
    pub stale_after: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

/// A directory record plus its liveness bookkeeping.
#[derive(Debug, Clone)]
pub struct RegisteredAgent {
    /// The capability record.
    pub record: CapabilityRecord,
    /// Last heartbeat (or registration) timestamp.
    pub last_heartbeat: DateTime<Utc>,
    /// Status line from the last heartbeat.
    pub last_status: Option<String>,
    /// Whether the agent missed its last heartbeat window.
    pub stale: bool,
    /// Consecutive missed windows.
    pub missed_heartbeats: u32,
}

/// Directory of agents and their declared capabilities.
#[derive(Clone)]
pub struct CapabilityRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: RegistryConfig,
    /// Keyed by canonical agent id string.
    records: DashMap<String, RegisteredAgent>,
    shutdown: CancellationToken,
}

impl CapabilityRegistry {
    /// Create a registry and spawn its liveness sweeper.
    pub fn new(config: RegistryConfig) -> Self {
        let inner = Arc::new(RegistryInner {
            config,
            records: DashMap::new(),
            shutdown: CancellationToken::new(),
        });
        let sweeper = inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = sweeper.shutdown.cancelled() => break,
                    _ = ticker.tick() => sweeper.sweep_liveness(),
                }
            }
        });
        Self { inner }
    }

    /// Subscribe the registry to its bus topics. Returns the subscription
    /// handles so the caller can release them on shutdown.
    pub fn attach(&self, bus: Arc<dyn EventBus>) -> anyhow::Result<Vec<SubscriptionHandle>> {
        let mut handles = Vec::with_capacity(4);

        let registry = self.clone();
        handles.push(bus.subscribe(
            "capability-registry",
            TopicPattern::parse(well_known::AGENT_REGISTER_PATTERN)?,
            handler_fn(move |event| {
                let registry = registry.clone();
                async move { registry.on_register(event) }
            }),
            SubscribeOptions::default(),
        )?);

        let registry = self.clone();
        handles.push(bus.subscribe(
            "capability-registry",
            TopicPattern::parse(well_known::AGENT_UNREGISTER_PATTERN)?,
            handler_fn(move |event| {
                let registry = registry.clone();
                async move { registry.on_unregister(event) }
            }),
            SubscribeOptions::default(),
        )?);

        let registry = self.clone();
        handles.push(bus.subscribe(
            "capability-registry",
            TopicPattern::parse(well_known::AGENT_HEARTBEAT_PATTERN)?,
            handler_fn(move |event| {
                let registry = registry.clone();
                async move { registry.on_heartbeat(event) }
            }),
            SubscribeOptions::default(),
        )?);

        let registry = self.clone();
        let reply_bus = bus.clone();
        handles.push(bus.subscribe(
            "capability-registry",
            TopicPattern::parse(well_known::AGENT_DISCOVER_PATTERN)?,
            handler_fn(move |event| {
                let registry = registry.clone();
                let bus = reply_bus.clone();
                async move { registry.on_discover(event, bus).await }
            }),
            SubscribeOptions::default(),
        )?);

        info!("capability registry attached to bus");
        Ok(handles)
    }

    /// Insert (or replace) a record directly, bypassing the bus.
    pub fn register(&self, record: CapabilityRecord) {
        let key = record.agent_id.to_string();
        info!(
            agent = key.as_str(),
            agent_type = record.agent_type.as_str(),
            capabilities = record.capabilities.len(),
            "agent registered"
        );
        self.inner.records.insert(
            key,
            RegisteredAgent {
                record,
                last_heartbeat: Utc::now(),
                last_status: None,
                stale: false,
                missed_heartbeats: 0,
            },
        );
    }

    /// Remove an agent's record. Returns whether it existed.
    pub fn unregister(&self, agent_id: &str) -> bool {
        let removed = self.inner.records.remove(agent_id).is_some();
        if removed {
            info!(agent = agent_id, "agent unregistered");
        }
        removed
    }

    /// All records whose capability set contains a case-insensitive
    /// substring match for `capability`.
    pub fn find_by_capability(&self, capability: &str) -> Vec<CapabilityRecord> {
        self.inner
            .records
            .iter()
            .filter(|entry| entry.value().record.matches_capability(capability))
            .map(|entry| entry.value().record.clone())
            .collect()
    }

    /// Look up a record by agent display name or agent type
    /// (case-insensitive).
    pub fn find_by_name(&self, name: &str) -> Option<CapabilityRecord> {
        let name = name.to_lowercase();
        self.inner
            .records
            .iter()
            .find(|entry| {
                let record = &entry.value().record;
                record.agent_type.to_lowercase() == name
                    || record
                        .agent_id
                        .name()
                        .map(|n| n.to_lowercase() == name)
                        .unwrap_or(false)
            })
            .map(|entry| entry.value().record.clone())
    }

    /// All current records.
    pub fn list_all(&self) -> Vec<CapabilityRecord> {
        self.inner
            .records
            .iter()
            .map(|entry| entry.value().record.clone())
            .collect()
    }

    /// Liveness bookkeeping for one agent.
    pub fn liveness(&self, agent_id: &str) -> Option<RegisteredAgent> {
        self.inner.records.get(agent_id).map(|e| e.value().clone())
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }

    /// Record a heartbeat for an agent.
    pub fn record_heartbeat(&self, heartbeat: &Heartbeat) {
        if let Some(mut entry) = self.inner.records.get_mut(&heartbeat.agent_id) {
            let agent = entry.value_mut();
            agent.last_heartbeat = Utc::now();
            agent.last_status = Some(heartbeat.status.clone());
            agent.stale = false;
            agent.missed_heartbeats = 0;
        } else {
            debug!(agent = heartbeat.agent_id.as_str(), "heartbeat for unknown agent");
        }
    }

    /// Stop the liveness sweeper.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    fn on_register(&self, event: Event) -> anyhow::Result<()> {
        let registration: CapabilityRegistration = event.payload().decode()?;
        let agent_id = AgentId::from_str(&registration.agent_id)
            .unwrap_or_else(|_| event.sender().clone());
        self.register(CapabilityRecord::from_registration(registration, agent_id));
        Ok(())
    }

    fn on_unregister(&self, event: Event) -> anyhow::Result<()> {
        // Accept either a full registration body or a bare {"agentId": ...}.
        let agent_id = match event.payload().decode::<CapabilityRegistration>() {
            Ok(registration) => registration.agent_id,
            Err(_) => event.payload().to_value()["agentId"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| event.sender().to_string()),
        };
        self.unregister(&agent_id);
        Ok(())
    }

    fn on_heartbeat(&self, event: Event) -> anyhow::Result<()> {
        let heartbeat: Heartbeat = event.payload().decode()?;
        self.record_heartbeat(&heartbeat);
        Ok(())
    }

    /// Answer a discovery request on its reply topic.
    async fn on_discover(&self, event: Event, bus: Arc<dyn EventBus>) -> anyhow::Result<()> {
        let query = event.payload().to_value();
        let Some(reply_to) = query["replyTo"].as_str().map(str::to_string) else {
            debug!(event_id = event.id(), "discovery request without replyTo");
            return Ok(());
        };

        let records = match query["capability"].as_str() {
            Some(capability) => self.find_by_capability(capability),
            None => self.list_all(),
        };
        debug!(
            reply_to = reply_to.as_str(),
            matches = records.len(),
            "answering discovery request"
        );

        let mut reply = Event::new(
            reply_to,
            EventPayload::raw(json!({ "agents": records })),
            AgentId::system(),
        )?;
        if let Some(correlation_id) = event.correlation_id() {
            reply = reply.with_correlation_id(correlation_id);
        }
        bus.publish(reply).await?;
        Ok(())
    }
}

impl RegistryInner {
    /// Mark agents stale after one missed window; drop them after two.
    fn sweep_liveness(&self) {
        let now = Utc::now();
        let stale_after =
            chrono::Duration::from_std(self.config.stale_after).unwrap_or_default();
        let mut to_remove = Vec::new();

        for mut entry in self.records.iter_mut() {
            let agent = entry.value_mut();
            if now - agent.last_heartbeat < stale_after * (agent.missed_heartbeats as i32 + 1) {
                continue;
            }
            agent.missed_heartbeats += 1;
            if agent.stale {
                to_remove.push(entry.key().clone());
            } else {
                agent.stale = true;
                warn!(
                    agent = entry.key().as_str(),
                    "agent missed heartbeat window, marking stale"
                );
            }
        }

        for key in to_remove {
            self.records.remove(&key);
            warn!(agent = key.as_str(), "agent missed two heartbeat windows, unregistered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amcp_bus::InMemoryBus;
    use std::collections::BTreeSet;

    fn record(name: &str, capabilities: &[&str]) -> CapabilityRecord {
        CapabilityRecord {
            agent_id: AgentId::named(name).unwrap(),
            agent_type: format!("{name}-agent"),
            capabilities: capabilities.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            description: String::new(),
            endpoint: name.to_string(),
            registered_at: Utc::now(),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_find_by_capability_is_substring_and_case_insensitive() {
        let registry = CapabilityRegistry::new(RegistryConfig::default());
        registry.register(record("weather", &["weather.get", "weather.forecast"]));
        registry.register(record("stock", &["stock.quote"]));

        assert_eq!(registry.find_by_capability("WEATHER").len(), 1);
        assert_eq!(registry.find_by_capability("quote").len(), 1);
        assert_eq!(registry.find_by_capability("travel").len(), 0);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_find_by_name_matches_display_name_and_type() {
        let registry = CapabilityRegistry::new(RegistryConfig::default());
        registry.register(record("weather", &["weather.get"]));

        assert!(registry.find_by_name("weather").is_some());
        assert!(registry.find_by_name("Weather-Agent").is_some());
        assert!(registry.find_by_name("stock").is_none());
    }

    #[tokio::test]
    async fn test_bus_registration_and_heartbeat_flow() {
        let bus = Arc::new(InMemoryBus::started());
        let registry = CapabilityRegistry::new(RegistryConfig::default());
        registry.attach(bus.clone()).unwrap();

        let agent = AgentId::named("weather").unwrap();
        let registration = CapabilityRegistration {
            agent_id: agent.to_string(),
            agent_type: "WeatherAgent".to_string(),
            capabilities: vec!["weather.get".to_string()],
            description: "weather lookups".to_string(),
            endpoint: "weather".to_string(),
            metadata: Default::default(),
        };
        bus.publish(
            Event::new(
                format!("agent.register.{agent}"),
                EventPayload::CapabilityRegistration(registration),
                agent.clone(),
            )
            .unwrap(),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find_by_capability("weather.get").len(), 1);

        bus.publish(
            Event::new(
                format!("agent.heartbeat.{agent}"),
                EventPayload::Heartbeat(Heartbeat {
                    agent_id: agent.to_string(),
                    status: "busy".to_string(),
                    details: Default::default(),
                    timestamp: Utc::now(),
                }),
                agent.clone(),
            )
            .unwrap(),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let liveness = registry.liveness(&agent.to_string()).unwrap();
        assert_eq!(liveness.last_status.as_deref(), Some("busy"));
        assert!(!liveness.stale);

        bus.publish(
            Event::new(
                format!("agent.unregister.{agent}"),
                EventPayload::raw(json!({"agentId": agent.to_string()})),
                agent.clone(),
            )
            .unwrap(),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_two_missed_windows_unregister() {
        let registry = CapabilityRegistry::new(RegistryConfig {
            heartbeat_interval: Duration::from_millis(50),
            stale_after: Duration::from_millis(100),
        });
        registry.register(record("weather", &["weather.get"]));

        // First miss marks stale, second evicts.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_discovery_replies_on_requested_topic() {
        let bus = Arc::new(InMemoryBus::started());
        let registry = CapabilityRegistry::new(RegistryConfig::default());
        registry.attach(bus.clone()).unwrap();
        registry.register(record("weather", &["weather.get"]));

        let replies = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = replies.clone();
        bus.subscribe(
            "requester",
            TopicPattern::parse("reply.discovery").unwrap(),
            handler_fn(move |event| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(event);
                    Ok(())
                }
            }),
            SubscribeOptions::default(),
        )
        .unwrap();

        bus.publish(
            Event::new(
                "agent.discover.weather",
                EventPayload::raw(json!({"capability": "weather", "replyTo": "reply.discovery"})),
                AgentId::random(),
            )
            .unwrap()
            .with_correlation_id("d1"),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let replies = replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].correlation_id(), Some("d1"));
        let agents = &replies[0].payload().to_value()["agents"];
        assert_eq!(agents.as_array().unwrap().len(), 1);
    }
}
