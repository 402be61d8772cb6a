#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **amcp-runtime** – Agent runtime for the AMCP mesh.
//!
//! The [`AgentContext`] exclusively owns every registered agent: it routes
//! matching bus events into [`Agent::handle_event`], enforces the lifecycle
//! state machine, answers control-topic commands, and tears agents down on
//! shutdown. Agents hold only a non-owning handle back to the runtime.
//!
//! Event dispatch is gated on lifecycle state: an agent that is not
//! `Active` silently discards events (no error). Registration,
//! unregistration, and state transitions are serialized per agent id;
//! lifecycle callbacks are invoked outside the state lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use amcp_bus::{handler_fn, BusError, EventBus, SubscribeOptions, SubscriptionHandle};
use amcp_types::{
    Agent, AgentId, AgentLifecycle, AgentStatus, ControlCommand, Event, EventPayload,
    LifecycleError, TopicError, TopicPattern,
};

mod mobility;

pub use mobility::{MobilityManager, NoopMobility};

/// Errors surfaced by runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// An agent with the same id is already registered.
    #[error("agent {0} already registered")]
    DuplicateAgent(String),
    /// No agent registered under the id.
    #[error("unknown agent {0}")]
    UnknownAgent(String),
    /// The requested lifecycle transition is illegal.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// Bus operation failed.
    #[error(transparent)]
    Bus(#[from] BusError),
    /// Invalid topic or pattern.
    #[error(transparent)]
    Topic(#[from] TopicError),
    /// The strong-mobility operation is not supported by this runtime.
    #[error("mobility operation {0:?} is not supported by this runtime")]
    MobilityUnsupported(&'static str),
    /// The runtime is shutting down; no further registrations or publishes.
    #[error("runtime is shutting down")]
    ShuttingDown,
    /// An agent callback failed.
    #[error("agent callback failed: {0}")]
    Callback(String),
}

struct AgentEntry {
    agent: Arc<dyn Agent>,
    state: Mutex<AgentLifecycle>,
    /// Serializes registration, unregistration, and transitions per agent.
    serial: tokio::sync::Mutex<()>,
    /// Live subscriptions keyed by pattern string.
    subscriptions: Mutex<HashMap<String, SubscriptionHandle>>,
}

impl AgentEntry {
    fn state(&self) -> AgentLifecycle {
        *self.state.lock().expect("agent state lock poisoned")
    }
}

struct ContextInner {
    bus: Arc<dyn EventBus>,
    agents: DashMap<String, Arc<AgentEntry>>,
    mobility: Arc<dyn MobilityManager>,
    shutting_down: AtomicBool,
}

/// The agent runtime.
///
/// Cloning is cheap; all clones share the same runtime state.
#[derive(Clone)]
pub struct AgentContext {
    inner: Arc<ContextInner>,
}

impl AgentContext {
    /// Create a runtime over the given bus with the no-op mobility manager.
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self::with_mobility(bus, Arc::new(NoopMobility))
    }

    /// Create a runtime with a custom mobility manager.
    pub fn with_mobility(bus: Arc<dyn EventBus>, mobility: Arc<dyn MobilityManager>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                bus,
                agents: DashMap::new(),
                mobility,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// The bus this runtime routes through.
    pub fn bus(&self) -> Arc<dyn EventBus> {
        self.inner.bus.clone()
    }

    /// The mobility manager (no-op in the core).
    pub fn mobility(&self) -> Arc<dyn MobilityManager> {
        self.inner.mobility.clone()
    }

    /// Create the non-owning handle an agent uses to reach the runtime.
    pub fn handle_for(&self, agent_id: &AgentId) -> RuntimeHandle {
        RuntimeHandle {
            context: Arc::downgrade(&self.inner),
            agent_id: agent_id.clone(),
        }
    }

    /// Register an agent in state `Inactive` and auto-subscribe it to its
    /// control topic. Fails on duplicate ids without touching the existing
    /// registration.
    pub fn register_agent(&self, agent: Arc<dyn Agent>) -> Result<(), RuntimeError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(RuntimeError::ShuttingDown);
        }
        let agent_id = agent.id().clone();
        let key = agent_id.to_string();

        let entry = Arc::new(AgentEntry {
            agent,
            state: Mutex::new(AgentLifecycle::Inactive),
            serial: tokio::sync::Mutex::new(()),
            subscriptions: Mutex::new(HashMap::new()),
        });

        match self.inner.agents.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RuntimeError::DuplicateAgent(key));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }

        // Control commands are handled by the runtime itself, so they work
        // in every lifecycle state.
        let control_pattern = TopicPattern::parse(&agent_id.control_topic())?;
        let runtime = self.clone();
        let control_agent = agent_id.clone();
        let handle = self.inner.bus.subscribe(
            &key,
            control_pattern,
            handler_fn(move |event| {
                let runtime = runtime.clone();
                let agent_id = control_agent.clone();
                async move { runtime.handle_control(&agent_id, event).await }
            }),
            SubscribeOptions::ordered(),
        )?;
        if let Some(entry) = self.inner.agents.get(&key) {
            entry
                .subscriptions
                .lock()
                .expect("subscriptions lock poisoned")
                .insert(agent_id.control_topic(), handle);
        }

        info!(agent = key.as_str(), "agent registered");
        Ok(())
    }

    /// Remove an agent and release all of its subscriptions.
    pub async fn unregister_agent(&self, agent_id: &AgentId) -> Result<(), RuntimeError> {
        let key = agent_id.to_string();
        let entry = self
            .inner
            .agents
            .get(&key)
            .map(|e| e.value().clone())
            .ok_or_else(|| RuntimeError::UnknownAgent(key.clone()))?;

        let _serial = entry.serial.lock().await;
        let handles: Vec<SubscriptionHandle> = {
            let mut subscriptions = entry
                .subscriptions
                .lock()
                .expect("subscriptions lock poisoned");
            subscriptions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            if let Err(e) = self.inner.bus.unsubscribe(&handle) {
                debug!(agent = key.as_str(), error = %e, "subscription already released");
            }
        }
        self.inner.agents.remove(&key);
        info!(agent = key.as_str(), "agent unregistered");
        Ok(())
    }

    /// Transition an agent to `Active` and run `on_activate`.
    pub async fn activate_agent(&self, agent_id: &AgentId) -> Result<(), RuntimeError> {
        self.set_lifecycle_state(agent_id, AgentLifecycle::Active).await
    }

    /// Transition an agent to `Inactive` and run `on_deactivate`.
    pub async fn deactivate_agent(&self, agent_id: &AgentId) -> Result<(), RuntimeError> {
        self.set_lifecycle_state(agent_id, AgentLifecycle::Inactive).await
    }

    /// Validate and apply a lifecycle transition, then fire the matching
    /// callbacks. Transitions are serialized per agent; callbacks run
    /// outside the state lock.
    pub async fn set_lifecycle_state(
        &self,
        agent_id: &AgentId,
        to: AgentLifecycle,
    ) -> Result<(), RuntimeError> {
        let key = agent_id.to_string();
        let entry = self
            .inner
            .agents
            .get(&key)
            .map(|e| e.value().clone())
            .ok_or_else(|| RuntimeError::UnknownAgent(key.clone()))?;

        let _serial = entry.serial.lock().await;
        let from = {
            let mut state = entry.state.lock().expect("agent state lock poisoned");
            let from = *state;
            *state = from.transition(to)?;
            from
        };
        if from == to {
            return Ok(());
        }
        debug!(agent = key.as_str(), ?from, ?to, "lifecycle transition");

        let agent = entry.agent.clone();
        let callback_result = match (from, to) {
            (_, AgentLifecycle::Active) if matches!(from, AgentLifecycle::Migrating | AgentLifecycle::Cloning) => {
                agent.on_after_migration().await.and(agent.on_activate().await)
            }
            (_, AgentLifecycle::Active) => agent.on_activate().await,
            (AgentLifecycle::Active, AgentLifecycle::Inactive) => agent.on_deactivate().await,
            (AgentLifecycle::Active, AgentLifecycle::Migrating | AgentLifecycle::Cloning) => {
                agent.on_deactivate().await.and(agent.on_before_migration().await)
            }
            (_, AgentLifecycle::Migrating | AgentLifecycle::Cloning) => {
                agent.on_before_migration().await
            }
            _ => Ok(()),
        };
        if let Err(e) = callback_result {
            warn!(agent = key.as_str(), error = %format!("{e:#}"), "lifecycle callback failed");
        }
        Ok(())
    }

    /// Publish an event through the runtime's bus.
    pub async fn publish_event(&self, event: Event) -> Result<(), RuntimeError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(RuntimeError::ShuttingDown);
        }
        Ok(self.inner.bus.publish(event).await?)
    }

    /// Subscribe an agent to a topic pattern. The agent's `handle_event`
    /// runs for every matching event while the agent is `Active`; in any
    /// other state events are silently discarded.
    pub fn subscribe(
        &self,
        agent_id: &AgentId,
        pattern: TopicPattern,
        options: SubscribeOptions,
    ) -> Result<(), RuntimeError> {
        let key = agent_id.to_string();
        let entry = self
            .inner
            .agents
            .get(&key)
            .map(|e| e.value().clone())
            .ok_or_else(|| RuntimeError::UnknownAgent(key.clone()))?;

        let dispatch_entry = entry.clone();
        let dispatch_key = key.clone();
        let handle = self.inner.bus.subscribe(
            &key,
            pattern.clone(),
            handler_fn(move |event| {
                let entry = dispatch_entry.clone();
                let key = dispatch_key.clone();
                async move {
                    if !entry.state().can_receive_events() {
                        debug!(
                            agent = key.as_str(),
                            topic = event.topic(),
                            "discarding event for non-active agent"
                        );
                        return Ok(());
                    }
                    entry.agent.handle_event(event).await
                }
            }),
            options,
        )?;

        entry
            .subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .insert(pattern.as_str().to_string(), handle);
        debug!(agent = key.as_str(), pattern = pattern.as_str(), "agent subscribed");
        Ok(())
    }

    /// Remove one of an agent's subscriptions by pattern.
    pub fn unsubscribe(&self, agent_id: &AgentId, pattern: &str) -> Result<(), RuntimeError> {
        let key = agent_id.to_string();
        let entry = self
            .inner
            .agents
            .get(&key)
            .map(|e| e.value().clone())
            .ok_or_else(|| RuntimeError::UnknownAgent(key.clone()))?;

        let handle = entry
            .subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .remove(pattern);
        match handle {
            Some(handle) => Ok(self.inner.bus.unsubscribe(&handle)?),
            None => Ok(()),
        }
    }

    /// Look up a registered agent.
    pub fn get_agent(&self, agent_id: &AgentId) -> Option<Arc<dyn Agent>> {
        self.inner
            .agents
            .get(&agent_id.to_string())
            .map(|entry| entry.agent.clone())
    }

    /// Current lifecycle state of an agent.
    pub fn agent_state(&self, agent_id: &AgentId) -> Option<AgentLifecycle> {
        self.inner
            .agents
            .get(&agent_id.to_string())
            .map(|entry| entry.state())
    }

    /// Number of registered agents.
    pub fn agent_count(&self) -> usize {
        self.inner.agents.len()
    }

    /// Deactivate and destroy every agent, then shut the bus down.
    ///
    /// Destruction order per agent: `on_deactivate` (if active),
    /// `on_destroy`, unregister.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(agents = self.inner.agents.len(), "runtime shutting down");

        let agents: Vec<(String, Arc<AgentEntry>)> = self
            .inner
            .agents
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (key, entry) in agents {
            let agent_id = entry.agent.id().clone();
            if entry.state() == AgentLifecycle::Active {
                if let Err(e) = self.set_lifecycle_state(&agent_id, AgentLifecycle::Inactive).await {
                    warn!(agent = key.as_str(), error = %e, "deactivation during shutdown failed");
                }
            }
            if let Err(e) = self
                .set_lifecycle_state(&agent_id, AgentLifecycle::Terminated)
                .await
            {
                warn!(agent = key.as_str(), error = %e, "termination during shutdown failed");
            }
            if let Err(e) = entry.agent.on_destroy().await {
                warn!(agent = key.as_str(), error = %format!("{e:#}"), "on_destroy failed");
            }
            if let Err(e) = self.unregister_agent(&agent_id).await {
                debug!(agent = key.as_str(), error = %e, "agent already unregistered");
            }
        }

        self.inner.bus.shutdown().await?;
        info!("runtime shut down");
        Ok(())
    }

    /// Handle a command on an agent's control topic.
    async fn handle_control(&self, agent_id: &AgentId, event: Event) -> anyhow::Result<()> {
        let command: ControlCommand = match event.payload().decode() {
            Ok(command) => command,
            Err(e) => {
                warn!(
                    agent = %agent_id,
                    event_id = event.id(),
                    error = %e,
                    "unrecognized control payload"
                );
                return Ok(());
            }
        };

        match command {
            ControlCommand::Ping => {
                let status = self.status_snapshot(agent_id)?;
                let reply = Event::new(
                    agent_id.pong_topic(),
                    EventPayload::Control(ControlCommand::Pong(status)),
                    AgentId::system(),
                )?;
                self.inner.bus.publish(reply).await?;
            }
            ControlCommand::StatusRequest => {
                let status = self.status_snapshot(agent_id)?;
                let reply = Event::new(
                    agent_id.status_topic(),
                    EventPayload::Control(ControlCommand::StatusReport(status)),
                    AgentId::system(),
                )?;
                self.inner.bus.publish(reply).await?;
            }
            ControlCommand::Shutdown => {
                info!(agent = %agent_id, "control shutdown received");
                self.set_lifecycle_state(agent_id, AgentLifecycle::Terminated)
                    .await?;
                if let Some(agent) = self.get_agent(agent_id) {
                    if let Err(e) = agent.on_destroy().await {
                        warn!(agent = %agent_id, error = %format!("{e:#}"), "on_destroy failed");
                    }
                }
                self.unregister_agent(agent_id).await?;
            }
            ControlCommand::Activate => {
                self.activate_agent(agent_id).await?;
            }
            ControlCommand::Deactivate => {
                self.deactivate_agent(agent_id).await?;
            }
            ControlCommand::Pong(_) | ControlCommand::StatusReport(_) => {
                // Replies are not commands; ignore if echoed back at us.
            }
        }
        Ok(())
    }

    fn status_snapshot(&self, agent_id: &AgentId) -> Result<AgentStatus, RuntimeError> {
        let state = self
            .agent_state(agent_id)
            .ok_or_else(|| RuntimeError::UnknownAgent(agent_id.to_string()))?;
        Ok(AgentStatus {
            agent_id: agent_id.to_string(),
            state,
            timestamp: Utc::now(),
        })
    }
}

/// Non-owning handle an agent keeps to reach the runtime.
///
/// The runtime owns the agent; the handle holds only a weak back-reference
/// so an agent storing its handle never forms an ownership cycle. It
/// exposes the operations the agent contract grants agents: publishing and
/// managing their own subscriptions.
#[derive(Clone)]
pub struct RuntimeHandle {
    context: std::sync::Weak<ContextInner>,
    agent_id: AgentId,
}

impl RuntimeHandle {
    fn upgrade(&self) -> Result<AgentContext, RuntimeError> {
        self.context
            .upgrade()
            .map(|inner| AgentContext { inner })
            .ok_or(RuntimeError::ShuttingDown)
    }

    /// Publish an event.
    pub async fn publish(&self, event: Event) -> Result<(), RuntimeError> {
        self.upgrade()?.publish_event(event).await
    }

    /// Subscribe the owning agent to a pattern.
    pub fn subscribe(&self, pattern: TopicPattern) -> Result<(), RuntimeError> {
        self.upgrade()?
            .subscribe(&self.agent_id, pattern, SubscribeOptions::default())
    }

    /// Drop one of the owning agent's subscriptions.
    pub fn unsubscribe(&self, pattern: &str) -> Result<(), RuntimeError> {
        self.upgrade()?.unsubscribe(&self.agent_id, pattern)
    }
}

#[async_trait]
impl MobilityManager for NoopMobility {
    async fn dispatch(&self, agent_id: &AgentId, destination: &str) -> Result<(), RuntimeError> {
        warn!(agent = %agent_id, destination, "mobility dispatch requested on no-op manager");
        Err(RuntimeError::MobilityUnsupported("dispatch"))
    }

    async fn clone_to(&self, agent_id: &AgentId, destination: &str) -> Result<(), RuntimeError> {
        warn!(agent = %agent_id, destination, "mobility clone requested on no-op manager");
        Err(RuntimeError::MobilityUnsupported("clone"))
    }

    async fn retract(&self, agent_id: &AgentId, source: &str) -> Result<(), RuntimeError> {
        warn!(agent = %agent_id, source, "mobility retract requested on no-op manager");
        Err(RuntimeError::MobilityUnsupported("retract"))
    }

    async fn replicate(&self, agent_id: &AgentId, destinations: &[String]) -> Result<(), RuntimeError> {
        warn!(
            agent = %agent_id,
            destinations = destinations.len(),
            "mobility replicate requested on no-op manager"
        );
        Err(RuntimeError::MobilityUnsupported("replicate"))
    }

    async fn federate(&self, agent_id: &AgentId, peers: &[String]) -> Result<(), RuntimeError> {
        warn!(
            agent = %agent_id,
            peers = peers.len(),
            "mobility federate requested on no-op manager"
        );
        Err(RuntimeError::MobilityUnsupported("federate"))
    }
}
