//! Behaviour traits shared across crates.
//!
//! The [`Agent`] contract is intentionally minimal and lives in `amcp-types`
//! so that the runtime and concrete agents can both depend on *this*
//! definition without creating cyclic dependencies.

use anyhow::Result;
use async_trait::async_trait;

use crate::event::Event;
use crate::identity::AgentId;

/// Contract every mesh agent implements.
///
/// The runtime exclusively owns registered agents and invokes these
/// callbacks; agents hold only a non-owning handle back to the runtime.
/// `handle_event` invocations for the same agent may run in parallel unless
/// the agent's subscription is ordered, so implementations must be
/// internally synchronized.
#[async_trait]
pub trait Agent: Send + Sync {
    /// This agent's immutable identity.
    fn id(&self) -> &AgentId;

    /// Handle one event routed to this agent. Errors never escape into the
    /// bus; the delivery layer logs and retries them per the event's
    /// delivery mode.
    async fn handle_event(&self, event: Event) -> Result<()>;

    /// Called after the agent transitions to `Active`.
    async fn on_activate(&self) -> Result<()> {
        Ok(())
    }

    /// Called after the agent leaves `Active`.
    async fn on_deactivate(&self) -> Result<()> {
        Ok(())
    }

    /// Called before the agent is unregistered for good.
    async fn on_destroy(&self) -> Result<()> {
        Ok(())
    }

    /// Mobility hook: called before the agent is serialized for transport.
    /// The core ships without a mobility transport, so the default is a
    /// no-op.
    async fn on_before_migration(&self) -> Result<()> {
        Ok(())
    }

    /// Mobility hook: called after the agent arrives on a new host.
    async fn on_after_migration(&self) -> Result<()> {
        Ok(())
    }
}
