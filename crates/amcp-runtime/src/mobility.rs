//! Strong-mobility interface.
//!
//! The mesh core does not ship a mobility transport; the trait preserves
//! the interface so hosts that do implement serialization-and-transport can
//! plug one in. The shipped [`NoopMobility`] logs every request and reports
//! [`RuntimeError::MobilityUnsupported`](crate::RuntimeError::MobilityUnsupported).

use async_trait::async_trait;

use amcp_types::AgentId;

use crate::RuntimeError;

/// Operations for moving agents between hosts.
#[async_trait]
pub trait MobilityManager: Send + Sync {
    /// Move the agent to `destination` and remove it locally.
    async fn dispatch(&self, agent_id: &AgentId, destination: &str) -> Result<(), RuntimeError>;

    /// Copy the agent to `destination`, keeping the local instance.
    async fn clone_to(&self, agent_id: &AgentId, destination: &str) -> Result<(), RuntimeError>;

    /// Pull the agent back from `source`.
    async fn retract(&self, agent_id: &AgentId, source: &str) -> Result<(), RuntimeError>;

    /// Copy the agent to several destinations.
    async fn replicate(&self, agent_id: &AgentId, destinations: &[String])
        -> Result<(), RuntimeError>;

    /// Join the agent to a federation of peers.
    async fn federate(&self, agent_id: &AgentId, peers: &[String]) -> Result<(), RuntimeError>;
}

/// The no-op mobility manager the core ships with.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMobility;
