#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **amcp-types** – Shared primitive data structures for the AMCP mesh.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the identity model, the event envelope that is the sole
//! inter-agent message, hierarchical topic patterns, delivery policies, the
//! agent lifecycle state machine, capability records, and LLM task plans.
//!
//! It intentionally makes no assumptions about I/O or transport; the wire
//! representation is the CloudEvents 1.0 JSON mapping in [`event`].

//─────────────────────────────
//  Size limits
//─────────────────────────────

/// Maximum allowed length of a topic string to prevent memory exhaustion.
pub const MAX_TOPIC_LEN: usize = 256;

/// Maximum allowed length of an agent display name.
pub const MAX_AGENT_NAME_LEN: usize = 256;

/// Maximum allowed size for a task description carried in a plan.
pub const MAX_TASK_DESCRIPTION_LEN: usize = 4096;

//─────────────────────────────
//  Modules
//─────────────────────────────

/// Agent identity.
pub mod identity;
/// Topic validation and wildcard pattern matching.
pub mod topic;
/// Delivery modes and per-event delivery policy.
pub mod delivery;
/// Typed event payloads and the task request/response wire contracts.
pub mod payload;
/// The event envelope and its CloudEvents 1.0 mapping.
pub mod event;
/// Agent lifecycle state machine.
pub mod lifecycle;
/// Capability directory records.
pub mod capability;
/// LLM-produced task plans.
pub mod plan;
/// Behaviour traits (`Agent`) shared across crates.
pub mod traits;

pub use capability::CapabilityRecord;
pub use delivery::{DeliveryMode, DeliveryOptions};
pub use event::{CloudEventEnvelope, Event, EventDecodeError};
pub use identity::{AgentId, IdentityError};
pub use lifecycle::{AgentLifecycle, LifecycleError};
pub use payload::{
    AgentStatus, CapabilityRegistration, ControlCommand, ErrorCode, EventPayload, Heartbeat,
    PayloadError, TaskError, TaskRequest, TaskResponse, UserContext,
};
pub use plan::{PlanError, TaskDefinition, TaskPlan};
pub use topic::{validate_topic, well_known, TopicError, TopicPattern};
pub use traits::Agent;
