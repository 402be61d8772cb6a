//! Typed event payloads.
//!
//! The payload is a sum type: structured variants for the schemas the mesh
//! itself understands, plus [`EventPayload::Raw`] for arbitrary bodies.
//! On the wire the payload is adjacently tagged (`{"kind": ..., "body":
//! ...}`) so unknown consumers can still route on `kind`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::lifecycle::AgentLifecycle;

/// Errors raised when decoding a payload into a concrete type.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// The payload body did not match the requested type.
    #[error("failed to decode {kind} payload: {source}")]
    Decode {
        /// Payload kind that was being decoded.
        kind: &'static str,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

/// Reserved machine-readable error codes carried in task responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The per-task timeout expired before a reply arrived.
    TaskTimeout,
    /// The sender lacked the required permission or capability.
    Unauthorized,
    /// No live agent serves the requested capability.
    AgentUnavailable,
    /// The task parameters failed validation.
    InvalidParameters,
    /// The agent accepted the task but execution failed.
    ExecutionFailed,
}

impl ErrorCode {
    /// Whether a task failing with this code may be retried.
    ///
    /// Authorization and parameter errors are deterministic and
    /// short-circuit to failure.
    pub fn is_retryable(self) -> bool {
        match self {
            Self::TaskTimeout | Self::AgentUnavailable | Self::ExecutionFailed => true,
            Self::Unauthorized | Self::InvalidParameters => false,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TaskTimeout => "TASK_TIMEOUT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::AgentUnavailable => "AGENT_UNAVAILABLE",
            Self::InvalidParameters => "INVALID_PARAMETERS",
            Self::ExecutionFailed => "EXECUTION_FAILED",
        };
        f.write_str(s)
    }
}

/// Structured error carried in a failed task response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl TaskError {
    /// Convenience constructor without details.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }
}

/// Caller identity and authorization context threaded through task requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    /// End-user identifier, if any.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Interactive session identifier, if any.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Roles granted to the caller.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Fine-grained permissions granted to the caller.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Additional context entries.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Task dispatched by the orchestrator to a specialist agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    /// Capability the task requires (e.g. `weather.get`).
    pub capability: String,
    /// Task parameters extracted from the user query.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    /// Caller context.
    #[serde(default)]
    pub user_context: UserContext,
    /// Dispatch priority, 1..=10.
    pub priority: u8,
    /// Per-task timeout in milliseconds.
    pub timeout_ms: u64,
    /// Dispatch timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Reply published by a specialist agent for a dispatched task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    /// Capability the task required.
    pub capability: String,
    /// Whether execution succeeded.
    pub success: bool,
    /// Structured result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Structured error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Wall-clock execution time in milliseconds.
    pub execution_time_ms: u64,
    /// Reply timestamp.
    pub timestamp: DateTime<Utc>,
}

impl TaskResponse {
    /// Build a success reply.
    pub fn ok(capability: impl Into<String>, result: Value, execution_time_ms: u64) -> Self {
        Self {
            capability: capability.into(),
            success: true,
            result: Some(result),
            error: None,
            execution_time_ms,
            timestamp: Utc::now(),
        }
    }

    /// Build a failure reply.
    pub fn failed(capability: impl Into<String>, error: TaskError, execution_time_ms: u64) -> Self {
        Self {
            capability: capability.into(),
            success: false,
            result: None,
            error: Some(error),
            execution_time_ms,
            timestamp: Utc::now(),
        }
    }
}

/// Periodic liveness report emitted by every registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Canonical agent id string.
    pub agent_id: String,
    /// Free-form status line (e.g. `"idle"`, `"busy"`).
    pub status: String,
    /// Last-seen status data.
    #[serde(default)]
    pub details: HashMap<String, Value>,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Announcement an agent publishes to join the capability directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityRegistration {
    /// Canonical agent id string.
    pub agent_id: String,
    /// Agent implementation type (e.g. `"WeatherAgent"`).
    pub agent_type: String,
    /// Declared capabilities (dotted strings like `weather.get`).
    pub capabilities: Vec<String>,
    /// Human-readable description used in planning prompts.
    #[serde(default)]
    pub description: String,
    /// Topic prefix the agent listens on.
    pub endpoint: String,
    /// Additional directory metadata.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Snapshot of an agent's runtime state, published on status requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    /// Canonical agent id string.
    pub agent_id: String,
    /// Current lifecycle state.
    pub state: AgentLifecycle,
    /// Snapshot timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Commands recognized on an agent's control topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCommand {
    /// Liveness probe; the runtime replies with [`ControlCommand::Pong`].
    Ping,
    /// Reply to a ping, published on the agent's pong topic.
    Pong(AgentStatus),
    /// Ask the agent to publish a status snapshot.
    StatusRequest,
    /// Status snapshot reply.
    StatusReport(AgentStatus),
    /// Destroy the agent and unregister it.
    Shutdown,
    /// Transition the agent to `Active`.
    Activate,
    /// Transition the agent to `Inactive`.
    Deactivate,
}

/// The sole inter-agent message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum EventPayload {
    /// Orchestrator → specialist task dispatch.
    TaskRequest(TaskRequest),
    /// Specialist → orchestrator task reply.
    TaskResponse(TaskResponse),
    /// Liveness report.
    Heartbeat(Heartbeat),
    /// Capability directory announcement.
    CapabilityRegistration(CapabilityRegistration),
    /// Agent control command.
    Control(ControlCommand),
    /// Unknown or application-defined body.
    Raw(Value),
}

impl EventPayload {
    /// Short kind tag used on the wire and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskRequest(_) => "task_request",
            Self::TaskResponse(_) => "task_response",
            Self::Heartbeat(_) => "heartbeat",
            Self::CapabilityRegistration(_) => "capability_registration",
            Self::Control(_) => "control",
            Self::Raw(_) => "raw",
        }
    }

    /// Wrap an arbitrary JSON value.
    pub fn raw(value: Value) -> Self {
        Self::Raw(value)
    }

    /// The payload body as a JSON value, dropping the kind tag.
    pub fn to_value(&self) -> Value {
        match self {
            Self::TaskRequest(v) => serde_json::to_value(v),
            Self::TaskResponse(v) => serde_json::to_value(v),
            Self::Heartbeat(v) => serde_json::to_value(v),
            Self::CapabilityRegistration(v) => serde_json::to_value(v),
            Self::Control(v) => serde_json::to_value(v),
            Self::Raw(v) => Ok(v.clone()),
        }
        // Serializing in-memory structs to a Value cannot fail for these
        // shapes (no non-string map keys).
        .unwrap_or(Value::Null)
    }

    /// Decode the payload body into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        serde_json::from_value(self.to_value()).map_err(|source| PayloadError::Decode {
            kind: self.kind(),
            source,
        })
    }
}

impl From<Value> for EventPayload {
    fn from(value: Value) -> Self {
        Self::Raw(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_recovers_typed_body() {
        let payload = EventPayload::Heartbeat(Heartbeat {
            agent_id: "default:1".to_string(),
            status: "idle".to_string(),
            details: HashMap::new(),
            timestamp: Utc::now(),
        });
        let hb: Heartbeat = payload.decode().unwrap();
        assert_eq!(hb.agent_id, "default:1");
    }

    #[test]
    fn decode_mismatch_is_typed_error() {
        let payload = EventPayload::raw(json!({"loc": "Paris"}));
        let err = payload.decode::<Heartbeat>().unwrap_err();
        assert!(matches!(err, PayloadError::Decode { kind: "raw", .. }));
    }

    #[test]
    fn wire_form_is_kind_tagged() {
        let payload = EventPayload::raw(json!({"loc": "Paris"}));
        let wire = serde_json::to_value(&payload).unwrap();
        assert_eq!(wire["kind"], "raw");
        assert_eq!(wire["body"]["loc"], "Paris");
    }

    #[test]
    fn error_codes_serialize_screaming_snake() {
        let err = TaskError::new(ErrorCode::TaskTimeout, "no reply");
        let wire = serde_json::to_value(&err).unwrap();
        assert_eq!(wire["code"], "TASK_TIMEOUT");
        assert!(!ErrorCode::Unauthorized.is_retryable());
        assert!(ErrorCode::AgentUnavailable.is_retryable());
    }
}
