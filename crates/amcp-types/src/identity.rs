//! Globally unique agent identity.
//!
//! An [`AgentId`] is immutable once created. Two identities are equal iff
//! both the `id` and the `namespace` match; the display name and metadata
//! are descriptive only and never participate in equality or hashing.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::MAX_AGENT_NAME_LEN;

/// Namespace used when none is given explicitly.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespace reserved for runtime-originated (system) events.
pub const SYSTEM_NAMESPACE: &str = "sys";

/// Errors raised while constructing or parsing agent identities.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The canonical string form could not be parsed.
    #[error("malformed agent id string: {0:?}")]
    Malformed(String),
    /// A component (id or namespace) was empty.
    #[error("agent id component cannot be empty: {0}")]
    EmptyComponent(&'static str),
    /// The display name exceeds [`MAX_AGENT_NAME_LEN`].
    #[error("agent name too long: {0} > {max}", max = MAX_AGENT_NAME_LEN)]
    NameTooLong(usize),
}

/// Immutable, globally unique agent identity.
///
/// Canonical string form is `namespace:id`; the alternate `name@id` form is
/// accepted on parse for human-entered identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentId {
    id: String,
    namespace: String,
    name: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl AgentId {
    /// Create a fresh identity with a random UUID in the default namespace.
    pub fn random() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            name: None,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Create a fresh identity carrying a human-readable display name.
    pub fn named(name: impl Into<String>) -> Result<Self, IdentityError> {
        let name = name.into();
        if name.is_empty() {
            return Err(IdentityError::EmptyComponent("name"));
        }
        if name.len() > MAX_AGENT_NAME_LEN {
            return Err(IdentityError::NameTooLong(name.len()));
        }
        let mut id = Self::random();
        id.name = Some(name);
        Ok(id)
    }

    /// Construct an identity from explicit parts. Used when rehydrating an
    /// id received over the wire.
    pub fn from_parts(
        id: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let id = id.into();
        let namespace = namespace.into();
        if id.is_empty() {
            return Err(IdentityError::EmptyComponent("id"));
        }
        if namespace.is_empty() {
            return Err(IdentityError::EmptyComponent("namespace"));
        }
        Ok(Self {
            id,
            namespace,
            name: None,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        })
    }

    /// The reserved identity used as the sender of runtime-originated events.
    pub fn system() -> Self {
        Self {
            id: "system".to_string(),
            namespace: SYSTEM_NAMESPACE.to_string(),
            name: Some("system".to_string()),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Move this identity into another namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Result<Self, IdentityError> {
        let namespace = namespace.into();
        if namespace.is_empty() {
            return Err(IdentityError::EmptyComponent("namespace"));
        }
        self.namespace = namespace;
        Ok(self)
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The unique id component.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The namespace component.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Optional human-readable display name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Descriptive metadata attached at creation.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Whether this is the reserved system identity.
    pub fn is_system(&self) -> bool {
        self.namespace == SYSTEM_NAMESPACE
    }

    /// Control topic this agent listens on: `agent.{namespace:id}.control`.
    pub fn control_topic(&self) -> String {
        format!("agent.{self}.control")
    }

    /// Topic ping replies are published on: `agent.{namespace:id}.pong`.
    pub fn pong_topic(&self) -> String {
        format!("agent.{self}.pong")
    }

    /// Topic status snapshots are published on: `agent.{namespace:id}.status`.
    pub fn status_topic(&self) -> String {
        format!("agent.{self}.status")
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.id)
    }
}

impl FromStr for AgentId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((name, id)) = s.split_once('@') {
            if name.is_empty() || id.is_empty() {
                return Err(IdentityError::Malformed(s.to_string()));
            }
            let mut parsed = Self::from_parts(id, DEFAULT_NAMESPACE)?;
            parsed.name = Some(name.to_string());
            return Ok(parsed);
        }
        if let Some((namespace, id)) = s.split_once(':') {
            if namespace.is_empty() || id.is_empty() {
                return Err(IdentityError::Malformed(s.to_string()));
            }
            return Self::from_parts(id, namespace);
        }
        Err(IdentityError::Malformed(s.to_string()))
    }
}

// Equality and hashing intentionally ignore name, timestamp, and metadata.
impl PartialEq for AgentId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.namespace == other.namespace
    }
}

impl Eq for AgentId {}

impl Hash for AgentId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.namespace.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_round_trips() {
        let id = AgentId::named("weather").unwrap();
        let parsed: AgentId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn name_at_id_form_parses() {
        let parsed: AgentId = "weather@abc-123".parse().unwrap();
        assert_eq!(parsed.id(), "abc-123");
        assert_eq!(parsed.namespace(), DEFAULT_NAMESPACE);
        assert_eq!(parsed.name(), Some("weather"));
    }

    #[test]
    fn equality_ignores_descriptive_fields() {
        let a = AgentId::from_parts("x", "default").unwrap();
        let b = AgentId::from_parts("x", "default")
            .unwrap()
            .with_metadata("host", "node-7");
        assert_eq!(a, b);

        let c = AgentId::from_parts("x", "other").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn bare_string_is_rejected() {
        assert!("not-an-id".parse::<AgentId>().is_err());
        assert!(":missing".parse::<AgentId>().is_err());
        assert!("@missing".parse::<AgentId>().is_err());
    }

    #[test]
    fn control_topic_embeds_canonical_form() {
        let id = AgentId::from_parts("42", "travel").unwrap();
        assert_eq!(id.control_topic(), "agent.travel:42.control");
    }
}
