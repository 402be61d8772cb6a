//! Capability directory records.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::AgentId;
use crate::payload::CapabilityRegistration;

/// Directory entry describing an agent and what it can do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityRecord {
    /// The agent this record describes.
    pub agent_id: AgentId,
    /// Agent implementation type (e.g. `"WeatherAgent"`).
    pub agent_type: String,
    /// Declared capabilities. Kept sorted for stable serialization.
    pub capabilities: BTreeSet<String>,
    /// Human-readable description used in planning prompts.
    #[serde(default)]
    pub description: String,
    /// Topic prefix the agent listens on.
    pub endpoint: String,
    /// When the record was registered.
    pub registered_at: DateTime<Utc>,
    /// Additional directory metadata.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl CapabilityRecord {
    /// Build a record from a wire registration announcement.
    pub fn from_registration(
        registration: CapabilityRegistration,
        agent_id: AgentId,
    ) -> Self {
        Self {
            agent_id,
            agent_type: registration.agent_type,
            capabilities: registration.capabilities.into_iter().collect(),
            description: registration.description,
            endpoint: registration.endpoint,
            registered_at: Utc::now(),
            metadata: registration.metadata,
        }
    }

    /// Case-insensitive substring lookup over the capability set.
    ///
    /// `"weather"` matches a record declaring `weather.get`;
    /// `"WEATHER.GET"` matches too.
    pub fn matches_capability(&self, query: &str) -> bool {
        let query = query.to_lowercase();
        self.capabilities
            .iter()
            .any(|c| c.to_lowercase().contains(&query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(capabilities: &[&str]) -> CapabilityRecord {
        CapabilityRecord {
            agent_id: AgentId::from_parts("1", "default").unwrap(),
            agent_type: "WeatherAgent".to_string(),
            capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
            description: String::new(),
            endpoint: "weather".to_string(),
            registered_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn lookup_is_case_insensitive_substring() {
        let r = record(&["weather.get", "weather.forecast"]);
        assert!(r.matches_capability("weather.get"));
        assert!(r.matches_capability("WEATHER"));
        assert!(r.matches_capability("forecast"));
        assert!(!r.matches_capability("stock"));
    }
}
