//! Hierarchical topic validation and wildcard pattern matching.
//!
//! Topics are dot-separated routing keys. A pattern segment may be a
//! literal, `*` (matches exactly one non-empty segment), or a trailing `**`
//! (matches one or more remaining segments). Matching is segment-based, not
//! regex: `travel.*` matches `travel.request` but not `travel.request.new`;
//! `travel.**` matches both.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::MAX_TOPIC_LEN;

/// Errors raised while validating topics or parsing patterns.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    /// Topic or pattern string was empty.
    #[error("topic cannot be empty")]
    Empty,
    /// Topic exceeds [`MAX_TOPIC_LEN`].
    #[error("topic too long: {0} > {max}", max = MAX_TOPIC_LEN)]
    TooLong(usize),
    /// A dot-separated segment was empty (`a..b`, leading or trailing dot).
    #[error("topic {0:?} contains an empty segment")]
    EmptySegment(String),
    /// A concrete topic contained a wildcard character.
    #[error("topic {0:?} must not contain wildcards")]
    WildcardInTopic(String),
    /// `*` appeared embedded inside a segment (`foo.ba*r`).
    #[error("pattern {0:?} has a wildcard inside a segment")]
    EmbeddedWildcard(String),
    /// `**` appeared anywhere but the final segment.
    #[error("pattern {0:?} may only use '**' as the final segment")]
    MisplacedMultiWildcard(String),
}

/// Validate a concrete (publishable) topic: non-empty dot-separated segments,
/// no wildcards.
pub fn validate_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong(topic.len()));
    }
    for segment in topic.split('.') {
        if segment.is_empty() {
            return Err(TopicError::EmptySegment(topic.to_string()));
        }
        if segment.contains('*') {
            return Err(TopicError::WildcardInTopic(topic.to_string()));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternSegment {
    Literal(String),
    /// `*` – exactly one segment.
    Single,
    /// `**` – one or more trailing segments.
    Rest,
}

/// A parsed, validated topic subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicPattern {
    raw: String,
    segments: Vec<PatternSegment>,
}

impl TopicPattern {
    /// Parse and validate a pattern string.
    pub fn parse(pattern: &str) -> Result<Self, TopicError> {
        if pattern.is_empty() {
            return Err(TopicError::Empty);
        }
        if pattern.len() > MAX_TOPIC_LEN {
            return Err(TopicError::TooLong(pattern.len()));
        }
        let raw_segments: Vec<&str> = pattern.split('.').collect();
        let mut segments = Vec::with_capacity(raw_segments.len());
        for (i, segment) in raw_segments.iter().enumerate() {
            let parsed = match *segment {
                "" => return Err(TopicError::EmptySegment(pattern.to_string())),
                "*" => PatternSegment::Single,
                "**" => {
                    if i + 1 != raw_segments.len() {
                        return Err(TopicError::MisplacedMultiWildcard(pattern.to_string()));
                    }
                    PatternSegment::Rest
                }
                literal => {
                    if literal.contains('*') {
                        return Err(TopicError::EmbeddedWildcard(pattern.to_string()));
                    }
                    PatternSegment::Literal(literal.to_string())
                }
            };
            segments.push(parsed);
        }
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// The original pattern string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether this pattern contains no wildcards (exact-topic subscription).
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, PatternSegment::Literal(_)))
    }

    /// Segment-based match of a concrete topic against this pattern.
    ///
    /// `*` consumes exactly one segment; a trailing `**` requires at least
    /// one remaining segment.
    pub fn matches(&self, topic: &str) -> bool {
        let topic_segments: Vec<&str> = topic.split('.').collect();
        if topic_segments.iter().any(|s| s.is_empty()) {
            return false;
        }
        let mut ti = 0;
        for (pi, segment) in self.segments.iter().enumerate() {
            match segment {
                PatternSegment::Rest => {
                    // Must be last; needs >= 1 remaining topic segment.
                    debug_assert_eq!(pi + 1, self.segments.len());
                    return ti < topic_segments.len();
                }
                PatternSegment::Single => {
                    if ti >= topic_segments.len() {
                        return false;
                    }
                    ti += 1;
                }
                PatternSegment::Literal(lit) => {
                    if ti >= topic_segments.len() || topic_segments[ti] != lit.as_str() {
                        return false;
                    }
                    ti += 1;
                }
            }
        }
        ti == topic_segments.len()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for TopicPattern {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TopicPattern {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TopicPattern> for String {
    fn from(pattern: TopicPattern) -> Self {
        pattern.raw
    }
}

/// Reserved topics and topic prefixes used across the mesh.
pub mod well_known {
    /// Orchestrator dispatches tasks here.
    pub const TASK_REQUEST: &str = "orchestrator.task.request";
    /// Specialist agents reply here.
    pub const TASK_RESPONSE: &str = "orchestrator.task.response";
    /// Capability registration addressed to the orchestrator.
    pub const CAPABILITY_REGISTER: &str = "orchestrator.capability.register";
    /// Capability discovery addressed to the orchestrator.
    pub const CAPABILITY_DISCOVER: &str = "orchestrator.capability.discover";

    /// Pattern covering all agent registration announcements.
    pub const AGENT_REGISTER_PATTERN: &str = "agent.register.**";
    /// Pattern covering all agent unregistration announcements.
    pub const AGENT_UNREGISTER_PATTERN: &str = "agent.unregister.**";
    /// Pattern covering all agent heartbeats.
    pub const AGENT_HEARTBEAT_PATTERN: &str = "agent.heartbeat.**";
    /// Pattern covering all discovery requests.
    pub const AGENT_DISCOVER_PATTERN: &str = "agent.discover.**";

    /// Prefix for dead-letter topics.
    pub const DEADLETTER_PREFIX: &str = "sys.deadletter";
    /// Prefix for health alert topics.
    pub const ALERT_PREFIX: &str = "sys.alert";

    /// Dead-letter topic for events that exhausted delivery retries on
    /// `original`.
    pub fn deadletter_topic(original: &str) -> String {
        format!("{DEADLETTER_PREFIX}.{original}")
    }

    /// Whether `topic` is itself a dead-letter topic.
    pub fn is_deadletter_topic(topic: &str) -> bool {
        topic == DEADLETTER_PREFIX || topic.starts_with("sys.deadletter.")
    }

    /// Alert topic for a named component.
    pub fn alert_topic(component: &str) -> String {
        format!("{ALERT_PREFIX}.{component}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_wildcard_matches_exactly_one_segment() {
        let p = TopicPattern::parse("travel.*").unwrap();
        assert!(p.matches("travel.request"));
        assert!(!p.matches("travel"));
        assert!(!p.matches("travel.request.new"));
    }

    #[test]
    fn multi_wildcard_requires_at_least_one_segment() {
        let p = TopicPattern::parse("travel.**").unwrap();
        assert!(p.matches("travel.request"));
        assert!(p.matches("travel.request.new"));
        assert!(!p.matches("travel"));
        assert!(!p.matches("weather.request"));
    }

    #[test]
    fn exact_pattern_matches_only_itself() {
        let p = TopicPattern::parse("travel.request").unwrap();
        assert!(p.matches("travel.request"));
        assert!(!p.matches("travel.request.new"));
        assert!(!p.matches("travel"));
    }

    #[test]
    fn bare_multi_wildcard_matches_everything_nonempty() {
        let p = TopicPattern::parse("**").unwrap();
        assert!(p.matches("a"));
        assert!(p.matches("a.b.c"));
    }

    #[test]
    fn embedded_wildcards_are_rejected() {
        assert_eq!(
            TopicPattern::parse("travel.re*quest"),
            Err(TopicError::EmbeddedWildcard("travel.re*quest".to_string()))
        );
        assert!(matches!(
            TopicPattern::parse("a.**.b"),
            Err(TopicError::MisplacedMultiWildcard(_))
        ));
        assert_eq!(TopicPattern::parse(""), Err(TopicError::Empty));
        assert!(matches!(
            TopicPattern::parse("a..b"),
            Err(TopicError::EmptySegment(_))
        ));
    }

    #[test]
    fn concrete_topics_reject_wildcards() {
        assert!(validate_topic("weather.request").is_ok());
        assert!(validate_topic("agent.default:1.control").is_ok());
        assert!(matches!(
            validate_topic("weather.*"),
            Err(TopicError::WildcardInTopic(_))
        ));
        assert_eq!(validate_topic(""), Err(TopicError::Empty));
    }

    #[test]
    fn deadletter_helpers() {
        assert_eq!(
            well_known::deadletter_topic("weather.request"),
            "sys.deadletter.weather.request"
        );
        assert!(well_known::is_deadletter_topic(
            "sys.deadletter.weather.request"
        ));
        assert!(!well_known::is_deadletter_topic("weather.request"));
    }
}
