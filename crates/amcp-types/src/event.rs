//! The event envelope and its CloudEvents 1.0 wire mapping.
//!
//! An [`Event`] is an immutable value: it is fully assembled through
//! [`Event::new`] and the consuming `with_*` refiners, after which consumers
//! only ever observe snapshots. Equality is by event id.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::delivery::DeliveryOptions;
use crate::identity::AgentId;
use crate::payload::EventPayload;
use crate::topic::{validate_topic, TopicError};

/// Content type recorded when none is given.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// CloudEvents context attribute names that extension attributes must not
/// shadow.
pub const RESERVED_CLOUDEVENT_ATTRIBUTES: &[&str] = &[
    "specversion",
    "id",
    "type",
    "source",
    "subject",
    "time",
    "datacontenttype",
    "dataschema",
    "data",
];

/// The sole inter-agent message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    id: String,
    topic: String,
    payload: EventPayload,
    sender: AgentId,
    timestamp: DateTime<Utc>,
    correlation_id: Option<String>,
    trace_id: Option<String>,
    data_content_type: String,
    data_schema: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
    delivery: DeliveryOptions,
}

impl Event {
    /// Create an event on `topic` with a generated id and default delivery
    /// options. Fails if the topic is empty or contains wildcards.
    pub fn new(
        topic: impl Into<String>,
        payload: EventPayload,
        sender: AgentId,
    ) -> Result<Self, TopicError> {
        let topic = topic.into();
        validate_topic(&topic)?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic,
            payload,
            sender,
            timestamp: Utc::now(),
            correlation_id: None,
            trace_id: None,
            data_content_type: DEFAULT_CONTENT_TYPE.to_string(),
            data_schema: None,
            metadata: HashMap::new(),
            delivery: DeliveryOptions::default(),
        })
    }

    /// Replace the generated id. Used when rehydrating wire events and when
    /// redelivery must preserve identity.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach a correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attach a trace id.
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Replace the delivery options.
    pub fn with_delivery(mut self, delivery: DeliveryOptions) -> Self {
        self.delivery = delivery;
        self
    }

    /// Declare a schema URI for the payload.
    pub fn with_data_schema(mut self, schema: impl Into<String>) -> Self {
        self.data_schema = Some(schema.into());
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Unique event id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Routing topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Message body.
    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// Publishing agent.
    pub fn sender(&self) -> &AgentId {
        &self.sender
    }

    /// Creation timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Correlation id threading this event into a logical request.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Distributed trace id.
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// MIME type of the payload.
    pub fn data_content_type(&self) -> &str {
        &self.data_content_type
    }

    /// Optional payload schema URI.
    pub fn data_schema(&self) -> Option<&str> {
        self.data_schema.as_deref()
    }

    /// Event metadata map.
    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// Delivery policy for this event.
    pub fn delivery(&self) -> &DeliveryOptions {
        &self.delivery
    }

    /// Serialize into the CloudEvents 1.0 JSON structure.
    pub fn to_cloudevents(&self) -> CloudEventEnvelope {
        CloudEventEnvelope {
            specversion: "1.0".to_string(),
            id: self.id.clone(),
            ty: self.topic.clone(),
            source: self.sender.to_string(),
            time: self.timestamp,
            datacontenttype: self.data_content_type.clone(),
            dataschema: self.data_schema.clone(),
            data: self.payload.clone(),
            amcpcorrelationid: self.correlation_id.clone(),
            amcptraceid: self.trace_id.clone(),
            amcpmetadata: self.metadata.clone(),
            amcpdeliveryoptions: self.delivery.clone(),
        }
    }

    /// Rebuild an event from its CloudEvents form.
    ///
    /// The sender is rehydrated from its canonical string, so descriptive
    /// fields (display name, id metadata) are not recovered; event equality
    /// is by id and is preserved.
    pub fn from_cloudevents(envelope: CloudEventEnvelope) -> Result<Self, EventDecodeError> {
        if envelope.specversion != "1.0" {
            return Err(EventDecodeError::UnsupportedSpecVersion(
                envelope.specversion,
            ));
        }
        validate_topic(&envelope.ty)?;
        let sender = AgentId::from_str(&envelope.source)
            .map_err(|e| EventDecodeError::BadSource(e.to_string()))?;
        Ok(Self {
            id: envelope.id,
            topic: envelope.ty,
            payload: envelope.data,
            sender,
            timestamp: envelope.time,
            correlation_id: envelope.amcpcorrelationid,
            trace_id: envelope.amcptraceid,
            data_content_type: envelope.datacontenttype,
            data_schema: envelope.dataschema,
            metadata: envelope.amcpmetadata,
            delivery: envelope.amcpdeliveryoptions,
        })
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Errors raised while rebuilding an event from its wire form.
#[derive(Debug, thiserror::Error)]
pub enum EventDecodeError {
    /// The envelope declared a spec version other than 1.0.
    #[error("unsupported CloudEvents specversion {0:?}")]
    UnsupportedSpecVersion(String),
    /// The `type` attribute is not a valid topic.
    #[error(transparent)]
    BadTopic(#[from] TopicError),
    /// The `source` attribute is not a parseable agent id.
    #[error("unparseable source attribute: {0}")]
    BadSource(String),
}

/// CloudEvents 1.0 JSON structure with `amcp*` extension attributes.
///
/// Extension attribute names are fixed and chosen not to collide with
/// [`RESERVED_CLOUDEVENT_ATTRIBUTES`]; event metadata lives *inside*
/// `amcpmetadata`, so user keys can never shadow a context attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEventEnvelope {
    /// Always `"1.0"`.
    pub specversion: String,
    /// Event id.
    pub id: String,
    /// Event topic.
    #[serde(rename = "type")]
    pub ty: String,
    /// Canonical sender string.
    pub source: String,
    /// Event timestamp (RFC 3339).
    pub time: DateTime<Utc>,
    /// Payload MIME type.
    pub datacontenttype: String,
    /// Optional payload schema URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataschema: Option<String>,
    /// Payload body.
    pub data: EventPayload,
    /// Correlation id extension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amcpcorrelationid: Option<String>,
    /// Trace id extension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amcptraceid: Option<String>,
    /// Event metadata extension.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub amcpmetadata: HashMap<String, Value>,
    /// Delivery options extension.
    pub amcpdeliveryoptions: DeliveryOptions,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_event_validates_topic() {
        let sender = AgentId::system();
        assert!(Event::new("", EventPayload::raw(json!({})), sender.clone()).is_err());
        assert!(Event::new("weather.*", EventPayload::raw(json!({})), sender.clone()).is_err());
        assert!(Event::new("weather.request", EventPayload::raw(json!({})), sender).is_ok());
    }

    #[test]
    fn equality_is_by_id() {
        let sender = AgentId::system();
        let a = Event::new("a.b", EventPayload::raw(json!(1)), sender.clone()).unwrap();
        let b = a.clone().with_metadata("extra", json!(true));
        assert_eq!(a, b);
        let c = Event::new("a.b", EventPayload::raw(json!(1)), sender).unwrap();
        assert_ne!(a, c);
    }
}
