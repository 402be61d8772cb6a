use std::collections::HashMap;

use chrono::Utc;
use serde_json::json;

use amcp_types::{
    AgentId, DeliveryMode, DeliveryOptions, ErrorCode, Event, EventPayload, TaskError,
    TaskRequest, TaskResponse, UserContext,
};

fn sample_event() -> Event {
    let sender = AgentId::named("weather-agent").unwrap();
    let request = TaskRequest {
        capability: "weather.get".to_string(),
        parameters: HashMap::from([("location".to_string(), json!("Paris"))]),
        user_context: UserContext::default(),
        priority: 3,
        timeout_ms: 15_000,
        timestamp: Utc::now(),
    };
    Event::new("orchestrator.task.request", EventPayload::TaskRequest(request), sender)
        .unwrap()
        .with_correlation_id("c-42")
        .with_trace_id("trace-7")
        .with_metadata("origin", json!("gateway"))
        .with_delivery(DeliveryOptions {
            mode: DeliveryMode::ExactlyOnce,
            ordered: true,
            priority: 9,
            ..DeliveryOptions::default()
        })
}

#[test]
fn test_cloudevents_roundtrip_preserves_event() {
    let original = sample_event();

    let wire = serde_json::to_string(&original.to_cloudevents()).expect("serialization failed");
    let envelope = serde_json::from_str(&wire).expect("deserialization failed");
    let decoded = Event::from_cloudevents(envelope).expect("rehydration failed");

    assert_eq!(original, decoded);
    assert_eq!(decoded.topic(), original.topic());
    assert_eq!(decoded.correlation_id(), Some("c-42"));
    assert_eq!(decoded.trace_id(), Some("trace-7"));
    assert_eq!(decoded.sender(), original.sender());
    assert_eq!(decoded.delivery(), original.delivery());
    assert_eq!(decoded.payload(), original.payload());
    assert_eq!(decoded.metadata()["origin"], json!("gateway"));
}

#[test]
fn test_cloudevents_wire_shape() {
    let wire = serde_json::to_value(sample_event().to_cloudevents()).unwrap();

    assert_eq!(wire["specversion"], "1.0");
    assert_eq!(wire["type"], "orchestrator.task.request");
    assert_eq!(wire["datacontenttype"], "application/json");
    assert_eq!(wire["amcpcorrelationid"], "c-42");
    assert_eq!(wire["amcptraceid"], "trace-7");
    assert_eq!(wire["data"]["kind"], "task_request");
    assert_eq!(wire["data"]["body"]["capability"], "weather.get");
    assert_eq!(wire["data"]["body"]["timeoutMs"], 15_000);
    assert_eq!(wire["amcpdeliveryoptions"]["mode"], "EXACTLY_ONCE");
}

#[test]
fn test_agent_id_string_roundtrip() {
    let id = AgentId::named("stock-agent")
        .unwrap()
        .with_namespace("finance")
        .unwrap();
    let parsed: AgentId = id.to_string().parse().expect("parse failed");
    assert_eq!(parsed, id);
}

#[test]
fn test_task_response_roundtrip() {
    let original = TaskResponse::failed(
        "travel.book",
        TaskError::new(ErrorCode::AgentUnavailable, "no travel agent registered"),
        128,
    );

    let json = serde_json::to_string(&original).expect("serialization failed");
    let decoded: TaskResponse = serde_json::from_str(&json).expect("deserialization failed");

    assert_eq!(original, decoded);
    assert_eq!(decoded.error.as_ref().unwrap().code, ErrorCode::AgentUnavailable);
}
