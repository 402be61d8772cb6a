//! Topic routing: the set of invoked subscribers must equal the set whose
//! pattern matches the published topic.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use amcp_bus::{handler_fn, EventBus, EventHandler, InMemoryBus, SubscribeOptions};
use amcp_types::{AgentId, Event, EventPayload, TopicPattern};

fn collector() -> (Arc<Mutex<Vec<Event>>>, Arc<dyn EventHandler>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = handler_fn(move |event| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(event);
            Ok(())
        }
    });
    (seen, handler)
}

fn event(topic: &str, payload: serde_json::Value) -> Event {
    Event::new(topic, EventPayload::raw(payload), AgentId::system()).unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_single_wildcard_routes_one_level_only() {
    let bus = InMemoryBus::started();
    let (seen, handler) = collector();
    bus.subscribe(
        "agent-a",
        TopicPattern::parse("weather.*").unwrap(),
        handler,
        SubscribeOptions::default(),
    )
    .unwrap();

    bus.publish(event("weather.request", json!({"loc": "Paris"})))
        .await
        .unwrap();
    settle().await;

    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].topic(), "weather.request");
        assert_eq!(seen[0].payload().to_value()["loc"], "Paris");
    }

    // One level deeper must not match.
    bus.publish(event("weather.request.new", json!({})))
        .await
        .unwrap();
    settle().await;

    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_multi_wildcard_routes_any_depth() {
    let bus = InMemoryBus::started();
    let (seen, handler) = collector();
    bus.subscribe(
        "agent-b",
        TopicPattern::parse("weather.**").unwrap(),
        handler,
        SubscribeOptions::default(),
    )
    .unwrap();

    bus.publish(event("weather.request", json!({}))).await.unwrap();
    bus.publish(event("weather.request.new", json!({})))
        .await
        .unwrap();
    settle().await;

    let topics: Vec<String> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.topic().to_string())
        .collect();
    assert_eq!(topics.len(), 2);
    assert!(topics.contains(&"weather.request".to_string()));
    assert!(topics.contains(&"weather.request.new".to_string()));
}

#[tokio::test]
async fn test_only_matching_subscribers_are_invoked() {
    let bus = InMemoryBus::started();
    let (weather_seen, weather_handler) = collector();
    let (stock_seen, stock_handler) = collector();
    let (all_seen, all_handler) = collector();

    bus.subscribe(
        "weather",
        TopicPattern::parse("weather.*").unwrap(),
        weather_handler,
        SubscribeOptions::default(),
    )
    .unwrap();
    bus.subscribe(
        "stock",
        TopicPattern::parse("stock.*").unwrap(),
        stock_handler,
        SubscribeOptions::default(),
    )
    .unwrap();
    bus.subscribe(
        "audit",
        TopicPattern::parse("**").unwrap(),
        all_handler,
        SubscribeOptions::default(),
    )
    .unwrap();

    bus.publish(event("weather.request", json!({}))).await.unwrap();
    settle().await;

    assert_eq!(weather_seen.lock().unwrap().len(), 1);
    assert_eq!(stock_seen.lock().unwrap().len(), 0);
    assert_eq!(all_seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let bus = InMemoryBus::started();
    let (seen, handler) = collector();
    let handle = bus
        .subscribe(
            "agent-a",
            TopicPattern::parse("travel.**").unwrap(),
            handler,
            SubscribeOptions::default(),
        )
        .unwrap();

    bus.publish(event("travel.book", json!({}))).await.unwrap();
    settle().await;
    assert_eq!(seen.lock().unwrap().len(), 1);

    bus.unsubscribe(&handle).unwrap();
    bus.publish(event("travel.book", json!({}))).await.unwrap();
    settle().await;
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_ordered_subscription_preserves_publish_order() {
    let bus = InMemoryBus::started();
    let (seen, handler) = collector();
    bus.subscribe(
        "ordered",
        TopicPattern::parse("seq.*").unwrap(),
        handler,
        SubscribeOptions::ordered(),
    )
    .unwrap();

    for i in 0..20 {
        bus.publish(event(&format!("seq.n{i}"), json!(i))).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let order: Vec<i64> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.payload().to_value().as_i64().unwrap())
        .collect();
    assert_eq!(order, (0..20).collect::<Vec<i64>>());
}
