//! Delivery-mode semantics: retries, dead-lettering, dedup, priority, and
//! backpressure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use amcp_bus::{handler_fn, BusConfig, BusError, EventBus, InMemoryBus, SubscribeOptions};
use amcp_types::{AgentId, DeliveryMode, DeliveryOptions, Event, EventPayload, TopicPattern};

fn event(topic: &str, payload: serde_json::Value) -> Event {
    Event::new(topic, EventPayload::raw(payload), AgentId::system()).unwrap()
}

#[tokio::test]
async fn test_failing_handler_dead_letters_after_retries() {
    let bus = InMemoryBus::started();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    bus.subscribe(
        "flaky",
        TopicPattern::parse("job.*").unwrap(),
        handler_fn(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("handler always fails")
            }
        }),
        SubscribeOptions::default(),
    )
    .unwrap();

    let dead = Arc::new(Mutex::new(Vec::new()));
    let sink = dead.clone();
    bus.subscribe(
        "morgue",
        TopicPattern::parse("sys.deadletter.**").unwrap(),
        handler_fn(move |e| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(e);
                Ok(())
            }
        }),
        SubscribeOptions::default(),
    )
    .unwrap();

    let delivery = DeliveryOptions {
        mode: DeliveryMode::AtLeastOnce,
        max_retries: 2,
        ..DeliveryOptions::default()
    };
    bus.publish(
        event("job.run", json!({"input": 7}))
            .with_correlation_id("c9")
            .with_delivery(delivery),
    )
    .await
    .unwrap();

    // Backoff between the three attempts is ~100ms + ~200ms (jittered).
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let dead = dead.lock().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].topic(), "sys.deadletter.job.run");
    assert_eq!(dead[0].payload().to_value()["input"], 7);
    assert_eq!(dead[0].correlation_id(), Some("c9"));
    assert!(dead[0].metadata().contains_key("amcperror"));
    assert_eq!(dead[0].metadata()["amcpattempts"], json!(3));
}

#[tokio::test]
async fn test_at_most_once_drops_on_failure() {
    let bus = InMemoryBus::started();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    bus.subscribe(
        "flaky",
        TopicPattern::parse("job.*").unwrap(),
        handler_fn(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("nope")
            }
        }),
        SubscribeOptions::default(),
    )
    .unwrap();

    let dead = Arc::new(AtomicUsize::new(0));
    let dead_counter = dead.clone();
    bus.subscribe(
        "morgue",
        TopicPattern::parse("sys.deadletter.**").unwrap(),
        handler_fn(move |_| {
            let dead_counter = dead_counter.clone();
            async move {
                dead_counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
        SubscribeOptions::default(),
    )
    .unwrap();

    let delivery = DeliveryOptions {
        mode: DeliveryMode::AtMostOnce,
        ..DeliveryOptions::default()
    };
    bus.publish(event("job.run", json!({})).with_delivery(delivery))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(dead.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_exactly_once_suppresses_duplicate_ids() {
    let bus = InMemoryBus::started();

    let deliveries = Arc::new(AtomicUsize::new(0));
    let counter = deliveries.clone();
    bus.subscribe(
        "dedup",
        TopicPattern::parse("pay.*").unwrap(),
        handler_fn(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
        SubscribeOptions::default(),
    )
    .unwrap();

    let delivery = DeliveryOptions {
        mode: DeliveryMode::ExactlyOnce,
        ..DeliveryOptions::default()
    };
    let first = event("pay.settle", json!({"amount": 10})).with_delivery(delivery.clone());
    let duplicate = event("pay.settle", json!({"amount": 10}))
        .with_id(first.id())
        .with_delivery(delivery);

    bus.publish(first).await.unwrap();
    bus.publish(duplicate).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(deliveries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_higher_priority_dequeues_first() {
    let bus = InMemoryBus::started();

    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = order.clone();
    bus.subscribe(
        "prio",
        TopicPattern::parse("work.*").unwrap(),
        handler_fn(move |e| {
            let sink = sink.clone();
            async move {
                if e.topic() == "work.blocker" {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                sink.lock().unwrap().push(e.topic().to_string());
                Ok(())
            }
        }),
        SubscribeOptions {
            concurrency: Some(1),
            ..SubscribeOptions::default()
        },
    )
    .unwrap();

    // The blocker is delivered inline (ordered=true) and stalls the worker,
    // so the low/high events accumulate in the queue.
    let blocker = DeliveryOptions {
        ordered: true,
        ..DeliveryOptions::default()
    };
    bus.publish(event("work.blocker", json!({})).with_delivery(blocker))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let low = DeliveryOptions {
        priority: 1,
        ..DeliveryOptions::default()
    };
    let high = DeliveryOptions {
        priority: 9,
        ..DeliveryOptions::default()
    };
    bus.publish(event("work.low", json!({})).with_delivery(low))
        .await
        .unwrap();
    bus.publish(event("work.high", json!({})).with_delivery(high))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(
        order.lock().unwrap().clone(),
        vec!["work.blocker", "work.high", "work.low"]
    );
}

#[tokio::test]
async fn test_full_queue_overloads_publish() {
    let bus = InMemoryBus::new(BusConfig {
        queue_capacity: 1,
        ..BusConfig::default()
    });
    bus.start().unwrap();

    bus.subscribe(
        "slow",
        TopicPattern::parse("slow.*").unwrap(),
        handler_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }),
        SubscribeOptions::ordered(),
    )
    .unwrap();

    let delivery = DeliveryOptions {
        timeout_millis: 100,
        ..DeliveryOptions::default()
    };

    // First event is dequeued and stalls the ordered worker; the second
    // occupies the single queue slot; the third must time out.
    bus.publish(event("slow.a", json!({})).with_delivery(delivery.clone()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.publish(event("slow.b", json!({})).with_delivery(delivery.clone()))
        .await
        .unwrap();

    let err = bus
        .publish(event("slow.c", json!({})).with_delivery(delivery))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Overloaded { .. }));
}
