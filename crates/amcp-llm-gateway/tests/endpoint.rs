//! Gateway behavior against a scripted completion endpoint.

use std::time::Duration;

use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use amcp_llm_gateway::{CompletionRequest, GatewayConfig, GatewayError, LlmGateway};

fn gateway_for(server_uri: &str, timeout: Duration) -> LlmGateway {
    let mut config = GatewayConfig::for_endpoint(format!("{server_uri}/api/generate"), "llama3");
    config.call_timeout = timeout;
    LlmGateway::new(config).unwrap()
}

#[tokio::test]
async fn test_plain_response_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(serde_json::json!({"model": "llama3"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "response": "Paris is sunny, 24°C.",
            "done": true
        })))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server.uri(), Duration::from_secs(5));
    let response = gateway
        .complete(CompletionRequest::new("weather in Paris?").unwrap())
        .await
        .unwrap();

    assert_eq!(response.content(), "Paris is sunny, 24°C.");
    assert_eq!(response.model(), "llama3");
    assert_eq!(response.fragments(), 1);

    let metrics = gateway.metrics().await;
    assert_eq!(metrics.total_requests, 1);
    assert_eq!(metrics.successful_responses, 1);
}

#[tokio::test]
async fn test_streamed_fragments_are_concatenated() {
    let server = MockServer::start().await;
    let ndjson = concat!(
        r#"{"response": "The weather ", "done": false}"#,
        "\n",
        r#"{"response": "in Paris ", "done": false}"#,
        "\n",
        r#"{"response": "is sunny.", "done": true}"#,
        "\n",
    );
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(ndjson, "application/x-ndjson"))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server.uri(), Duration::from_secs(5));
    let response = gateway
        .complete(CompletionRequest::new("weather in Paris?").unwrap())
        .await
        .unwrap();

    assert_eq!(response.content(), "The weather in Paris is sunny.");
    assert_eq!(response.fragments(), 3);
}

#[tokio::test]
async fn test_endpoint_error_surfaces_as_backend_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model exploded"))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server.uri(), Duration::from_secs(5));
    let err = gateway
        .complete(CompletionRequest::new("hello").unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Backend(_)));
    assert!(err.to_string().contains("500"));
    assert_eq!(gateway.metrics().await.failed_requests, 1);
}

#[tokio::test]
async fn test_slow_endpoint_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(10))
                .set_body_json(serde_json::json!({"response": "late", "done": true})),
        )
        .mount(&server)
        .await;

    let gateway = gateway_for(&server.uri(), Duration::from_millis(200));
    let err = gateway
        .complete(CompletionRequest::new("hello").unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Timeout(_)));
}

#[tokio::test]
async fn test_cancellation_aborts_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(10))
                .set_body_json(serde_json::json!({"response": "late", "done": true})),
        )
        .mount(&server)
        .await;

    let gateway = gateway_for(&server.uri(), Duration::from_secs(30));
    let cancel = tokio_util::sync::CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let err = gateway
        .complete_cancellable(CompletionRequest::new("hello").unwrap(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Cancelled));
}

#[tokio::test]
async fn test_rate_limit_is_enforced_per_source() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "response": "ok",
            "done": true
        })))
        .mount(&server)
        .await;

    let mut config = GatewayConfig::for_endpoint(format!("{}/api/generate", server.uri()), "llama3");
    config.rate_limit_per_minute = 1;
    let gateway = LlmGateway::new(config).unwrap();

    let first = CompletionRequest::new("hello").unwrap().with_source("planner");
    gateway.complete(first).await.unwrap();

    let second = CompletionRequest::new("hello").unwrap().with_source("planner");
    let err = gateway.complete(second).await.unwrap_err();
    assert!(matches!(err, GatewayError::RateLimited(_)));

    // A different source has its own allowance.
    let other = CompletionRequest::new("hello").unwrap().with_source("synthesizer");
    gateway.complete(other).await.unwrap();
}
