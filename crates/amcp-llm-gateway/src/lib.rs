#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **amcp-llm-gateway** – Gateway to the LLM completion endpoint.
//!
//! The orchestrator treats the language model as an HTTP text-completion
//! endpoint: POST `{prompt, model, temperature?, max_tokens?}` and read back
//! either a single `{response, done}` object or a streamed NDJSON sequence
//! of such fragments, concatenated until `done`.
//!
//! [`LlmGateway`] wraps a [`CompletionBackend`] with per-source rate
//! limiting, a call timeout, best-effort cancellation, request validation,
//! and rolling metrics. API keys, when configured, are held in
//! [`secrecy::Secret`] and never logged.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod backend;
pub mod config;

pub use backend::{CompletionBackend, HttpCompletionBackend};
pub use config::GatewayConfig;

/// Maximum allowed prompt length, to bound request memory.
pub const MAX_PROMPT_LENGTH: usize = 32_768;

/// Maximum allowed response length, to bound response memory.
pub const MAX_RESPONSE_LENGTH: usize = 1_048_576;

/// Errors surfaced by gateway calls.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The request failed validation before leaving the process.
    #[error("invalid completion request: {0}")]
    InvalidRequest(String),
    /// The caller exceeded its rate limit.
    #[error("rate limit exceeded for source {0:?}")]
    RateLimited(String),
    /// The call did not finish inside the configured timeout.
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),
    /// The call was cancelled through its cancellation token.
    #[error("LLM call cancelled")]
    Cancelled,
    /// The endpoint itself failed.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// A text-completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    prompt: String,
    model: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    source: String,
}

impl CompletionRequest {
    /// Create a request, validating prompt bounds.
    pub fn new(prompt: impl Into<String>) -> Result<Self, GatewayError> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("prompt cannot be empty".into()));
        }
        if prompt.len() > MAX_PROMPT_LENGTH {
            return Err(GatewayError::InvalidRequest(format!(
                "prompt too long: {} > {MAX_PROMPT_LENGTH}",
                prompt.len()
            )));
        }
        Ok(Self {
            prompt,
            model: None,
            temperature: None,
            max_tokens: None,
            source: "anonymous".to_string(),
        })
    }

    /// Override the backend's default model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set sampling temperature (0.0..=1.0).
    pub fn with_temperature(mut self, temperature: f32) -> Result<Self, GatewayError> {
        if !(0.0..=1.0).contains(&temperature) {
            return Err(GatewayError::InvalidRequest(format!(
                "temperature {temperature} outside 0.0..=1.0"
            )));
        }
        self.temperature = Some(temperature);
        Ok(self)
    }

    /// Cap the completion length.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Name the requesting component; rate limits are keyed by source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// The prompt text.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Requested model override, if any.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Sampling temperature, if set.
    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    /// Completion length cap, if set.
    pub fn max_tokens(&self) -> Option<u32> {
        self.max_tokens
    }

    /// Rate-limit key.
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// A completed text generation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    content: String,
    model: String,
    duration_ms: u64,
    fragments: u32,
}

impl CompletionResponse {
    /// Assemble a response, validating size bounds.
    pub fn new(
        content: String,
        model: String,
        duration: Duration,
        fragments: u32,
    ) -> anyhow::Result<Self> {
        if content.len() > MAX_RESPONSE_LENGTH {
            anyhow::bail!(
                "response too long: {} > {MAX_RESPONSE_LENGTH}",
                content.len()
            );
        }
        Ok(Self {
            content,
            model,
            duration_ms: duration.as_millis() as u64,
            fragments,
        })
    }

    /// The generated text.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Model that produced it.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Wall-clock duration of the call in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// Number of streamed fragments concatenated (1 for plain responses).
    pub fn fragments(&self) -> u32 {
        self.fragments
    }
}

/// Rolling gateway metrics.
#[derive(Debug, Default, Clone)]
pub struct GatewayMetrics {
    /// Total requests processed.
    pub total_requests: u64,
    /// Successful completions.
    pub successful_responses: u64,
    /// Failed or timed-out requests.
    pub failed_requests: u64,
    /// Rolling average response time in milliseconds.
    pub avg_response_time_ms: f64,
}

impl GatewayMetrics {
    /// Fraction of requests that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.successful_responses as f64 / self.total_requests as f64
    }
}

type KeyedLimiter = RateLimiter<String, DashMapStateStore<String>, DefaultClock>;

/// Gateway wrapping a completion backend with policy.
pub struct LlmGateway {
    backend: Box<dyn CompletionBackend>,
    rate_limiter: Arc<KeyedLimiter>,
    call_timeout: Duration,
    metrics: Arc<RwLock<GatewayMetrics>>,
}

impl LlmGateway {
    /// Build a gateway from configuration.
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let backend = config.create_backend()?;
        Ok(Self::with_backend(backend, &config))
    }

    /// Build a gateway over an existing backend (used by tests and by the
    /// orchestrator's scripted stubs).
    pub fn with_backend(backend: Box<dyn CompletionBackend>, config: &GatewayConfig) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(config.rate_limit_per_minute.max(1)).expect("non-zero rate limit"),
        );
        info!(
            backend = backend.backend_name(),
            model = backend.model_name(),
            timeout_ms = config.call_timeout.as_millis() as u64,
            "LLM gateway initialized"
        );
        Self {
            backend,
            rate_limiter: Arc::new(RateLimiter::keyed(quota)),
            call_timeout: config.call_timeout,
            metrics: Arc::new(RwLock::new(GatewayMetrics::default())),
        }
    }

    /// Complete a request under the gateway's timeout and rate limits.
    pub async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, GatewayError> {
        self.complete_cancellable(request, &CancellationToken::new())
            .await
    }

    /// Complete a request, aborting early if `cancel` fires. Cancellation is
    /// best-effort: the HTTP call is dropped, which interrupts it within the
    /// client's own timeout.
    pub async fn complete_cancellable(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, GatewayError> {
        if self.rate_limiter.check_key(&request.source).is_err() {
            warn!(source = request.source(), "rate limit exceeded");
            self.record(false, 0).await;
            return Err(GatewayError::RateLimited(request.source.clone()));
        }

        let started = std::time::Instant::now();
        debug!(
            source = request.source(),
            prompt_len = request.prompt.len(),
            "dispatching completion request"
        );

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
            result = tokio::time::timeout(self.call_timeout, self.backend.complete(&request)) => {
                match result {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(e)) => Err(GatewayError::Backend(e)),
                    Err(_) => Err(GatewayError::Timeout(self.call_timeout)),
                }
            }
        };

        let elapsed = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(response) => {
                debug!(
                    source = request.source(),
                    duration_ms = elapsed,
                    fragments = response.fragments(),
                    "completion succeeded"
                );
                self.record(true, elapsed).await;
            }
            Err(e) => {
                warn!(source = request.source(), error = %e, "completion failed");
                self.record(false, elapsed).await;
            }
        }
        outcome
    }

    /// Snapshot the rolling metrics.
    pub async fn metrics(&self) -> GatewayMetrics {
        self.metrics.read().await.clone()
    }

    /// Probe the backend.
    pub async fn health_check(&self) -> anyhow::Result<()> {
        self.backend.health_check().await
    }

    async fn record(&self, success: bool, duration_ms: u64) {
        let mut metrics = self.metrics.write().await;
        metrics.total_requests += 1;
        if success {
            metrics.successful_responses += 1;
            let n = metrics.successful_responses as f64;
            metrics.avg_response_time_ms =
                (metrics.avg_response_time_ms * (n - 1.0) + duration_ms as f64) / n;
        } else {
            metrics.failed_requests += 1;
        }
    }
}
