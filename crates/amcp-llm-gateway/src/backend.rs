//! Completion backends.
//!
//! [`HttpCompletionBackend`] speaks the generic completion contract: POST
//! `{prompt, model, temperature?, max_tokens?, stream}` and read back either
//! one `{response, done}` object or an NDJSON stream of fragments that are
//! concatenated until `done` is true (or the stream ends).

use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use crate::{CompletionRequest, CompletionResponse};

/// Trait every completion backend implements.
#[async_trait::async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Complete a text generation request.
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;

    /// Backend name for logging and metrics.
    fn backend_name(&self) -> &'static str;

    /// Default model used when the request does not name one.
    fn model_name(&self) -> &str;

    /// Probe the backend with a minimal request.
    async fn health_check(&self) -> Result<()> {
        let request = CompletionRequest::new("ping")
            .map_err(|e| anyhow::anyhow!(e.to_string()))?
            .with_max_tokens(1);
        self.complete(&request).await.map(|_| ())
    }
}

#[derive(Debug, Serialize)]
struct EndpointRequest<'a> {
    prompt: &'a str,
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct EndpointFragment {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

/// HTTP backend for the generic completion endpoint.
pub struct HttpCompletionBackend {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: Option<Secret<String>>,
}

impl HttpCompletionBackend {
    /// Create a backend. `endpoint` is the full completion URL.
    pub fn new(
        endpoint: impl AsRef<str>,
        model: impl Into<String>,
        api_key: Option<Secret<String>>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint.as_ref()).context("invalid completion endpoint URL")?;
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent("amcp-llm-gateway/0.2")
            .build()
            .context("failed to build HTTP client")?;
        debug!(endpoint = %endpoint, "initialized completion backend");
        Ok(Self {
            client,
            endpoint,
            model: model.into(),
            api_key,
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = &self.api_key {
            let value = format!("Bearer {}", api_key.expose_secret());
            let mut value =
                HeaderValue::from_str(&value).context("invalid authorization header value")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

#[async_trait::async_trait]
impl CompletionBackend for HttpCompletionBackend {
    #[instrument(skip(self, request), fields(model = %self.model))]
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let started = std::time::Instant::now();
        let model = request.model().unwrap_or(&self.model);

        let body = EndpointRequest {
            prompt: request.prompt(),
            model,
            temperature: request.temperature(),
            max_tokens: request.max_tokens(),
            stream: true,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .context("failed to reach completion endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            anyhow::bail!("completion endpoint error {status}: {error_text}");
        }

        // The body is either one JSON object or an NDJSON fragment stream;
        // both reduce to "parse each line, concatenate response fields".
        let mut content = String::new();
        let mut fragments = 0u32;
        let mut buffer = Vec::new();
        let mut done = false;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("completion stream failed")?;
            buffer.extend_from_slice(&chunk);
            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                if append_fragment(&line, &mut content, &mut fragments)? {
                    done = true;
                }
            }
            if done {
                break;
            }
        }
        if !done && !buffer.is_empty() {
            append_fragment(&buffer, &mut content, &mut fragments)?;
        }

        if content.is_empty() {
            anyhow::bail!("empty response from completion endpoint");
        }
        debug!(
            fragments,
            duration_ms = started.elapsed().as_millis() as u64,
            "completion endpoint responded"
        );
        CompletionResponse::new(content, model.to_string(), started.elapsed(), fragments.max(1))
    }

    fn backend_name(&self) -> &'static str {
        "http"
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Parse one NDJSON line and append its text. Returns true when the
/// fragment carries `done: true`.
fn append_fragment(line: &[u8], content: &mut String, fragments: &mut u32) -> Result<bool> {
    let line = std::str::from_utf8(line)
        .context("completion fragment is not UTF-8")?
        .trim();
    if line.is_empty() {
        return Ok(false);
    }
    let fragment: EndpointFragment =
        serde_json::from_str(line).context("unparseable completion fragment")?;
    content.push_str(&fragment.response);
    *fragments += 1;
    Ok(fragment.done)
}
