//! Gateway configuration.
//!
//! Loaded from the environment so deployments never write API keys to
//! disk. The key is moved straight into a [`Secret`] and is zeroized when
//! the configuration is dropped.

use std::time::Duration;

use anyhow::{Context, Result};
use secrecy::Secret;
use tracing::debug;

use crate::backend::{CompletionBackend, HttpCompletionBackend};

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default requests-per-minute allowance per source.
pub const DEFAULT_RATE_LIMIT: u32 = 60;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Full URL of the completion endpoint.
    pub endpoint: String,
    /// Default model name sent with requests.
    pub model: String,
    /// Optional bearer token for the endpoint.
    pub api_key: Option<Secret<String>>,
    /// Per-call timeout applied by the gateway.
    pub call_timeout: Duration,
    /// Requests per minute allowed per source.
    pub rate_limit_per_minute: u32,
}

impl GatewayConfig {
    /// Configuration for a local endpoint with defaults.
    pub fn for_endpoint(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            rate_limit_per_minute: DEFAULT_RATE_LIMIT,
        }
    }

    /// Load configuration from `AMCP_LLM_*` environment variables:
    /// `AMCP_LLM_ENDPOINT` (required), `AMCP_LLM_MODEL` (required),
    /// `AMCP_LLM_API_KEY`, `AMCP_LLM_TIMEOUT_SECS`,
    /// `AMCP_LLM_RATE_LIMIT_PER_MIN`.
    pub fn from_env() -> Result<Self> {
        let endpoint =
            std::env::var("AMCP_LLM_ENDPOINT").context("AMCP_LLM_ENDPOINT is not set")?;
        let model = std::env::var("AMCP_LLM_MODEL").context("AMCP_LLM_MODEL is not set")?;
        let api_key = std::env::var("AMCP_LLM_API_KEY").ok().map(Secret::new);
        let call_timeout = match std::env::var("AMCP_LLM_TIMEOUT_SECS") {
            Ok(raw) => Duration::from_secs(
                raw.parse::<u64>()
                    .context("AMCP_LLM_TIMEOUT_SECS is not a number")?,
            ),
            Err(_) => DEFAULT_CALL_TIMEOUT,
        };
        let rate_limit_per_minute = match std::env::var("AMCP_LLM_RATE_LIMIT_PER_MIN") {
            Ok(raw) => raw
                .parse::<u32>()
                .context("AMCP_LLM_RATE_LIMIT_PER_MIN is not a number")?,
            Err(_) => DEFAULT_RATE_LIMIT,
        };

        debug!(endpoint = endpoint.as_str(), model = model.as_str(), "gateway config loaded");
        Ok(Self {
            endpoint,
            model,
            api_key,
            call_timeout,
            rate_limit_per_minute,
        })
    }

    /// Build the HTTP backend this configuration describes.
    pub fn create_backend(&self) -> Result<Box<dyn CompletionBackend>> {
        // The HTTP client gets a slightly larger timeout than the gateway so
        // the gateway's own deadline fires first and is attributed correctly.
        let client_timeout = self.call_timeout + Duration::from_secs(5);
        Ok(Box::new(HttpCompletionBackend::new(
            &self.endpoint,
            self.model.clone(),
            self.api_key.clone(),
            client_timeout,
        )?))
    }

    /// Validate field ranges.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            anyhow::bail!("completion endpoint cannot be empty");
        }
        if self.model.is_empty() {
            anyhow::bail!("model name cannot be empty");
        }
        if self.call_timeout.is_zero() {
            anyhow::bail!("call timeout must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GatewayConfig::for_endpoint("http://localhost:11434/api/generate", "llama3");
        assert!(config.validate().is_ok());
        assert_eq!(config.call_timeout, DEFAULT_CALL_TIMEOUT);
        assert_eq!(config.rate_limit_per_minute, DEFAULT_RATE_LIMIT);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn validation_catches_empty_fields() {
        let mut config = GatewayConfig::for_endpoint("", "llama3");
        assert!(config.validate().is_err());
        config.endpoint = "http://localhost:1".to_string();
        config.model = String::new();
        assert!(config.validate().is_err());
    }
}
