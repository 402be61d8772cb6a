//! Mesh configuration.
//!
//! One document covers the whole core: bus capacities, timeout layers,
//! heartbeat cadence, and feature toggles. Loadable from YAML so
//! deployments and tests can supply alternatives; every field has the
//! documented default.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use amcp_bus::BusConfig;
use amcp_correlation::TrackerConfig;
use amcp_registry::RegistryConfig;

/// Full configuration surface of the mesh core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeshConfig {
    /// Concurrent `process_request` calls admitted.
    pub max_concurrent_requests: usize,
    /// Per-request base timeout in milliseconds (scaled by task count,
    /// capped at five minutes).
    pub default_timeout_ms: u64,
    /// Per-task reply timeout in milliseconds.
    pub task_timeout_ms: u64,
    /// Per-LLM-call timeout in milliseconds.
    pub llm_timeout_ms: u64,
    /// Retry attempts per task before fallback gives up.
    pub task_retry_attempts: u32,
    /// Apply retry/emergency fallback strategies.
    pub enable_fallback_strategies: bool,
    /// Run the health monitor.
    pub enable_health_monitoring: bool,
    /// Score prompts and record prompt performance.
    pub enable_prompt_optimization: bool,
    /// Agent heartbeat interval in seconds.
    pub heartbeat_interval_sec: u64,
    /// Window in seconds after which a silent agent is stale.
    pub heartbeat_stale_sec: u64,
    /// Correlation sweeper cadence in milliseconds.
    pub correlation_sweep_ms: u64,
    /// Soft cap per bus subscription queue.
    pub subscription_queue_cap: usize,
    /// Parallel handler invocations per unordered subscription.
    pub subscription_concurrency: usize,
    /// Route undeliverable events to `sys.deadletter.*`.
    pub deadletter_enabled: bool,
    /// Model used when a request does not name one.
    pub default_model: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 100,
            default_timeout_ms: 30_000,
            task_timeout_ms: 15_000,
            llm_timeout_ms: 30_000,
            task_retry_attempts: 2,
            enable_fallback_strategies: true,
            enable_health_monitoring: true,
            enable_prompt_optimization: true,
            heartbeat_interval_sec: 30,
            heartbeat_stale_sec: 120,
            correlation_sweep_ms: 1_000,
            subscription_queue_cap: 10_000,
            subscription_concurrency: 16,
            deadletter_enabled: true,
            default_model: "llama3".to_string(),
        }
    }
}

impl MeshConfig {
    /// Load configuration from a YAML file; absent fields keep defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        info!(path = %path.display(), "mesh configuration loaded");
        Ok(config)
    }

    /// Validate field ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            anyhow::bail!("maxConcurrentRequests must be positive");
        }
        if self.default_timeout_ms == 0 || self.task_timeout_ms == 0 || self.llm_timeout_ms == 0 {
            anyhow::bail!("timeouts must be positive");
        }
        if self.correlation_sweep_ms == 0 {
            anyhow::bail!("correlationSweepMs must be positive");
        }
        if self.subscription_queue_cap == 0 || self.subscription_concurrency == 0 {
            anyhow::bail!("subscription bounds must be positive");
        }
        if self.heartbeat_stale_sec < self.heartbeat_interval_sec {
            anyhow::bail!("heartbeatStaleSec must be at least heartbeatIntervalSec");
        }
        if self.default_model.is_empty() {
            anyhow::bail!("defaultModel cannot be empty");
        }
        Ok(())
    }

    /// Bus configuration slice.
    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            queue_capacity: self.subscription_queue_cap,
            subscription_concurrency: self.subscription_concurrency,
            deadletter_enabled: self.deadletter_enabled,
            ..BusConfig::default()
        }
    }

    /// Correlation tracker configuration slice.
    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            sweep_interval: Duration::from_millis(self.correlation_sweep_ms),
            ..TrackerConfig::default()
        }
    }

    /// Capability registry configuration slice.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_sec),
            stale_after: Duration::from_secs(self.heartbeat_stale_sec),
        }
    }

    /// Per-task timeout as a [`Duration`].
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Per-LLM-call timeout as a [`Duration`], for building the gateway
    /// configuration.
    pub fn llm_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_timeout_ms)
    }

    /// Root timeout for a request with `task_count` tasks: the per-request
    /// base scaled by task count, capped at five minutes.
    pub fn request_timeout(&self, task_count: usize) -> Duration {
        let scaled = self.default_timeout_ms.saturating_mul(task_count.max(1) as u64);
        Duration::from_millis(scaled.min(300_000))
    }
}
