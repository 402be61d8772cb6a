//! Retry policy and emergency responses.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use amcp_types::{ErrorCode, TaskError};

/// Per-task retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per task (first try included).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Delay ceiling.
    pub max_delay: Duration,
    /// Exponential growth factor.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let delay = self.base_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }
}

/// Failure categories the emergency dictionary is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    /// A task or the whole request timed out.
    Timeout,
    /// No agent could serve the request.
    Unavailable,
    /// The caller was not authorized.
    Unauthorized,
    /// Parameters could not be understood.
    InvalidInput,
    /// Response synthesis itself failed.
    Synthesis,
    /// Anything else.
    General,
}

impl From<ErrorCode> for FailureCategory {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::TaskTimeout => Self::Timeout,
            ErrorCode::AgentUnavailable => Self::Unavailable,
            ErrorCode::Unauthorized => Self::Unauthorized,
            ErrorCode::InvalidParameters => Self::InvalidInput,
            ErrorCode::ExecutionFailed => Self::General,
        }
    }
}

/// Applies retry policy and composes emergency responses.
#[derive(Debug, Clone)]
pub struct FallbackManager {
    policy: RetryPolicy,
    emergency: HashMap<FailureCategory, String>,
}

impl Default for FallbackManager {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl FallbackManager {
    /// Create a manager with the canned emergency dictionary.
    pub fn new(policy: RetryPolicy) -> Self {
        let mut emergency = HashMap::new();
        emergency.insert(
            FailureCategory::Timeout,
            "The request \"{task}\" did not complete in time. Please try again.".to_string(),
        );
        emergency.insert(
            FailureCategory::Unavailable,
            "No agent is currently available to handle \"{task}\".".to_string(),
        );
        emergency.insert(
            FailureCategory::Unauthorized,
            "You are not authorized to request \"{task}\".".to_string(),
        );
        emergency.insert(
            FailureCategory::InvalidInput,
            "I could not understand the parameters of \"{task}\".".to_string(),
        );
        emergency.insert(
            FailureCategory::Synthesis,
            "I gathered results for \"{task}\" but could not compose an answer.".to_string(),
        );
        emergency.insert(
            FailureCategory::General,
            "I cannot process this request right now.".to_string(),
        );
        Self { policy, emergency }
    }

    /// The retry policy in effect.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether a failed attempt should be retried. Non-retryable error
    /// codes (unauthorized, invalid parameters) short-circuit regardless of
    /// remaining attempts.
    pub fn should_retry(&self, error: &TaskError, attempt: u32) -> bool {
        if attempt >= self.policy.max_attempts {
            return false;
        }
        let retryable = error.code.is_retryable();
        debug!(
            code = %error.code,
            attempt,
            max_attempts = self.policy.max_attempts,
            retryable,
            "fallback retry decision"
        );
        retryable
    }

    /// Compose the canned message for a failure category, interpolating the
    /// original task description.
    pub fn emergency_response(&self, category: FailureCategory, task_description: &str) -> String {
        let template = self
            .emergency
            .get(&category)
            .or_else(|| self.emergency.get(&FailureCategory::General))
            .cloned()
            .unwrap_or_else(|| "I cannot process this request right now.".to_string());
        template.replace("{task}", task_description)
    }

    /// Replace a category's canned message.
    pub fn set_emergency_response(&mut self, category: FailureCategory, template: String) {
        self.emergency.insert(category, template);
    }
}
