//! LLM-driven task planning.
//!
//! The planner builds a task-planning prompt, calls the completion
//! endpoint, and parses the JSON reply into a [`TaskPlan`]. Invalid output
//! is retried with a repair prompt quoting the bad response, up to two
//! repair rounds; a final failure degrades to a single-task
//! `general.fallback` plan so the pipeline always has something to
//! dispatch.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use amcp_llm_gateway::{CompletionRequest, LlmGateway};
use amcp_prompt::{PromptEngine, PromptKind};
use amcp_types::{CapabilityRecord, TaskDefinition, TaskPlan};

/// Capability of the degenerate plan emitted when planning fails outright.
pub const FALLBACK_CAPABILITY: &str = "general.fallback";

/// Repair rounds after the first failed attempt.
pub const MAX_REPAIR_ATTEMPTS: u32 = 2;

/// LLM-backed task planner.
pub struct TaskPlanner {
    engine: Arc<PromptEngine>,
    gateway: Arc<LlmGateway>,
    record_performance: bool,
}

impl TaskPlanner {
    /// Create a planner over a prompt engine and gateway.
    pub fn new(engine: Arc<PromptEngine>, gateway: Arc<LlmGateway>, record_performance: bool) -> Self {
        Self {
            engine,
            gateway,
            record_performance,
        }
    }

    /// Plan a query against the available agents.
    ///
    /// Never fails: exhausted repair attempts yield the degenerate
    /// fallback plan.
    pub async fn plan(
        &self,
        query: &str,
        available_agents: &[CapabilityRecord],
        correlation_id: &str,
        model: &str,
        cancel: &CancellationToken,
    ) -> TaskPlan {
        let base_prompt = self
            .engine
            .build_task_planning_prompt(query, available_agents, model);

        let mut last_failure: Option<(String, String)> = None;
        for attempt in 0..=MAX_REPAIR_ATTEMPTS {
            let prompt = match &last_failure {
                None => base_prompt.clone(),
                Some((bad_output, error)) => repair_prompt(&base_prompt, bad_output, error),
            };

            let started = Instant::now();
            let completion = match CompletionRequest::new(prompt) {
                Ok(request) => {
                    self.gateway
                        .complete_cancellable(
                            request.with_model(model).with_source("task-planner"),
                            cancel,
                        )
                        .await
                }
                Err(e) => {
                    warn!(correlation_id, error = %e, "planning prompt rejected");
                    break;
                }
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            let raw = match completion {
                Ok(response) => response.content().to_string(),
                Err(e) => {
                    warn!(correlation_id, attempt, error = %e, "planning LLM call failed");
                    self.record(model, false, latency_ms);
                    // Endpoint failures are not repairable by quoting output.
                    if matches!(
                        e,
                        amcp_llm_gateway::GatewayError::Cancelled
                            | amcp_llm_gateway::GatewayError::RateLimited(_)
                    ) {
                        break;
                    }
                    continue;
                }
            };

            match parse_plan(&raw, available_agents) {
                Ok(plan) => {
                    self.record(model, true, latency_ms);
                    info!(
                        correlation_id,
                        tasks = plan.tasks.len(),
                        confidence = plan.confidence,
                        attempt,
                        "task plan accepted"
                    );
                    return plan;
                }
                Err(error) => {
                    warn!(correlation_id, attempt, error = error.as_str(), "task plan rejected");
                    self.record(model, false, latency_ms);
                    last_failure = Some((raw, error));
                }
            }
        }

        warn!(correlation_id, "planning failed, emitting degenerate fallback plan");
        degenerate_plan(query)
    }

    fn record(&self, model: &str, success: bool, latency_ms: u64) {
        if self.record_performance {
            self.engine
                .record_performance(PromptKind::TaskPlanning, model, success, latency_ms);
        }
    }
}

/// Single-task plan that routes the raw query to the fallback capability.
pub fn degenerate_plan(query: &str) -> TaskPlan {
    TaskPlan {
        tasks: vec![TaskDefinition {
            task_id: "fallback-1".to_string(),
            capability: FALLBACK_CAPABILITY.to_string(),
            target_agent: None,
            parameters: [("query".to_string(), json!(query))].into_iter().collect(),
            priority: 5,
            dependencies: Vec::new(),
            optional: false,
        }],
        confidence: 0.0,
    }
}

fn repair_prompt(base: &str, bad_output: &str, error: &str) -> String {
    format!(
        "{base}\n### Repair\nYour previous output was rejected: {error}\n\
         Previous output:\n{bad_output}\n\
         Produce a corrected JSON object only, fixing exactly this problem.\n"
    )
}

/// Strip optional Markdown code fences around a JSON body.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

/// Parse and validate a plan from raw model output.
fn parse_plan(raw: &str, available_agents: &[CapabilityRecord]) -> Result<TaskPlan, String> {
    let body = strip_code_fences(raw);
    let plan: TaskPlan =
        serde_json::from_str(body).map_err(|e| format!("unparseable JSON: {e}"))?;
    plan.validate().map_err(|e| e.to_string())?;

    for task in &plan.tasks {
        if task.optional || task.capability == FALLBACK_CAPABILITY {
            continue;
        }
        let known = available_agents
            .iter()
            .any(|record| record.matches_capability(&task.capability));
        if !known {
            return Err(format!(
                "task {:?} names unknown capability {:?}",
                task.task_id, task.capability
            ));
        }
    }
    debug!(tasks = plan.tasks.len(), "plan parsed");
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use amcp_types::AgentId;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn agents() -> Vec<CapabilityRecord> {
        vec![CapabilityRecord {
            agent_id: AgentId::named("weather").unwrap(),
            agent_type: "WeatherAgent".to_string(),
            capabilities: ["weather.get".to_string()]
                .into_iter()
                .collect::<BTreeSet<_>>(),
            description: String::new(),
            endpoint: "weather".to_string(),
            registered_at: Utc::now(),
            metadata: Default::default(),
        }]
    }

    const VALID: &str = r#"{"tasks": [{"id": "t1", "capability": "weather.get", "agent": "WeatherAgent", "parameters": {"location": "Paris"}, "priority": 1, "dependencies": []}], "confidence": 0.95}"#;

    #[test]
    fn test_valid_plan_parses() {
        let plan = parse_plan(VALID, &agents()).unwrap();
        assert_eq!(plan.tasks[0].capability, "weather.get");
    }

    #[test]
    fn test_code_fences_are_stripped() {
        let fenced = format!("```json\n{VALID}\n```");
        assert!(parse_plan(&fenced, &agents()).is_ok());
    }

    #[test]
    fn test_unknown_capability_is_rejected() {
        let raw = r#"{"tasks": [{"id": "t1", "capability": "time.travel", "parameters": {}, "priority": 1, "dependencies": []}], "confidence": 0.9}"#;
        let err = parse_plan(raw, &agents()).unwrap_err();
        assert!(err.contains("time.travel"));

        // Optional tasks may name unknown capabilities.
        let raw = r#"{"tasks": [{"id": "t1", "capability": "time.travel", "parameters": {}, "priority": 1, "dependencies": [], "optional": true}], "confidence": 0.9}"#;
        assert!(parse_plan(raw, &agents()).is_ok());
    }

    #[test]
    fn test_cycles_are_rejected() {
        let raw = r#"{"tasks": [
            {"id": "t1", "capability": "weather.get", "parameters": {}, "priority": 1, "dependencies": ["t2"]},
            {"id": "t2", "capability": "weather.get", "parameters": {}, "priority": 1, "dependencies": ["t1"]}
        ], "confidence": 0.9}"#;
        assert!(parse_plan(raw, &agents()).is_err());
    }

    #[test]
    fn test_degenerate_plan_is_valid() {
        let plan = degenerate_plan("help me");
        assert!(plan.validate().is_ok());
        assert_eq!(plan.tasks[0].capability, FALLBACK_CAPABILITY);
        assert_eq!(plan.tasks[0].parameters["query"], json!("help me"));
    }
}
