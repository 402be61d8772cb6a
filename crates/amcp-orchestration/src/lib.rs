#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **amcp-orchestration** – LLM-driven orchestration engine for the AMCP
//! mesh.
//!
//! The [`Orchestrator`] runs the end-to-end pipeline: plan → dispatch →
//! gather → synthesize. A user query is decomposed by the
//! [`TaskPlanner`], each task is published as an event on
//! `orchestrator.task.request` with its own correlation context, replies
//! are collected on `orchestrator.task.response`, failures run through the
//! [`FallbackManager`], and the final answer is synthesized by the LLM
//! from the per-task results.
//!
//! Status semantics: all tasks succeeded → `Success`; a mix →
//! `PartialSuccess` (the synthesized answer flags what is missing); all
//! failed, or synthesis itself failed → `Failed` with a deterministic
//! emergency message.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use amcp_bus::{handler_fn, EventBus, SubscribeOptions, SubscriptionHandle};
use amcp_correlation::{CorrelationError, CorrelationTracker};
use amcp_llm_gateway::{CompletionRequest, LlmGateway};
use amcp_prompt::{PromptEngine, PromptKind, TaskResultSummary};
use amcp_registry::CapabilityRegistry;
use amcp_types::{
    well_known, AgentId, DeliveryOptions, ErrorCode, Event, EventPayload, TaskDefinition,
    TaskError, TaskPlan, TaskRequest, TaskResponse, TopicPattern, UserContext,
    MAX_TASK_DESCRIPTION_LEN,
};

pub mod config;
pub mod dependency;
pub mod fallback;
pub mod health;
pub mod planner;

pub use config::MeshConfig;
pub use dependency::TaskDagResolver;
pub use fallback::{FailureCategory, FallbackManager, RetryPolicy};
pub use health::{Alert, AlertHandler, HealthLevel, HealthMonitor, MetricKey};
pub use planner::{degenerate_plan, TaskPlanner, FALLBACK_CAPABILITY};

/// Topic the final per-request response event is published on.
pub const RESPONSE_TOPIC: &str = "orchestrator.response";

/// A natural-language request entering the pipeline.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorRequest {
    /// The user query.
    pub task_description: String,
    /// Structured input accompanying the query; keys are normalized before
    /// dispatch.
    pub input_data: HashMap<String, Value>,
    /// If non-empty, restricts planning to agents matching these
    /// capabilities.
    pub agent_capabilities: Vec<String>,
    /// Model override for this request.
    pub model: Option<String>,
    /// Caller metadata threaded into each task's user context.
    pub metadata: HashMap<String, Value>,
}

impl OrchestratorRequest {
    /// Request with just a query. Fails on an empty or oversized
    /// description.
    pub fn new(task_description: impl Into<String>) -> Result<Self, String> {
        let request = Self {
            task_description: task_description.into(),
            ..Self::default()
        };
        request.validate()?;
        Ok(request)
    }

    /// Validate an existing request.
    ///
    /// Bounds the description length to prevent memory exhaustion through
    /// unbounded prompt construction.
    pub fn validate(&self) -> Result<(), String> {
        if self.task_description.trim().is_empty() {
            return Err("task description cannot be empty".to_string());
        }
        if self.task_description.len() > MAX_TASK_DESCRIPTION_LEN {
            return Err(format!(
                "task description too long: {} > {}",
                self.task_description.len(),
                MAX_TASK_DESCRIPTION_LEN
            ));
        }
        Ok(())
    }
}

/// Outcome class of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Every task succeeded and synthesis produced an answer.
    Success,
    /// At least one task succeeded and at least one failed.
    PartialSuccess,
    /// No task succeeded, or synthesis failed.
    Failed,
}

/// The response handed back to the caller.
#[derive(Debug, Clone)]
pub struct OrchestratorResponse {
    /// Root correlation id of the request.
    pub correlation_id: String,
    /// Outcome class.
    pub status: RequestStatus,
    /// Per-task results, keyed by task id.
    pub results: HashMap<String, Value>,
    /// Per-task errors for tasks that failed, keyed by task id.
    pub failed_tasks: HashMap<String, TaskError>,
    /// Synthesized natural-language answer (or emergency message).
    pub response: String,
    /// The plan that was executed.
    pub task_plan: TaskPlan,
    /// End-to-end processing time in milliseconds.
    pub processing_time_ms: u64,
    /// Completion timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Rolling orchestrator metrics.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorMetrics {
    /// Requests processed.
    pub total_requests: u64,
    /// Requests that ended `Success`.
    pub successes: u64,
    /// Requests that ended `PartialSuccess`.
    pub partial_successes: u64,
    /// Requests that ended `Failed`.
    pub failures: u64,
    /// Rolling average end-to-end time in milliseconds.
    pub avg_processing_ms: f64,
}

impl OrchestratorMetrics {
    /// Fraction of requests that ended `Success`.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.successes as f64 / self.total_requests as f64
    }
}

struct OrchestratorInner {
    config: MeshConfig,
    bus: Arc<dyn EventBus>,
    registry: CapabilityRegistry,
    tracker: CorrelationTracker,
    gateway: Arc<LlmGateway>,
    engine: Arc<PromptEngine>,
    planner: TaskPlanner,
    fallback: FallbackManager,
    health: Arc<HealthMonitor>,
    admission: Semaphore,
    metrics: Mutex<OrchestratorMetrics>,
    response_subscription: Mutex<Option<SubscriptionHandle>>,
}

/// The orchestration engine.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    /// Build an orchestrator and subscribe it to
    /// `orchestrator.task.response`.
    pub async fn new(
        config: MeshConfig,
        bus: Arc<dyn EventBus>,
        registry: CapabilityRegistry,
        gateway: Arc<LlmGateway>,
    ) -> anyhow::Result<Self> {
        Self::with_engine(config, bus, registry, gateway, Arc::new(PromptEngine::builtin())).await
    }

    /// Build an orchestrator over a custom prompt engine (alternative
    /// profile documents, test libraries).
    pub async fn with_engine(
        config: MeshConfig,
        bus: Arc<dyn EventBus>,
        registry: CapabilityRegistry,
        gateway: Arc<LlmGateway>,
        engine: Arc<PromptEngine>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let tracker = CorrelationTracker::new(config.tracker_config());
        let planner = TaskPlanner::new(
            engine.clone(),
            gateway.clone(),
            config.enable_prompt_optimization,
        );
        let fallback = FallbackManager::new(RetryPolicy {
            max_attempts: config.task_retry_attempts.max(1),
            ..RetryPolicy::default()
        });
        let health = Arc::new(HealthMonitor::default());
        if config.enable_health_monitoring {
            health.attach_bus(bus.clone()).await;
        }

        let orchestrator = Self {
            inner: Arc::new(OrchestratorInner {
                admission: Semaphore::new(config.max_concurrent_requests),
                config,
                bus,
                registry,
                tracker,
                gateway,
                engine,
                planner,
                fallback,
                health,
                metrics: Mutex::new(OrchestratorMetrics::default()),
                response_subscription: Mutex::new(None),
            }),
        };
        orchestrator.subscribe_responses()?;
        info!("orchestrator initialized");
        Ok(orchestrator)
    }

    /// The health monitor.
    pub fn health(&self) -> Arc<HealthMonitor> {
        self.inner.health.clone()
    }

    /// The correlation tracker.
    pub fn tracker(&self) -> &CorrelationTracker {
        &self.inner.tracker
    }

    /// Snapshot of the rolling metrics.
    pub fn metrics(&self) -> OrchestratorMetrics {
        self.inner.metrics.lock().expect("metrics lock poisoned").clone()
    }

    /// Run the full pipeline for one request.
    pub async fn process_request(&self, request: OrchestratorRequest) -> OrchestratorResponse {
        let started = Instant::now();
        let root_id = Uuid::new_v4().to_string();
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.inner.config.default_model.clone());
        // Requests can arrive as bare struct literals, so the bounds are
        // re-checked here, not only in the constructor.
        if let Err(reason) = request.validate() {
            warn!(
                correlation_id = root_id.as_str(),
                reason = reason.as_str(),
                "rejecting invalid request"
            );
            // Keep the emergency message bounded even when the rejection
            // was for an oversized description.
            let brief: String = request.task_description.chars().take(120).collect();
            return self.failed_response(
                root_id,
                TaskPlan {
                    tasks: Vec::new(),
                    confidence: 0.0,
                },
                HashMap::new(),
                HashMap::new(),
                FailureCategory::InvalidInput,
                &brief,
                started,
            );
        }
        info!(
            correlation_id = root_id.as_str(),
            model = model.as_str(),
            query = request.task_description.as_str(),
            "processing request"
        );

        let _permit = match self.inner.admission.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return self.failed_response(
                    root_id,
                    degenerate_plan(&request.task_description),
                    HashMap::new(),
                    HashMap::new(),
                    FailureCategory::General,
                    &request.task_description,
                    started,
                );
            }
        };

        // Normalize the structured input before it reaches any agent.
        let input = normalize_input(&request.input_data);

        // Snapshot the directory, optionally restricted by the caller.
        let mut agents = self.inner.registry.list_all();
        if !request.agent_capabilities.is_empty() {
            agents.retain(|record| {
                request
                    .agent_capabilities
                    .iter()
                    .any(|capability| record.matches_capability(capability))
            });
        }

        let plan = self
            .inner
            .planner
            .plan(
                &request.task_description,
                &agents,
                &root_id,
                &model,
                &tokio_util::sync::CancellationToken::new(),
            )
            .await;

        let root_timeout = self.inner.config.request_timeout(plan.tasks.len());
        if let Err(e) = self.inner.tracker.create(
            root_id.clone(),
            "orchestration",
            input.clone(),
            root_timeout.as_secs().max(1),
        ) {
            error!(correlation_id = root_id.as_str(), error = %e, "failed to create root correlation");
            return self.failed_response(
                root_id,
                plan,
                HashMap::new(),
                HashMap::new(),
                FailureCategory::General,
                &request.task_description,
                started,
            );
        }

        let results: Arc<Mutex<HashMap<String, Value>>> = Arc::new(Mutex::new(HashMap::new()));
        let failures: Arc<Mutex<HashMap<String, TaskError>>> = Arc::new(Mutex::new(HashMap::new()));

        let gather = self.run_plan(
            root_id.clone(),
            plan.clone(),
            input.clone(),
            user_context_from(&request),
            results.clone(),
            failures.clone(),
        );
        if tokio::time::timeout(root_timeout, gather).await.is_err() {
            warn!(correlation_id = root_id.as_str(), "request timed out, cancelling children");
            self.inner.tracker.cancel(&root_id);
            let mut failures = failures.lock().expect("failures lock poisoned");
            let results = results.lock().expect("results lock poisoned");
            for task in &plan.tasks {
                if !results.contains_key(&task.task_id) && !failures.contains_key(&task.task_id) {
                    failures.insert(
                        task.task_id.clone(),
                        TaskError::new(ErrorCode::TaskTimeout, "request deadline exceeded"),
                    );
                }
            }
        }

        let results = Arc::try_unwrap(results)
            .map(|m| m.into_inner().expect("results lock poisoned"))
            .unwrap_or_else(|arc| arc.lock().expect("results lock poisoned").clone());
        let failures = Arc::try_unwrap(failures)
            .map(|m| m.into_inner().expect("failures lock poisoned"))
            .unwrap_or_else(|arc| arc.lock().expect("failures lock poisoned").clone());

        // Synthesize the final answer from the per-task outcomes.
        let synthesis = self
            .synthesize(&request.task_description, &plan, &results, &failures, &model)
            .await;

        let status = match synthesis {
            Ok(_) if failures.is_empty() => RequestStatus::Success,
            Ok(_) if !results.is_empty() => RequestStatus::PartialSuccess,
            Ok(_) => RequestStatus::Failed,
            Err(_) => RequestStatus::Failed,
        };
        let response_text = match synthesis {
            Ok(text) => text,
            Err(e) => {
                error!(correlation_id = root_id.as_str(), error = %e, "response synthesis failed");
                self.inner
                    .fallback
                    .emergency_response(FailureCategory::Synthesis, &request.task_description)
            }
        };

        match status {
            RequestStatus::Success => {
                self.inner
                    .tracker
                    .complete(&root_id, json!({ "results": results }));
            }
            RequestStatus::PartialSuccess | RequestStatus::Failed => {
                self.inner.tracker.fail(
                    &root_id,
                    format!("{} of {} tasks failed", failures.len(), plan.tasks.len()),
                );
            }
        }

        self.publish_response(&root_id, status, &response_text, started).await;
        self.record_request(status, started);

        OrchestratorResponse {
            correlation_id: root_id,
            status,
            results,
            failed_tasks: failures,
            response: response_text,
            task_plan: plan,
            processing_time_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    /// Stop collecting replies and the correlation sweeper.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .inner
            .response_subscription
            .lock()
            .expect("subscription lock poisoned")
            .take()
        {
            let _ = self.inner.bus.unsubscribe(&handle);
        }
        self.inner.tracker.shutdown();
        info!("orchestrator shut down");
    }

    /// Dispatch tasks in dependency order, collecting outcomes into the
    /// shared maps as they arrive.
    async fn run_plan(
        &self,
        root_id: String,
        plan: TaskPlan,
        input: HashMap<String, Value>,
        user_context: UserContext,
        results: Arc<Mutex<HashMap<String, Value>>>,
        failures: Arc<Mutex<HashMap<String, TaskError>>>,
    ) {
        let resolver = TaskDagResolver::new(&plan);
        let mut succeeded: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut join_set: JoinSet<(String, Result<Value, TaskError>)> = JoinSet::new();

        loop {
            for task in resolver.ready_tasks(&succeeded, &failed, &in_flight) {
                in_flight.insert(task.task_id.clone());
                let inner = self.inner.clone();
                let root = root_id.clone();
                let task = task.clone();
                let input = input.clone();
                let user_context = user_context.clone();
                join_set.spawn(async move {
                    let task_id = task.task_id.clone();
                    let outcome = execute_task(inner, root, task, input, user_context).await;
                    (task_id, outcome)
                });
            }

            for task in resolver.blocked_by_failure(&succeeded, &failed) {
                if in_flight.contains(&task.task_id) {
                    continue;
                }
                warn!(task = task.task_id.as_str(), "skipping task with failed dependency");
                failed.insert(task.task_id.clone());
                failures.lock().expect("failures lock poisoned").insert(
                    task.task_id.clone(),
                    TaskError::new(ErrorCode::ExecutionFailed, "a required dependency failed"),
                );
            }

            if resolver.all_terminal(&succeeded, &failed) {
                break;
            }

            match join_set.join_next().await {
                Some(Ok((task_id, outcome))) => {
                    in_flight.remove(&task_id);
                    match outcome {
                        Ok(value) => {
                            succeeded.insert(task_id.clone());
                            results
                                .lock()
                                .expect("results lock poisoned")
                                .insert(task_id, value);
                        }
                        Err(task_error) => {
                            failed.insert(task_id.clone());
                            failures
                                .lock()
                                .expect("failures lock poisoned")
                                .insert(task_id, task_error);
                        }
                    }
                }
                Some(Err(join_error)) => {
                    error!(error = %join_error, "task execution future failed");
                }
                None => {
                    // Nothing running and nothing became ready: the
                    // blocked-by-failure pass will finish the plan.
                    if resolver
                        .ready_tasks(&succeeded, &failed, &in_flight)
                        .is_empty()
                        && resolver.blocked_by_failure(&succeeded, &failed).is_empty()
                    {
                        break;
                    }
                }
            }
        }
    }

    async fn synthesize(
        &self,
        query: &str,
        plan: &TaskPlan,
        results: &HashMap<String, Value>,
        failures: &HashMap<String, TaskError>,
        model: &str,
    ) -> anyhow::Result<String> {
        let mut summaries = Vec::with_capacity(plan.tasks.len());
        for task in &plan.tasks {
            if let Some(value) = results.get(&task.task_id) {
                summaries.push(TaskResultSummary {
                    task_id: task.task_id.clone(),
                    capability: task.capability.clone(),
                    success: true,
                    detail: value.clone(),
                });
            } else if let Some(task_error) = failures.get(&task.task_id) {
                summaries.push(TaskResultSummary {
                    task_id: task.task_id.clone(),
                    capability: task.capability.clone(),
                    success: false,
                    detail: json!({
                        "code": task_error.code,
                        "message": task_error.message,
                    }),
                });
            }
        }

        let prompt = self
            .inner
            .engine
            .build_response_synthesis_prompt(query, &summaries, model);
        let started = Instant::now();
        let completion = self
            .inner
            .gateway
            .complete(
                CompletionRequest::new(prompt)
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?
                    .with_model(model)
                    .with_source("synthesizer"),
            )
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;
        if self.inner.config.enable_prompt_optimization {
            self.inner.engine.record_performance(
                PromptKind::ResponseSynthesis,
                model,
                completion.is_ok(),
                latency_ms,
            );
        }
        Ok(completion?.content().to_string())
    }

    fn subscribe_responses(&self) -> anyhow::Result<()> {
        let tracker = self.inner.tracker.clone();
        let handle = self.inner.bus.subscribe(
            "orchestrator",
            TopicPattern::parse(well_known::TASK_RESPONSE)?,
            handler_fn(move |event| {
                let tracker = tracker.clone();
                async move {
                    let Some(correlation_id) = event.correlation_id().map(str::to_string) else {
                        warn!(event_id = event.id(), "task response without correlation id");
                        return Ok(());
                    };
                    match event.payload().decode::<TaskResponse>() {
                        Ok(response) if response.success => {
                            tracker.complete(&correlation_id, serde_json::to_value(&response)?);
                        }
                        Ok(response) => {
                            let task_error = response.error.clone().unwrap_or_else(|| {
                                TaskError::new(ErrorCode::ExecutionFailed, "agent reported failure")
                            });
                            tracker.fail(&correlation_id, serde_json::to_string(&task_error)?);
                        }
                        Err(e) => {
                            warn!(
                                correlation_id = correlation_id.as_str(),
                                error = %e,
                                "unparseable task response"
                            );
                            tracker.fail(
                                &correlation_id,
                                serde_json::to_string(&TaskError::new(
                                    ErrorCode::ExecutionFailed,
                                    "unparseable task response",
                                ))?,
                            );
                        }
                    }
                    Ok(())
                }
            }),
            SubscribeOptions::default(),
        )?;
        *self
            .inner
            .response_subscription
            .lock()
            .expect("subscription lock poisoned") = Some(handle);
        Ok(())
    }

    async fn publish_response(
        &self,
        correlation_id: &str,
        status: RequestStatus,
        response_text: &str,
        started: Instant,
    ) {
        let event = Event::new(
            RESPONSE_TOPIC,
            EventPayload::raw(json!({
                "correlationId": correlation_id,
                "status": status,
                "response": response_text,
                "processingTimeMs": started.elapsed().as_millis() as u64,
            })),
            AgentId::system(),
        );
        match event {
            Ok(event) => {
                let event = event
                    .with_correlation_id(correlation_id)
                    .with_delivery(DeliveryOptions::fire_and_forget());
                if let Err(e) = self.inner.bus.publish(event).await {
                    debug!(error = %e, "failed to publish final response event");
                }
            }
            Err(e) => debug!(error = %e, "failed to build final response event"),
        }
    }

    fn record_request(&self, status: RequestStatus, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as f64;
        {
            let mut metrics = self.inner.metrics.lock().expect("metrics lock poisoned");
            metrics.total_requests += 1;
            match status {
                RequestStatus::Success => metrics.successes += 1,
                RequestStatus::PartialSuccess => metrics.partial_successes += 1,
                RequestStatus::Failed => metrics.failures += 1,
            }
            let n = metrics.total_requests as f64;
            metrics.avg_processing_ms = (metrics.avg_processing_ms * (n - 1.0) + elapsed_ms) / n;
        }

        if self.inner.config.enable_health_monitoring {
            let outcome = match status {
                RequestStatus::Success => "success",
                RequestStatus::PartialSuccess => "partial",
                RequestStatus::Failed => "failed",
            };
            self.inner.health.increment(
                MetricKey::named("orchestrator.requests.total").with_tag("outcome", outcome),
            );
            self.inner.health.set_gauge(
                MetricKey::named("orchestrator.requests.success_rate"),
                self.metrics().success_rate(),
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn failed_response(
        &self,
        correlation_id: String,
        plan: TaskPlan,
        results: HashMap<String, Value>,
        failed_tasks: HashMap<String, TaskError>,
        category: FailureCategory,
        task_description: &str,
        started: Instant,
    ) -> OrchestratorResponse {
        self.record_request(RequestStatus::Failed, started);
        OrchestratorResponse {
            correlation_id,
            status: RequestStatus::Failed,
            results,
            failed_tasks,
            response: self
                .inner
                .fallback
                .emergency_response(category, task_description),
            task_plan: plan,
            processing_time_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        }
    }
}

/// Run one task to a terminal outcome, applying the retry policy.
async fn execute_task(
    inner: Arc<OrchestratorInner>,
    root_id: String,
    task: TaskDefinition,
    input: HashMap<String, Value>,
    user_context: UserContext,
) -> Result<Value, TaskError> {
    let max_attempts = if inner.config.enable_fallback_strategies {
        inner.fallback.policy().max_attempts.max(1)
    } else {
        1
    };

    let mut attempt = 1u32;
    loop {
        let correlation_id = if attempt == 1 {
            format!("{root_id}.{}", task.task_id)
        } else {
            format!("{root_id}.{}.retry{}", task.task_id, attempt - 1)
        };
        match dispatch_once(&inner, &root_id, &correlation_id, &task, &input, &user_context).await
        {
            Ok(value) => return Ok(value),
            Err(task_error) => {
                if attempt < max_attempts && inner.fallback.should_retry(&task_error, attempt) {
                    let delay = inner.fallback.policy().delay_for(attempt);
                    debug!(
                        task = task.task_id.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying task"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(task_error);
            }
        }
    }
}

/// One dispatch attempt: child correlation, task event, awaited reply.
async fn dispatch_once(
    inner: &OrchestratorInner,
    root_id: &str,
    correlation_id: &str,
    task: &TaskDefinition,
    input: &HashMap<String, Value>,
    user_context: &UserContext,
) -> Result<Value, TaskError> {
    let task_timeout = inner.config.task_timeout();
    let timeout_secs = task_timeout.as_secs().max(1);
    inner
        .tracker
        .create_child(
            root_id,
            correlation_id,
            "task",
            HashMap::new(),
            timeout_secs,
        )
        .map_err(|e| TaskError::new(ErrorCode::ExecutionFailed, e.to_string()))?;

    // Task parameters override the request-level input where they overlap.
    let mut parameters = input.clone();
    parameters.extend(task.parameters.clone());

    let payload = TaskRequest {
        capability: task.capability.clone(),
        parameters,
        user_context: user_context.clone(),
        priority: task.priority.clamp(1, 10),
        timeout_ms: inner.config.task_timeout_ms,
        timestamp: Utc::now(),
    };
    let event = Event::new(
        well_known::TASK_REQUEST,
        EventPayload::TaskRequest(payload),
        AgentId::system(),
    )
    .map_err(|e| TaskError::new(ErrorCode::ExecutionFailed, e.to_string()))?
    .with_correlation_id(correlation_id)
    .with_trace_id(root_id)
    .with_delivery(DeliveryOptions {
        priority: task.priority.clamp(1, 10),
        ..DeliveryOptions::default()
    });

    debug!(
        task = task.task_id.as_str(),
        capability = task.capability.as_str(),
        correlation_id,
        "dispatching task"
    );
    if let Err(e) = inner.bus.publish(event).await {
        inner.tracker.fail(correlation_id, e.to_string());
        return Err(TaskError::new(ErrorCode::AgentUnavailable, e.to_string()));
    }

    // Leave the sweeper room to resolve the context as TimedOut before the
    // local wait gives up.
    let wait = task_timeout + Duration::from_millis(inner.config.correlation_sweep_ms) * 2
        + Duration::from_secs(1);
    match inner.tracker.await_result(correlation_id, wait).await {
        Ok(value) => match serde_json::from_value::<TaskResponse>(value.clone()) {
            Ok(response) if response.success => Ok(response.result.unwrap_or(Value::Null)),
            Ok(response) => Err(response
                .error
                .unwrap_or_else(|| TaskError::new(ErrorCode::ExecutionFailed, "agent reported failure"))),
            // Raw completion value from a non-standard responder.
            Err(_) => Ok(value),
        },
        Err(CorrelationError::TimedOut(_)) | Err(CorrelationError::WaitExpired(_)) => Err(
            TaskError::new(ErrorCode::TaskTimeout, "no reply before the task deadline"),
        ),
        Err(CorrelationError::Cancelled(_)) => Err(TaskError::new(
            ErrorCode::ExecutionFailed,
            "task cancelled",
        )),
        Err(CorrelationError::Failed { error, .. }) => {
            Err(serde_json::from_str::<TaskError>(&error)
                .unwrap_or_else(|_| TaskError::new(ErrorCode::ExecutionFailed, error)))
        }
        Err(e) => Err(TaskError::new(ErrorCode::ExecutionFailed, e.to_string())),
    }
}

/// Build the per-task user context from request metadata.
fn user_context_from(request: &OrchestratorRequest) -> UserContext {
    UserContext {
        user_id: request
            .metadata
            .get("userId")
            .and_then(Value::as_str)
            .map(str::to_string),
        session_id: request
            .metadata
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string),
        roles: Vec::new(),
        permissions: Vec::new(),
        metadata: request.metadata.clone(),
    }
}

/// Normalize input data: lowercase keys, trim strings, coerce numeric and
/// boolean scalars.
fn normalize_input(input: &HashMap<String, Value>) -> HashMap<String, Value> {
    input
        .iter()
        .map(|(key, value)| (key.to_lowercase(), normalize_value(value)))
        .collect()
}

fn normalize_value(value: &Value) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(n) = trimmed.parse::<i64>() {
                return json!(n);
            }
            if let Ok(f) = trimmed.parse::<f64>() {
                return json!(f);
            }
            match trimmed.to_lowercase().as_str() {
                "true" => json!(true),
                "false" => json!(false),
                _ => json!(trimmed),
            }
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_normalization() {
        let input = HashMap::from([
            ("Location".to_string(), json!("  Paris ")),
            ("Count".to_string(), json!("42")),
            ("Ratio".to_string(), json!("0.5")),
            ("Flag".to_string(), json!("TRUE")),
            ("Nested".to_string(), json!({"keep": "as-is"})),
        ]);
        let normalized = normalize_input(&input);

        assert_eq!(normalized["location"], json!("Paris"));
        assert_eq!(normalized["count"], json!(42));
        assert_eq!(normalized["ratio"], json!(0.5));
        assert_eq!(normalized["flag"], json!(true));
        assert_eq!(normalized["nested"], json!({"keep": "as-is"}));
    }

    #[test]
    fn test_request_validation_bounds() {
        assert!(OrchestratorRequest::new("weather in Paris").is_ok());
        assert!(OrchestratorRequest::new("   ").is_err());
        assert!(OrchestratorRequest::new("x".repeat(MAX_TASK_DESCRIPTION_LEN + 1)).is_err());

        // Struct-literal requests are caught by validate().
        let request = OrchestratorRequest::default();
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_user_context_extraction() {
        let mut request = OrchestratorRequest::new("q").unwrap();
        request
            .metadata
            .insert("userId".to_string(), json!("u-1"));
        request
            .metadata
            .insert("sessionId".to_string(), json!("s-9"));
        let context = user_context_from(&request);
        assert_eq!(context.user_id.as_deref(), Some("u-1"));
        assert_eq!(context.session_id.as_deref(), Some("s-9"));
    }

    #[test]
    fn test_metrics_success_rate() {
        let metrics = OrchestratorMetrics {
            total_requests: 4,
            successes: 2,
            partial_successes: 1,
            failures: 1,
            avg_processing_ms: 5.0,
        };
        assert!((metrics.success_rate() - 0.5).abs() < f64::EPSILON);
    }
}
