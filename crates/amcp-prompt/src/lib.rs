#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **amcp-prompt** – Model-agnostic prompt construction for the AMCP mesh.
//!
//! The engine builds the four prompt kinds the orchestrator needs (task
//! planning, capability detection, parameter extraction, response
//! synthesis) in a fixed section order:
//!
//! system prefix → few-shot examples → instruction → context block → user
//! query → JSON enforcement → system suffix.
//!
//! Every JSON-producing kind carries a strict output contract; the
//! synthesis kind asks for plain prose. [`PromptEngine::validate`] scores a
//! built prompt against the structural heuristics, and
//! [`PromptEngine::record_performance`] keeps per (kind, model) success and
//! latency statistics.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use amcp_types::CapabilityRecord;

mod library;

pub use library::{FewShotExample, ModelProfile, PromptLibrary};

/// Errors raised while loading prompt data.
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    /// The profile document could not be read.
    #[error("failed to read prompt library: {0}")]
    Io(#[from] std::io::Error),
    /// The profile document could not be parsed.
    #[error("failed to parse prompt library: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// `default_profile` names a profile that does not exist.
    #[error("default profile {0:?} is not defined")]
    MissingProfile(String),
}

/// The four prompt kinds the orchestrator builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    /// Decompose a query into a task plan.
    TaskPlanning,
    /// Map a query onto a single capability.
    CapabilityDetection,
    /// Extract expected parameters from a query.
    ParameterExtraction,
    /// Merge task results into a final answer.
    ResponseSynthesis,
}

impl PromptKind {
    /// Stable string tag (also the key in the profile document).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskPlanning => "task_planning",
            Self::CapabilityDetection => "capability_detection",
            Self::ParameterExtraction => "parameter_extraction",
            Self::ResponseSynthesis => "response_synthesis",
        }
    }

    /// Whether the output contract is JSON (synthesis is prose).
    pub fn expects_json(self) -> bool {
        !matches!(self, Self::ResponseSynthesis)
    }

    fn context_header(self) -> &'static str {
        match self {
            Self::TaskPlanning => "### Available agents",
            Self::CapabilityDetection => "### Capabilities",
            Self::ParameterExtraction => "### Expected parameters",
            Self::ResponseSynthesis => "### Task results",
        }
    }

    fn missing_context_penalty(self) -> i32 {
        match self {
            Self::TaskPlanning => 25,
            Self::CapabilityDetection => 20,
            Self::ResponseSynthesis => 20,
            Self::ParameterExtraction => 15,
        }
    }

    fn output_schema(self) -> &'static str {
        match self {
            Self::TaskPlanning => {
                r#"{"tasks": [{"id": string, "capability": string, "agent": string, "parameters": object, "priority": number, "dependencies": [string]}], "confidence": number}"#
            }
            Self::CapabilityDetection => {
                r#"{"intent": string, "capability": string, "targetAgent": string, "confidence": number, "parameters": object}"#
            }
            Self::ParameterExtraction => r#"{"parameters": object, "confidence": number}"#,
            Self::ResponseSynthesis => "",
        }
    }
}

/// One expected parameter in an extraction prompt.
#[derive(Debug, Clone)]
pub struct ParameterSpec {
    /// Parameter name.
    pub name: String,
    /// Informal type tag (`"string"`, `"number"`, ...).
    pub kind: String,
    /// Whether the parameter must be present.
    pub required: bool,
    /// One-line description.
    pub description: String,
}

/// One task outcome fed into a synthesis prompt.
#[derive(Debug, Clone)]
pub struct TaskResultSummary {
    /// Plan task id.
    pub task_id: String,
    /// Capability the task required.
    pub capability: String,
    /// Whether the task succeeded.
    pub success: bool,
    /// Structured result on success, or error description on failure.
    pub detail: Value,
}

/// Validation outcome for a built prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptScore {
    /// 0..=100; starts at 100 and loses points per issue.
    pub score: i32,
    /// Human-readable issues found.
    pub issues: Vec<String>,
}

/// Per (kind, model) prompt performance counters.
#[derive(Debug, Clone, Default)]
pub struct PromptPerformance {
    /// Prompt kind tag.
    pub kind: &'static str,
    /// Model name.
    pub model: String,
    /// Total recorded invocations.
    pub invocations: u64,
    /// Invocations that produced a usable output.
    pub successes: u64,
    /// Rolling average latency in milliseconds.
    pub avg_latency_ms: f64,
}

impl PromptPerformance {
    /// Fraction of invocations that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.invocations == 0 {
            return 1.0;
        }
        self.successes as f64 / self.invocations as f64
    }
}

#[derive(Default)]
struct PerfCell {
    invocations: u64,
    successes: u64,
    total_latency_ms: u64,
}

/// Builds and scores prompts from an immutable [`PromptLibrary`].
pub struct PromptEngine {
    library: PromptLibrary,
    performance: Mutex<HashMap<(PromptKind, String), PerfCell>>,
}

impl PromptEngine {
    /// Create an engine over a loaded library.
    pub fn new(library: PromptLibrary) -> Self {
        Self {
            library,
            performance: Mutex::new(HashMap::new()),
        }
    }

    /// Engine over the embedded default library.
    pub fn builtin() -> Self {
        Self::new(PromptLibrary::builtin())
    }

    /// The library this engine reads from.
    pub fn library(&self) -> &PromptLibrary {
        &self.library
    }

    /// Build a task-planning prompt over the currently registered agents.
    pub fn build_task_planning_prompt(
        &self,
        query: &str,
        available_agents: &[CapabilityRecord],
        model: &str,
    ) -> String {
        let mut context = String::new();
        if available_agents.is_empty() {
            context.push_str("(no agents registered)\n");
        }
        for record in available_agents {
            let capabilities: Vec<&str> =
                record.capabilities.iter().map(String::as_str).collect();
            context.push_str(&format!(
                "- {} ({}): capabilities [{}]{}\n",
                record.agent_type,
                record.agent_id,
                capabilities.join(", "),
                if record.description.is_empty() {
                    String::new()
                } else {
                    format!(" — {}", record.description)
                },
            ));
        }
        self.assemble(
            PromptKind::TaskPlanning,
            model,
            "Decompose the user query into an ordered task plan. Use only listed capabilities. \
             Express prerequisites through the dependencies array; independent tasks must not \
             depend on each other. Report your confidence between 0 and 1.",
            &context,
            query,
        )
    }

    /// Build a capability-detection prompt over a capability → description
    /// map.
    pub fn build_capability_detection_prompt(
        &self,
        query: &str,
        capability_map: &BTreeMap<String, String>,
        model: &str,
    ) -> String {
        let mut context = String::new();
        for (capability, description) in capability_map {
            context.push_str(&format!("- {capability}: {description}\n"));
        }
        self.assemble(
            PromptKind::CapabilityDetection,
            model,
            "Identify the single capability that best serves the user query and extract its \
             parameters. If no capability fits, use \"general.fallback\" with confidence 0.",
            &context,
            query,
        )
    }

    /// Build a parameter-extraction prompt for a known capability.
    pub fn build_parameter_extraction_prompt(
        &self,
        query: &str,
        expected: &[ParameterSpec],
        model: &str,
    ) -> String {
        let mut context = String::new();
        for spec in expected {
            context.push_str(&format!(
                "- {} ({}, {}): {}\n",
                spec.name,
                spec.kind,
                if spec.required { "required" } else { "optional" },
                spec.description,
            ));
        }
        self.assemble(
            PromptKind::ParameterExtraction,
            model,
            "Extract the expected parameters from the user query. Omit parameters the query \
             does not mention; never invent values.",
            &context,
            query,
        )
    }

    /// Build a response-synthesis prompt over collected task results.
    pub fn build_response_synthesis_prompt(
        &self,
        query: &str,
        responses: &[TaskResultSummary],
        model: &str,
    ) -> String {
        let mut context = String::new();
        for summary in responses {
            context.push_str(&format!(
                "- task {} ({}): {} — {}\n",
                summary.task_id,
                summary.capability,
                if summary.success { "succeeded" } else { "FAILED" },
                summary.detail,
            ));
        }
        self.assemble(
            PromptKind::ResponseSynthesis,
            model,
            "Write the final answer to the user query from the task results below, as plain \
             natural language. If any task failed, say explicitly which information is missing \
             and why the answer is incomplete. Do not output JSON.",
            &context,
            query,
        )
    }

    /// Score a built prompt against the structural heuristics.
    pub fn validate(&self, prompt: &str, kind: PromptKind) -> PromptScore {
        let mut score = 100i32;
        let mut issues = Vec::new();

        if prompt.len() < 100 {
            score -= 20;
            issues.push(format!("prompt too short ({} chars)", prompt.len()));
        } else if prompt.len() > 8_000 {
            score -= 15;
            issues.push(format!("prompt too long ({} chars)", prompt.len()));
        }
        if !prompt.contains("### Examples") {
            score -= 25;
            issues.push("no few-shot examples".to_string());
        }
        if kind.expects_json() && !prompt.contains("JSON") {
            score -= 30;
            issues.push("JSON output contract not enforced".to_string());
        }
        if !prompt.contains(kind.context_header()) {
            score -= kind.missing_context_penalty();
            issues.push(format!("missing section {:?}", kind.context_header()));
        }

        PromptScore {
            score: score.max(0),
            issues,
        }
    }

    /// Record one prompt invocation outcome.
    pub fn record_performance(
        &self,
        kind: PromptKind,
        model: &str,
        success: bool,
        latency_ms: u64,
    ) {
        let mut performance = self.performance.lock();
        let cell = performance
            .entry((kind, model.to_string()))
            .or_default();
        cell.invocations += 1;
        if success {
            cell.successes += 1;
        }
        cell.total_latency_ms += latency_ms;
        debug!(
            kind = kind.as_str(),
            model,
            success,
            latency_ms,
            "prompt performance recorded"
        );
    }

    /// Snapshot per (kind, model) performance.
    pub fn performance_report(&self) -> Vec<PromptPerformance> {
        let performance = self.performance.lock();
        let mut report: Vec<PromptPerformance> = performance
            .iter()
            .map(|((kind, model), cell)| PromptPerformance {
                kind: kind.as_str(),
                model: model.clone(),
                invocations: cell.invocations,
                successes: cell.successes,
                avg_latency_ms: if cell.invocations == 0 {
                    0.0
                } else {
                    cell.total_latency_ms as f64 / cell.invocations as f64
                },
            })
            .collect();
        report.sort_by(|a, b| (a.kind, &a.model).cmp(&(b.kind, &b.model)));
        report
    }

    /// Assemble the fixed section order.
    fn assemble(
        &self,
        kind: PromptKind,
        model: &str,
        instruction: &str,
        context: &str,
        query: &str,
    ) -> String {
        let profile = self.library.profile_for(model);
        let mut prompt = String::new();

        prompt.push_str(&profile.system_prefix);
        prompt.push_str("\n\n");

        let examples = self.library.examples_for(kind);
        if !examples.is_empty() && profile.max_few_shot_examples > 0 {
            prompt.push_str("### Examples\n");
            for example in examples.iter().take(profile.max_few_shot_examples) {
                prompt.push_str(&format!(
                    "User query: {}\nOutput: {}\n\n",
                    example.query, example.output
                ));
            }
        }

        prompt.push_str("### Instruction\n");
        prompt.push_str(instruction);
        prompt.push_str("\n\n");

        prompt.push_str(kind.context_header());
        prompt.push('\n');
        prompt.push_str(context);
        prompt.push('\n');

        prompt.push_str("### User query\n");
        prompt.push_str(query);
        prompt.push('\n');

        if kind.expects_json() && profile.strict_json_mode {
            prompt.push_str(&format!(
                "\nRespond ONLY with a single JSON object matching this schema, with no prose \
                 before or after it:\n{}\n",
                kind.output_schema()
            ));
        }

        if !profile.system_suffix.is_empty() {
            prompt.push('\n');
            prompt.push_str(&profile.system_suffix);
            prompt.push('\n');
        }

        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amcp_types::AgentId;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn weather_record() -> CapabilityRecord {
        CapabilityRecord {
            agent_id: AgentId::named("weather").unwrap(),
            agent_type: "WeatherAgent".to_string(),
            capabilities: ["weather.get".to_string()].into_iter().collect::<BTreeSet<_>>(),
            description: "current conditions and forecasts".to_string(),
            endpoint: "weather".to_string(),
            registered_at: Utc::now(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn planning_prompt_has_every_section_in_order() {
        let engine = PromptEngine::builtin();
        let prompt = engine.build_task_planning_prompt(
            "What's the weather in Paris?",
            &[weather_record()],
            "llama3",
        );

        let examples = prompt.find("### Examples").unwrap();
        let instruction = prompt.find("### Instruction").unwrap();
        let agents = prompt.find("### Available agents").unwrap();
        let query = prompt.find("### User query").unwrap();
        let json_block = prompt.find("Respond ONLY with a single JSON object").unwrap();
        assert!(examples < instruction);
        assert!(instruction < agents);
        assert!(agents < query);
        assert!(query < json_block);
        assert!(prompt.contains("WeatherAgent"));
        assert!(prompt.contains("weather.get"));

        let score = engine.validate(&prompt, PromptKind::TaskPlanning);
        assert_eq!(score.score, 100, "issues: {:?}", score.issues);
    }

    #[test]
    fn synthesis_prompt_is_prose_only() {
        let engine = PromptEngine::builtin();
        let prompt = engine.build_response_synthesis_prompt(
            "What's the weather in Paris?",
            &[TaskResultSummary {
                task_id: "t1".to_string(),
                capability: "weather.get".to_string(),
                success: true,
                detail: json!({"temp": 24}),
            }],
            "llama3",
        );
        assert!(!prompt.contains("Respond ONLY with a single JSON object"));
        assert!(prompt.contains("### Task results"));
    }

    #[test]
    fn validation_deducts_for_missing_sections() {
        let engine = PromptEngine::builtin();
        let score = engine.validate("tiny prompt", PromptKind::TaskPlanning);
        // -20 short, -25 no examples, -30 no JSON contract, -25 no agents.
        assert_eq!(score.score, 0);
        assert_eq!(score.issues.len(), 4);

        let long = "x".repeat(9_000);
        let score = engine.validate(&long, PromptKind::ResponseSynthesis);
        assert!(score.issues.iter().any(|i| i.contains("too long")));
    }

    #[test]
    fn performance_report_aggregates() {
        let engine = PromptEngine::builtin();
        engine.record_performance(PromptKind::TaskPlanning, "llama3", true, 100);
        engine.record_performance(PromptKind::TaskPlanning, "llama3", false, 300);

        let report = engine.performance_report();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].invocations, 2);
        assert_eq!(report[0].successes, 1);
        assert!((report[0].avg_latency_ms - 200.0).abs() < f64::EPSILON);
        assert!((report[0].success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn capability_detection_and_extraction_prompts_build() {
        let engine = PromptEngine::builtin();
        let mut map = BTreeMap::new();
        map.insert("weather.get".to_string(), "current conditions".to_string());
        let prompt = engine.build_capability_detection_prompt("weather in Rome", &map, "gpt-4");
        assert_eq!(engine.validate(&prompt, PromptKind::CapabilityDetection).score, 100);

        let prompt = engine.build_parameter_extraction_prompt(
            "quote ACME in euros",
            &[ParameterSpec {
                name: "symbol".to_string(),
                kind: "string".to_string(),
                required: true,
                description: "ticker symbol".to_string(),
            }],
            "unknown-model",
        );
        assert_eq!(engine.validate(&prompt, PromptKind::ParameterExtraction).score, 100);
    }

    #[test]
    fn library_can_be_loaded_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.yaml");
        std::fs::write(
            &path,
            r#"
default_profile: default
profiles:
  default: { system_prefix: "alt", max_few_shot_examples: 0, strict_json_mode: false, max_tokens: 256 }
"#,
        )
        .unwrap();

        let engine = PromptEngine::new(PromptLibrary::from_file(&path).unwrap());
        let prompt = engine.build_task_planning_prompt("q", &[], "anything");
        assert!(prompt.starts_with("alt"));
        assert!(!prompt.contains("### Examples"));
        assert!(!prompt.contains("Respond ONLY"));
    }
}
