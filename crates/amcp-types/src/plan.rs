//! LLM-produced task plans.
//!
//! A plan is an ordered DAG of tasks. Validation enforces unique task ids,
//! resolvable dependency references, and acyclicity; the serde field names
//! match the JSON-output contract of the planning prompt.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors raised by plan validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    /// The plan contains no tasks.
    #[error("plan contains no tasks")]
    Empty,
    /// Two tasks share the same id.
    #[error("duplicate task id {0:?}")]
    DuplicateTaskId(String),
    /// A task references a dependency id missing from the plan.
    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency {
        /// The referencing task.
        task: String,
        /// The missing dependency id.
        dependency: String,
    },
    /// The dependency graph contains a cycle.
    #[error("dependency cycle involving task {0:?}")]
    CycleDetected(String),
    /// Confidence outside 0..=1.
    #[error("confidence {0} outside 0.0..=1.0")]
    InvalidConfidence(f64),
    /// A task field failed validation.
    #[error("task {task:?}: {reason}")]
    InvalidTask {
        /// The offending task id.
        task: String,
        /// What was wrong.
        reason: String,
    },
}

/// A single task within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    /// Plan-unique task id.
    #[serde(rename = "id")]
    pub task_id: String,
    /// Capability the task requires.
    pub capability: String,
    /// Suggested agent, if the planner named one.
    #[serde(rename = "agent", default, skip_serializing_if = "Option::is_none")]
    pub target_agent: Option<String>,
    /// Task parameters.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    /// Dispatch priority, 1..=10.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Ids of tasks that must succeed before this one runs.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Planner may mark a task optional; unknown capabilities on optional
    /// tasks degrade instead of failing the plan.
    #[serde(default)]
    pub optional: bool,
}

fn default_priority() -> u8 {
    crate::delivery::DEFAULT_PRIORITY
}

/// An ordered DAG of tasks with planner confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    /// Tasks in plan order. Plan order breaks priority ties.
    pub tasks: Vec<TaskDefinition>,
    /// Planner confidence in 0..=1.
    pub confidence: f64,
}

impl TaskPlan {
    /// Look up a task by id.
    pub fn task(&self, task_id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    /// Validate plan structure: non-empty, unique ids, resolvable
    /// dependencies, acyclic, confidence in range.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.tasks.is_empty() {
            return Err(PlanError::Empty);
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(PlanError::InvalidConfidence(self.confidence));
        }

        let mut ids = HashSet::new();
        for task in &self.tasks {
            if task.task_id.is_empty() {
                return Err(PlanError::InvalidTask {
                    task: task.task_id.clone(),
                    reason: "empty task id".to_string(),
                });
            }
            if task.capability.is_empty() {
                return Err(PlanError::InvalidTask {
                    task: task.task_id.clone(),
                    reason: "empty capability".to_string(),
                });
            }
            if !ids.insert(task.task_id.as_str()) {
                return Err(PlanError::DuplicateTaskId(task.task_id.clone()));
            }
        }

        for task in &self.tasks {
            for dep in &task.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        task: task.task_id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        self.check_acyclic()
    }

    /// DFS cycle detection over the dependency edges.
    fn check_acyclic(&self) -> Result<(), PlanError> {
        let deps: HashMap<&str, &Vec<String>> = self
            .tasks
            .iter()
            .map(|t| (t.task_id.as_str(), &t.dependencies))
            .collect();

        fn visit<'a>(
            node: &'a str,
            deps: &HashMap<&'a str, &'a Vec<String>>,
            visiting: &mut HashSet<&'a str>,
            visited: &mut HashSet<&'a str>,
        ) -> Result<(), PlanError> {
            if visited.contains(node) {
                return Ok(());
            }
            if !visiting.insert(node) {
                return Err(PlanError::CycleDetected(node.to_string()));
            }
            if let Some(node_deps) = deps.get(node) {
                for dep in node_deps.iter() {
                    visit(dep, deps, visiting, visited)?;
                }
            }
            visiting.remove(node);
            visited.insert(node);
            Ok(())
        }

        let mut visiting = HashSet::new();
        let mut visited = HashSet::new();
        for task in &self.tasks {
            visit(task.task_id.as_str(), &deps, &mut visiting, &mut visited)?;
        }
        Ok(())
    }
}
