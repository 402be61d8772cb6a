//! Task DAG resolution for dispatch ordering.
//!
//! A validated [`TaskPlan`] is a DAG; the resolver answers "which tasks can
//! run now" as tasks finish, so independent tasks dispatch concurrently
//! while dependents wait for every prerequisite to *succeed*. Priority ties
//! are broken by plan order.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use amcp_types::{TaskDefinition, TaskPlan};

/// Resolves dispatch order over a validated task plan.
pub struct TaskDagResolver {
    tasks: Vec<TaskDefinition>,
    dependencies: HashMap<String, Vec<String>>,
}

impl TaskDagResolver {
    /// Build a resolver. The plan must already have passed
    /// [`TaskPlan::validate`]; the resolver assumes resolvable, acyclic
    /// dependencies.
    pub fn new(plan: &TaskPlan) -> Self {
        let dependencies = plan
            .tasks
            .iter()
            .map(|t| (t.task_id.clone(), t.dependencies.clone()))
            .collect();
        Self {
            tasks: plan.tasks.clone(),
            dependencies,
        }
    }

    /// Total task count.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the plan holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks whose dependencies have all succeeded and which are not yet
    /// running or finished, ordered by priority (desc) then plan order.
    pub fn ready_tasks(
        &self,
        succeeded: &HashSet<String>,
        failed: &HashSet<String>,
        in_flight: &HashSet<String>,
    ) -> Vec<&TaskDefinition> {
        let mut ready: Vec<(usize, &TaskDefinition)> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| {
                !succeeded.contains(&task.task_id)
                    && !failed.contains(&task.task_id)
                    && !in_flight.contains(&task.task_id)
            })
            .filter(|(_, task)| {
                task.dependencies.iter().all(|dep| succeeded.contains(dep))
                    && !task.dependencies.iter().any(|dep| failed.contains(dep))
            })
            .collect();

        // Stable sort keeps plan order within a priority.
        ready.sort_by(|(ia, a), (ib, b)| b.priority.cmp(&a.priority).then(ia.cmp(ib)));
        ready.into_iter().map(|(_, task)| task).collect()
    }

    /// Tasks that can never run because a (transitive) dependency failed.
    pub fn blocked_by_failure(
        &self,
        succeeded: &HashSet<String>,
        failed: &HashSet<String>,
    ) -> Vec<&TaskDefinition> {
        let mut doomed: HashSet<String> = failed.clone();
        // Failure propagates along dependency edges until a fixpoint.
        loop {
            let mut grew = false;
            for task in &self.tasks {
                if doomed.contains(&task.task_id) || succeeded.contains(&task.task_id) {
                    continue;
                }
                if task.dependencies.iter().any(|dep| doomed.contains(dep)) {
                    doomed.insert(task.task_id.clone());
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }

        let blocked: Vec<&TaskDefinition> = self
            .tasks
            .iter()
            .filter(|task| doomed.contains(&task.task_id) && !failed.contains(&task.task_id))
            .collect();
        if !blocked.is_empty() {
            debug!(blocked = blocked.len(), "tasks blocked by failed dependencies");
        }
        blocked
    }

    /// Whether every task reached a terminal set.
    pub fn all_terminal(&self, succeeded: &HashSet<String>, failed: &HashSet<String>) -> bool {
        self.tasks
            .iter()
            .all(|task| succeeded.contains(&task.task_id) || failed.contains(&task.task_id))
    }

    /// Dependencies declared for a task id.
    pub fn dependencies_of(&self, task_id: &str) -> &[String] {
        self.dependencies
            .get(task_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, priority: u8, deps: &[&str]) -> TaskDefinition {
        TaskDefinition {
            task_id: id.to_string(),
            capability: "test.run".to_string(),
            target_agent: None,
            parameters: HashMap::new(),
            priority,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            optional: false,
        }
    }

    fn plan(tasks: Vec<TaskDefinition>) -> TaskPlan {
        TaskPlan {
            tasks,
            confidence: 0.9,
        }
    }

    #[test]
    fn test_independent_tasks_are_ready_together() {
        let resolver = TaskDagResolver::new(&plan(vec![
            task("t1", 5, &[]),
            task("t2", 5, &[]),
            task("t3", 5, &["t1", "t2"]),
        ]));

        let ready = resolver.ready_tasks(&HashSet::new(), &HashSet::new(), &HashSet::new());
        let ids: Vec<&str> = ready.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[test]
    fn test_priority_orders_ready_set_with_plan_order_ties() {
        let resolver = TaskDagResolver::new(&plan(vec![
            task("low", 2, &[]),
            task("high", 9, &[]),
            task("mid-a", 5, &[]),
            task("mid-b", 5, &[]),
        ]));

        let ready = resolver.ready_tasks(&HashSet::new(), &HashSet::new(), &HashSet::new());
        let ids: Vec<&str> = ready.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid-a", "mid-b", "low"]);
    }

    #[test]
    fn test_dependent_becomes_ready_after_success() {
        let resolver = TaskDagResolver::new(&plan(vec![task("t1", 5, &[]), task("t2", 5, &["t1"])]));

        let mut succeeded = HashSet::new();
        assert_eq!(
            resolver
                .ready_tasks(&succeeded, &HashSet::new(), &HashSet::new())
                .len(),
            1
        );

        succeeded.insert("t1".to_string());
        let ready = resolver.ready_tasks(&succeeded, &HashSet::new(), &HashSet::new());
        assert_eq!(ready[0].task_id, "t2");
    }

    #[test]
    fn test_failure_propagates_transitively() {
        let resolver = TaskDagResolver::new(&plan(vec![
            task("t1", 5, &[]),
            task("t2", 5, &["t1"]),
            task("t3", 5, &["t2"]),
            task("t4", 5, &[]),
        ]));

        let mut failed = HashSet::new();
        failed.insert("t1".to_string());
        let blocked = resolver.blocked_by_failure(&HashSet::new(), &failed);
        let ids: HashSet<&str> = blocked.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, HashSet::from(["t2", "t3"]));

        assert!(!resolver.all_terminal(&HashSet::new(), &failed));
    }
}
