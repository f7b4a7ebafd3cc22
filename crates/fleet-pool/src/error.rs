//! Pool failure types.

use thiserror::Error;

/// One work item that returned an error (or panicked).
#[derive(Debug)]
pub struct TaskFailure {
    /// Name the work item was submitted under.
    pub task: String,
    pub error: anyhow::Error,
}

/// One or more pool items failed. Siblings ran to completion regardless.
#[derive(Debug, Error)]
#[error("{} of {total} tasks failed: {}", .failures.len(), summarize(.failures))]
pub struct AggregateTaskFailure {
    /// Number of items the pool ran.
    pub total: usize,
    pub failures: Vec<TaskFailure>,
}

impl AggregateTaskFailure {
    /// Names of the failed work items, in submission order.
    pub fn failed_tasks(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.task.as_str()).collect()
    }
}

fn summarize(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {:#}", f.task, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}
