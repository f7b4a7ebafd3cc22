//! fleet-pool: bounded task pool for director operations.
//!
//! Runs a batch of independent work items with at most `max_threads`
//! executing at once, waits for every item, and collects every failure
//! instead of stopping at the first one.
//!
//! # Architecture
//!
//! ```text
//!   items ──► VecDeque ──┬──► worker 0 ──┐
//!                        ├──► worker 1 ──┼──► results (sorted by submission)
//!                        └──► worker N ──┘
//! ```
//!
//! A fixed set of `min(max_threads, items)` workers drains a shared queue.
//! Each item runs on its own tokio task so a panic is recorded as that
//! item's failure and never takes the worker (or its siblings) down.
//! Nothing is cancelled when an item fails.

pub mod error;

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

pub use error::{AggregateTaskFailure, TaskFailure};

/// Concurrency used for teardown when nothing else is configured.
pub const DEFAULT_MAX_THREADS: usize = 3;

/// Boxed future type used for work items.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'static>>;

/// A named unit of work.
pub struct WorkItem<T> {
    pub name: String,
    future: BoxFuture<T>,
}

impl<T> WorkItem<T> {
    pub fn new<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            name: name.into(),
            future: Box::pin(future),
        }
    }
}

/// Everything a pool run produced.
#[derive(Debug)]
pub struct PoolOutcome<T> {
    /// Successful items as `(name, output)`, in submission order.
    pub completed: Vec<(String, T)>,
    /// Failed items, in submission order.
    pub failures: Vec<TaskFailure>,
}

impl<T> PoolOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Outputs of every item, or the aggregate of every failure.
    pub fn into_result(self) -> Result<Vec<T>, AggregateTaskFailure> {
        if self.failures.is_empty() {
            Ok(self.completed.into_iter().map(|(_, out)| out).collect())
        } else {
            Err(AggregateTaskFailure {
                total: self.completed.len() + self.failures.len(),
                failures: self.failures,
            })
        }
    }
}

/// Fixed-size worker pool.
#[derive(Debug, Clone, Copy)]
pub struct TaskPool {
    max_threads: usize,
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_THREADS)
    }
}

type Queue<T> = Arc<Mutex<VecDeque<(usize, WorkItem<T>)>>>;
type Finished<T> = (usize, String, anyhow::Result<T>);

impl TaskPool {
    /// A pool running at most `max_threads` items at once (minimum 1).
    pub fn new(max_threads: usize) -> Self {
        Self {
            max_threads: max_threads.max(1),
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Run every item and wait for all of them.
    pub async fn run<T: Send + 'static>(&self, items: Vec<WorkItem<T>>) -> PoolOutcome<T> {
        let total = items.len();
        let queue: Queue<T> = Arc::new(Mutex::new(items.into_iter().enumerate().collect()));
        let workers = self.max_threads.min(total);
        debug!(total, workers, "task pool starting");

        let mut set = JoinSet::new();
        for worker in 0..workers {
            set.spawn(drain(worker, Arc::clone(&queue)));
        }

        let mut finished: Vec<Finished<T>> = Vec::with_capacity(total);
        let mut lost_workers = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(results) => finished.extend(results),
                Err(e) => {
                    error!(error = %e, "task pool worker died");
                    lost_workers += 1;
                }
            }
        }
        finished.sort_by_key(|(index, _, _)| *index);

        let mut outcome = PoolOutcome {
            completed: Vec::with_capacity(total),
            failures: Vec::new(),
        };
        for (_, name, result) in finished {
            match result {
                Ok(output) => outcome.completed.push((name, output)),
                Err(error) => {
                    warn!(task = %name, error = %format!("{error:#}"), "task failed");
                    outcome.failures.push(TaskFailure { task: name, error });
                }
            }
        }
        for worker in 0..lost_workers {
            outcome.failures.push(TaskFailure {
                task: format!("pool worker {worker}"),
                error: anyhow::anyhow!("worker terminated before draining its queue"),
            });
        }
        debug!(
            completed = outcome.completed.len(),
            failed = outcome.failures.len(),
            "task pool finished"
        );
        outcome
    }
}

async fn drain<T: Send + 'static>(worker: usize, queue: Queue<T>) -> Vec<Finished<T>> {
    let mut results = Vec::new();
    loop {
        let next = queue.lock().await.pop_front();
        let Some((index, WorkItem { name, future })) = next else {
            break;
        };
        debug!(worker, task = %name, "task started");
        let result = match tokio::spawn(future).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(anyhow::anyhow!("task panicked")),
            Err(e) => Err(anyhow::anyhow!("task aborted: {e}")),
        };
        results.push((index, name, result));
    }
    results
}
