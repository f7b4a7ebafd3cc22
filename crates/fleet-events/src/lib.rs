//! fleet-events: hierarchical stage/task progress reporting.
//!
//! Every director operation reports its work as stages ("Deleting
//! instances", "Applying problem resolutions") made of tasks (one per
//! instance, VM, problem...). Each state change becomes an [`Event`]: kept
//! in memory for inspection and optionally appended as a JSON line to an
//! event file.
//!
//! Reporting is purely observational. A failure to write the event file is
//! logged and otherwise ignored; it never changes the outcome of the work
//! being reported.

use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// State of a task at the time of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Started,
    Finished,
    Failed,
}

/// One progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unix timestamp (seconds).
    pub time: u64,
    pub stage: String,
    pub tags: Vec<String>,
    /// Number of tasks in the stage.
    pub total: u32,
    pub task: String,
    /// 1-based position of the task within its stage.
    pub index: u32,
    pub state: TaskState,
    /// Percentage of the stage's tasks done when the event was emitted.
    pub progress: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

struct Inner {
    events: Mutex<Vec<Event>>,
    file: Option<Mutex<File>>,
}

/// Shared sink for progress events.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Inner>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl EventLog {
    /// An event log that only keeps events in memory.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Inner {
                events: Mutex::new(Vec::new()),
                file: None,
            }),
        }
    }

    /// An event log that also appends every event to `path` as JSON lines.
    pub fn with_file(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!(?path, "event log file opened");
        Ok(Self {
            inner: Arc::new(Inner {
                events: Mutex::new(Vec::new()),
                file: Some(Mutex::new(file)),
            }),
        })
    }

    /// Begin a stage of `total` tasks.
    pub fn begin_stage(&self, name: impl Into<String>, total: u32) -> Stage {
        self.begin_stage_with_tags(name, Vec::new(), total)
    }

    pub fn begin_stage_with_tags(
        &self,
        name: impl Into<String>,
        tags: Vec<String>,
        total: u32,
    ) -> Stage {
        let name = name.into();
        info!(stage = %name, total, "stage started");
        Stage {
            inner: Arc::new(StageInner {
                log: self.clone(),
                name,
                tags,
                total,
                next_index: AtomicU32::new(0),
                done: AtomicU32::new(0),
            }),
        }
    }

    /// Snapshot of every event recorded so far.
    pub fn events(&self) -> Vec<Event> {
        match self.inner.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Events of one stage, in emission order.
    pub fn stage_events(&self, stage: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.stage == stage)
            .collect()
    }

    fn record(&self, event: Event) {
        if let Some(file) = &self.inner.file {
            match serde_json::to_string(&event) {
                Ok(line) => {
                    let mut file = match file.lock() {
                        Ok(f) => f,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if let Err(e) = writeln!(file, "{line}") {
                        warn!(error = %e, "failed to write event");
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize event"),
            }
        }
        let mut events = match self.inner.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push(event);
    }
}

struct StageInner {
    log: EventLog,
    name: String,
    tags: Vec<String>,
    total: u32,
    next_index: AtomicU32,
    done: AtomicU32,
}

/// A named group of tasks. Cheap to clone and share between workers.
#[derive(Clone)]
pub struct Stage {
    inner: Arc<StageInner>,
}

impl Stage {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Start a task in this stage.
    pub fn start_task(&self, name: impl Into<String>) -> Task {
        let index = self.inner.next_index.fetch_add(1, Ordering::SeqCst) + 1;
        let task = Task {
            stage: self.clone(),
            name: name.into(),
            index,
        };
        task.emit(TaskState::Started, None);
        task
    }

    /// Run `work` as a task, reporting its start and its outcome.
    pub async fn track<T, E, F>(&self, name: impl Into<String>, work: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let task = self.start_task(name);
        let result = work.await;
        match &result {
            Ok(_) => task.finish(),
            Err(e) => task.fail(e),
        }
        result
    }

    fn progress(&self, done: u32) -> u32 {
        match self.inner.total {
            0 => 100,
            total => (done.min(total) * 100) / total,
        }
    }
}

/// A task inside a stage. Consumed by `finish` or `fail`.
pub struct Task {
    stage: Stage,
    name: String,
    index: u32,
}

impl Task {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn finish(self) {
        self.stage.inner.done.fetch_add(1, Ordering::SeqCst);
        self.emit(TaskState::Finished, None);
    }

    pub fn fail(self, error: &dyn Display) {
        self.stage.inner.done.fetch_add(1, Ordering::SeqCst);
        let message = error.to_string();
        warn!(stage = %self.stage.inner.name, task = %self.name, error = %message, "task failed");
        self.emit(
            TaskState::Failed,
            Some(serde_json::json!({ "error": message })),
        );
    }

    fn emit(&self, state: TaskState, data: Option<serde_json::Value>) {
        let stage = &self.stage.inner;
        let event = Event {
            time: now_secs(),
            stage: stage.name.clone(),
            tags: stage.tags.clone(),
            total: stage.total,
            task: self.name.clone(),
            index: self.index,
            state,
            progress: self.stage.progress(stage.done.load(Ordering::SeqCst)),
            data,
        };
        debug!(stage = %event.stage, task = %event.task, state = ?state, "task event");
        stage.log.record(event);
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_lifecycle_is_recorded() {
        let log = EventLog::in_memory();
        let stage = log.begin_stage("Deleting instances", 2);
        stage.start_task("web/0").finish();
        stage.start_task("web/1").fail(&"cloud unavailable");

        let events = log.stage_events("Deleting instances");
        let states: Vec<TaskState> = events.iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![
                TaskState::Started,
                TaskState::Finished,
                TaskState::Started,
                TaskState::Failed
            ]
        );
        assert_eq!(events[1].progress, 50);
        assert_eq!(events[3].progress, 100);
        assert_eq!(events[3].index, 2);
        assert_eq!(events[3].data.as_ref().unwrap()["error"], "cloud unavailable");
    }

    #[tokio::test]
    async fn track_reports_outcome_and_passes_result_through() {
        let log = EventLog::in_memory();
        let stage = log.begin_stage("Deleting VMs", 2);
        let ok: anyhow::Result<u32> = stage.track("vm-1", async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);
        let err: anyhow::Result<u32> = stage
            .track("vm-2", async { Err(anyhow::anyhow!("gone")) })
            .await;
        assert!(err.is_err());

        let events = log.events();
        assert_eq!(events.len(), 4);
        assert_eq!(events[3].state, TaskState::Failed);
        assert_eq!(events[3].task, "vm-2");
    }

    #[test]
    fn events_are_appended_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let log = EventLog::with_file(&path).unwrap();
        log.begin_stage_with_tags("Updating instance", vec!["web".to_string()], 1)
            .start_task("web/0 (canary)")
            .finish();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Event> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].tags, vec!["web".to_string()]);
        assert!(lines[1].data.is_none());
    }

    #[test]
    fn empty_stage_reports_complete() {
        let log = EventLog::in_memory();
        let stage = log.begin_stage("Nothing", 0);
        assert_eq!(stage.progress(0), 100);
    }
}
