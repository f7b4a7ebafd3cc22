//! One VM's agent.

use std::path::Path;

use fleet_cloud::{AgentJobState, AgentResult, LocalDnsRecords, SyncOutcome};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::local_dns::LocalDns;

struct AgentState {
    jobs: AgentJobState,
    /// Newest sync received but not yet written.
    pending: Option<LocalDnsRecords>,
}

/// Agent of a single VM.
///
/// DNS syncs may be queued while the agent is busy; [`Agent::start_jobs`]
/// always writes a queued sync before any job starts, so jobs never come up
/// with an older record set than the director already sent.
pub struct Agent {
    id: String,
    dns: LocalDns,
    state: Mutex<AgentState>,
}

impl Agent {
    pub fn open(id: &str, dir: &Path) -> AgentResult<Self> {
        Ok(Self {
            id: id.to_string(),
            dns: LocalDns::open(dir)?,
            state: Mutex::new(AgentState {
                jobs: AgentJobState::Pending,
                pending: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_dns(&self) -> &LocalDns {
        &self.dns
    }

    /// Queue a sync without writing it. Older-than-queued syncs are dropped.
    pub async fn queue_sync(&self, records: LocalDnsRecords) {
        let mut state = self.state.lock().await;
        let newer = state
            .pending
            .as_ref()
            .is_none_or(|queued| records.version > queued.version);
        if newer {
            debug!(agent_id = %self.id, version = records.version, "dns sync queued");
            state.pending = Some(records);
        }
    }

    /// Apply a sync now (after any queued one).
    pub async fn sync_dns(&self, records: &LocalDnsRecords) -> AgentResult<SyncOutcome> {
        let mut state = self.state.lock().await;
        self.flush(&mut state).await?;
        self.dns.apply(records).await
    }

    /// Start jobs: flush the pending sync, capture prestart records, run.
    pub async fn start_jobs(&self) -> AgentResult<()> {
        let mut state = self.state.lock().await;
        state.jobs = AgentJobState::Starting;
        self.flush(&mut state).await?;
        self.dns.snapshot_prestart().await?;
        state.jobs = AgentJobState::Running;
        info!(agent_id = %self.id, "jobs started");
        Ok(())
    }

    pub async fn stop_jobs(&self, skip_drain: bool) {
        let mut state = self.state.lock().await;
        if !skip_drain {
            debug!(agent_id = %self.id, "draining jobs");
        }
        state.jobs = AgentJobState::Stopped;
        info!(agent_id = %self.id, skip_drain, "jobs stopped");
    }

    pub async fn job_state(&self) -> AgentJobState {
        self.state.lock().await.jobs
    }

    async fn flush(&self, state: &mut AgentState) -> AgentResult<()> {
        if let Some(pending) = state.pending.take() {
            self.dns.apply(&pending).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(v: u64) -> LocalDnsRecords {
        LocalDnsRecords::new(
            v,
            vec![("10.0.0.2".to_string(), format!("v{v}.web.default.app.bosh"))],
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn pending_sync_is_flushed_before_jobs_start() {
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::open("agent-1", dir.path()).unwrap();
        agent.queue_sync(version(3)).await;
        agent.queue_sync(version(2)).await;
        assert_eq!(agent.local_dns().applied_version().await.unwrap(), 0);

        agent.start_jobs().await.unwrap();
        assert_eq!(agent.job_state().await, AgentJobState::Running);
        let prestart = agent.local_dns().prestart_records().await.unwrap().unwrap();
        assert_eq!(prestart.version, 3);
    }

    #[tokio::test]
    async fn sync_dns_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::open("agent-1", dir.path()).unwrap();
        assert_eq!(agent.sync_dns(&version(1)).await.unwrap(), SyncOutcome::Applied);
        assert_eq!(agent.sync_dns(&version(1)).await.unwrap(), SyncOutcome::Stale);
        agent.stop_jobs(true).await;
        assert_eq!(agent.job_state().await, AgentJobState::Stopped);
    }
}
