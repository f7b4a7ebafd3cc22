//! Agent RPC seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AgentResult;
use crate::wire::LocalDnsRecords;

/// Job state reported by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentJobState {
    /// Agent booted, jobs not started.
    Pending,
    Starting,
    Running,
    Stopped,
    Failing,
}

/// What an agent did with a DNS sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Records written; the agent now serves `version`.
    Applied,
    /// The agent already had this version or a newer one.
    Stale,
}

/// Request/response channel to the agent running on one VM.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Push a full record set. Agents ignore versions they already have.
    async fn sync_dns(&self, agent_id: &str, records: &LocalDnsRecords) -> AgentResult<SyncOutcome>;

    /// Start the VM's jobs. A pending DNS sync is applied first.
    async fn start(&self, agent_id: &str) -> AgentResult<()>;

    async fn stop(&self, agent_id: &str, skip_drain: bool) -> AgentResult<()>;

    async fn get_state(&self, agent_id: &str) -> AgentResult<AgentJobState>;
}
