//! In-process agents for VMs of the dummy cloud.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fleet_cloud::{
    AgentClient, AgentError, AgentJobState, AgentResult, DummyCloud, LocalDnsRecords,
    SyncOutcome,
};
use tokio::sync::RwLock;
use tracing::debug;

/// Hosts one [`Agent`](crate::Agent) per dummy-cloud VM under
/// `<base_dir>/<agent_id>/`.
///
/// An agent answers only while the cloud still has a VM booted with its
/// id; calls to any other agent fail with `Unresponsive`.
#[derive(Clone)]
pub struct LocalAgents {
    base_dir: PathBuf,
    cloud: DummyCloud,
    agents: Arc<RwLock<HashMap<String, Arc<crate::Agent>>>>,
    silenced: Arc<RwLock<HashSet<String>>>,
}

impl LocalAgents {
    pub fn new(base_dir: &Path, cloud: DummyCloud) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            cloud,
            agents: Arc::new(RwLock::new(HashMap::new())),
            silenced: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Make an agent stop answering even though its VM exists.
    pub async fn silence(&self, agent_id: &str) {
        self.silenced.write().await.insert(agent_id.to_string());
    }

    pub async fn revive(&self, agent_id: &str) {
        self.silenced.write().await.remove(agent_id);
    }

    /// The agent for `agent_id`, if it is reachable.
    pub async fn agent(&self, agent_id: &str) -> AgentResult<Arc<crate::Agent>> {
        if self.silenced.read().await.contains(agent_id) {
            return Err(AgentError::Unresponsive(agent_id.to_string()));
        }
        let vm = self
            .cloud
            .vm_for_agent(agent_id)
            .await
            .map_err(|e| AgentError::Storage(e.to_string()))?;
        if vm.is_none() {
            return Err(AgentError::Unresponsive(agent_id.to_string()));
        }

        if let Some(agent) = self.agents.read().await.get(agent_id) {
            return Ok(Arc::clone(agent));
        }
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get(agent_id) {
            return Ok(Arc::clone(agent));
        }
        let agent = Arc::new(crate::Agent::open(agent_id, &self.base_dir.join(agent_id))?);
        agents.insert(agent_id.to_string(), Arc::clone(&agent));
        debug!(%agent_id, "agent connected");
        Ok(agent)
    }
}

#[async_trait]
impl AgentClient for LocalAgents {
    async fn sync_dns(&self, agent_id: &str, records: &LocalDnsRecords) -> AgentResult<SyncOutcome> {
        self.agent(agent_id).await?.sync_dns(records).await
    }

    async fn start(&self, agent_id: &str) -> AgentResult<()> {
        self.agent(agent_id).await?.start_jobs().await
    }

    async fn stop(&self, agent_id: &str, skip_drain: bool) -> AgentResult<()> {
        self.agent(agent_id).await?.stop_jobs(skip_drain).await;
        Ok(())
    }

    async fn get_state(&self, agent_id: &str) -> AgentResult<AgentJobState> {
        Ok(self.agent(agent_id).await?.job_state().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_cloud::{CloudProvider, VmRequest};

    #[tokio::test]
    async fn agents_answer_only_while_their_vm_exists() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = DummyCloud::open(&dir.path().join("vms")).unwrap();
        let agents = LocalAgents::new(&dir.path().join("agents"), cloud.clone());

        assert!(matches!(
            agents.get_state("agent-1").await,
            Err(AgentError::Unresponsive(_))
        ));

        let cid = cloud
            .create_vm(&VmRequest {
                agent_id: "agent-1".to_string(),
                stemcell_cid: "img".to_string(),
                networks: Vec::new(),
            })
            .await
            .unwrap()
            .cid;
        assert_eq!(agents.get_state("agent-1").await.unwrap(), AgentJobState::Pending);
        agents.start("agent-1").await.unwrap();
        assert_eq!(agents.get_state("agent-1").await.unwrap(), AgentJobState::Running);

        agents.silence("agent-1").await;
        assert!(agents.stop("agent-1", false).await.is_err());
        agents.revive("agent-1").await;

        cloud.delete_vm(&cid).await.unwrap();
        assert!(matches!(
            agents.start("agent-1").await,
            Err(AgentError::Unresponsive(_))
        ));
    }
}
