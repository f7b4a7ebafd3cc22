//! Bringing one instance to `running` on a VM.

use std::sync::Arc;
use std::time::Duration;

use fleet_cloud::{AgentClient, CloudProvider};
use fleet_director::{DeleteVm, DirectorError, VmCreator, VmDeleter};
use fleet_dns::DnsSynchronizer;
use fleet_state::{Instance, InstanceLifecycle, StateStore, epoch_secs};
use tracing::{debug, info};

use crate::error::RolloutResult;
use crate::health::watch_until_running;

/// How one instance should be updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    /// Image for the new VM. Falls back to the image of the VM being replaced.
    pub stemcell_cid: Option<String>,
    /// Replace the instance's current VM, if it has one.
    pub recreate: bool,
    pub watch_time: Duration,
}

/// Per instance, in order:
/// 1. drop the old VM and take a fresh agent id (recreate only)
/// 2. recompute the deployment's DNS rows so the new agent id is in them
/// 3. boot a VM with the instance's agent id; on a dynamic network,
///    recompute again with the address the cloud assigned
/// 4. push the current record set to the new agent
/// 5. start jobs and watch until `running`
#[derive(Clone)]
pub struct InstanceUpdater {
    store: StateStore,
    agents: Arc<dyn AgentClient>,
    creator: VmCreator,
    vm_deleter: Arc<dyn DeleteVm>,
    dns: Option<DnsSynchronizer>,
}

impl InstanceUpdater {
    pub fn new(
        store: StateStore,
        cloud: Arc<dyn CloudProvider>,
        agents: Arc<dyn AgentClient>,
        dns: Option<DnsSynchronizer>,
    ) -> Self {
        let vm_deleter: Arc<dyn DeleteVm> = Arc::new(VmDeleter::new(Arc::clone(&cloud), store.clone()));
        Self {
            creator: VmCreator::new(cloud, store.clone()),
            store,
            agents,
            vm_deleter,
            dns,
        }
    }

    pub fn agents(&self) -> Arc<dyn AgentClient> {
        Arc::clone(&self.agents)
    }

    pub fn vm_deleter(&self) -> Arc<dyn DeleteVm> {
        Arc::clone(&self.vm_deleter)
    }

    pub fn dns(&self) -> Option<&DnsSynchronizer> {
        self.dns.as_ref()
    }

    pub async fn update(&self, mut instance: Instance, request: &UpdateRequest) -> RolloutResult<Instance> {
        let name = instance.display_name();
        let mut stemcell_cid = request.stemcell_cid.clone();

        if request.recreate && instance.vm_cid.is_some() {
            let previous = self
                .creator
                .detach_for_recreate(&mut instance, self.vm_deleter.as_ref())
                .await?;
            stemcell_cid = stemcell_cid.or(previous);
            self.recompute(&instance.deployment)?;
        }

        if instance.vm_cid.is_none() {
            let stemcell_cid =
                stemcell_cid.ok_or_else(|| DirectorError::StemcellNotFound(format!("no image known for {name}")))?;
            self.creator.create_for(&mut instance, &stemcell_cid).await?;
            if instance.dynamic_ip {
                self.recompute(&instance.deployment)?;
            }
            if let Some(dns) = &self.dns {
                let outcome = dns.sync_agent(&instance.agent_id).await?;
                debug!(instance = %name, ?outcome, "records pushed before start");
            }
        }

        self.agents.start(&instance.agent_id).await?;
        watch_until_running(self.agents.as_ref(), &name, &instance.agent_id, request.watch_time).await?;

        instance.state = InstanceLifecycle::Running;
        instance.updated_at = epoch_secs();
        self.store.put_instance(&instance)?;
        info!(instance = %name, agent_id = %instance.agent_id, "instance updated");
        Ok(instance)
    }

    /// Recompute the DNS rows of `deployment` from its stored instances.
    pub fn recompute(&self, deployment: &str) -> RolloutResult<()> {
        if let Some(dns) = &self.dns {
            dns.recompute_stored(deployment)?;
        }
        Ok(())
    }

    /// Recompute, then push the record set to the deployment's agents.
    pub async fn converge_dns(&self, deployment: &str) -> RolloutResult<()> {
        if let Some(dns) = &self.dns {
            self.recompute(deployment)?;
            dns.publish(deployment).await?;
        }
        Ok(())
    }
}
