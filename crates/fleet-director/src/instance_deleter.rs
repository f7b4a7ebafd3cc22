//! Instance Deleter.
//!
//! Deletes instances through the task pool. One instance's deletion owns a
//! disjoint slice of state (its row, its VM, its IP), so instances are
//! deleted in parallel and one failure never affects another.
//!
//! Per instance, in order:
//! 1. mark it `deleting` (it stops counting as live, e.g. for DNS)
//! 2. stop its jobs through the agent (best-effort: the agent may be gone)
//! 3. release it: VM orphaned, IP freed, row removed, in one transaction
//! 4. delete the now orphaned VM; if that fails the VM stays listed as
//!    orphaned for the next teardown step or the next operation

use std::sync::Arc;

use async_trait::async_trait;
use fleet_cloud::AgentClient;
use fleet_events::Stage;
use fleet_pool::{DEFAULT_MAX_THREADS, TaskPool, WorkItem};
use fleet_state::{Instance, InstanceLifecycle, StateStore, epoch_secs};
use tracing::{info, warn};

use crate::error::DirectorResult;
use crate::vm::DeleteVm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOptions {
    pub max_threads: usize,
    pub skip_drain: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_MAX_THREADS,
            skip_drain: false,
        }
    }
}

/// Deletes a batch of instances, reporting one task per instance on `stage`.
///
/// Fails with `DirectorError::Tasks` when any instance failed; every
/// other instance was still deleted.
#[async_trait]
pub trait DeleteInstances: Send + Sync {
    async fn delete_instances(
        &self,
        instances: Vec<Instance>,
        stage: Stage,
        options: DeleteOptions,
    ) -> DirectorResult<()>;
}

#[derive(Clone)]
pub struct InstanceDeleter {
    store: StateStore,
    agents: Arc<dyn AgentClient>,
    vm_deleter: Arc<dyn DeleteVm>,
}

impl InstanceDeleter {
    pub fn new(store: StateStore, agents: Arc<dyn AgentClient>, vm_deleter: Arc<dyn DeleteVm>) -> Self {
        Self {
            store,
            agents,
            vm_deleter,
        }
    }

    /// Delete one instance. Idempotent: an already released instance is a no-op.
    pub async fn delete_instance(&self, mut instance: Instance, skip_drain: bool) -> DirectorResult<()> {
        let name = instance.display_name();
        if self
            .store
            .get_instance(&instance.deployment, &instance.id)?
            .is_none()
        {
            return Ok(());
        }
        instance.state = InstanceLifecycle::Deleting;
        instance.updated_at = epoch_secs();
        self.store.put_instance(&instance)?;

        if instance.vm_cid.is_some() {
            if let Err(e) = self.agents.stop(&instance.agent_id, skip_drain).await {
                warn!(instance = %name, error = %e, "could not stop jobs, deleting anyway");
            }
        }

        if let Some(orphan) = self
            .store
            .release_instance(&instance.deployment, &instance.id)?
        {
            self.vm_deleter.delete_vm(&orphan).await?;
        }
        info!(instance = %name, "instance deleted");
        Ok(())
    }
}

#[async_trait]
impl DeleteInstances for InstanceDeleter {
    async fn delete_instances(
        &self,
        instances: Vec<Instance>,
        stage: Stage,
        options: DeleteOptions,
    ) -> DirectorResult<()> {
        let items: Vec<WorkItem<()>> = instances
            .into_iter()
            .map(|instance| {
                let deleter = self.clone();
                let stage = stage.clone();
                let name = instance.display_name();
                WorkItem::new(name.clone(), async move {
                    stage
                        .track(name, deleter.delete_instance(instance, options.skip_drain))
                        .await?;
                    Ok(())
                })
            })
            .collect();
        TaskPool::new(options.max_threads).run(items).await.into_result()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DirectorError;
    use fleet_cloud::{AgentJobState, AgentResult, LocalDnsRecords, SyncOutcome};
    use fleet_events::EventLog;
    use fleet_state::Vm;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubAgents {
        stopped: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl AgentClient for StubAgents {
        async fn sync_dns(&self, _agent_id: &str, _records: &LocalDnsRecords) -> AgentResult<SyncOutcome> {
            Ok(SyncOutcome::Applied)
        }
        async fn start(&self, _agent_id: &str) -> AgentResult<()> {
            Ok(())
        }
        async fn stop(&self, agent_id: &str, skip_drain: bool) -> AgentResult<()> {
            self.stopped
                .lock()
                .unwrap()
                .push((agent_id.to_string(), skip_drain));
            Ok(())
        }
        async fn get_state(&self, _agent_id: &str) -> AgentResult<AgentJobState> {
            Ok(AgentJobState::Running)
        }
    }

    /// Fails for the cids listed in `broken`, deletes the row otherwise.
    struct FlakyVmDeleter {
        store: StateStore,
        broken: Vec<String>,
    }

    #[async_trait]
    impl DeleteVm for FlakyVmDeleter {
        async fn delete_vm(&self, vm: &Vm) -> DirectorResult<()> {
            if self.broken.contains(&vm.cid) {
                return Err(fleet_cloud::CloudError::Permanent(format!("cannot delete {}", vm.cid)).into());
            }
            self.store.delete_vm(&vm.deployment, &vm.cid)?;
            Ok(())
        }
    }

    fn seed(store: &StateStore, index: u32) -> Instance {
        let cid = format!("vm-{index}");
        let instance = Instance {
            id: format!("uuid-{index}"),
            deployment: "app".to_string(),
            group: "web".to_string(),
            index,
            az: None,
            network: "default".to_string(),
            ip: format!("10.0.0.{}", index + 2),
            dynamic_ip: false,
            agent_id: format!("agent-{index}"),
            state: InstanceLifecycle::Running,
            vm_cid: Some(cid.clone()),
            created_at: 0,
            updated_at: 0,
        };
        let vm = Vm {
            cid,
            deployment: "app".to_string(),
            instance_id: Some(instance.id.clone()),
            agent_id: instance.agent_id.clone(),
            stemcell_cid: "img-1".to_string(),
            created_at: 0,
        };
        store.bind_vm(&vm, &instance).unwrap();
        instance
    }

    #[tokio::test]
    async fn failed_vm_delete_leaves_an_orphan_and_spares_siblings() {
        let store = StateStore::open_in_memory().unwrap();
        let agents = Arc::new(StubAgents::default());
        let deleter = InstanceDeleter::new(
            store.clone(),
            agents.clone(),
            Arc::new(FlakyVmDeleter {
                store: store.clone(),
                broken: vec!["vm-1".to_string()],
            }),
        );
        let instances: Vec<Instance> = (0..3).map(|i| seed(&store, i)).collect();
        let log = EventLog::in_memory();
        let stage = log.begin_stage("Deleting instances", 3);

        let err = deleter
            .delete_instances(instances, stage, DeleteOptions::default())
            .await
            .unwrap_err();
        let DirectorError::Tasks(failure) = err else {
            panic!("expected aggregate failure");
        };
        assert_eq!(failure.failed_tasks(), vec!["web/uuid-1 (1)"]);

        assert!(store.list_instances("app").unwrap().is_empty());
        let orphans = store.list_orphaned_vms("app").unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].cid, "vm-1");
        assert_eq!(agents.stopped.lock().unwrap().len(), 3);
        assert_eq!(log.stage_events("Deleting instances").len(), 6);
    }

    #[tokio::test]
    async fn deleting_twice_is_a_no_op() {
        let store = StateStore::open_in_memory().unwrap();
        let deleter = InstanceDeleter::new(
            store.clone(),
            Arc::new(StubAgents::default()),
            Arc::new(FlakyVmDeleter {
                store: store.clone(),
                broken: Vec::new(),
            }),
        );
        let instance = seed(&store, 0);
        deleter.delete_instance(instance.clone(), true).await.unwrap();
        deleter.delete_instance(instance, true).await.unwrap();
        assert!(store.list_vms("app").unwrap().is_empty());
    }
}
