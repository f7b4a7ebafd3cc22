//! Cloud Reconciler.
//!
//! `scan` compares every instance that should have a VM against the cloud
//! and the VM's agent:
//!
//! | cloud has VM | agent answers | problem              |
//! |--------------|---------------|----------------------|
//! | no           | -             | `missing_vm`         |
//! | yes          | no            | `unresponsive_agent` |
//! | yes          | yes           | none                 |
//!
//! Found problems replace the deployment's open problems in the store.
//! `resolve` applies one resolution to one problem; `auto` applies the
//! default resolution to everything found and scans again.

use std::sync::Arc;
use std::time::Duration;

use fleet_cloud::{AgentClient, CloudProvider};
use fleet_director::UpdateConfig;
use fleet_events::EventLog;
use fleet_pool::{TaskPool, WorkItem};
use fleet_rollout::health::watch_until_running;
use fleet_rollout::{InstanceUpdater, UpdateRequest};
use fleet_state::{Instance, InstanceLifecycle, NewProblem, Problem, ProblemKind, StateStore, epoch_secs};
use tracing::{debug, info, warn};

use crate::error::{CloudCheckError, CloudCheckResult};
use crate::report::{AppliedResolution, CheckReport};
use crate::resolution::{Resolution, default_resolution, resolutions_for};

/// Result of one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Scan {
    pub deployment: String,
    /// VMs looked at.
    pub scanned: usize,
    pub problems: Vec<Problem>,
}

#[derive(Clone)]
pub struct CloudReconciler {
    store: StateStore,
    events: EventLog,
    cloud: Arc<dyn CloudProvider>,
    agents: Arc<dyn AgentClient>,
    updater: InstanceUpdater,
    pool: TaskPool,
    watch_time: Duration,
}

impl CloudReconciler {
    pub fn new(
        store: StateStore,
        events: EventLog,
        cloud: Arc<dyn CloudProvider>,
        updater: InstanceUpdater,
        pool: TaskPool,
    ) -> Self {
        Self {
            store,
            events,
            cloud,
            agents: updater.agents(),
            updater,
            pool,
            watch_time: Duration::from_millis(UpdateConfig::default().update_watch_time_ms),
        }
    }

    /// How long a rebooted or recreated VM may take to report `running`.
    pub fn with_watch_time(mut self, watch_time: Duration) -> Self {
        self.watch_time = watch_time;
        self
    }

    /// Find drift between the inventory and the cloud.
    pub async fn scan(&self, deployment: &str) -> CloudCheckResult<Scan> {
        if self.store.get_deployment(deployment)?.is_none() {
            return Err(CloudCheckError::DeploymentNotFound(deployment.to_string()));
        }
        let instances: Vec<Instance> = self
            .store
            .list_instances(deployment)?
            .into_iter()
            .filter(|i| i.state.is_live() && i.vm_cid.is_some())
            .collect();
        let scanned = instances.len();
        info!(%deployment, vms = scanned, "scanning vms");

        let stage = self.events.begin_stage("Scanning VMs", scanned as u32);
        let items: Vec<WorkItem<Option<NewProblem>>> = instances
            .into_iter()
            .map(|instance| {
                let cloud = Arc::clone(&self.cloud);
                let agents = Arc::clone(&self.agents);
                let stage = stage.clone();
                let name = instance.display_name();
                WorkItem::new(name.clone(), async move {
                    Ok(stage.track(name, check_instance(cloud, agents, instance)).await?)
                })
            })
            .collect();
        let found: Vec<NewProblem> = self
            .pool
            .run(items)
            .await
            .into_result()?
            .into_iter()
            .flatten()
            .collect();

        let problems = self.store.replace_open_problems(deployment, found)?;
        info!(%deployment, problems = problems.len(), "scan finished");
        Ok(Scan {
            deployment: deployment.to_string(),
            scanned,
            problems,
        })
    }

    /// Apply `resolution` to `problem` and mark it resolved.
    pub async fn resolve(&self, problem: &Problem, resolution: Resolution) -> CloudCheckResult<Problem> {
        if !resolutions_for(problem.kind).contains(&resolution) {
            return Err(CloudCheckError::UnsupportedResolution {
                kind: problem.kind,
                resolution,
            });
        }
        let deployment = problem.deployment.as_str();
        let mut instance = self
            .store
            .get_instance(deployment, &problem.instance_id)?
            .ok_or_else(|| CloudCheckError::InstanceGone(problem.instance_id.clone()))?;
        let name = instance.display_name();
        info!(%deployment, instance = %name, problem = problem.id, %resolution, "applying resolution");

        match resolution {
            Resolution::Skip => {}
            Resolution::RebootVm => {
                if let Some(cid) = &instance.vm_cid {
                    self.cloud.reboot_vm(cid).await?;
                    watch_until_running(self.agents.as_ref(), &name, &instance.agent_id, self.watch_time)
                        .await?;
                }
            }
            Resolution::RecreateVm => {
                let request = UpdateRequest {
                    stemcell_cid: None,
                    recreate: true,
                    watch_time: self.watch_time,
                };
                self.updater.update(instance, &request).await?;
                self.updater.converge_dns(deployment).await?;
            }
            Resolution::DeleteVm => {
                if let Some(cid) = instance.vm_cid.take() {
                    detach(&self.store, &mut instance)?;
                    if let Some(mut vm) = self.store.get_vm(deployment, &cid)? {
                        vm.instance_id = None;
                        self.store.put_vm(&vm)?;
                        self.updater.vm_deleter().delete_vm(&vm).await?;
                    }
                }
            }
            Resolution::DeleteVmReference => {
                if let Some(cid) = instance.vm_cid.take() {
                    detach(&self.store, &mut instance)?;
                    self.store.delete_vm(deployment, &cid)?;
                    warn!(instance = %name, %cid, "vm reference deleted, the vm may still exist");
                }
            }
        }

        Ok(self
            .store
            .resolve_problem(deployment, problem.id, resolution.as_str())?)
    }

    /// Apply the chosen resolutions, then scan again.
    ///
    /// A failing resolution does not stop the others.
    pub async fn apply(
        &self,
        scan: Scan,
        choices: Vec<(Problem, Resolution)>,
    ) -> CloudCheckResult<CheckReport> {
        let stage = self
            .events
            .begin_stage("Applying problem resolutions", choices.len() as u32);
        let items: Vec<WorkItem<AppliedResolution>> = choices
            .into_iter()
            .map(|(problem, resolution)| {
                let reconciler = self.clone();
                let stage = stage.clone();
                let task = format!(
                    "{} {}: {}",
                    problem.kind.as_str(),
                    problem.id,
                    resolution.label()
                );
                WorkItem::new(task.clone(), async move {
                    let outcome = stage.track(task, reconciler.resolve(&problem, resolution)).await;
                    Ok(AppliedResolution {
                        error: outcome.err().map(|e| e.to_string()),
                        problem,
                        resolution,
                    })
                })
            })
            .collect();
        let applied = self.pool.run(items).await.into_result()?;

        let remaining = self.scan(&scan.deployment).await?.problems.len();
        debug!(deployment = %scan.deployment, remaining, "rescanned after resolutions");
        Ok(CheckReport {
            scan,
            applied,
            remaining: Some(remaining),
        })
    }

    /// Scan and apply every problem's default resolution.
    pub async fn auto(&self, deployment: &str) -> CloudCheckResult<CheckReport> {
        let scan = self.scan(deployment).await?;
        if scan.problems.is_empty() {
            return Ok(CheckReport::scan_only(scan));
        }
        let choices = scan
            .problems
            .iter()
            .map(|p| (p.clone(), default_resolution(p.kind)))
            .collect();
        self.apply(scan, choices).await
    }

    /// Scan without resolving anything.
    pub async fn report(&self, deployment: &str) -> CloudCheckResult<CheckReport> {
        Ok(CheckReport::scan_only(self.scan(deployment).await?))
    }
}

async fn check_instance(
    cloud: Arc<dyn CloudProvider>,
    agents: Arc<dyn AgentClient>,
    instance: Instance,
) -> CloudCheckResult<Option<NewProblem>> {
    let Some(cid) = instance.vm_cid.clone() else {
        return Ok(None);
    };
    let name = instance.display_name();
    let kind = if !cloud.has_vm(&cid).await? {
        ProblemKind::MissingVm
    } else if let Err(e) = agents.get_state(&instance.agent_id).await {
        debug!(instance = %name, error = %e, "agent not answering");
        ProblemKind::UnresponsiveAgent
    } else {
        return Ok(None);
    };
    let description = match kind {
        ProblemKind::MissingVm => format!("VM for '{name}' with cloud ID '{cid}' missing."),
        ProblemKind::UnresponsiveAgent => {
            format!("VM for '{name}' with cloud ID '{cid}' is not responding.")
        }
    };
    warn!(instance = %name, %cid, kind = kind.as_str(), "problem found");
    Ok(Some(NewProblem {
        kind,
        instance_id: instance.id,
        vm_cid: Some(cid),
        description,
    }))
}

/// Keep the instance, without a VM.
fn detach(store: &StateStore, instance: &mut Instance) -> CloudCheckResult<()> {
    instance.vm_cid = None;
    instance.state = InstanceLifecycle::Detached;
    instance.updated_at = epoch_secs();
    store.put_instance(instance)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_agent::LocalAgents;
    use fleet_cloud::{DummyCloud, VmRequest};
    use fleet_state::{Deployment, Vm};

    struct Harness {
        _dir: tempfile::TempDir,
        store: StateStore,
        cloud: DummyCloud,
        agents: Arc<LocalAgents>,
        reconciler: CloudReconciler,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cloud = DummyCloud::open(&dir.path().join("vms")).unwrap();
        let agents = Arc::new(LocalAgents::new(&dir.path().join("agents"), cloud.clone()));
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_deployment(&Deployment {
                name: "app".to_string(),
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        let updater = InstanceUpdater::new(store.clone(), Arc::new(cloud.clone()), agents.clone(), None);
        let reconciler = CloudReconciler::new(
            store.clone(),
            EventLog::in_memory(),
            Arc::new(cloud.clone()),
            updater,
            TaskPool::default(),
        )
        .with_watch_time(Duration::from_millis(500));
        Harness {
            _dir: dir,
            store,
            cloud,
            agents,
            reconciler,
        }
    }

    /// A running instance on a real dummy-cloud VM.
    async fn running(h: &Harness, index: u32) -> Instance {
        let agent_id = format!("agent-{index}");
        let cid = h
            .cloud
            .create_vm(&VmRequest {
                agent_id: agent_id.clone(),
                stemcell_cid: "img-1".to_string(),
                networks: Vec::new(),
            })
            .await
            .unwrap()
            .cid;
        let instance = Instance {
            id: format!("uuid-{index}"),
            deployment: "app".to_string(),
            group: "web".to_string(),
            index,
            az: None,
            network: "default".to_string(),
            ip: format!("10.0.0.{}", index + 2),
            dynamic_ip: false,
            agent_id: agent_id.clone(),
            state: InstanceLifecycle::Running,
            vm_cid: Some(cid.clone()),
            created_at: 0,
            updated_at: 0,
        };
        h.store.put_instance(&instance).unwrap();
        h.store
            .put_vm(&Vm {
                cid,
                deployment: "app".to_string(),
                instance_id: Some(instance.id.clone()),
                agent_id,
                stemcell_cid: "img-1".to_string(),
                created_at: 0,
            })
            .unwrap();
        h.agents.start(&instance.agent_id).await.unwrap();
        instance
    }

    #[tokio::test]
    async fn healthy_deployment_has_no_problems() {
        let h = harness().await;
        running(&h, 0).await;
        let scan = h.reconciler.scan("app").await.unwrap();
        assert_eq!(scan.scanned, 1);
        assert!(scan.problems.is_empty());
    }

    #[tokio::test]
    async fn classifies_missing_and_unresponsive() {
        let h = harness().await;
        let gone = running(&h, 0).await;
        let mute = running(&h, 1).await;
        h.cloud.delete_vm(gone.vm_cid.as_deref().unwrap()).await.unwrap();
        h.agents.silence(&mute.agent_id).await;

        let scan = h.reconciler.scan("app").await.unwrap();
        let kinds: Vec<_> = scan.problems.iter().map(|p| (p.kind, p.instance_id.as_str())).collect();
        assert_eq!(
            kinds,
            vec![
                (ProblemKind::MissingVm, "uuid-0"),
                (ProblemKind::UnresponsiveAgent, "uuid-1"),
            ]
        );
        assert_eq!(h.store.list_open_problems("app").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejects_resolution_not_offered_for_kind() {
        let h = harness().await;
        let gone = running(&h, 0).await;
        h.cloud.delete_vm(gone.vm_cid.as_deref().unwrap()).await.unwrap();
        let scan = h.reconciler.scan("app").await.unwrap();

        let err = h
            .reconciler
            .resolve(&scan.problems[0], Resolution::RebootVm)
            .await
            .unwrap_err();
        assert!(matches!(err, CloudCheckError::UnsupportedResolution { .. }));
    }

    #[tokio::test]
    async fn delete_vm_reference_detaches_instance() {
        let h = harness().await;
        let gone = running(&h, 0).await;
        let cid = gone.vm_cid.clone().unwrap();
        h.cloud.delete_vm(&cid).await.unwrap();
        let scan = h.reconciler.scan("app").await.unwrap();

        let resolved = h
            .reconciler
            .resolve(&scan.problems[0], Resolution::DeleteVmReference)
            .await
            .unwrap();
        assert_eq!(resolved.resolution.as_deref(), Some("delete_vm_reference"));
        let instance = h.store.get_instance("app", "uuid-0").unwrap().unwrap();
        assert_eq!(instance.state, InstanceLifecycle::Detached);
        assert!(instance.vm_cid.is_none());
        assert!(h.store.get_vm("app", &cid).unwrap().is_none());
        assert!(h.reconciler.scan("app").await.unwrap().problems.is_empty());
    }

    #[tokio::test]
    async fn delete_vm_removes_it_from_the_cloud() {
        let h = harness().await;
        let mute = running(&h, 0).await;
        h.agents.silence(&mute.agent_id).await;
        let scan = h.reconciler.scan("app").await.unwrap();

        h.reconciler
            .resolve(&scan.problems[0], Resolution::DeleteVm)
            .await
            .unwrap();
        assert!(h.cloud.vms().await.unwrap().is_empty());
        assert!(h.store.list_vms("app").unwrap().is_empty());
    }

    #[tokio::test]
    async fn reboot_of_a_silent_agent_fails() {
        let h = harness().await;
        let mute = running(&h, 0).await;
        h.agents.silence(&mute.agent_id).await;
        let scan = h.reconciler.scan("app").await.unwrap();

        let result = h
            .reconciler
            .resolve(&scan.problems[0], Resolution::RebootVm)
            .await;
        assert!(result.is_err());
        let vm = h.cloud.get_vm(mute.vm_cid.as_deref().unwrap()).await.unwrap().unwrap();
        assert_eq!(vm.reboots, 1);
        assert_eq!(h.store.list_open_problems("app").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_deployment() {
        let h = harness().await;
        assert!(matches!(
            h.reconciler.scan("nope").await,
            Err(CloudCheckError::DeploymentNotFound(_))
        ));
    }
}
