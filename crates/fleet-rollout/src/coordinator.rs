//! Rolling Update Coordinator.
//!
//! Converges a deployment to a [`DeploymentPlan`], one instance group at a
//! time. For each group the [`GroupRollout`] controller hands out steps:
//!
//! 1. delete instances beyond the planned count
//! 2. give every new index an identity (id, IP, agent id), recomputing the
//!    DNS rows once per admitted instance
//! 3. update the canaries, then the rest in batches of `max_in_flight`
//!
//! DNS is recomputed and published after every step, so agents see the
//! topology converge batch by batch.

use std::collections::BTreeSet;
use std::sync::Arc;

use fleet_cloud::{AgentClient, CloudProvider};
use fleet_director::{
    DeleteInstances, DeleteOptions, DeploymentPlan, DirectorError, InstanceDeleter,
    InstanceGroupPlan, NetworkType, vm::new_agent_id,
};
use fleet_dns::DnsSynchronizer;
use fleet_events::EventLog;
use fleet_pool::{AggregateTaskFailure, TaskPool, WorkItem};
use fleet_state::{
    Deployment, Instance, InstanceLifecycle, Property, ReleaseVersion, StateStore, Stemcell,
    epoch_secs,
};
use tracing::{info, warn};

use crate::controller::{BatchAction, GroupChanges, GroupRollout, RolloutPhase, StepHealth};
use crate::error::{RolloutError, RolloutResult};
use crate::strategy::{BatchKind, batch_parallelism, watch_time};
use crate::updater::{InstanceUpdater, UpdateRequest};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeployOptions {
    /// Replace the VM of every instance, not just of the ones that need it.
    pub recreate: bool,
}

/// What a deploy did to one instance group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupReport {
    pub group: String,
    pub deleted: u32,
    pub admitted: u32,
    pub updated: u32,
    pub phase: RolloutPhase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReport {
    pub deployment: String,
    pub groups: Vec<GroupReport>,
}

#[derive(Clone)]
pub struct RollingUpdateCoordinator {
    store: StateStore,
    events: EventLog,
    updater: InstanceUpdater,
    instance_deleter: Arc<dyn DeleteInstances>,
}

impl RollingUpdateCoordinator {
    pub fn new(
        store: StateStore,
        events: EventLog,
        cloud: Arc<dyn CloudProvider>,
        agents: Arc<dyn AgentClient>,
        dns: Option<DnsSynchronizer>,
    ) -> Self {
        let updater = InstanceUpdater::new(store.clone(), cloud, Arc::clone(&agents), dns);
        let instance_deleter = Arc::new(InstanceDeleter::new(store.clone(), agents, updater.vm_deleter()));
        Self {
            store,
            events,
            updater,
            instance_deleter,
        }
    }

    pub fn updater(&self) -> &InstanceUpdater {
        &self.updater
    }

    /// Converge the deployment to `plan`.
    ///
    /// Groups are rolled out in plan order; the first group that fails
    /// stops the deploy. Nothing already converged is rolled back.
    pub async fn deploy(&self, plan: &DeploymentPlan, options: DeployOptions) -> RolloutResult<DeployReport> {
        plan.validate()?;
        info!(deployment = %plan.name, recreate = options.recreate, "deploy started");
        self.prepare(plan)?;

        let mut report = DeployReport {
            deployment: plan.name.clone(),
            groups: Vec::new(),
        };

        let planned: BTreeSet<&str> = plan.instance_groups.iter().map(|g| g.name.as_str()).collect();
        let dropped: BTreeSet<String> = self
            .store
            .list_instances(&plan.name)?
            .into_iter()
            .filter(|i| !planned.contains(i.group.as_str()))
            .map(|i| i.group)
            .collect();
        for group in dropped {
            report.groups.push(self.delete_group(plan, &group).await?);
        }

        for group in &plan.instance_groups {
            report.groups.push(self.roll_group(plan, group, options).await?);
        }

        info!(deployment = %plan.name, groups = report.groups.len(), "deploy finished");
        Ok(report)
    }

    /// Record the deployment and its shared resources and properties.
    fn prepare(&self, plan: &DeploymentPlan) -> RolloutResult<()> {
        let now = epoch_secs();
        let created_at = self
            .store
            .get_deployment(&plan.name)?
            .map_or(now, |d| d.created_at);
        self.store.put_deployment(&Deployment {
            name: plan.name.clone(),
            created_at,
            updated_at: now,
        })?;

        for stemcell in &plan.stemcells {
            let key = stemcell.key();
            if self.store.get_stemcell(&key)?.is_none() {
                let cid = stemcell
                    .cid
                    .clone()
                    .ok_or_else(|| DirectorError::StemcellNotFound(key.clone()))?;
                self.store.put_stemcell(&Stemcell {
                    name: stemcell.name.clone(),
                    version: stemcell.version.clone(),
                    cid,
                })?;
                info!(stemcell = %key, "stemcell registered");
            }
            self.store.link_stemcell(&plan.name, &key)?;
        }

        for release in &plan.releases {
            let key = release.key();
            if self.store.get_release_version(&key)?.is_none() {
                self.store.put_release_version(&ReleaseVersion {
                    name: release.name.clone(),
                    version: release.version.clone(),
                })?;
                info!(release = %key, "release version registered");
            }
            self.store.link_release_version(&plan.name, &key)?;
        }

        self.store.delete_properties(&plan.name)?;
        for (key, value) in &plan.properties {
            self.store.put_property(&Property {
                deployment: plan.name.clone(),
                key: key.clone(),
                value: value.clone(),
            })?;
        }
        Ok(())
    }

    /// Delete every instance of a group the plan no longer has.
    async fn delete_group(&self, plan: &DeploymentPlan, group: &str) -> RolloutResult<GroupReport> {
        let obsolete: Vec<Instance> = self
            .store
            .list_group_instances(&plan.name, group)?
            .into_iter()
            .filter(|i| i.state.is_live())
            .collect();
        let count = obsolete.len() as u32;
        let changes = GroupChanges {
            obsolete: count,
            ..GroupChanges::default()
        };
        let mut rollout = GroupRollout::new(&plan.name, group, changes, &plan.update);
        let mut last = StepHealth::default();
        let mut failure = None;
        while let Some(action) = rollout.advance(&last) {
            if let BatchAction::DeleteObsolete { count } = action {
                let options = DeleteOptions {
                    max_threads: plan.update.max_in_flight.max(1) as usize,
                    skip_drain: false,
                };
                (last, failure) = self
                    .delete_instances(&plan.name, group, obsolete.clone(), count, options)
                    .await?;
            }
        }
        if let Some(source) = failure {
            return Err(batch_failed(group, &rollout, source));
        }
        Ok(GroupReport {
            group: group.to_string(),
            deleted: count,
            admitted: 0,
            updated: 0,
            phase: rollout.phase,
        })
    }

    async fn roll_group(
        &self,
        plan: &DeploymentPlan,
        group: &InstanceGroupPlan,
        options: DeployOptions,
    ) -> RolloutResult<GroupReport> {
        let deployment = plan.name.as_str();
        let stemcell_cid = self.stemcell_cid(plan, group)?;
        let existing: Vec<Instance> = self
            .store
            .list_group_instances(deployment, &group.name)?
            .into_iter()
            .filter(|i| i.state.is_live())
            .collect();

        let (obsolete, kept): (Vec<Instance>, Vec<Instance>) =
            existing.into_iter().partition(|i| i.index >= group.instances);
        let taken: BTreeSet<u32> = kept.iter().map(|i| i.index).collect();
        let missing: Vec<u32> = (0..group.instances).filter(|i| !taken.contains(i)).collect();

        let mut to_update = Vec::new();
        for instance in kept {
            if self.needs_update(&instance, &stemcell_cid, options)? {
                to_update.push(instance);
            }
        }

        let changes = GroupChanges {
            obsolete: obsolete.len() as u32,
            admitted: missing.len() as u32,
            to_update: (to_update.len() + missing.len()) as u32,
        };
        info!(
            %deployment,
            group = %group.name,
            obsolete = changes.obsolete,
            admitted = changes.admitted,
            to_update = changes.to_update,
            "rolling out instance group"
        );

        let stage = self.events.begin_stage_with_tags(
            "Updating instance",
            vec![group.name.clone()],
            changes.to_update,
        );
        let mut rollout = GroupRollout::new(deployment, &group.name, changes, &plan.update);
        let mut last = StepHealth::default();
        let mut failure: Option<AggregateTaskFailure> = None;
        let mut updated = 0;

        while let Some(action) = rollout.advance(&last) {
            match action {
                BatchAction::DeleteObsolete { count } => {
                    let options = DeleteOptions {
                        max_threads: plan.update.max_in_flight.max(1) as usize,
                        skip_drain: group.skip_drain,
                    };
                    (last, failure) = self
                        .delete_instances(deployment, &group.name, obsolete.clone(), count, options)
                        .await?;
                }
                BatchAction::AdmitNew { count } => {
                    for &index in &missing {
                        to_update.push(self.admit(plan, group, index)?);
                    }
                    to_update.sort_by_key(|i| i.index);
                    self.updater.converge_dns(deployment).await?;
                    last = StepHealth::of(count, count);
                }
                BatchAction::UpdateBatch(batch) => {
                    let request = UpdateRequest {
                        stemcell_cid: Some(stemcell_cid.clone()),
                        recreate: true,
                        watch_time: watch_time(&plan.update, batch.kind),
                    };
                    let canary = batch.kind == BatchKind::Canary;
                    let items: Vec<WorkItem<Instance>> = to_update[batch.range()]
                        .iter()
                        .cloned()
                        .map(|instance| {
                            let updater = self.updater.clone();
                            let stage = stage.clone();
                            let request = request.clone();
                            let mut name = instance.display_name();
                            if canary {
                                name.push_str(" (canary)");
                            }
                            WorkItem::new(name.clone(), async move {
                                Ok(stage.track(name, updater.update(instance, &request)).await?)
                            })
                        })
                        .collect();

                    let outcome = TaskPool::new(batch_parallelism(&plan.update, &batch))
                        .run(items)
                        .await;
                    let succeeded = outcome.completed.len() as u32;
                    updated += succeeded;
                    self.updater.converge_dns(deployment).await?;
                    last = StepHealth::of(succeeded, batch.count);
                    failure = outcome.into_result().err();
                }
                BatchAction::Halt => break,
            }
        }

        if let Some(source) = failure {
            return Err(batch_failed(&group.name, &rollout, source));
        }
        Ok(GroupReport {
            group: group.name.clone(),
            deleted: obsolete.len() as u32,
            admitted: missing.len() as u32,
            updated,
            phase: rollout.phase,
        })
    }

    async fn delete_instances(
        &self,
        deployment: &str,
        group: &str,
        instances: Vec<Instance>,
        count: u32,
        options: DeleteOptions,
    ) -> RolloutResult<(StepHealth, Option<AggregateTaskFailure>)> {
        let stage = self.events.begin_stage_with_tags(
            "Deleting unneeded instances",
            vec![group.to_string()],
            count,
        );
        let result = self
            .instance_deleter
            .delete_instances(instances, stage, options)
            .await;
        self.updater.converge_dns(deployment).await?;
        match result {
            Ok(()) => Ok((StepHealth::of(count, count), None)),
            Err(DirectorError::Tasks(failures)) => {
                let failed = failures.failures.len() as u32;
                Ok((StepHealth::of(count.saturating_sub(failed), count), Some(failures)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Assign identity to a new instance and give it its DNS row.
    ///
    /// On a dynamic network the address, and with it the row, only arrive
    /// once the cloud has booted the VM.
    fn admit(&self, plan: &DeploymentPlan, group: &InstanceGroupPlan, index: u32) -> RolloutResult<Instance> {
        let network = plan.network(&group.network).ok_or_else(|| {
            DirectorError::Plan(format!("unknown network `{}`", group.network))
        })?;
        let id = uuid::Uuid::new_v4().to_string();
        let ip = match network.range() {
            Some((first, last)) => self.store.reserve_ip(&network.name, first, last, &id)?.to_string(),
            None => String::new(),
        };
        let now = epoch_secs();
        let instance = Instance {
            id,
            deployment: plan.name.clone(),
            group: group.name.clone(),
            index,
            az: group.az_for(index),
            network: network.name.clone(),
            dynamic_ip: network.kind == NetworkType::Dynamic,
            ip,
            agent_id: new_agent_id(),
            state: InstanceLifecycle::Desired,
            vm_cid: None,
            created_at: now,
            updated_at: now,
        };
        self.store.put_instance(&instance)?;
        self.updater.recompute(&plan.name)?;
        info!(instance = %instance.display_name(), ip = %instance.ip, "instance admitted");
        Ok(instance)
    }

    fn needs_update(&self, instance: &Instance, stemcell_cid: &str, options: DeployOptions) -> RolloutResult<bool> {
        if options.recreate || instance.state != InstanceLifecycle::Running {
            return Ok(true);
        }
        let Some(cid) = &instance.vm_cid else {
            return Ok(true);
        };
        match self.store.get_vm(&instance.deployment, cid)? {
            Some(vm) => Ok(vm.stemcell_cid != stemcell_cid),
            None => {
                warn!(instance = %instance.display_name(), %cid, "vm row missing, recreating");
                Ok(true)
            }
        }
    }

    fn stemcell_cid(&self, plan: &DeploymentPlan, group: &InstanceGroupPlan) -> RolloutResult<String> {
        let stemcell = plan
            .stemcell(&group.stemcell)
            .ok_or_else(|| DirectorError::StemcellNotFound(group.stemcell.clone()))?;
        let key = stemcell.key();
        let stored = self
            .store
            .get_stemcell(&key)?
            .ok_or(DirectorError::StemcellNotFound(key))?;
        Ok(stored.cid)
    }
}

fn batch_failed(group: &str, rollout: &GroupRollout, source: AggregateTaskFailure) -> RolloutError {
    RolloutError::BatchFailed {
        group: group.to_string(),
        phase: rollout.failure().unwrap_or("rollout").to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_agent::LocalAgents;
    use fleet_cloud::DummyCloud;
    use fleet_dns::DnsSettings;

    const PLAN: &str = r#"
name = "app"

[[stemcells]]
name = "ubuntu"
version = "1"
cid = "img-1"

[[releases]]
name = "web-release"
version = "1"

[[networks]]
name = "default"
first_ip = "10.0.0.2"
last_ip = "10.0.0.20"

[update]
canaries = 1
max_in_flight = 2
canary_watch_time_ms = 500
update_watch_time_ms = 500

[[instance_groups]]
name = "web"
instances = 3
network = "default"
stemcell = "ubuntu"

[properties]
port = 8080
"#;

    struct Harness {
        _dir: tempfile::TempDir,
        store: StateStore,
        cloud: DummyCloud,
        events: EventLog,
        coordinator: RollingUpdateCoordinator,
    }

    fn harness(dns: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cloud = DummyCloud::open(&dir.path().join("vms")).unwrap();
        let agents = Arc::new(LocalAgents::new(&dir.path().join("agents"), cloud.clone()));
        let store = StateStore::open_in_memory().unwrap();
        let events = EventLog::in_memory();
        let dns = dns.then(|| {
            DnsSynchronizer::new(store.clone(), agents.clone(), TaskPool::default(), DnsSettings::default())
                .unwrap()
        });
        let coordinator = RollingUpdateCoordinator::new(
            store.clone(),
            events.clone(),
            Arc::new(cloud.clone()),
            agents,
            dns,
        );
        Harness {
            _dir: dir,
            store,
            cloud,
            events,
            coordinator,
        }
    }

    #[tokio::test]
    async fn initial_deploy_creates_everything() {
        let h = harness(true);
        let plan = DeploymentPlan::from_toml(PLAN).unwrap();
        let report = h.coordinator.deploy(&plan, DeployOptions::default()).await.unwrap();

        assert_eq!(report.groups[0].admitted, 3);
        assert_eq!(report.groups[0].updated, 3);
        assert_eq!(report.groups[0].phase, RolloutPhase::Converged);
        assert_eq!(h.cloud.vms().await.unwrap().len(), 3);
        assert!(
            h.store
                .list_instances("app")
                .unwrap()
                .iter()
                .all(|i| i.state == InstanceLifecycle::Running)
        );
        assert_eq!(h.store.linked_stemcells("app").unwrap(), vec!["ubuntu/1"]);
        assert_eq!(h.store.linked_release_versions("app").unwrap(), vec!["web-release/1"]);
        assert_eq!(h.store.list_properties("app").unwrap().len(), 1);
        assert_eq!(h.store.dns_version().unwrap(), 3);

        let canaries: Vec<_> = h
            .events
            .stage_events("Updating instance")
            .into_iter()
            .filter(|e| e.task.ends_with("(canary)"))
            .collect();
        assert_eq!(canaries.len(), 2);
    }

    #[tokio::test]
    async fn redeploy_without_changes_touches_nothing() {
        let h = harness(true);
        let plan = DeploymentPlan::from_toml(PLAN).unwrap();
        h.coordinator.deploy(&plan, DeployOptions::default()).await.unwrap();
        let vms = h.cloud.vms().await.unwrap();

        let report = h.coordinator.deploy(&plan, DeployOptions::default()).await.unwrap();
        assert_eq!(report.groups[0].updated, 0);
        assert_eq!(h.cloud.vms().await.unwrap(), vms);
        assert_eq!(h.store.dns_version().unwrap(), 3);
    }

    #[tokio::test]
    async fn dropped_group_is_deleted() {
        let h = harness(true);
        let plan = DeploymentPlan::from_toml(PLAN).unwrap();
        h.coordinator.deploy(&plan, DeployOptions::default()).await.unwrap();

        let mut renamed = plan.clone();
        renamed.instance_groups[0].name = "api".to_string();
        renamed.instance_groups[0].instances = 1;
        let report = h.coordinator.deploy(&renamed, DeployOptions::default()).await.unwrap();

        assert_eq!(report.groups[0].group, "web");
        assert_eq!(report.groups[0].deleted, 3);
        let instances = h.store.list_instances("app").unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].group, "api");
        assert_eq!(h.store.list_dns_records("app").unwrap().len(), 1);
        assert_eq!(h.cloud.vms().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_canary_stops_the_group() {
        let h = harness(false);
        let plan = DeploymentPlan::from_toml(PLAN).unwrap();
        h.cloud.fail_next_creates(1);

        let err = h.coordinator.deploy(&plan, DeployOptions::default()).await.unwrap_err();
        match err {
            RolloutError::BatchFailed { group, phase, source } => {
                assert_eq!(group, "web");
                assert!(phase.starts_with("canary update"));
                assert_eq!(source.failures.len(), 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Identities were assigned, no VM was created past the canary.
        assert_eq!(h.store.list_instances("app").unwrap().len(), 3);
        assert!(h.cloud.vms().await.unwrap().is_empty());

        // Operators re-run the deploy; it picks up where it stopped.
        let report = h.coordinator.deploy(&plan, DeployOptions::default()).await.unwrap();
        assert_eq!(report.groups[0].updated, 3);
        assert_eq!(h.cloud.vms().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn missing_stemcell_without_cid_is_rejected() {
        let h = harness(false);
        let plan = DeploymentPlan::from_toml(&PLAN.replace("cid = \"img-1\"\n", "")).unwrap();
        let err = h.coordinator.deploy(&plan, DeployOptions::default()).await.unwrap_err();
        assert!(matches!(
            err,
            RolloutError::Director(DirectorError::StemcellNotFound(_))
        ));
    }
}
