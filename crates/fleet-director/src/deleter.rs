//! Deployment Deleter.
//!
//! Steps run in a fixed order whatever the outcome of the parallel work
//! inside them. Instance and orphaned-VM deletion (steps 1-2) are
//! best-effort: their failures are collected into the [`TeardownReport`]
//! and teardown moves on. Any failure from step 3 on aborts the teardown.

use std::sync::Arc;

use fleet_dns::DeploymentRecords;
use fleet_events::EventLog;
use fleet_state::{Instance, StateStore};
use tracing::{info, warn};

use crate::error::{DirectorError, DirectorResult};
use crate::instance_deleter::{DeleteInstances, DeleteOptions};
use crate::unlinker::{ResourceUnlinker, UnlinkReport};
use crate::vm::DeleteVm;

/// What a teardown works from: the deployment as currently recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct TeardownPlan {
    pub deployment: String,
    pub instances: Vec<Instance>,
    pub skip_drain: bool,
}

impl TeardownPlan {
    pub fn load(store: &StateStore, deployment: &str) -> DirectorResult<Self> {
        if store.get_deployment(deployment)?.is_none() {
            return Err(DirectorError::DeploymentNotFound(deployment.to_string()));
        }
        Ok(Self {
            deployment: deployment.to_string(),
            instances: store.list_instances(deployment)?,
            skip_drain: false,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub deployment: String,
    /// Instances that could not be deleted (step 1).
    pub instance_failures: Vec<String>,
    /// Orphaned VMs that could not be deleted (step 2).
    pub vm_failures: Vec<String>,
    pub unlinked: UnlinkReport,
    pub properties_deleted: u32,
    /// `None` when local DNS is disabled.
    pub dns_records_deleted: Option<usize>,
}

impl TeardownReport {
    /// Whether every best-effort step succeeded too.
    pub fn is_clean(&self) -> bool {
        self.instance_failures.is_empty() && self.vm_failures.is_empty()
    }
}

pub struct DeploymentDeleter {
    store: StateStore,
    events: EventLog,
    dns: Arc<dyn DeploymentRecords>,
    max_threads: usize,
    dns_enabled: bool,
}

impl DeploymentDeleter {
    pub fn new(
        store: StateStore,
        events: EventLog,
        dns: Arc<dyn DeploymentRecords>,
        max_threads: usize,
        dns_enabled: bool,
    ) -> Self {
        Self {
            store,
            events,
            dns,
            max_threads,
            dns_enabled,
        }
    }

    pub async fn delete(
        &self,
        plan: &TeardownPlan,
        instance_deleter: &dyn DeleteInstances,
        vm_deleter: &dyn DeleteVm,
    ) -> DirectorResult<TeardownReport> {
        let name = plan.deployment.as_str();
        info!(deployment = %name, instances = plan.instances.len(), "deleting deployment");
        let mut report = TeardownReport {
            deployment: name.to_string(),
            ..TeardownReport::default()
        };

        // 1. Instances.
        let stage = self
            .events
            .begin_stage("Deleting instances", plan.instances.len() as u32);
        let options = DeleteOptions {
            max_threads: self.max_threads,
            skip_drain: plan.skip_drain,
        };
        if let Err(e) = instance_deleter
            .delete_instances(plan.instances.clone(), stage, options)
            .await
        {
            warn!(deployment = %name, error = %e, "some instances were not deleted, continuing");
            report.instance_failures = match e {
                DirectorError::Tasks(failure) => failure
                    .failures
                    .iter()
                    .map(|f| format!("{}: {:#}", f.task, f.error))
                    .collect(),
                other => vec![other.to_string()],
            };
        }

        // 2. VMs without an instance, including ones step 1 left behind.
        let orphans = self.store.list_orphaned_vms(name)?;
        let stage = self
            .events
            .begin_stage("Deleting orphaned VMs", orphans.len() as u32);
        for vm in &orphans {
            if let Err(e) = stage.track(vm.cid.clone(), vm_deleter.delete_vm(vm)).await {
                warn!(deployment = %name, cid = %vm.cid, error = %e, "orphaned vm not deleted, continuing");
                report.vm_failures.push(format!("{}: {e}", vm.cid));
            }
        }

        let total = if self.dns_enabled { 4 } else { 3 };
        let stage = self.events.begin_stage("Deleting deployment", total);

        // 3. Shared resource links.
        let unlinker = ResourceUnlinker::new(self.store.clone());
        report.unlinked = stage
            .track("Unlinking stemcells and releases", async { unlinker.unlink(name) })
            .await?;

        // 4. Properties.
        report.properties_deleted = stage
            .track("Deleting properties", async {
                Ok::<_, DirectorError>(self.store.delete_properties(name)?)
            })
            .await?;

        // 5. Local DNS rows, only when DNS is enabled.
        if self.dns_enabled {
            let delta = stage
                .track("Deleting local dns records", async {
                    Ok::<_, DirectorError>(self.dns.delete_for_deployment(name)?)
                })
                .await?;
            report.dns_records_deleted = Some(delta.deleted.len());
        }

        // 6. The deployment record.
        stage
            .track("Destroying deployment", async {
                Ok::<_, DirectorError>(self.store.destroy_deployment(name)?)
            })
            .await?;

        info!(
            deployment = %name,
            clean = report.is_clean(),
            instance_failures = report.instance_failures.len(),
            vm_failures = report.vm_failures.len(),
            "deployment deleted"
        );
        Ok(report)
    }
}
