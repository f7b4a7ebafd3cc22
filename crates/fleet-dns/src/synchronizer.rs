//! DNS Record Synchronizer.
//!
//! `recompute` diffs the target rows of a deployment against the stored
//! rows and applies the difference through
//! [`StateStore::apply_dns_delta`], which deletes every stale row before
//! inserting any new one and bumps the global version once. A
//! `ConstraintViolation` means another writer changed the rows between
//! our read and our write; the diff is recomputed from fresh data.

use std::collections::HashSet;
use std::sync::Arc;

use fleet_cloud::{AgentClient, LocalDnsRecords, SyncOutcome};
use fleet_pool::{TaskPool, WorkItem};
use fleet_state::{DnsDelta, DnsRecordSpec, Instance, StateStore};
use tracing::{debug, info, warn};

use crate::error::{DnsError, DnsResult};
use crate::records::{DnsSettings, RecordBuilder};

/// Attempts per recompute before giving up on concurrent writers.
pub const MAX_RECOMPUTE_ATTEMPTS: u32 = 5;

/// Deletion path used by deployment teardown.
pub trait DeploymentRecords: Send + Sync {
    /// Remove every DNS row of a deployment, bumping the version once.
    fn delete_for_deployment(&self, deployment: &str) -> DnsResult<DnsDelta>;
}

/// Outcome of pushing a record set to a deployment's agents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub version: u64,
    pub applied: usize,
    /// Agents that already had this version or a newer one.
    pub stale: usize,
    /// Agents that did not take the update; they catch up on a later version.
    pub failed: Vec<String>,
}

#[derive(Clone)]
pub struct DnsSynchronizer {
    store: StateStore,
    agents: Arc<dyn AgentClient>,
    pool: TaskPool,
    builder: RecordBuilder,
}

impl DnsSynchronizer {
    pub fn new(
        store: StateStore,
        agents: Arc<dyn AgentClient>,
        pool: TaskPool,
        settings: DnsSettings,
    ) -> DnsResult<Self> {
        Ok(Self {
            store,
            agents,
            pool,
            builder: RecordBuilder::new(settings)?,
        })
    }

    pub fn builder(&self) -> &RecordBuilder {
        &self.builder
    }

    /// Make the stored rows of `deployment` match `desired`.
    ///
    /// Instances that are not live get no row. An unchanged topology
    /// commits nothing and keeps the version. `desired` is the caller's
    /// view; the stored rows are re-read on every attempt. Use
    /// [`Self::recompute_stored`] when the instances live in the store.
    pub fn recompute(&self, deployment: &str, desired: &[Instance]) -> DnsResult<DnsDelta> {
        let target = self.builder.target(desired);
        self.retrying(deployment, || {
            let current = self.store.list_dns_records(deployment)?;
            let (stale, inserts) = diff(&current, &target);
            self.store.apply_dns_delta(deployment, &stale, &inserts)
        })
    }

    /// Make the stored rows of `deployment` match its stored instances.
    ///
    /// Each attempt reads the instances and the rows in the transaction
    /// that writes the delta, so a concurrent instance update is either
    /// fully seen or not seen at all, and never reverted.
    pub fn recompute_stored(&self, deployment: &str) -> DnsResult<DnsDelta> {
        self.retrying(deployment, || {
            self.store.reconcile_dns_records(deployment, |instances, current| {
                diff(current, &self.builder.target(instances))
            })
        })
    }

    fn retrying<F>(&self, deployment: &str, mut attempt_once: F) -> DnsResult<DnsDelta>
    where
        F: FnMut() -> fleet_state::StateResult<DnsDelta>,
    {
        let mut last = String::new();
        for attempt in 1..=MAX_RECOMPUTE_ATTEMPTS {
            match attempt_once() {
                Ok(delta) => {
                    if !delta.deleted.is_empty() {
                        info!(%deployment, count = delta.deleted.len(), "deleted local dns records for deployment");
                    }
                    debug!(
                        %deployment,
                        attempt,
                        deleted = delta.deleted.len(),
                        inserted = delta.inserted.len(),
                        version = delta.version,
                        "local dns recomputed"
                    );
                    return Ok(delta);
                }
                Err(e) if e.is_constraint_violation() => {
                    warn!(%deployment, attempt, error = %e, "local dns recompute raced, retrying");
                    last = e.to_string();
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(DnsError::RecomputeExhausted {
            deployment: deployment.to_string(),
            attempts: MAX_RECOMPUTE_ATTEMPTS,
            last,
        })
    }

    /// The full record set (every deployment) at the current version.
    pub fn record_set(&self) -> DnsResult<LocalDnsRecords> {
        let (version, records) = self.store.dns_snapshot_all()?;
        Ok(self.builder.to_wire(version, &records))
    }

    /// Push the current record set to every agent of `deployment`.
    pub async fn publish(&self, deployment: &str) -> DnsResult<PublishReport> {
        let records = self.record_set()?;
        self.publish_records(deployment, records).await
    }

    /// Push `records` to every agent of `deployment` that has a VM.
    ///
    /// Runs through the task pool. A failing agent is logged and reported,
    /// never fatal: it applies a later version when it comes back.
    pub async fn publish_records(
        &self,
        deployment: &str,
        records: LocalDnsRecords,
    ) -> DnsResult<PublishReport> {
        let version = records.version;
        let records = Arc::new(records);
        let items: Vec<WorkItem<SyncOutcome>> = self
            .store
            .list_instances(deployment)?
            .into_iter()
            .filter(|i| i.state.is_live() && i.vm_cid.is_some())
            .map(|instance| {
                let agents = Arc::clone(&self.agents);
                let records = Arc::clone(&records);
                let agent_id = instance.agent_id;
                WorkItem::new(agent_id.clone(), async move {
                    Ok(agents.sync_dns(&agent_id, &records).await?)
                })
            })
            .collect();

        let outcome = self.pool.run(items).await;
        let mut report = PublishReport {
            version,
            ..PublishReport::default()
        };
        for (_, result) in &outcome.completed {
            match result {
                SyncOutcome::Applied => report.applied += 1,
                SyncOutcome::Stale => report.stale += 1,
            }
        }
        for failure in outcome.failures {
            warn!(%deployment, agent_id = %failure.task, error = %failure.error, "agent missed dns sync");
            report.failed.push(failure.task);
        }
        info!(
            %deployment,
            version,
            applied = report.applied,
            stale = report.stale,
            failed = report.failed.len(),
            "local dns published"
        );
        Ok(report)
    }

    /// Push the current record set to one agent, e.g. before its jobs start.
    pub async fn sync_agent(&self, agent_id: &str) -> DnsResult<SyncOutcome> {
        let records = self.record_set()?;
        Ok(self.agents.sync_dns(agent_id, &records).await?)
    }
}

impl DeploymentRecords for DnsSynchronizer {
    fn delete_for_deployment(&self, deployment: &str) -> DnsResult<DnsDelta> {
        info!(%deployment, "deleting local dns records for deployment");
        Ok(self.store.delete_dns_records_for_deployment(deployment)?)
    }
}

/// Stale row ids and specs to insert, turning `current` into `target`.
///
/// A row survives only if an identical spec is wanted; any field change
/// (new IP, new agent id) replaces the row.
fn diff(current: &[fleet_state::DnsRecord], target: &[DnsRecordSpec]) -> (Vec<u64>, Vec<DnsRecordSpec>) {
    let mut wanted: HashSet<&DnsRecordSpec> = target.iter().collect();
    let stale = current
        .iter()
        .filter(|row| !wanted.remove(&row.spec))
        .map(|row| row.id)
        .collect();
    let inserts = target
        .iter()
        .filter(|spec| wanted.remove(spec))
        .cloned()
        .collect();
    (stale, inserts)
}
