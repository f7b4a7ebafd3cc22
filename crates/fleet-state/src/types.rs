//! Domain types for the inventory store.
//!
//! These types represent the persisted state of deployments, instances,
//! VMs, shared resources, properties, local DNS records and cloud-check
//! problems. All types are serializable to/from JSON for storage in redb
//! tables.

use serde::{Deserialize, Serialize};

/// Unique name of a deployment.
pub type DeploymentName = String;

/// Unique identifier (uuid) of an instance.
pub type InstanceId = String;

/// Cloud-provider identifier of a VM.
pub type VmCid = String;

// ── Deployment ─────────────────────────────────────────────────────

/// A named desired-state unit owning instances and properties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub name: DeploymentName,
    /// Unix timestamp (seconds) when this deployment was first recorded.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last deploy.
    pub updated_at: u64,
}

// ── Instance ──────────────────────────────────────────────────────

/// One member of an instance group.
///
/// Identity, IP and agent id are assigned before any VM exists, so an
/// instance may be fully addressable (and present in DNS) with `vm_cid`
/// still `None`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub deployment: DeploymentName,
    /// Instance group name as written in the plan (not canonicalized).
    pub group: String,
    pub index: u32,
    pub az: Option<String>,
    pub network: String,
    /// Empty until known: a dynamic network address arrives with the VM.
    pub ip: String,
    /// The address is assigned by the cloud when the VM boots.
    #[serde(default)]
    pub dynamic_ip: bool,
    /// Agent id of the current VM, or the one the next VM will boot with.
    pub agent_id: String,
    pub state: InstanceLifecycle,
    pub vm_cid: Option<VmCid>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Lifecycle of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceLifecycle {
    /// Identity assigned, no VM yet.
    Desired,
    /// VM requested from the cloud, jobs not started.
    Creating,
    Running,
    /// VM intentionally absent (instance kept).
    Detached,
    /// Teardown in progress.
    Deleting,
    Deleted,
}

impl InstanceLifecycle {
    /// Whether the instance still counts toward the deployment's topology.
    pub fn is_live(self) -> bool {
        !matches!(self, InstanceLifecycle::Deleting | InstanceLifecycle::Deleted)
    }
}

impl Instance {
    /// Build the composite key for the instances table.
    pub fn table_key(&self) -> String {
        instance_key(&self.deployment, &self.id)
    }

    /// `group/id (index)`: how instances are named in logs and events.
    pub fn display_name(&self) -> String {
        format!("{}/{} ({})", self.group, self.id, self.index)
    }
}

// ── VM ────────────────────────────────────────────────────────────

/// A cloud-provider VM. `instance_id == None` means orphaned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vm {
    pub cid: VmCid,
    pub deployment: DeploymentName,
    pub instance_id: Option<InstanceId>,
    pub agent_id: String,
    /// Image the VM was booted from; reused when it has to be recreated.
    pub stemcell_cid: String,
    pub created_at: u64,
}

impl Vm {
    /// Build the composite key for the VMs table.
    pub fn table_key(&self) -> String {
        vm_key(&self.deployment, &self.cid)
    }

    pub fn is_orphaned(&self) -> bool {
        self.instance_id.is_none()
    }
}

// ── Shared resources ──────────────────────────────────────────────

/// An uploaded stemcell, shared by any number of deployments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stemcell {
    pub name: String,
    pub version: String,
    /// Cloud image id the stemcell was uploaded as.
    pub cid: String,
}

impl Stemcell {
    pub fn table_key(&self) -> String {
        versioned_key(&self.name, &self.version)
    }
}

/// An uploaded release version, shared by any number of deployments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseVersion {
    pub name: String,
    pub version: String,
}

impl ReleaseVersion {
    pub fn table_key(&self) -> String {
        versioned_key(&self.name, &self.version)
    }
}

/// A deployment-scoped key/value property.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Property {
    pub deployment: DeploymentName,
    pub key: String,
    pub value: serde_json::Value,
}

// ── Local DNS ─────────────────────────────────────────────────────

/// Content of one local DNS row, everything except its synthetic id.
///
/// Names are stored canonicalized; the row is the unit compared during a
/// recompute, so any field change replaces the row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DnsRecordSpec {
    pub instance_id: InstanceId,
    pub index: u32,
    pub instance_group: String,
    pub az: Option<String>,
    pub network: String,
    pub deployment: String,
    pub ip: String,
    pub domain: String,
    pub agent_id: String,
}

/// A committed local DNS row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsRecord {
    pub id: u64,
    /// Deployment name as recorded by the director (not canonicalized).
    pub owner: DeploymentName,
    #[serde(flatten)]
    pub spec: DnsRecordSpec,
}

/// What happened to a DNS row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsChangeKind {
    Delete,
    Insert,
}

/// One committed DNS row change, in commit order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsChange {
    pub seq: u64,
    pub kind: DnsChangeKind,
    pub record_id: u64,
    pub instance_id: InstanceId,
    pub deployment: DeploymentName,
    /// Record set version the change was committed under.
    pub version: u64,
}

/// Result of applying a DNS delta.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsDelta {
    pub deleted: Vec<u64>,
    pub inserted: Vec<DnsRecord>,
    /// Global version after the delta (unchanged when the delta was empty).
    pub version: u64,
}

impl DnsDelta {
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.inserted.is_empty()
    }
}

// ── Cloud check ───────────────────────────────────────────────────

/// Kind of drift between recorded and live cloud state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    /// The recorded VM no longer exists in the cloud.
    MissingVm,
    /// The VM exists but its agent does not answer.
    UnresponsiveAgent,
}

impl ProblemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProblemKind::MissingVm => "missing_vm",
            ProblemKind::UnresponsiveAgent => "unresponsive_agent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemState {
    Open,
    Resolved,
}

/// A detected problem awaiting (or past) resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Problem {
    pub id: u64,
    pub deployment: DeploymentName,
    pub kind: ProblemKind,
    pub instance_id: InstanceId,
    pub vm_cid: Option<VmCid>,
    pub description: String,
    pub state: ProblemState,
    /// Name of the resolution applied, once resolved.
    pub resolution: Option<String>,
    pub created_at: u64,
}

/// A problem found by a scan, before it has been assigned an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewProblem {
    pub kind: ProblemKind,
    pub instance_id: InstanceId,
    pub vm_cid: Option<VmCid>,
    pub description: String,
}

impl Problem {
    pub fn table_key(&self) -> String {
        problem_key(&self.deployment, self.id)
    }
}

// ── Keys ──────────────────────────────────────────────────────────

pub fn instance_key(deployment: &str, instance_id: &str) -> String {
    format!("{deployment}:{instance_id}")
}

pub fn vm_key(deployment: &str, cid: &str) -> String {
    format!("{deployment}:{cid}")
}

pub fn versioned_key(name: &str, version: &str) -> String {
    format!("{name}/{version}")
}

pub fn link_key(deployment: &str, resource_key: &str) -> String {
    format!("{deployment}|{resource_key}")
}

pub fn property_key(deployment: &str, key: &str) -> String {
    format!("{deployment}:{key}")
}

pub fn reservation_key(network: &str, ip: &str) -> String {
    format!("{network}|{ip}")
}

/// Zero-padded so lexicographic order matches numeric order.
pub fn problem_key(deployment: &str, id: u64) -> String {
    format!("{deployment}:{id:020}")
}
