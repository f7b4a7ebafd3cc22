//! redb table definitions for the inventory store.
//!
//! Most tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys follow `{deployment}:{id}` for owned rows and
//! `{deployment}|{resource_key}` for join rows.

use redb::TableDefinition;

/// Deployment records keyed by name.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Instances keyed by `{deployment}:{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// VMs keyed by `{deployment}:{cid}`. The owning instance is a nullable field.
pub const VMS: TableDefinition<&str, &[u8]> = TableDefinition::new("vms");

/// Stemcells keyed by `{name}/{version}`.
pub const STEMCELLS: TableDefinition<&str, &[u8]> = TableDefinition::new("stemcells");

/// Release versions keyed by `{name}/{version}`.
pub const RELEASE_VERSIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("release_versions");

/// Deployment ↔ stemcell join rows keyed by `{deployment}|{stemcell_key}`.
pub const DEPLOYMENT_STEMCELLS: TableDefinition<&str, ()> =
    TableDefinition::new("deployment_stemcells");

/// Deployment ↔ release version join rows keyed by `{deployment}|{release_key}`.
pub const DEPLOYMENT_RELEASES: TableDefinition<&str, ()> =
    TableDefinition::new("deployment_release_versions");

/// Deployment properties keyed by `{deployment}:{key}`.
pub const PROPERTIES: TableDefinition<&str, &[u8]> = TableDefinition::new("deployment_properties");

/// IP reservations keyed by `{network}|{ip}`, value is the owning instance id.
pub const IP_RESERVATIONS: TableDefinition<&str, &str> = TableDefinition::new("ip_reservations");

/// Local DNS records keyed by synthetic row id.
pub const DNS_RECORDS: TableDefinition<u64, &[u8]> = TableDefinition::new("local_dns_records");

/// Unique index over active DNS rows: instance id → row id.
pub const DNS_RECORD_INSTANCES: TableDefinition<&str, u64> =
    TableDefinition::new("local_dns_records_instance_idx");

/// Committed DNS row changes keyed by global sequence number.
pub const DNS_CHANGES: TableDefinition<u64, &[u8]> = TableDefinition::new("local_dns_changes");

/// Cloud-check problems keyed by `{deployment}:{problem_id:020}`.
pub const PROBLEMS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployment_problems");

/// Named monotonic counters (DNS version, row-id sequences).
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// Counter holding the global local-DNS record set version.
pub const LOCAL_DNS_VERSION: &str = "local_dns_version";

/// Sequence for `DNS_RECORDS` row ids.
pub const LOCAL_DNS_RECORD_ID: &str = "local_dns_record_id";

/// Sequence for `DNS_CHANGES` entries.
pub const LOCAL_DNS_CHANGE_SEQ: &str = "local_dns_change_seq";

/// Sequence for problem ids.
pub const PROBLEM_ID: &str = "problem_id";
