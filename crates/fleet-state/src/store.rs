//! StateStore: redb-backed inventory persistence for the fleet director.
//!
//! Provides typed operations over deployments, instances, VMs, shared
//! resources, properties, IP reservations, local DNS records and problems.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use redb::{
    Database, ReadableDatabase, ReadableTable, Table, TableDefinition, TableHandle, WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;
type LinkTable = TableDefinition<'static, &'static str, ()>;

/// Thread-safe inventory store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for def in [
            DEPLOYMENTS,
            INSTANCES,
            VMS,
            STEMCELLS,
            RELEASE_VERSIONS,
            PROPERTIES,
            PROBLEMS,
        ] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.open_table(DEPLOYMENT_STEMCELLS).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENT_RELEASES).map_err(map_err!(Table))?;
        txn.open_table(IP_RESERVATIONS).map_err(map_err!(Table))?;
        txn.open_table(DNS_RECORDS).map_err(map_err!(Table))?;
        txn.open_table(DNS_RECORD_INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(DNS_CHANGES).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        Ok(scan_prefix(&table, prefix)?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    fn remove_key(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or update a deployment record.
    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        self.put_json(DEPLOYMENTS, &deployment.name, deployment)?;
        debug!(deployment = %deployment.name, "deployment stored");
        Ok(())
    }

    pub fn get_deployment(&self, name: &str) -> StateResult<Option<Deployment>> {
        self.get_json(DEPLOYMENTS, name)
    }

    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        self.scan_json(DEPLOYMENTS, "")
    }

    /// Destroy a deployment record.
    ///
    /// Refuses with `ConstraintViolation` while the deployment still links a
    /// stemcell or release version, or still owns a live instance. Instance
    /// rows already marked `deleting`/`deleted` go with it, and so does every
    /// VM row left under the deployment (VMs whose cloud deletion failed).
    /// Returns whether the deployment existed.
    pub fn destroy_deployment(&self, name: &str) -> StateResult<bool> {
        let link_prefix = format!("{name}|");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let stemcells = txn.open_table(DEPLOYMENT_STEMCELLS).map_err(map_err!(Table))?;
            if !scan_link_keys(&stemcells, &link_prefix)?.is_empty() {
                return Err(StateError::ConstraintViolation(format!(
                    "deployment `{name}` still references stemcells"
                )));
            }
            let releases = txn.open_table(DEPLOYMENT_RELEASES).map_err(map_err!(Table))?;
            if !scan_link_keys(&releases, &link_prefix)?.is_empty() {
                return Err(StateError::ConstraintViolation(format!(
                    "deployment `{name}` still references release versions"
                )));
            }
        }
        let leftovers = {
            let instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for (key, instance) in scan_prefix::<Instance>(&instances, &format!("{name}:"))? {
                if instance.state.is_live() {
                    return Err(StateError::ConstraintViolation(format!(
                        "deployment `{name}` still owns live instance {}",
                        instance.display_name()
                    )));
                }
                keys.push(key);
            }
            keys
        };
        let existed;
        let swept_vms: Vec<String>;
        {
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            for key in &leftovers {
                instances.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            let mut vms = txn.open_table(VMS).map_err(map_err!(Table))?;
            let vm_prefix = format!("{name}:");
            swept_vms = scan_prefix::<Vm>(&vms, &vm_prefix)?
                .into_iter()
                .map(|(key, _)| key)
                .collect();
            for key in &swept_vms {
                vms.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            existed = deployments.remove(name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if !swept_vms.is_empty() {
            warn!(deployment = %name, vms = ?swept_vms, "dropped vm rows left by a failed cloud delete");
        }
        debug!(deployment = %name, existed, leftover_instances = leftovers.len(), "deployment destroyed");
        Ok(existed)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance.
    pub fn put_instance(&self, instance: &Instance) -> StateResult<()> {
        self.put_json(INSTANCES, &instance.table_key(), instance)
    }

    pub fn get_instance(&self, deployment: &str, instance_id: &str) -> StateResult<Option<Instance>> {
        self.get_json(INSTANCES, &instance_key(deployment, instance_id))
    }

    /// All instances of a deployment, ordered by group then index.
    pub fn list_instances(&self, deployment: &str) -> StateResult<Vec<Instance>> {
        let mut instances: Vec<Instance> = self.scan_json(INSTANCES, &format!("{deployment}:"))?;
        instances.sort_by(|a, b| (&a.group, a.index).cmp(&(&b.group, b.index)));
        Ok(instances)
    }

    /// Instances of one instance group, ordered by index.
    pub fn list_group_instances(&self, deployment: &str, group: &str) -> StateResult<Vec<Instance>> {
        Ok(self
            .list_instances(deployment)?
            .into_iter()
            .filter(|i| i.group == group)
            .collect())
    }

    pub fn delete_instance(&self, deployment: &str, instance_id: &str) -> StateResult<bool> {
        self.remove_key(INSTANCES, &instance_key(deployment, instance_id))
    }

    /// Remove an instance row, orphaning its VM and releasing its IP.
    ///
    /// One transaction: the VM (if any) loses its owner, the reservation is
    /// dropped and the instance row is removed. The orphaned VM is returned
    /// so the caller can delete it from the cloud; if that fails the VM
    /// stays listable through [`Self::list_orphaned_vms`].
    pub fn release_instance(&self, deployment: &str, instance_id: &str) -> StateResult<Option<Vm>> {
        let key = instance_key(deployment, instance_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let instance: Option<Instance> = {
            let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let found = table.get(key.as_str()).map_err(map_err!(Read))?;
            found.map(|guard| decode(guard.value())).transpose()?
        };
        let Some(instance) = instance else {
            return Ok(None);
        };

        let orphan = match &instance.vm_cid {
            Some(cid) => {
                let mut vms = txn.open_table(VMS).map_err(map_err!(Table))?;
                let vm_key = vm_key(deployment, cid);
                let found = vms.get(vm_key.as_str()).map_err(map_err!(Read))?;
                let vm: Option<Vm> = found.map(|guard| decode(guard.value())).transpose()?;
                match vm {
                    Some(mut vm) => {
                        vm.instance_id = None;
                        let value = encode(&vm)?;
                        vms.insert(vm_key.as_str(), value.as_slice())
                            .map_err(map_err!(Write))?;
                        Some(vm)
                    }
                    None => None,
                }
            }
            None => None,
        };

        {
            let mut reservations = txn.open_table(IP_RESERVATIONS).map_err(map_err!(Table))?;
            let res_key = reservation_key(&instance.network, &instance.ip);
            let owner = reservations
                .get(res_key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_string());
            if owner.as_deref() == Some(instance_id) {
                reservations
                    .remove(res_key.as_str())
                    .map_err(map_err!(Write))?;
            }
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            instances.remove(key.as_str()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            %deployment,
            instance = %instance.display_name(),
            orphaned_vm = ?orphan.as_ref().map(|vm| &vm.cid),
            "instance released"
        );
        Ok(orphan)
    }

    // ── VMs ────────────────────────────────────────────────────────

    pub fn put_vm(&self, vm: &Vm) -> StateResult<()> {
        self.put_json(VMS, &vm.table_key(), vm)
    }

    pub fn get_vm(&self, deployment: &str, cid: &str) -> StateResult<Option<Vm>> {
        self.get_json(VMS, &vm_key(deployment, cid))
    }

    pub fn list_vms(&self, deployment: &str) -> StateResult<Vec<Vm>> {
        self.scan_json(VMS, &format!("{deployment}:"))
    }

    /// VMs of a deployment with no owning instance.
    pub fn list_orphaned_vms(&self, deployment: &str) -> StateResult<Vec<Vm>> {
        Ok(self
            .list_vms(deployment)?
            .into_iter()
            .filter(Vm::is_orphaned)
            .collect())
    }

    pub fn delete_vm(&self, deployment: &str, cid: &str) -> StateResult<bool> {
        self.remove_key(VMS, &vm_key(deployment, cid))
    }

    /// Persist a VM together with the instance that now owns it.
    pub fn bind_vm(&self, vm: &Vm, instance: &Instance) -> StateResult<()> {
        let vm_value = encode(vm)?;
        let instance_value = encode(instance)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut vms = txn.open_table(VMS).map_err(map_err!(Table))?;
            vms.insert(vm.table_key().as_str(), vm_value.as_slice())
                .map_err(map_err!(Write))?;
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            instances
                .insert(instance.table_key().as_str(), instance_value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(cid = %vm.cid, instance = %instance.display_name(), "vm bound to instance");
        Ok(())
    }

    // ── Stemcells / release versions ───────────────────────────────

    pub fn put_stemcell(&self, stemcell: &Stemcell) -> StateResult<()> {
        self.put_json(STEMCELLS, &stemcell.table_key(), stemcell)
    }

    pub fn get_stemcell(&self, key: &str) -> StateResult<Option<Stemcell>> {
        self.get_json(STEMCELLS, key)
    }

    pub fn put_release_version(&self, release: &ReleaseVersion) -> StateResult<()> {
        self.put_json(RELEASE_VERSIONS, &release.table_key(), release)
    }

    pub fn get_release_version(&self, key: &str) -> StateResult<Option<ReleaseVersion>> {
        self.get_json(RELEASE_VERSIONS, key)
    }

    /// Record that `deployment` uses the stemcell `stemcell_key`.
    pub fn link_stemcell(&self, deployment: &str, stemcell_key: &str) -> StateResult<()> {
        self.link(STEMCELLS, DEPLOYMENT_STEMCELLS, deployment, stemcell_key)
    }

    /// Record that `deployment` uses the release version `release_key`.
    pub fn link_release_version(&self, deployment: &str, release_key: &str) -> StateResult<()> {
        self.link(RELEASE_VERSIONS, DEPLOYMENT_RELEASES, deployment, release_key)
    }

    /// Stemcell keys referenced by a deployment.
    pub fn linked_stemcells(&self, deployment: &str) -> StateResult<Vec<String>> {
        self.linked(DEPLOYMENT_STEMCELLS, deployment)
    }

    /// Release version keys referenced by a deployment.
    pub fn linked_release_versions(&self, deployment: &str) -> StateResult<Vec<String>> {
        self.linked(DEPLOYMENT_RELEASES, deployment)
    }

    /// Deployments referencing a stemcell.
    pub fn stemcell_deployments(&self, stemcell_key: &str) -> StateResult<Vec<String>> {
        self.linkers(DEPLOYMENT_STEMCELLS, stemcell_key)
    }

    /// Deployments referencing a release version.
    pub fn release_version_deployments(&self, release_key: &str) -> StateResult<Vec<String>> {
        self.linkers(DEPLOYMENT_RELEASES, release_key)
    }

    /// Drop every stemcell link of a deployment. Returns the unlinked keys.
    pub fn unlink_stemcells(&self, deployment: &str) -> StateResult<Vec<String>> {
        self.unlink_all(DEPLOYMENT_STEMCELLS, deployment)
    }

    /// Drop every release version link of a deployment. Returns the unlinked keys.
    pub fn unlink_release_versions(&self, deployment: &str) -> StateResult<Vec<String>> {
        self.unlink_all(DEPLOYMENT_RELEASES, deployment)
    }

    fn link(
        &self,
        resources: JsonTable,
        links: LinkTable,
        deployment: &str,
        resource_key: &str,
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let table = txn.open_table(resources).map_err(map_err!(Table))?;
            let exists = table.get(resource_key).map_err(map_err!(Read))?.is_some();
            if !exists {
                return Err(StateError::NotFound(format!(
                    "{} `{resource_key}`",
                    resources.name()
                )));
            }
            let mut links = txn.open_table(links).map_err(map_err!(Table))?;
            links
                .insert(link_key(deployment, resource_key).as_str(), ())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn linked(&self, links: LinkTable, deployment: &str) -> StateResult<Vec<String>> {
        let prefix = format!("{deployment}|");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(links).map_err(map_err!(Table))?;
        Ok(scan_link_keys(&table, &prefix)?
            .into_iter()
            .map(|key| key[prefix.len()..].to_string())
            .collect())
    }

    fn linkers(&self, links: LinkTable, resource_key: &str) -> StateResult<Vec<String>> {
        let suffix = format!("|{resource_key}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(links).map_err(map_err!(Table))?;
        Ok(scan_link_keys(&table, "")?
            .into_iter()
            .filter_map(|key| key.strip_suffix(&suffix).map(str::to_string))
            .collect())
    }

    fn unlink_all(&self, links: LinkTable, deployment: &str) -> StateResult<Vec<String>> {
        let prefix = format!("{deployment}|");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let keys;
        {
            let mut table = txn.open_table(links).map_err(map_err!(Table))?;
            keys = scan_link_keys(&table, &prefix)?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(keys
            .into_iter()
            .map(|key| key[prefix.len()..].to_string())
            .collect())
    }

    // ── Properties ─────────────────────────────────────────────────

    pub fn put_property(&self, property: &Property) -> StateResult<()> {
        self.put_json(
            PROPERTIES,
            &property_key(&property.deployment, &property.key),
            property,
        )
    }

    pub fn list_properties(&self, deployment: &str) -> StateResult<Vec<Property>> {
        self.scan_json(PROPERTIES, &format!("{deployment}:"))
    }

    /// Delete all properties of a deployment. Returns number deleted.
    pub fn delete_properties(&self, deployment: &str) -> StateResult<u32> {
        let prefix = format!("{deployment}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count;
        {
            let mut table = txn.open_table(PROPERTIES).map_err(map_err!(Table))?;
            let keys: Vec<String> = scan_prefix::<Property>(&table, &prefix)?
                .into_iter()
                .map(|(key, _)| key)
                .collect();
            count = keys.len() as u32;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── IP reservations ────────────────────────────────────────────

    /// Reserve the first free address of `[first, last]` on `network`.
    pub fn reserve_ip(
        &self,
        network: &str,
        first: Ipv4Addr,
        last: Ipv4Addr,
        instance_id: &str,
    ) -> StateResult<Ipv4Addr> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut reserved = None;
        {
            let mut table = txn.open_table(IP_RESERVATIONS).map_err(map_err!(Table))?;
            for raw in u32::from(first)..=u32::from(last) {
                let ip = Ipv4Addr::from(raw);
                let key = reservation_key(network, &ip.to_string());
                let taken = table.get(key.as_str()).map_err(map_err!(Read))?.is_some();
                if !taken {
                    table
                        .insert(key.as_str(), instance_id)
                        .map_err(map_err!(Write))?;
                    reserved = Some(ip);
                    break;
                }
            }
        }
        let Some(ip) = reserved else {
            return Err(StateError::Capacity(format!(
                "network `{network}` has no free address in {first}-{last}"
            )));
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%network, %ip, instance = %instance_id, "ip reserved");
        Ok(ip)
    }

    /// Reserved addresses of a network with their owning instance ids.
    pub fn list_reservations(&self, network: &str) -> StateResult<Vec<(String, String)>> {
        let prefix = format!("{network}|");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(IP_RESERVATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let Some(ip) = key.value().strip_prefix(&prefix) else {
                break;
            };
            results.push((ip.to_string(), value.value().to_string()));
        }
        Ok(results)
    }

    // ── Local DNS ──────────────────────────────────────────────────

    /// Current global record set version (0 before the first change).
    pub fn dns_version(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        Ok(table
            .get(LOCAL_DNS_VERSION)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0))
    }

    /// Active DNS rows of a deployment, ordered by row id.
    pub fn list_dns_records(&self, deployment: &str) -> StateResult<Vec<DnsRecord>> {
        Ok(self.dns_snapshot(deployment)?.1)
    }

    /// Version and active rows of a deployment, read from one snapshot.
    pub fn dns_snapshot(&self, deployment: &str) -> StateResult<(u64, Vec<DnsRecord>)> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let counters = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        let version = counters
            .get(LOCAL_DNS_VERSION)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        let table = txn.open_table(DNS_RECORDS).map_err(map_err!(Table))?;
        let records = scan_dns_records(&table, deployment)?;
        Ok((version, records))
    }

    /// Version and active rows of every deployment, read from one snapshot.
    pub fn dns_snapshot_all(&self) -> StateResult<(u64, Vec<DnsRecord>)> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let counters = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        let version = counters
            .get(LOCAL_DNS_VERSION)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        let table = txn.open_table(DNS_RECORDS).map_err(map_err!(Table))?;
        let mut records = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            records.push(decode(value.value())?);
        }
        Ok((version, records))
    }

    /// Apply a DNS delta for one deployment in a single transaction.
    ///
    /// Every row in `stale_ids` is deleted first, then every spec in
    /// `inserts` is inserted, then the global version is bumped once. If a
    /// stale row has vanished or an inserted instance already owns an active
    /// row, the transaction aborts with `ConstraintViolation` and nothing is
    /// committed. An empty delta writes nothing and keeps the version.
    pub fn apply_dns_delta(
        &self,
        deployment: &str,
        stale_ids: &[u64],
        inserts: &[DnsRecordSpec],
    ) -> StateResult<DnsDelta> {
        if stale_ids.is_empty() && inserts.is_empty() {
            return Ok(DnsDelta {
                version: self.dns_version()?,
                ..DnsDelta::default()
            });
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let delta = write_dns_delta(&txn, deployment, stale_ids, inserts)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            %deployment,
            deleted = delta.deleted.len(),
            inserted = delta.inserted.len(),
            version = delta.version,
            "local dns delta committed"
        );
        Ok(delta)
    }

    /// Recompute a deployment's DNS rows from its stored instances.
    ///
    /// The instances and the active rows are read inside the write
    /// transaction that applies the delta, so no other writer can change
    /// either between the read and the commit. `plan` turns them into stale
    /// row ids and specs to insert; an empty result commits nothing.
    pub fn reconcile_dns_records<F>(&self, deployment: &str, plan: F) -> StateResult<DnsDelta>
    where
        F: FnOnce(&[Instance], &[DnsRecord]) -> (Vec<u64>, Vec<DnsRecordSpec>),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (stale_ids, inserts) = {
            let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut instances: Vec<Instance> = scan_prefix::<Instance>(&table, &format!("{deployment}:"))?
                .into_iter()
                .map(|(_, instance)| instance)
                .collect();
            instances.sort_by(|a, b| (&a.group, a.index).cmp(&(&b.group, b.index)));
            let records = txn.open_table(DNS_RECORDS).map_err(map_err!(Table))?;
            let current = scan_dns_records(&records, deployment)?;
            plan(&instances, &current)
        };
        if stale_ids.is_empty() && inserts.is_empty() {
            let version = {
                let counters = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
                counters
                    .get(LOCAL_DNS_VERSION)
                    .map_err(map_err!(Read))?
                    .map(|guard| guard.value())
                    .unwrap_or(0)
            };
            drop(txn);
            return Ok(DnsDelta {
                version,
                ..DnsDelta::default()
            });
        }
        let delta = write_dns_delta(&txn, deployment, &stale_ids, &inserts)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            %deployment,
            deleted = delta.deleted.len(),
            inserted = delta.inserted.len(),
            version = delta.version,
            "local dns reconciled"
        );
        Ok(delta)
    }

    /// Delete every DNS row of a deployment, bumping the version once.
    pub fn delete_dns_records_for_deployment(&self, deployment: &str) -> StateResult<DnsDelta> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stale_ids: Vec<u64> = {
            let table = txn.open_table(DNS_RECORDS).map_err(map_err!(Table))?;
            scan_dns_records(&table, deployment)?
                .into_iter()
                .map(|record| record.id)
                .collect()
        };
        if stale_ids.is_empty() {
            drop(txn);
            return Ok(DnsDelta {
                version: self.dns_version()?,
                ..DnsDelta::default()
            });
        }
        let delta = write_dns_delta(&txn, deployment, &stale_ids, &[])?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%deployment, deleted = delta.deleted.len(), version = delta.version, "local dns records deleted");
        Ok(delta)
    }

    /// Every committed DNS row change, in commit order.
    pub fn list_dns_changes(&self) -> StateResult<Vec<DnsChange>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DNS_CHANGES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    // ── Problems ───────────────────────────────────────────────────

    /// Replace a deployment's open problems with a fresh scan result.
    pub fn replace_open_problems(
        &self,
        deployment: &str,
        found: Vec<NewProblem>,
    ) -> StateResult<Vec<Problem>> {
        let prefix = format!("{deployment}:");
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut created = Vec::with_capacity(found.len());
        {
            let mut table = txn.open_table(PROBLEMS).map_err(map_err!(Table))?;
            let stale: Vec<String> = scan_prefix::<Problem>(&table, &prefix)?
                .into_iter()
                .filter(|(_, problem)| problem.state == ProblemState::Open)
                .map(|(key, _)| key)
                .collect();
            for key in &stale {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            let mut counters = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            for new in found {
                let problem = Problem {
                    id: bump(&mut counters, PROBLEM_ID)?,
                    deployment: deployment.to_string(),
                    kind: new.kind,
                    instance_id: new.instance_id,
                    vm_cid: new.vm_cid,
                    description: new.description,
                    state: ProblemState::Open,
                    resolution: None,
                    created_at: now,
                };
                let value = encode(&problem)?;
                table
                    .insert(problem.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                created.push(problem);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(created)
    }

    /// All problems of a deployment, oldest first.
    pub fn list_problems(&self, deployment: &str) -> StateResult<Vec<Problem>> {
        self.scan_json(PROBLEMS, &format!("{deployment}:"))
    }

    pub fn list_open_problems(&self, deployment: &str) -> StateResult<Vec<Problem>> {
        Ok(self
            .list_problems(deployment)?
            .into_iter()
            .filter(|p| p.state == ProblemState::Open)
            .collect())
    }

    /// Mark a problem resolved with the named resolution.
    pub fn resolve_problem(&self, deployment: &str, id: u64, resolution: &str) -> StateResult<Problem> {
        let key = problem_key(deployment, id);
        let mut problem: Problem = self
            .get_json(PROBLEMS, &key)?
            .ok_or_else(|| StateError::NotFound(format!("problem {id} of `{deployment}`")))?;
        problem.state = ProblemState::Resolved;
        problem.resolution = Some(resolution.to_string());
        self.put_json(PROBLEMS, &key, &problem)?;
        Ok(problem)
    }
}

// ── Transaction-scoped helpers ─────────────────────────────────────

fn write_dns_delta(
    txn: &WriteTransaction,
    deployment: &str,
    stale_ids: &[u64],
    inserts: &[DnsRecordSpec],
) -> StateResult<DnsDelta> {
    let mut counters = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
    let mut records = txn.open_table(DNS_RECORDS).map_err(map_err!(Table))?;
    let mut index = txn.open_table(DNS_RECORD_INSTANCES).map_err(map_err!(Table))?;
    let version = bump(&mut counters, LOCAL_DNS_VERSION)?;
    let mut changes = Vec::with_capacity(stale_ids.len() + inserts.len());
    let mut delta = DnsDelta {
        version,
        ..DnsDelta::default()
    };

    for &id in stale_ids {
        let removed = records.remove(id).map_err(map_err!(Write))?;
        let row: Option<DnsRecord> = removed.map(|guard| decode(guard.value())).transpose()?;
        let Some(row) = row else {
            return Err(StateError::ConstraintViolation(format!(
                "local dns record {id} no longer exists"
            )));
        };
        if row.owner != deployment {
            return Err(StateError::ConstraintViolation(format!(
                "local dns record {id} belongs to `{}`, not `{deployment}`",
                row.owner
            )));
        }
        index
            .remove(row.spec.instance_id.as_str())
            .map_err(map_err!(Write))?;
        debug!(id, instance = %row.spec.instance_id, %deployment, "deleting local dns record");
        changes.push((DnsChangeKind::Delete, id, row.spec.instance_id));
        delta.deleted.push(id);
    }

    for spec in inserts {
        let taken = index
            .get(spec.instance_id.as_str())
            .map_err(map_err!(Read))?
            .is_some();
        if taken {
            return Err(StateError::ConstraintViolation(format!(
                "instance {} already has an active local dns record",
                spec.instance_id
            )));
        }
        let id = bump(&mut counters, LOCAL_DNS_RECORD_ID)?;
        let record = DnsRecord {
            id,
            owner: deployment.to_string(),
            spec: spec.clone(),
        };
        let value = encode(&record)?;
        records
            .insert(id, value.as_slice())
            .map_err(map_err!(Write))?;
        index
            .insert(spec.instance_id.as_str(), id)
            .map_err(map_err!(Write))?;
        debug!(id, instance = %spec.instance_id, ip = %spec.ip, %deployment, "inserting local dns record");
        changes.push((DnsChangeKind::Insert, id, spec.instance_id.clone()));
        delta.inserted.push(record);
    }

    let mut journal = txn.open_table(DNS_CHANGES).map_err(map_err!(Table))?;
    for (kind, record_id, instance_id) in changes {
        let change = DnsChange {
            seq: bump(&mut counters, LOCAL_DNS_CHANGE_SEQ)?,
            kind,
            record_id,
            instance_id,
            deployment: deployment.to_string(),
            version,
        };
        let value = encode(&change)?;
        journal
            .insert(change.seq, value.as_slice())
            .map_err(map_err!(Write))?;
    }
    Ok(delta)
}

fn bump(counters: &mut Table<'_, &'static str, u64>, name: &str) -> StateResult<u64> {
    let current = counters
        .get(name)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    counters.insert(name, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn scan_prefix<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> StateResult<Vec<(String, T)>> {
    let mut results = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        results.push((key.to_string(), decode(value.value())?));
    }
    Ok(results)
}

fn scan_link_keys(
    table: &impl ReadableTable<&'static str, ()>,
    prefix: &str,
) -> StateResult<Vec<String>> {
    let mut keys = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key.to_string());
    }
    Ok(keys)
}

fn scan_dns_records(
    table: &impl ReadableTable<u64, &'static [u8]>,
    deployment: &str,
) -> StateResult<Vec<DnsRecord>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let record: DnsRecord = decode(value.value())?;
        if record.owner == deployment {
            results.push(record);
        }
    }
    Ok(results)
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_instance(deployment: &str, group: &str, index: u32) -> Instance {
        Instance {
            id: format!("{group}-uuid-{index}"),
            deployment: deployment.to_string(),
            group: group.to_string(),
            index,
            az: Some("z1".to_string()),
            network: "default".to_string(),
            ip: format!("10.0.0.{}", index + 2),
            dynamic_ip: false,
            agent_id: format!("agent-{group}-{index}"),
            state: InstanceLifecycle::Running,
            vm_cid: None,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_vm(deployment: &str, cid: &str, instance_id: Option<&str>) -> Vm {
        Vm {
            cid: cid.to_string(),
            deployment: deployment.to_string(),
            instance_id: instance_id.map(str::to_string),
            agent_id: format!("agent-{cid}"),
            stemcell_cid: "img-1".to_string(),
            created_at: 1000,
        }
    }

    fn record_spec(instance: &Instance) -> DnsRecordSpec {
        DnsRecordSpec {
            instance_id: instance.id.clone(),
            index: instance.index,
            instance_group: instance.group.clone(),
            az: instance.az.clone(),
            network: instance.network.clone(),
            deployment: instance.deployment.clone(),
            ip: instance.ip.clone(),
            domain: "bosh".to_string(),
            agent_id: instance.agent_id.clone(),
        }
    }

    fn deployment(name: &str) -> Deployment {
        Deployment {
            name: name.to_string(),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    // ── Deployments ────────────────────────────────────────────────

    #[test]
    fn deployment_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_deployment(&deployment("api")).unwrap();
        assert_eq!(store.get_deployment("api").unwrap(), Some(deployment("api")));
        assert!(store.get_deployment("nope").unwrap().is_none());
        assert_eq!(store.list_deployments().unwrap().len(), 1);
    }

    #[test]
    fn destroy_refuses_while_links_remain() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_deployment(&deployment("api")).unwrap();
        let stemcell = Stemcell {
            name: "ubuntu".to_string(),
            version: "1".to_string(),
            cid: "img-1".to_string(),
        };
        store.put_stemcell(&stemcell).unwrap();
        store.link_stemcell("api", &stemcell.table_key()).unwrap();

        let err = store.destroy_deployment("api").unwrap_err();
        assert!(err.is_constraint_violation());
        assert!(store.get_deployment("api").unwrap().is_some());

        store.unlink_stemcells("api").unwrap();
        assert!(store.destroy_deployment("api").unwrap());
        assert!(store.get_deployment("api").unwrap().is_none());
    }

    #[test]
    fn destroy_refuses_live_instances_and_sweeps_deleting_ones() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_deployment(&deployment("api")).unwrap();
        let mut inst = test_instance("api", "web", 0);
        store.put_instance(&inst).unwrap();
        assert!(store.destroy_deployment("api").unwrap_err().is_constraint_violation());

        inst.state = InstanceLifecycle::Deleting;
        store.put_instance(&inst).unwrap();
        assert!(store.destroy_deployment("api").unwrap());
        assert!(store.list_instances("api").unwrap().is_empty());
    }

    #[test]
    fn destroy_sweeps_leftover_vm_rows() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_deployment(&deployment("d")).unwrap();
        store.put_vm(&test_vm("d", "vm-1", None)).unwrap();
        store.put_vm(&test_vm("d", "vm-2", Some("i-gone"))).unwrap();
        store.put_vm(&test_vm("dd", "vm-3", None)).unwrap();

        assert!(store.destroy_deployment("d").unwrap());
        assert!(store.list_vms("d").unwrap().is_empty());
        assert_eq!(store.list_vms("dd").unwrap().len(), 1);
    }

    // ── Instances and VMs ──────────────────────────────────────────

    #[test]
    fn instances_are_scoped_and_ordered() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&test_instance("a", "web", 1)).unwrap();
        store.put_instance(&test_instance("a", "web", 0)).unwrap();
        store.put_instance(&test_instance("a", "db", 0)).unwrap();
        store.put_instance(&test_instance("ab", "web", 0)).unwrap();

        let all = store.list_instances("a").unwrap();
        assert_eq!(all.len(), 3);
        let web: Vec<u32> = store
            .list_group_instances("a", "web")
            .unwrap()
            .iter()
            .map(|i| i.index)
            .collect();
        assert_eq!(web, vec![0, 1]);
    }

    #[test]
    fn release_instance_orphans_vm_and_frees_ip() {
        let store = StateStore::open_in_memory().unwrap();
        let first: Ipv4Addr = "10.0.0.2".parse().unwrap();
        let last: Ipv4Addr = "10.0.0.10".parse().unwrap();

        let mut inst = test_instance("api", "web", 0);
        inst.ip = store
            .reserve_ip("default", first, last, &inst.id)
            .unwrap()
            .to_string();
        let vm = test_vm("api", "vm-1", Some(&inst.id));
        inst.vm_cid = Some(vm.cid.clone());
        store.bind_vm(&vm, &inst).unwrap();

        let orphan = store.release_instance("api", &inst.id).unwrap().unwrap();
        assert!(orphan.is_orphaned());
        assert!(store.get_instance("api", &inst.id).unwrap().is_none());
        assert_eq!(store.list_orphaned_vms("api").unwrap(), vec![orphan]);
        assert!(store.list_reservations("default").unwrap().is_empty());

        // Releasing again is a no-op.
        assert!(store.release_instance("api", &inst.id).unwrap().is_none());
    }

    #[test]
    fn orphaned_vms_are_queryable() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_vm(&test_vm("api", "vm-1", Some("i-1"))).unwrap();
        store.put_vm(&test_vm("api", "vm-2", None)).unwrap();
        store.put_vm(&test_vm("other", "vm-3", None)).unwrap();

        let orphans = store.list_orphaned_vms("api").unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].cid, "vm-2");
        assert!(store.delete_vm("api", "vm-2").unwrap());
        assert!(!store.delete_vm("api", "vm-2").unwrap());
    }

    // ── Shared resources ───────────────────────────────────────────

    #[test]
    fn unlink_keeps_shared_resource_and_other_deployments() {
        let store = StateStore::open_in_memory().unwrap();
        let release = ReleaseVersion {
            name: "app".to_string(),
            version: "0+dev.1".to_string(),
        };
        store.put_release_version(&release).unwrap();
        store.link_release_version("a", &release.table_key()).unwrap();
        store.link_release_version("b", &release.table_key()).unwrap();

        let unlinked = store.unlink_release_versions("a").unwrap();
        assert_eq!(unlinked, vec![release.table_key()]);
        assert_eq!(
            store.release_version_deployments(&release.table_key()).unwrap(),
            vec!["b".to_string()]
        );
        assert!(store.get_release_version(&release.table_key()).unwrap().is_some());
    }

    #[test]
    fn link_requires_existing_resource() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.link_stemcell("a", "ubuntu/1").unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    // ── Properties ─────────────────────────────────────────────────

    #[test]
    fn properties_deleted_in_bulk() {
        let store = StateStore::open_in_memory().unwrap();
        for (deployment, key) in [("a", "x"), ("a", "y"), ("b", "x")] {
            store
                .put_property(&Property {
                    deployment: deployment.to_string(),
                    key: key.to_string(),
                    value: serde_json::json!(1),
                })
                .unwrap();
        }
        assert_eq!(store.delete_properties("a").unwrap(), 2);
        assert!(store.list_properties("a").unwrap().is_empty());
        assert_eq!(store.list_properties("b").unwrap().len(), 1);
    }

    // ── IP reservations ────────────────────────────────────────────

    #[test]
    fn reserve_ip_is_sequential_and_bounded() {
        let store = StateStore::open_in_memory().unwrap();
        let first: Ipv4Addr = "10.0.0.2".parse().unwrap();
        let last: Ipv4Addr = "10.0.0.3".parse().unwrap();
        assert_eq!(store.reserve_ip("n", first, last, "i-1").unwrap(), first);
        assert_eq!(store.reserve_ip("n", first, last, "i-2").unwrap(), last);
        assert!(matches!(
            store.reserve_ip("n", first, last, "i-3"),
            Err(StateError::Capacity(_))
        ));
    }

    // ── Local DNS ──────────────────────────────────────────────────

    #[test]
    fn dns_delta_deletes_before_inserting_and_bumps_once() {
        let store = StateStore::open_in_memory().unwrap();
        let a = test_instance("api", "web", 0);
        let b = test_instance("api", "web", 1);

        let first = store
            .apply_dns_delta("api", &[], &[record_spec(&a), record_spec(&b)])
            .unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.inserted.len(), 2);

        let mut replacement = record_spec(&a);
        replacement.agent_id = "agent-new".to_string();
        let stale = vec![first.inserted[1].id, first.inserted[0].id];
        let second = store
            .apply_dns_delta("api", &stale, &[replacement])
            .unwrap();
        assert_eq!(second.version, 2);

        let changes = store.list_dns_changes().unwrap();
        let kinds: Vec<DnsChangeKind> = changes.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                DnsChangeKind::Insert,
                DnsChangeKind::Insert,
                DnsChangeKind::Delete,
                DnsChangeKind::Delete,
                DnsChangeKind::Insert,
            ]
        );
        assert!(changes.windows(2).all(|w| w[0].seq < w[1].seq));

        let (version, rows) = store.dns_snapshot("api").unwrap();
        assert_eq!(version, 2);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].spec.agent_id, "agent-new");
    }

    #[test]
    fn dns_duplicate_instance_aborts_whole_delta() {
        let store = StateStore::open_in_memory().unwrap();
        let a = test_instance("api", "web", 0);
        store.apply_dns_delta("api", &[], &[record_spec(&a)]).unwrap();

        let b = test_instance("api", "web", 1);
        let err = store
            .apply_dns_delta("api", &[], &[record_spec(&b), record_spec(&a)])
            .unwrap_err();
        assert!(err.is_constraint_violation());

        // Nothing from the aborted delta was committed.
        assert_eq!(store.dns_version().unwrap(), 1);
        assert_eq!(store.list_dns_records("api").unwrap().len(), 1);
        assert_eq!(store.list_dns_changes().unwrap().len(), 1);
    }

    #[test]
    fn dns_vanished_stale_row_is_a_constraint_violation() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.apply_dns_delta("api", &[42], &[]).unwrap_err();
        assert!(err.is_constraint_violation());
        assert_eq!(store.dns_version().unwrap(), 0);
    }

    #[test]
    fn dns_reconcile_reads_instances_and_rows_in_one_transaction() {
        let store = StateStore::open_in_memory().unwrap();
        let a = test_instance("api", "web", 0);
        let b = test_instance("api", "web", 1);
        store.put_instance(&a).unwrap();
        store.put_instance(&b).unwrap();
        store.apply_dns_delta("api", &[], &[record_spec(&a)]).unwrap();

        let delta = store
            .reconcile_dns_records("api", |instances, current| {
                assert_eq!(instances.len(), 2);
                assert_eq!(current.len(), 1);
                let inserts = instances
                    .iter()
                    .filter(|i| current.iter().all(|row| row.spec.instance_id != i.id))
                    .map(record_spec)
                    .collect();
                (Vec::new(), inserts)
            })
            .unwrap();
        assert_eq!(delta.inserted.len(), 1);
        assert_eq!(delta.version, 2);

        let unchanged = store
            .reconcile_dns_records("api", |_, _| (Vec::new(), Vec::new()))
            .unwrap();
        assert!(unchanged.is_empty());
        assert_eq!(unchanged.version, 2);
    }

    #[test]
    fn dns_empty_delta_keeps_version() {
        let store = StateStore::open_in_memory().unwrap();
        let delta = store.apply_dns_delta("api", &[], &[]).unwrap();
        assert!(delta.is_empty());
        assert_eq!(delta.version, 0);
    }

    #[test]
    fn dns_delete_for_deployment_is_scoped() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .apply_dns_delta(
                "a",
                &[],
                &[record_spec(&test_instance("a", "web", 0)), record_spec(&test_instance("a", "web", 1))],
            )
            .unwrap();
        store
            .apply_dns_delta("b", &[], &[record_spec(&test_instance("b", "web", 0))])
            .unwrap();

        let delta = store.delete_dns_records_for_deployment("a").unwrap();
        assert_eq!(delta.deleted.len(), 2);
        assert_eq!(delta.version, 3);
        assert!(store.list_dns_records("a").unwrap().is_empty());
        assert_eq!(store.list_dns_records("b").unwrap().len(), 1);

        let again = store.delete_dns_records_for_deployment("a").unwrap();
        assert!(again.is_empty());
        assert_eq!(again.version, 3);
    }

    // ── Problems ───────────────────────────────────────────────────

    #[test]
    fn problems_replace_and_resolve() {
        let store = StateStore::open_in_memory().unwrap();
        let found = |id: &str| NewProblem {
            kind: ProblemKind::MissingVm,
            instance_id: id.to_string(),
            vm_cid: Some(format!("vm-{id}")),
            description: format!("VM with cloud ID `vm-{id}` missing."),
        };
        let first = store
            .replace_open_problems("api", vec![found("1"), found("2")])
            .unwrap();
        assert_eq!(first.len(), 2);

        store.resolve_problem("api", first[0].id, "recreate_vm").unwrap();
        let second = store.replace_open_problems("api", vec![found("3")]).unwrap();
        assert_eq!(second.len(), 1);

        let all = store.list_problems("api").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].state, ProblemState::Resolved);
        assert_eq!(store.list_open_problems("api").unwrap()[0].instance_id, "3");
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("director.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_deployment(&deployment("prod")).unwrap();
            store
                .apply_dns_delta("prod", &[], &[record_spec(&test_instance("prod", "web", 0))])
                .unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_deployment("prod").unwrap().is_some());
        assert_eq!(store.dns_version().unwrap(), 1);
    }
}
