//! VM lifecycle on behalf of instances.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_cloud::{CloudError, CloudProvider, NetworkSpec, VmRequest};
use fleet_state::{Instance, InstanceLifecycle, StateStore, Vm, epoch_secs};
use tracing::{debug, info};

use crate::error::DirectorResult;

/// Deletes one VM from the cloud and the inventory.
#[async_trait]
pub trait DeleteVm: Send + Sync {
    async fn delete_vm(&self, vm: &Vm) -> DirectorResult<()>;
}

/// Cloud-backed [`DeleteVm`]. A VM the cloud no longer knows counts as deleted.
#[derive(Clone)]
pub struct VmDeleter {
    cloud: Arc<dyn CloudProvider>,
    store: StateStore,
}

impl VmDeleter {
    pub fn new(cloud: Arc<dyn CloudProvider>, store: StateStore) -> Self {
        Self { cloud, store }
    }
}

#[async_trait]
impl DeleteVm for VmDeleter {
    async fn delete_vm(&self, vm: &Vm) -> DirectorResult<()> {
        match self.cloud.delete_vm(&vm.cid).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(cid = %vm.cid, "vm already gone from the cloud");
            }
            Err(e) => return Err(e.into()),
        }
        self.store.delete_vm(&vm.deployment, &vm.cid)?;
        info!(cid = %vm.cid, deployment = %vm.deployment, "vm deleted");
        Ok(())
    }
}

/// Creates VMs for instances that already have an identity.
#[derive(Clone)]
pub struct VmCreator {
    cloud: Arc<dyn CloudProvider>,
    store: StateStore,
}

impl VmCreator {
    pub fn new(cloud: Arc<dyn CloudProvider>, store: StateStore) -> Self {
        Self { cloud, store }
    }

    /// Boot a VM with the instance's agent id and bind it to the instance.
    ///
    /// On a dynamic network the instance takes the address the cloud
    /// assigned; the caller recomputes DNS to publish it.
    pub async fn create_for(&self, instance: &mut Instance, stemcell_cid: &str) -> DirectorResult<Vm> {
        let request = VmRequest {
            agent_id: instance.agent_id.clone(),
            stemcell_cid: stemcell_cid.to_string(),
            networks: vec![NetworkSpec {
                name: instance.network.clone(),
                ip: (!instance.dynamic_ip).then(|| instance.ip.clone()),
            }],
        };
        let created = self.cloud.create_vm(&request).await?;
        if instance.dynamic_ip {
            let ip = created.ip_on(&instance.network).ok_or_else(|| {
                CloudError::Permanent(format!(
                    "vm {} has no address on network `{}`",
                    created.cid, instance.network
                ))
            })?;
            debug!(instance = %instance.display_name(), %ip, "dynamic address assigned");
            instance.ip = ip.to_string();
        }
        let cid = created.cid;
        let now = epoch_secs();
        let vm = Vm {
            cid,
            deployment: instance.deployment.clone(),
            instance_id: Some(instance.id.clone()),
            agent_id: instance.agent_id.clone(),
            stemcell_cid: stemcell_cid.to_string(),
            created_at: now,
        };
        instance.vm_cid = Some(vm.cid.clone());
        instance.state = InstanceLifecycle::Creating;
        instance.updated_at = now;
        self.store.bind_vm(&vm, instance)?;
        info!(instance = %instance.display_name(), cid = %vm.cid, "vm created");
        Ok(vm)
    }

    /// Drop the instance's current VM (if any) and give it a fresh agent id.
    ///
    /// The instance keeps its identity, and its IP unless the address came
    /// from the cloud with the old VM. It is left `desired` with no VM so
    /// the new agent id can be published before the new VM boots.
    /// Returns the stemcell the old VM ran, if it had one.
    pub async fn detach_for_recreate(
        &self,
        instance: &mut Instance,
        vm_deleter: &dyn DeleteVm,
    ) -> DirectorResult<Option<String>> {
        let mut stemcell_cid = None;
        if let Some(cid) = instance.vm_cid.take() {
            if let Some(mut vm) = self.store.get_vm(&instance.deployment, &cid)? {
                stemcell_cid = Some(vm.stemcell_cid.clone());
                vm.instance_id = None;
                self.store.put_vm(&vm)?;
                vm_deleter.delete_vm(&vm).await?;
            }
        }
        if instance.dynamic_ip {
            instance.ip.clear();
        }
        instance.agent_id = new_agent_id();
        instance.state = InstanceLifecycle::Desired;
        instance.updated_at = epoch_secs();
        self.store.put_instance(instance)?;
        debug!(instance = %instance.display_name(), agent_id = %instance.agent_id, "instance detached for recreate");
        Ok(stemcell_cid)
    }
}

/// Agent ids are assigned before the VM exists.
pub fn new_agent_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
