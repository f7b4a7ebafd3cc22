//! File-backed dummy cloud.
//!
//! Each VM is a JSON file `<dir>/<cid>.json`. Deleting the file out of band
//! is how tests (and operators) simulate a VM vanishing from the cloud.
//!
//! Dynamic network addresses come from [`DYNAMIC_POOL`] and are never handed
//! out twice by one process, so a recreated VM always gets a new address.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CloudError, CloudResult};
use crate::provider::{CloudProvider, CreatedVm, NetworkSpec, VmRequest};

/// Base of the addresses the dummy cloud assigns on dynamic networks.
pub const DYNAMIC_POOL: Ipv4Addr = Ipv4Addr::new(10, 200, 0, 0);

/// A VM as the dummy cloud stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DummyVm {
    pub cid: String,
    pub agent_id: String,
    pub stemcell_cid: String,
    pub networks: Vec<NetworkSpec>,
    #[serde(default)]
    pub reboots: u32,
}

#[derive(Clone)]
pub struct DummyCloud {
    dir: PathBuf,
    failing_creates: Arc<AtomicU32>,
    /// Highest dynamic address offset handed out so far.
    dynamic_offset: Arc<AtomicU32>,
}

impl DummyCloud {
    /// Use (and create if needed) `dir` as the VM directory.
    pub fn open(dir: &Path) -> CloudResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            CloudError::Permanent(format!("creating vm dir {}: {e}", dir.display()))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            failing_creates: Arc::new(AtomicU32::new(0)),
            dynamic_offset: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Make the next `count` `create_vm` calls fail transiently.
    pub fn fail_next_creates(&self, count: u32) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    pub async fn get_vm(&self, cid: &str) -> CloudResult<Option<DummyVm>> {
        match tokio::fs::read(self.vm_path(cid)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| CloudError::Permanent(format!("corrupt vm {cid}: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CloudError::Transient(e.to_string())),
        }
    }

    /// All VMs currently in the cloud, ordered by cid.
    pub async fn vms(&self) -> CloudResult<Vec<DummyVm>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| CloudError::Transient(e.to_string()))?;
        let mut vms = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CloudError::Transient(e.to_string()))?
        {
            let path = entry.path();
            let Some(cid) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
            else {
                continue;
            };
            if let Some(vm) = self.get_vm(cid).await? {
                vms.push(vm);
            }
        }
        vms.sort_by(|a, b| a.cid.cmp(&b.cid));
        Ok(vms)
    }

    /// The VM booted with `agent_id`, if it still exists.
    pub async fn vm_for_agent(&self, agent_id: &str) -> CloudResult<Option<DummyVm>> {
        Ok(self.vms().await?.into_iter().find(|vm| vm.agent_id == agent_id))
    }

    /// Next free dynamic address, above every one already in use.
    async fn next_dynamic_ip(&self) -> CloudResult<String> {
        let base = u32::from(DYNAMIC_POOL);
        let in_use = self
            .vms()
            .await?
            .iter()
            .flat_map(|vm| vm.networks.iter())
            .filter_map(|n| n.ip.as_deref()?.parse::<Ipv4Addr>().ok())
            .map(u32::from)
            .filter(|ip| *ip > base && *ip - base < 1 << 16)
            .map(|ip| ip - base)
            .max()
            .unwrap_or(0);
        self.dynamic_offset.fetch_max(in_use, Ordering::SeqCst);
        let offset = self.dynamic_offset.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Ipv4Addr::from(base + offset).to_string())
    }

    fn vm_path(&self, cid: &str) -> PathBuf {
        self.dir.join(format!("{cid}.json"))
    }

    async fn write_vm(&self, vm: &DummyVm) -> CloudResult<()> {
        let bytes =
            serde_json::to_vec_pretty(vm).map_err(|e| CloudError::Permanent(e.to_string()))?;
        let tmp = self.dir.join(format!(".{}.tmp", vm.cid));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| CloudError::Transient(e.to_string()))?;
        tokio::fs::rename(&tmp, self.vm_path(&vm.cid))
            .await
            .map_err(|e| CloudError::Transient(e.to_string()))
    }
}

#[async_trait]
impl CloudProvider for DummyCloud {
    async fn create_vm(&self, request: &VmRequest) -> CloudResult<CreatedVm> {
        let remaining = self.failing_creates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_creates.store(remaining - 1, Ordering::SeqCst);
            return Err(CloudError::Transient(format!(
                "create_vm for agent {} rejected",
                request.agent_id
            )));
        }
        let mut networks = Vec::with_capacity(request.networks.len());
        for network in &request.networks {
            let ip = match &network.ip {
                Some(ip) => ip.clone(),
                None => self.next_dynamic_ip().await?,
            };
            networks.push(NetworkSpec {
                name: network.name.clone(),
                ip: Some(ip),
            });
        }
        let vm = DummyVm {
            cid: format!("vm-{}", uuid::Uuid::new_v4()),
            agent_id: request.agent_id.clone(),
            stemcell_cid: request.stemcell_cid.clone(),
            networks,
            reboots: 0,
        };
        self.write_vm(&vm).await?;
        info!(cid = %vm.cid, agent_id = %vm.agent_id, "vm created");
        Ok(CreatedVm {
            cid: vm.cid,
            networks: vm.networks,
        })
    }

    async fn delete_vm(&self, cid: &str) -> CloudResult<()> {
        match tokio::fs::remove_file(self.vm_path(cid)).await {
            Ok(()) => {
                info!(%cid, "vm deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CloudError::VmNotFound(cid.to_string()))
            }
            Err(e) => Err(CloudError::Transient(e.to_string())),
        }
    }

    async fn has_vm(&self, cid: &str) -> CloudResult<bool> {
        tokio::fs::try_exists(self.vm_path(cid))
            .await
            .map_err(|e| CloudError::Transient(e.to_string()))
    }

    async fn reboot_vm(&self, cid: &str) -> CloudResult<()> {
        let mut vm = self
            .get_vm(cid)
            .await?
            .ok_or_else(|| CloudError::VmNotFound(cid.to_string()))?;
        vm.reboots += 1;
        self.write_vm(&vm).await?;
        debug!(%cid, reboots = vm.reboots, "vm rebooted");
        Ok(())
    }
}
