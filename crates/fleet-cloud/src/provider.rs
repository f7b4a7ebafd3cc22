//! Cloud provider seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CloudResult;

/// Network attachment of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    /// `None` on a dynamic network: the cloud picks the address.
    #[serde(default)]
    pub ip: Option<String>,
}

/// A VM the cloud has booted, with the address it has on each network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedVm {
    pub cid: String,
    pub networks: Vec<NetworkSpec>,
}

impl CreatedVm {
    /// Address on `network`, if the VM is attached to it.
    pub fn ip_on(&self, network: &str) -> Option<&str> {
        self.networks
            .iter()
            .find(|n| n.name == network)
            .and_then(|n| n.ip.as_deref())
    }
}

/// Everything the cloud needs to boot a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRequest {
    /// Agent id the VM boots with; assigned by the director beforehand.
    pub agent_id: String,
    pub stemcell_cid: String,
    pub networks: Vec<NetworkSpec>,
}

/// VM lifecycle operations of a cloud provider.
///
/// Any call may block for as long as the provider takes; callers bound
/// concurrency themselves.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Create a VM. Every network of the result carries an address.
    async fn create_vm(&self, request: &VmRequest) -> CloudResult<CreatedVm>;

    /// Delete a VM. Fails with `VmNotFound` if it does not exist.
    async fn delete_vm(&self, cid: &str) -> CloudResult<()>;

    async fn has_vm(&self, cid: &str) -> CloudResult<bool>;

    async fn reboot_vm(&self, cid: &str) -> CloudResult<()>;
}
