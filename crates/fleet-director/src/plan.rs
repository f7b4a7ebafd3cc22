//! Desired-state deployment plans.
//!
//! A plan is what a deploy converges to. It is read from TOML:
//!
//! ```toml
//! name = "simple.local_dns"
//!
//! [[stemcells]]
//! name = "ubuntu-noble"
//! version = "1.5"
//! cid = "img-ubuntu-noble-1.5"
//!
//! [[releases]]
//! name = "test-release"
//! version = "0+dev.1"
//!
//! [[networks]]
//! name = "local_dns"
//! first_ip = "192.168.1.2"
//! last_ip = "192.168.1.50"
//!
//! [[networks]]
//! name = "cloud_assigned"
//! type = "dynamic"
//!
//! [update]
//! canaries = 2
//! max_in_flight = 5
//!
//! [[instance_groups]]
//! name = "job_to_test_local_dns"
//! instances = 10
//! network = "local_dns"
//! stemcell = "ubuntu-noble"
//! ```

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DirectorError, DirectorResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub name: String,
    #[serde(default)]
    pub stemcells: Vec<StemcellRef>,
    #[serde(default)]
    pub releases: Vec<ReleaseRef>,
    #[serde(default)]
    pub networks: Vec<NetworkPlan>,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub instance_groups: Vec<InstanceGroupPlan>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StemcellRef {
    pub name: String,
    pub version: String,
    /// Cloud image to register the stemcell with if it is not uploaded yet.
    #[serde(default)]
    pub cid: Option<String>,
}

impl StemcellRef {
    pub fn key(&self) -> String {
        fleet_state::versioned_key(&self.name, &self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRef {
    pub name: String,
    pub version: String,
}

impl ReleaseRef {
    pub fn key(&self) -> String {
        fleet_state::versioned_key(&self.name, &self.version)
    }
}

/// How instances on a network get their address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    /// Sequential addresses from `[first_ip, last_ip]`, reserved before the VM exists.
    #[default]
    Manual,
    /// The cloud assigns the address when it boots the VM.
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPlan {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: NetworkType,
    #[serde(default)]
    pub first_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub last_ip: Option<Ipv4Addr>,
}

impl NetworkPlan {
    /// Address range of a manual network.
    pub fn range(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        match self.kind {
            NetworkType::Manual => Some((self.first_ip?, self.last_ip?)),
            NetworkType::Dynamic => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceGroupPlan {
    pub name: String,
    pub instances: u32,
    pub network: String,
    /// Stemcell name; the version comes from the plan's `stemcells`.
    pub stemcell: String,
    /// Availability zones, assigned round-robin by index.
    #[serde(default)]
    pub azs: Vec<String>,
    #[serde(default)]
    pub skip_drain: bool,
}

impl InstanceGroupPlan {
    pub fn az_for(&self, index: u32) -> Option<String> {
        if self.azs.is_empty() {
            None
        } else {
            Some(self.azs[index as usize % self.azs.len()].clone())
        }
    }
}

/// Rollout limits of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Instances updated (and validated) before the rest.
    pub canaries: u32,
    /// Maximum instances updated at once after the canaries.
    pub max_in_flight: u32,
    /// How long a canary may take to report `running`.
    pub canary_watch_time_ms: u64,
    /// How long any other instance may take to report `running`.
    pub update_watch_time_ms: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            canaries: 1,
            max_in_flight: 1,
            canary_watch_time_ms: 4000,
            update_watch_time_ms: 2000,
        }
    }
}

impl DeploymentPlan {
    pub fn from_toml(content: &str) -> DirectorResult<Self> {
        let plan: DeploymentPlan =
            toml::from_str(content).map_err(|e| DirectorError::Plan(e.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn from_file(path: &Path) -> DirectorResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DirectorError::Plan(format!("reading {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Check cross references between groups, networks and stemcells.
    pub fn validate(&self) -> DirectorResult<()> {
        if self.name.is_empty() {
            return Err(DirectorError::Plan("deployment name is empty".to_string()));
        }
        for network in &self.networks {
            if network.kind == NetworkType::Manual && network.range().is_none() {
                return Err(DirectorError::Plan(format!(
                    "manual network `{}` needs first_ip and last_ip",
                    network.name
                )));
            }
        }
        for group in &self.instance_groups {
            if self.network(&group.network).is_none() {
                return Err(DirectorError::Plan(format!(
                    "instance group `{}` references unknown network `{}`",
                    group.name, group.network
                )));
            }
            if self.stemcell(&group.stemcell).is_none() {
                return Err(DirectorError::Plan(format!(
                    "instance group `{}` references unknown stemcell `{}`",
                    group.name, group.stemcell
                )));
            }
        }
        Ok(())
    }

    pub fn network(&self, name: &str) -> Option<&NetworkPlan> {
        self.networks.iter().find(|n| n.name == name)
    }

    pub fn stemcell(&self, name: &str) -> Option<&StemcellRef> {
        self.stemcells.iter().find(|s| s.name == name)
    }

    pub fn instance_group(&self, name: &str) -> Option<&InstanceGroupPlan> {
        self.instance_groups.iter().find(|g| g.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
name = "simple.local_dns"

[[stemcells]]
name = "ubuntu"
version = "1"
cid = "img-1"

[[releases]]
name = "test-release"
version = "0+dev.1"

[[networks]]
name = "local_dns"
first_ip = "192.168.1.2"
last_ip = "192.168.1.20"

[update]
canaries = 2
max_in_flight = 5

[[instance_groups]]
name = "job_to_test_local_dns"
instances = 10
network = "local_dns"
stemcell = "ubuntu"
azs = ["z1", "z2"]

[properties]
answer = 42
"#;

    #[test]
    fn parses_plan_with_defaults() {
        let plan = DeploymentPlan::from_toml(PLAN).unwrap();
        assert_eq!(plan.update.canaries, 2);
        assert_eq!(plan.update.max_in_flight, 5);
        assert_eq!(plan.update.canary_watch_time_ms, 4000);
        assert_eq!(plan.stemcells[0].key(), "ubuntu/1");
        assert_eq!(plan.properties["answer"], 42);
        let group = plan.instance_group("job_to_test_local_dns").unwrap();
        assert_eq!(group.az_for(3).as_deref(), Some("z2"));
        assert!(!group.skip_drain);
    }

    #[test]
    fn networks_default_to_manual() {
        let plan = DeploymentPlan::from_toml(PLAN).unwrap();
        let network = plan.network("local_dns").unwrap();
        assert_eq!(network.kind, NetworkType::Manual);
        assert_eq!(
            network.range(),
            Some(("192.168.1.2".parse().unwrap(), "192.168.1.20".parse().unwrap()))
        );
    }

    #[test]
    fn dynamic_network_needs_no_range() {
        let dynamic = PLAN.replace(
            "first_ip = \"192.168.1.2\"\nlast_ip = \"192.168.1.20\"",
            "type = \"dynamic\"",
        );
        let plan = DeploymentPlan::from_toml(&dynamic).unwrap();
        let network = plan.network("local_dns").unwrap();
        assert_eq!(network.kind, NetworkType::Dynamic);
        assert!(network.range().is_none());
    }

    #[test]
    fn manual_network_without_range_is_rejected() {
        let bad = PLAN.replace("last_ip = \"192.168.1.20\"\n", "");
        assert!(matches!(
            DeploymentPlan::from_toml(&bad),
            Err(DirectorError::Plan(_))
        ));
    }

    #[test]
    fn rejects_unknown_network() {
        let bad = PLAN.replace("network = \"local_dns\"", "network = \"nope\"");
        assert!(matches!(
            DeploymentPlan::from_toml(&bad),
            Err(DirectorError::Plan(_))
        ));
    }
}
