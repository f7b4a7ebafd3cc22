//! fleetd.toml configuration.
//!
//! ```toml
//! [director]
//! data_dir = "/var/lib/fleet"
//! max_threads = 3
//!
//! [dns]
//! enabled = true
//! domain_name = "bosh"
//! include_index = false
//!
//! [cloud]
//! vm_dir = "/var/lib/fleet/vms"
//!
//! [agents]
//! base_dir = "/var/lib/fleet/agents"
//! ```
//!
//! Every section and key is optional.

use std::path::{Path, PathBuf};

use anyhow::Context;
use fleet_dns::DnsSettings;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorConfig {
    pub director: DirectorSection,
    pub dns: DnsConfig,
    pub cloud: CloudConfig,
    pub agents: AgentsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorSection {
    /// Inventory database and event log live here.
    pub data_dir: PathBuf,
    /// Concurrency of teardown and of agent fan-out.
    pub max_threads: usize,
}

impl Default for DirectorSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/fleet"),
            max_threads: fleet_pool::DEFAULT_MAX_THREADS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub enabled: bool,
    #[serde(flatten)]
    pub settings: DnsSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Defaults to `<data_dir>/vms`.
    pub vm_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Defaults to `<data_dir>/agents`.
    pub base_dir: Option<PathBuf>,
}

impl DirectorConfig {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("invalid director config")
    }

    /// Read `path`, or use the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Self::from_toml(&content)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn vm_dir(&self) -> PathBuf {
        self.cloud
            .vm_dir
            .clone()
            .unwrap_or_else(|| self.director.data_dir.join("vms"))
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.agents
            .base_dir
            .clone()
            .unwrap_or_else(|| self.director.data_dir.join("agents"))
    }
}
