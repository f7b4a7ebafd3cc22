//! fleet-agent: what runs next to the jobs on every VM.
//!
//! - [`LocalDns`]: applies DNS syncs to the VM's hosts file and
//!   `records.json`, gated by record set version
//! - [`Agent`]: one VM's agent: job state plus a pending DNS sync that is
//!   always flushed before jobs start
//! - [`LocalAgents`]: an in-process `AgentClient` hosting one [`Agent`]
//!   per VM of a [`fleet_cloud::DummyCloud`]

pub mod agent;
pub mod local;
pub mod local_dns;

pub use agent::Agent;
pub use local::LocalAgents;
pub use local_dns::LocalDns;
