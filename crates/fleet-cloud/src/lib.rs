//! fleet-cloud: the director's external collaborators.
//!
//! The director talks to two things it does not own: the cloud provider
//! (VM lifecycle) and the per-VM agents (DNS sync, job lifecycle). Both are
//! modelled as `async_trait` seams so the orchestration crates can run
//! against real bindings, the file-backed [`DummyCloud`], or hand-written
//! test fakes.

pub mod agent;
pub mod dummy;
pub mod error;
pub mod provider;
pub mod wire;

pub use agent::{AgentClient, AgentJobState, SyncOutcome};
pub use dummy::DummyCloud;
pub use error::{AgentError, AgentResult, CloudError, CloudResult};
pub use provider::{CloudProvider, CreatedVm, NetworkSpec, VmRequest};
pub use wire::{LocalDnsRecords, RECORD_KEYS, RecordInfo};
