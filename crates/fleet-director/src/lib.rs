//! fleet-director: the director's deployment-level operations.
//!
//! - [`plan`]: desired-state deployment plans (TOML)
//! - [`vm`]: creating, recreating and deleting VMs for instances
//! - [`instance_deleter`]: bounded, non-cancelling instance deletion
//! - [`unlinker`]: detaching a deployment from shared stemcells/releases
//! - [`deleter`]: full deployment teardown
//!
//! # Teardown order
//!
//! ```text
//!   1. instances ──► InstanceDeleter (TaskPool, max_threads)   best-effort
//!   2. orphaned VMs ──► VmDeleter                               best-effort
//!   3. stemcell / release links ──► ResourceUnlinker            fatal
//!   4. properties                                               fatal
//!   5. DNS rows (only when DNS is enabled)                      fatal
//!   6. deployment record                                        fatal
//! ```

pub mod deleter;
pub mod error;
pub mod instance_deleter;
pub mod plan;
pub mod unlinker;
pub mod vm;

pub use deleter::{DeploymentDeleter, TeardownPlan, TeardownReport};
pub use error::{DirectorError, DirectorResult};
pub use instance_deleter::{DeleteInstances, DeleteOptions, InstanceDeleter};
pub use plan::{
    DeploymentPlan, InstanceGroupPlan, NetworkPlan, NetworkType, ReleaseRef, StemcellRef, UpdateConfig,
};
pub use unlinker::{ResourceUnlinker, UnlinkReport};
pub use vm::{DeleteVm, VmCreator, VmDeleter};
