//! fleet-cloudcheck: reconciling the recorded VM inventory with the cloud.
//!
//! - [`reconciler`]: scan, resolve, auto mode
//! - [`resolution`]: resolutions per problem kind and their menu
//! - [`report`]: text reports

pub mod error;
pub mod reconciler;
pub mod report;
pub mod resolution;

pub use error::{CloudCheckError, CloudCheckResult};
pub use reconciler::{CloudReconciler, Scan};
pub use report::{AppliedResolution, CheckReport};
pub use resolution::{Resolution, default_resolution, menu, resolutions_for};
