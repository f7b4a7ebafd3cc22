//! Cloud-check error types.

use fleet_state::ProblemKind;
use thiserror::Error;

use crate::resolution::Resolution;

#[derive(Debug, Error)]
pub enum CloudCheckError {
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("`{}` cannot be resolved with `{}`", .kind.as_str(), .resolution.as_str())]
    UnsupportedResolution {
        kind: ProblemKind,
        resolution: Resolution,
    },

    #[error("instance {0} is gone")]
    InstanceGone(String),

    #[error("state store error: {0}")]
    State(#[from] fleet_state::StateError),

    #[error("cloud error: {0}")]
    Cloud(#[from] fleet_cloud::CloudError),

    #[error(transparent)]
    Director(#[from] fleet_director::DirectorError),

    #[error(transparent)]
    Rollout(#[from] fleet_rollout::RolloutError),

    #[error(transparent)]
    Tasks(#[from] fleet_pool::AggregateTaskFailure),
}

pub type CloudCheckResult<T> = Result<T, CloudCheckError>;
