//! Director error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectorError {
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("stemcell not found: {0}")]
    StemcellNotFound(String),

    #[error("invalid deployment plan: {0}")]
    Plan(String),

    #[error("state store error: {0}")]
    State(#[from] fleet_state::StateError),

    #[error("cloud error: {0}")]
    Cloud(#[from] fleet_cloud::CloudError),

    #[error("agent error: {0}")]
    Agent(#[from] fleet_cloud::AgentError),

    #[error("local dns error: {0}")]
    Dns(#[from] fleet_dns::DnsError),

    #[error(transparent)]
    Tasks(#[from] fleet_pool::AggregateTaskFailure),
}

pub type DirectorResult<T> = Result<T, DirectorError>;
