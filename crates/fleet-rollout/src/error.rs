//! Rollout error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error(transparent)]
    Director(#[from] fleet_director::DirectorError),

    #[error("state store error: {0}")]
    State(#[from] fleet_state::StateError),

    #[error("local dns error: {0}")]
    Dns(#[from] fleet_dns::DnsError),

    #[error("agent error: {0}")]
    Agent(#[from] fleet_cloud::AgentError),

    /// The instance's agent did not report `running` within the watch time.
    #[error("instance {instance} not running after {waited_ms}ms (last state: {last_state})")]
    Unhealthy {
        instance: String,
        waited_ms: u64,
        last_state: String,
    },

    /// A batch had failing instances; earlier batches stay converged.
    #[error("{group}: {phase} failed: {source}")]
    BatchFailed {
        group: String,
        phase: String,
        #[source]
        source: fleet_pool::AggregateTaskFailure,
    },
}

pub type RolloutResult<T> = Result<T, RolloutError>;
