//! DNS synchronizer errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("state store error: {0}")]
    State(#[from] fleet_state::StateError),

    /// Every recompute attempt lost a race with a concurrent writer.
    #[error("local dns recompute for `{deployment}` gave up after {attempts} attempts: {last}")]
    RecomputeExhausted {
        deployment: String,
        attempts: u32,
        last: String,
    },

    #[error("invalid name pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("agent error: {0}")]
    Agent(#[from] fleet_cloud::AgentError),
}

pub type DnsResult<T> = Result<T, DnsError>;
