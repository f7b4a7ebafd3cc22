//! Collaborator error types.

use thiserror::Error;

/// Errors reported by a cloud provider.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The VM does not exist (any more). Idempotent deletes treat this as success.
    #[error("vm not found: {0}")]
    VmNotFound(String),

    /// Worth retrying at operation granularity.
    #[error("transient cloud error: {0}")]
    Transient(String),

    #[error("cloud error: {0}")]
    Permanent(String),
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::VmNotFound(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Transient(_))
    }
}

pub type CloudResult<T> = Result<T, CloudError>;

/// Errors reported by the agent RPC channel.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent {0} is unresponsive")]
    Unresponsive(String),

    #[error("agent {agent_id} rejected {method}: {message}")]
    Rejected {
        agent_id: String,
        method: &'static str,
        message: String,
    },

    #[error("agent storage error: {0}")]
    Storage(String),
}

pub type AgentResult<T> = Result<T, AgentError>;
