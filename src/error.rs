//! Typed error taxonomy for the Machine Manager.
//!
//! Library code returns `ManagerError`/`DeployError`; `anyhow` is reserved for the
//! CLI binary and config-loading boundary.

use thiserror::Error;

/// Top-level error kind surfaced by Machine Manager operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("firecracker driver error: {0}")]
    DriverError(String),

    #[error("handshake for vm {vmid} timed out after {timeout_ms}ms")]
    HandshakeTimeout { vmid: String, timeout_ms: u64 },

    #[error("deploy for vm {vmid} timed out after {timeout_ms}ms")]
    DeployTimeout { vmid: String, timeout_ms: u64 },

    #[error("agent rejected deploy for vm {vmid}: {message}")]
    AgentRejected { vmid: String, message: String },

    #[error("subscribe failed for subject {subject}: {cause}")]
    SubscribeFailed { subject: String, cause: String },

    #[error("no such workload")]
    NotFound,

    #[error("trigger on subject {subject} for vm {vmid} timed out after {timeout_ms}ms")]
    TriggerTimeout {
        vmid: String,
        subject: String,
        timeout_ms: u64,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

/// Fine-grained error returned by `DeploymentEngine::deploy` (§4.3).
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("failed to encode deploy request: {0}")]
    Encoding(String),

    #[error("deploy request timed out")]
    Timeout,

    #[error("agent rejected deploy: {0}")]
    AgentRejected(String),

    #[error("subscribe failed for subject {subject}: {cause}")]
    SubscribeFailed { subject: String, cause: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DeployError> for ManagerError {
    fn from(err: DeployError) -> Self {
        match err {
            DeployError::Encoding(msg) => ManagerError::Internal(format!("encoding: {msg}")),
            DeployError::Timeout => ManagerError::Internal("deploy timeout".to_string()),
            DeployError::AgentRejected(msg) => ManagerError::AgentRejected {
                vmid: String::new(),
                message: msg,
            },
            DeployError::SubscribeFailed { subject, cause } => {
                ManagerError::SubscribeFailed { subject, cause }
            }
            DeployError::Internal(msg) => ManagerError::Internal(msg),
        }
    }
}

pub type ManagerResult<T> = std::result::Result<T, ManagerError>;
pub type DeployResult<T> = std::result::Result<T, DeployError>;
