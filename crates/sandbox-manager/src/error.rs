//! Session manager error taxonomy (spec.md §7), mapped onto `tonic::Status`
//! codes at the C6 boundary in [`crate::rpc`].

use thiserror::Error;

pub type ManagerResult<T> = Result<T, ManagerError>;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("agent did not become ready: {0}")]
    AgentUnready(String),

    #[error("container engine unavailable: {0}")]
    Unavailable(String),

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sandbox_container::ContainerError> for ManagerError {
    fn from(e: sandbox_container::ContainerError) -> Self {
        use sandbox_container::ContainerError::*;
        match e {
            InvalidInput(msg) => ManagerError::InvalidArgument(msg),
            ContainerNotFound(id) => ManagerError::SessionNotFound(id),
            NoRuntimeAvailable | CommandFailed { .. } | Io(_) => ManagerError::Unavailable(e.to_string()),
            ImageNotFound(_) | ParseError(_) => ManagerError::Internal(e.to_string()),
        }
    }
}
