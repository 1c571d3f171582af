//! Container driver error types.

use thiserror::Error;

pub type ContainerResult<T> = Result<T, ContainerError>;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("failed to parse container engine output: {0}")]
    ParseError(String),

    #[error("no container runtime available (docker or podman)")]
    NoRuntimeAvailable,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
