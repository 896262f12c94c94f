//! Unified error handling for the client.

use draftline_engine::{ApiError, EntityError};

/// Errors reported by a save endpoint.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EndpointError {
    /// The server rejected the batch and said why.
    #[error("batch rejected with {} error(s)", .0.len())]
    Validation(Vec<ApiError>),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {0}")]
    Status(u16),

    /// The response could not be read as a result list.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for EndpointError {
    fn from(err: reqwest::Error) -> Self {
        EndpointError::Transport(err.to_string())
    }
}

/// Client error type.
///
/// `Clone`, so every caller of a collapsed recalculation can get the same
/// result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("Engine error: {0}")]
    Engine(#[from] draftline_engine::Error),

    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    /// Validation errors resolved to the entities they concern.
    #[error("validation failed with {} error(s)", .0.len())]
    Validation(Vec<EntityError>),

    #[error("cannot decode document: {0}")]
    Decode(String),
}

/// Result type alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
