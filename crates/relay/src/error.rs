//! Errors returned by relay operations.
use http::StatusCode;
use relay_api::ValidationError;
use thiserror::Error;

use crate::backend::BackendError;

/// A relay operation that could not be carried out.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The request body could not be understood.
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The request was understood but asks for something contradictory.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    /// The backend failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl RelayError {
    /// The HTTP status code to answer with.
    ///
    /// Contradictory log options answer 500 rather than 400; nodes in the
    /// field already treat that code as "do not retry".
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Malformed(_) => StatusCode::BAD_REQUEST,
            RelayError::Invalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
