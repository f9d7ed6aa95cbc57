//! Analysis client error types.

use thiserror::Error;

pub type MlResult<T> = Result<T, MlError>;

#[derive(Debug, Error)]
pub enum MlError {
    #[error("Analysis service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The service looked at the chunk and refused or failed it. Retrying
    /// the same input will not help.
    #[error("Analysis rejected: {0}")]
    Rejected(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MlError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MlError::ServiceUnavailable(_) | MlError::Timeout(_) | MlError::Network(_)
        )
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
        {
            MlError::ServiceUnavailable(format!("{}: {}", status, body))
        } else {
            MlError::Rejected(format!("{}: {}", status, body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_status_classification() {
        assert!(MlError::from_status(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_retryable());
        assert!(MlError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(!MlError::from_status(StatusCode::UNPROCESSABLE_ENTITY, String::new()).is_retryable());
        assert!(!MlError::InvalidResponse("bad".into()).is_retryable());
    }
}
