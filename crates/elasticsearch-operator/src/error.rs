//! Error types for the Elasticsearch operator

use crate::validation::SpecError;
use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// A work queue key that cannot be split into namespace and name
    #[error("Invalid resource key: {0}")]
    InvalidKey(String),

    /// The cluster specification was rejected by the validator
    #[error("Invalid cluster spec: {0}")]
    InvalidSpec(#[from] SpecError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable.
    ///
    /// Malformed keys and rejected specs cannot be fixed by trying again; they
    /// only change when the resource itself changes, which enqueues it anew.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            OperatorError::InvalidKey(_)
                | OperatorError::InvalidSpec(_)
                | OperatorError::InvalidConfig(_)
        )
    }

    /// Whether the API server reported the object as missing (HTTP 404)
    pub fn is_not_found(&self) -> bool {
        matches!(self, OperatorError::KubeError(kube::Error::Api(resp)) if resp.code == 404)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> OperatorError {
        OperatorError::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("statefulsets.apps \"es-logs-data\" {}", reason),
            reason: reason.to_string(),
            code,
        }))
    }

    #[test]
    fn test_error_display() {
        let err = OperatorError::InvalidSpec(SpecError::InvalidRole("worker".to_string()));
        assert!(err.to_string().contains("worker"));

        let err = OperatorError::InvalidKey("a/b/c".to_string());
        assert_eq!(err.to_string(), "Invalid resource key: a/b/c");
    }

    #[test]
    fn test_retryable_errors() {
        let timeout_err = OperatorError::Timeout("test".to_string());
        assert!(timeout_err.is_retryable());

        assert!(api_error(409, "Conflict").is_retryable());

        let spec_err = OperatorError::InvalidSpec(SpecError::MissingVersion);
        assert!(!spec_err.is_retryable());

        let key_err = OperatorError::InvalidKey("a/b/c".to_string());
        assert!(!key_err.is_retryable());
    }

    #[test]
    fn test_not_found() {
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(!api_error(409, "Conflict").is_not_found());
        assert!(!OperatorError::Timeout("x".to_string()).is_not_found());
    }
}
