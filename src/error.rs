//! Error types for the Block Volume Controller
//!
//! Every reconcile failure is classified so the loop driver can decide between
//! requeueing and dropping a key without inspecting error strings.

use thiserror::Error;

/// Unified error type for the controller
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Update conflict on {kind}/{name}: resource version {resource_version} is stale")]
    Conflict {
        kind: String,
        name: String,
        resource_version: String,
    },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    // =========================================================================
    // Static Data Errors
    // =========================================================================
    #[error("Invalid {kind}/{name}: {reason}")]
    InvalidObject {
        kind: String,
        name: String,
        reason: String,
    },

    // =========================================================================
    // Encoding Errors
    // =========================================================================
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Classification of an error for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Object absent; steady state, never a failure
    NotFound,
    /// Optimistic-concurrency collision; re-read and recompute
    Conflict,
    /// Backend unavailable or other retryable failure
    Transient,
    /// Malformed static data; retrying cannot help
    Invalid,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Invalid => write!(f, "invalid"),
        }
    }
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Re-read and recompute after the configured conflict delay
    Recompute,
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ResourceNotFound { .. } => ErrorKind::NotFound,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::Kube(e) => match api_status_code(e) {
                Some(404) => ErrorKind::NotFound,
                Some(409) => ErrorKind::Conflict,
                Some(400) | Some(422) => ErrorKind::Invalid,
                _ => ErrorKind::Transient,
            },
            Error::InvalidObject { .. }
            | Error::Configuration(_)
            | Error::Yaml(_) => ErrorKind::Invalid,
            Error::Unavailable(_) | Error::Internal(_) | Error::Metrics(_) => ErrorKind::Transient,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self.kind() {
            ErrorKind::NotFound | ErrorKind::Invalid => ErrorAction::NoRequeue,
            ErrorKind::Conflict => ErrorAction::Recompute,
            ErrorKind::Transient => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error means the object is simply absent
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

/// HTTP status code of an API server rejection, if this is one
fn api_status_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

/// Result type alias for the controller
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{} test", reason),
            reason: reason.into(),
            code,
        }))
    }

    #[test]
    fn test_kube_error_classification() {
        assert_eq!(api_error(404, "NotFound").kind(), ErrorKind::NotFound);
        assert_eq!(api_error(409, "Conflict").kind(), ErrorKind::Conflict);
        assert_eq!(api_error(422, "Invalid").kind(), ErrorKind::Invalid);
        assert_eq!(api_error(503, "ServiceUnavailable").kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_error_actions() {
        let err = Error::Conflict {
            kind: "Volume".into(),
            name: "vol-1".into(),
            resource_version: "7".into(),
        };
        assert_eq!(err.action(), ErrorAction::Recompute);

        let err = Error::InvalidObject {
            kind: "PersistentVolume".into(),
            name: "pv-1".into(),
            reason: "empty volume handle".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::Unavailable("apiserver".into());
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
    }

    #[test]
    fn test_error_retryable() {
        assert!(api_error(500, "InternalError").is_retryable());
        assert!(api_error(409, "Conflict").is_retryable());
        assert!(!api_error(404, "NotFound").is_retryable());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_conflict());
    }
}
