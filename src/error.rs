//! Error types for DirectPV
//!
//! Provides a single error enum shared by the reconcilers, the conversion
//! engine, the cluster clients and the CSI services, plus the mapping of
//! those errors onto gRPC status codes at the CSI boundary.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for DirectPV
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

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Resource version conflict: {kind}/{name}")]
    Conflict { kind: String, name: String },

    #[error("Leadership lost for lease {0}")]
    LeadershipLost(String),

    // =========================================================================
    // Conversion Errors
    // =========================================================================
    #[error("Kind unsupported for conversion: {0}")]
    KindUnsupported(String),

    #[error("Invalid from version: {0}")]
    InvalidFromVersion(String),

    #[error("Invalid to version: {0}")]
    InvalidToVersion(String),

    #[error("Migration of {kind} from {from} to {to} failed: {reason}")]
    Migration {
        kind: String,
        from: String,
        to: String,
        reason: String,
    },

    // =========================================================================
    // CSI Errors
    // =========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    // =========================================================================
    // Host Errors
    // =========================================================================
    #[error("Device not found for FSUUID {fsuuid}")]
    DeviceNotFound { fsuuid: String },

    #[error("Mount operation failed on {path}: {reason}")]
    Mount { path: String, reason: String },

    #[error("Quota operation failed on {path}: {reason}")]
    Quota { path: String, reason: String },

    #[error("Command {command} failed: {reason}")]
    Command { command: String, reason: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Init config error: {0}")]
    InitConfig(String),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Build a not-found error for a kind/name pair
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::ResourceNotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Optimistic concurrency and API hiccups - retry with backoff
            Error::Conflict { .. } | Error::Kube(_) => ErrorAction::RequeueWithBackoff,

            // Device may come back after a rescan
            Error::DeviceNotFound { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            // Invalid input never heals by itself
            Error::Configuration(_)
            | Error::InvalidArgument(_)
            | Error::KindUnsupported(_)
            | Error::InvalidFromVersion(_)
            | Error::InvalidToVersion(_)
            | Error::InitConfig(_) => ErrorAction::NoRequeue,

            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Whether the error says the object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }

    /// Whether the error says the object already exists
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::ResourceExists { .. } => true,
            Error::Kube(kube::Error::Api(response)) => {
                response.code == 409 && response.reason == "AlreadyExists"
            }
            _ => false,
        }
    }

    /// Whether the error is a resource-version conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube(kube::Error::Api(response)) => {
                response.code == 409 && response.reason == "Conflict"
            }
            _ => false,
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        if error.is_not_found() {
            return tonic::Status::not_found(error.to_string());
        }
        match error {
            Error::InvalidArgument(message) => tonic::Status::invalid_argument(message),
            Error::FailedPrecondition(message) => tonic::Status::failed_precondition(message),
            Error::OutOfRange(message) => tonic::Status::out_of_range(message),
            Error::ResourceExhausted(message) => tonic::Status::resource_exhausted(message),
            error => tonic::Status::internal(error.to_string()),
        }
    }
}

/// Result type alias for DirectPV
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "boom".into(),
            reason: reason.into(),
            code,
        }))
    }

    #[test]
    fn test_error_actions() {
        let err = Error::Conflict {
            kind: "DirectPVDrive".into(),
            name: "d1".into(),
        };
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);
        assert!(!err.is_retryable());

        let err = Error::DeviceNotFound {
            fsuuid: "abc".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(api_error(409, "AlreadyExists").is_already_exists());
        assert!(!api_error(409, "AlreadyExists").is_conflict());
        assert!(api_error(409, "Conflict").is_conflict());
        assert!(Error::not_found("DirectPVVolume", "v1").is_not_found());
    }

    #[test]
    fn test_status_mapping() {
        let status: tonic::Status = Error::not_found("DirectPVVolume", "v1").into();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status: tonic::Status = Error::OutOfRange("too big".into()).into();
        assert_eq!(status.code(), tonic::Code::OutOfRange);

        let status: tonic::Status = Error::ResourceExhausted("no drive".into()).into();
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);

        let status: tonic::Status = Error::FailedPrecondition("staged".into()).into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let status: tonic::Status = Error::Mount {
            path: "/mnt".into(),
            reason: "EPERM".into(),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
