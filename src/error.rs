//! Error types for scope-broker.
//!
//! Each component has its own error enum; [`BrokerError`] wraps them so the
//! public operations share one [`Result`] alias.

use std::time::Duration;

use thiserror::Error;

/// The user or OS declined or withdrew access to a resource.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PermissionError {
    /// Access was refused.
    #[error("permission denied for {0}")]
    Denied(String),

    /// A previous grant is no longer valid.
    #[error("permission expired for {0}")]
    Expired(String),
}

/// Bookmark creation, resolution and validation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookmarkError {
    /// The resource could not be bookmarked.
    #[error("bookmark creation failed: {0}")]
    CreationFailed(String),

    /// The token is malformed or refers to nothing resolvable.
    #[error("bookmark resolution failed: {0}")]
    ResolutionFailed(String),

    /// The token resolved, but must be re-created before further use.
    #[error("bookmark is stale: {0}")]
    Stale(String),

    /// The resolved resource no longer matches the recorded grant.
    #[error("bookmark validation failed: {0}")]
    ValidationFailed(String),
}

/// Channel-level command failures.
///
/// `ExecutionFailed`, `TimeoutFailure` and `Cancelled` are normally carried
/// inside a [`CommandResult`](crate::channel::CommandResult) rather than
/// returned as errors; only `ConnectionFailed` is raised from `execute`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The isolated execution context could not be reached.
    #[error("connection to isolated context failed: {0}")]
    ConnectionFailed(String),

    /// The command exceeded its wall-clock bound.
    #[error("command exceeded timeout of {:.3}s", .0.as_secs_f64())]
    TimeoutFailure(Duration),

    /// The command ran and exited unsuccessfully.
    #[error("command exited with code {exit_code}: {detail}")]
    ExecutionFailed { exit_code: i32, detail: String },

    /// The caller cancelled the command.
    #[error("command cancelled by caller")]
    Cancelled,
}

impl CommandError {
    /// Stable tag prefixed to result error details.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "ConnectionFailed",
            Self::TimeoutFailure(_) => "TimeoutFailure",
            Self::ExecutionFailed { .. } => "ExecutionFailed",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Render as `"<Tag>: <message>"`.
    pub fn tagged_detail(&self) -> String {
        format!("{}: {}", self.tag(), self)
    }
}

/// Credential storage failures. Messages never contain secret material.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("failed to save credential '{key}': {reason}")]
    SaveFailed { key: String, reason: String },

    #[error("failed to retrieve credential '{key}': {reason}")]
    RetrievalFailed { key: String, reason: String },

    #[error("failed to delete credential '{key}': {reason}")]
    DeletionFailed { key: String, reason: String },

    #[error("failed to configure sharing group '{group}': {reason}")]
    SharingConfigurationFailed { group: String, reason: String },

    #[error("sharing group '{group}' is not usable: {reason}")]
    SharingValidationFailed { group: String, reason: String },
}

/// Main error type for scope-broker operations.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Bookmark(#[from] BookmarkError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Operation invoked on a component that is not (yet) available.
    #[error("operation unavailable: {0}")]
    OperationUnavailable(String),

    /// A command request failed validation before reaching the channel.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid lifecycle transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Internal lock was poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type for scope-broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_display() {
        let err = PermissionError::Denied("/tmp/x".into());
        assert!(err.to_string().contains("/tmp/x"));
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_timeout_tagged_detail() {
        let err = CommandError::TimeoutFailure(Duration::from_secs(2));
        let detail = err.tagged_detail();
        assert!(detail.starts_with("TimeoutFailure: "));
        assert!(detail.contains("2.000s"));
    }

    #[test]
    fn test_execution_failed_tag() {
        let err = CommandError::ExecutionFailed {
            exit_code: 3,
            detail: "boom".into(),
        };
        assert_eq!(err.tag(), "ExecutionFailed");
        assert!(err.to_string().contains("code 3"));
    }

    #[test]
    fn test_transparent_wrapping() {
        let err: BrokerError = BookmarkError::Stale("/data".into()).into();
        assert!(matches!(err, BrokerError::Bookmark(BookmarkError::Stale(_))));
        assert_eq!(err.to_string(), "bookmark is stale: /data");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BrokerError = io_err.into();
        assert!(matches!(err, BrokerError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_credential_error_has_no_secret() {
        let err = CredentialError::SaveFailed {
            key: "repo1".into(),
            reason: "disk full".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to save credential 'repo1': disk full"
        );
    }
}
