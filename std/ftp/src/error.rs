//! Error taxonomy shared by every FTP tool.
//!
//! Each [`ToolError`] carries an [`ErrorKind`] tag so callers can branch on
//! the failure class without parsing the human-readable detail.

use crate::validate::ValidateError;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used by sessions, the recursive engine and the dispatcher.
pub type ToolResult<T> = Result<T, ToolError>;

/// Machine-readable failure class reported to the calling agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    SessionNotFound,
    SessionBusy,
    AuthenticationError,
    ConnectivityError,
    PathNotFoundError,
    PathExistsError,
    DirectoryNotEmptyError,
    NotAFileError,
    NoActiveTransferError,
    LocalIOError,
    ProtocolError,
    InvalidArgument,
    TransferAborted,
    AccessDenied,
}

/// Errors surfaced by FTP tools.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("session '{0}' not found, connect first")]
    SessionNotFound(String),
    #[error("session '{0}' is busy with another operation")]
    SessionBusy(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("could not reach server: {0}")]
    Connectivity(String),
    #[error("remote path not found: {0}")]
    PathNotFound(String),
    #[error("remote path already exists: {0}")]
    PathExists(String),
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("no transfer in progress on session '{0}'")]
    NoActiveTransfer(String),
    #[error("local I/O error on {}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Protocol(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("transfer of {0} was aborted")]
    TransferAborted(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
}

impl ToolError {
    /// The taxonomy tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            ToolError::SessionBusy(_) => ErrorKind::SessionBusy,
            ToolError::Authentication(_) => ErrorKind::AuthenticationError,
            ToolError::Connectivity(_) => ErrorKind::ConnectivityError,
            ToolError::PathNotFound(_) => ErrorKind::PathNotFoundError,
            ToolError::PathExists(_) => ErrorKind::PathExistsError,
            ToolError::DirectoryNotEmpty(_) => ErrorKind::DirectoryNotEmptyError,
            ToolError::NotAFile(_) => ErrorKind::NotAFileError,
            ToolError::NoActiveTransfer(_) => ErrorKind::NoActiveTransferError,
            ToolError::LocalIo { .. } => ErrorKind::LocalIOError,
            ToolError::Protocol(_) => ErrorKind::ProtocolError,
            ToolError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ToolError::TransferAborted(_) => ErrorKind::TransferAborted,
            ToolError::AccessDenied(_) => ErrorKind::AccessDenied,
        }
    }

    pub(crate) fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ToolError::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// Serialize into the structured error body returned to the caller.
    pub fn to_json(&self) -> String {
        let body = ErrorBody::from(self);
        serde_json::to_string_pretty(&body).unwrap_or_else(|_| self.to_string())
    }
}

impl From<ValidateError> for ToolError {
    fn from(err: ValidateError) -> Self {
        match err {
            ValidateError::NotAllowed(path) => ToolError::AccessDenied(format!(
                "{} is outside the allowed directories",
                path.display()
            )),
            ValidateError::Io { path, source } => ToolError::LocalIo { path, source },
            other => ToolError::InvalidArgument(other.to_string()),
        }
    }
}

/// Compact error description embedded in recursive operation outcomes.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub detail: String,
}

impl From<&ToolError> for ErrorDetail {
    fn from(err: &ToolError) -> Self {
        Self {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}

/// Failure envelope: `{"status": "error", "kind": ..., "detail": ...}`.
#[derive(Debug, Serialize)]
struct ErrorBody {
    status: &'static str,
    #[serde(flatten)]
    error: ErrorDetail,
}

impl From<&ToolError> for ErrorBody {
    fn from(err: &ToolError) -> Self {
        Self {
            status: "error",
            error: ErrorDetail::from(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::{ErrorKind, ToolError};
    use crate::validate::ValidateError;
    use std::path::PathBuf;

    #[test]
    fn error_body_carries_kind_and_detail() {
        let err = ToolError::PathNotFound("/docs".into());
        let body: serde_json::Value = serde_json::from_str(&err.to_json()).unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["kind"], "PathNotFoundError");
        assert!(body["detail"].as_str().unwrap().contains("/docs"));
    }

    #[test]
    fn sandbox_violations_become_access_denied() {
        let err = ToolError::from(ValidateError::NotAllowed(PathBuf::from("/etc/passwd")));
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        let err = ToolError::from(ValidateError::NullByte);
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
