use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum BerthError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("A {class} operation on '{target}' is already in flight")]
    Conflict { class: String, target: String },

    #[error("Required tool not available: {0}")]
    ToolMissing(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cannot reach the Docker daemon: {0}")]
    ConnectionFailed(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Resource in use: {0}")]
    InUse(String),

    #[error("Unsupported disk format '{0}' (expected qcow2, raw, vmdk or vhdx)")]
    InvalidFormat(String),

    #[error("I/O failure: {0}")]
    IoFailure(String),

    #[error("Operation failed: {0}")]
    Failed(String),

    #[error("{0}")]
    Unknown(String),

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(String),
}

/// Flat classification of [`BerthError`], stable across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    ToolMissing,
    NotFound,
    ConnectionFailed,
    Unauthorized,
    InUse,
    InvalidFormat,
    IoFailure,
    Failed,
    Unknown,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ToolMissing => "tool-missing",
            ErrorKind::NotFound => "not-found",
            ErrorKind::ConnectionFailed => "connection-failed",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::InUse => "in-use",
            ErrorKind::InvalidFormat => "invalid-format",
            ErrorKind::IoFailure => "io-failure",
            ErrorKind::Failed => "failed",
            ErrorKind::Unknown => "unknown",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

impl BerthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BerthError::Validation(_) | BerthError::Config(_) => ErrorKind::Validation,
            BerthError::Conflict { .. } => ErrorKind::Conflict,
            BerthError::ToolMissing(_) => ErrorKind::ToolMissing,
            BerthError::NotFound(_) => ErrorKind::NotFound,
            BerthError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            BerthError::Unauthorized(_) => ErrorKind::Unauthorized,
            BerthError::InUse(_) => ErrorKind::InUse,
            BerthError::InvalidFormat(_) => ErrorKind::InvalidFormat,
            BerthError::IoFailure(_) | BerthError::Io(_) => ErrorKind::IoFailure,
            BerthError::Failed(_) => ErrorKind::Failed,
            BerthError::Unknown(_)
            | BerthError::InvalidTransition { .. }
            | BerthError::Serde(_) => ErrorKind::Unknown,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        BerthError::Validation(msg.into())
    }
}

impl From<toml::de::Error> for BerthError {
    fn from(err: toml::de::Error) -> Self {
        BerthError::Serde(err.to_string())
    }
}

impl From<serde_json::Error> for BerthError {
    fn from(err: serde_json::Error) -> Self {
        BerthError::Serde(err.to_string())
    }
}

/// Terminal error payload stored on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Cancelled by request")
    }
}

impl From<&BerthError> for JobError {
    fn from(err: &BerthError) -> Self {
        JobError::new(err.kind(), err.to_string())
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_classify_as_io_failure() {
        let err: BerthError = std::io::Error::other("disk full").into();
        assert_eq!(err.kind(), ErrorKind::IoFailure);
    }

    #[test]
    fn job_error_keeps_message_verbatim() {
        let err = BerthError::Unknown("daemon said: no space left".into());
        let snapshot = JobError::from(&err);
        assert_eq!(snapshot.kind, ErrorKind::Unknown);
        assert_eq!(snapshot.message, "daemon said: no space left");
    }
}
