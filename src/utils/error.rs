//! Error types and handling
//!
//! Common error types used across the session coordinator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Session-wide error type
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Operation in progress: {0}")]
    OperationInProgress(String),

    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    #[error("Configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Session queue is closed")]
    QueueClosed,

    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Discriminant of [`SessionError`], cheap to copy and serialize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    PermissionDenied,
    DeviceUnavailable,
    OperationInProgress,
    CaptureFailed,
    ConfigurationFailed,
    Io,
    Serialization,
    Config,
    QueueClosed,
    Runtime,
}

impl ErrorKind {
    /// Stable error code for observers
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::DeviceUnavailable => "DEVICE_UNAVAILABLE",
            ErrorKind::OperationInProgress => "OPERATION_IN_PROGRESS",
            ErrorKind::CaptureFailed => "CAPTURE_FAILED",
            ErrorKind::ConfigurationFailed => "CONFIGURATION_FAILED",
            ErrorKind::Io => "IO_ERROR",
            ErrorKind::Serialization => "SERIALIZATION_ERROR",
            ErrorKind::Config => "CONFIG_ERROR",
            ErrorKind::QueueClosed => "QUEUE_CLOSED",
            ErrorKind::Runtime => "RUNTIME_ERROR",
        }
    }
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            SessionError::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            SessionError::OperationInProgress(_) => ErrorKind::OperationInProgress,
            SessionError::CaptureFailed(_) => ErrorKind::CaptureFailed,
            SessionError::ConfigurationFailed(_) => ErrorKind::ConfigurationFailed,
            SessionError::Io(_) => ErrorKind::Io,
            SessionError::Serialization(_) => ErrorKind::Serialization,
            SessionError::Config(_) => ErrorKind::Config,
            SessionError::QueueClosed => ErrorKind::QueueClosed,
            SessionError::Runtime(_) => ErrorKind::Runtime,
        }
    }

    /// Human readable cause, without the variant prefix for capture failures
    pub fn reason(&self) -> String {
        match self {
            SessionError::CaptureFailed(reason) => reason.clone(),
            other => other.to_string(),
        }
    }

    /// Re-tag any error raised while talking to capture hardware as a capture failure
    pub fn into_capture_failure(self) -> SessionError {
        match self {
            SessionError::CaptureFailed(reason) => SessionError::CaptureFailed(reason),
            other => SessionError::CaptureFailed(other.to_string()),
        }
    }
}

/// Non-fatal error notification handed to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub code: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SessionError> for ErrorReport {
    fn from(error: &SessionError) -> Self {
        let kind = error.kind();
        ErrorReport {
            code: kind.code().to_string(),
            kind,
            message: error.to_string(),
        }
    }
}

impl From<SessionError> for ErrorReport {
    fn from(error: SessionError) -> Self {
        ErrorReport::from(&error)
    }
}

/// Result type alias using SessionError
pub type SessionResult<T> = Result<T, SessionError>;
