//! Error types for scan operations.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::ScanId;

/// Errors surfaced by the scan engine.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The engine is misconfigured (no roots, missing probe tool, ...).
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A scan is already running or paused.
    #[error("Scan already running: {scan_id}")]
    AlreadyRunning { scan_id: ScanId },

    /// A control command referenced an unknown or finished scan.
    #[error("Scan not found: {scan_id}")]
    NotFound { scan_id: ScanId },

    /// The scan was cancelled at a checkpoint gate.
    #[error("Scan cancelled: {scan_id}")]
    Cancelled { scan_id: ScanId },

    /// The persistence layer failed.
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// A persistence transaction exceeded its time budget.
    #[error("Persistence transaction timed out after {timeout:?}")]
    TransactionTimeout { timeout: Duration },

    /// A settings update was rejected.
    #[error("Invalid settings: {message}")]
    InvalidSettings { message: String },

    /// An event payload failed validation.
    #[error("Invalid event: {message}")]
    InvalidEvent { message: String },

    /// A path resolved outside every configured root.
    #[error("Path is outside the configured roots: {path}")]
    OutsideRoots { path: PathBuf },

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ScanError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Whether this error is a cooperative cancellation rather than a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Convenience alias used across the workspace.
pub type ScanResult<T> = Result<T, ScanError>;

/// Why a single file could not be fully probed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ExtractionError {
    /// The probe did not finish within its time budget.
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    /// The probe process exited unsuccessfully.
    #[error("probe failed: {0}")]
    ProbeFailed(String),

    /// The probe output could not be parsed.
    #[error("unreadable probe output: {0}")]
    Parse(String),

    /// The file could not be read.
    #[error("I/O error: {0}")]
    Io(String),

    /// The path was rejected by root sanitization.
    #[error("path is outside the configured roots")]
    OutsideRoots,
}

/// Kind of scan warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningKind {
    /// Permission was denied.
    PermissionDenied,
    /// Error reading a directory.
    ReadError,
    /// Error reading metadata.
    MetadataError,
    /// A configured root does not exist or is not a directory.
    MissingRoot,
}

/// Non-fatal warning encountered during a walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanWarning {
    /// Path where the warning occurred.
    pub path: PathBuf,
    /// Human-readable message.
    pub message: String,
    /// Kind of warning.
    pub kind: WarningKind,
}

impl ScanWarning {
    /// Create a new scan warning.
    pub fn new(path: impl Into<PathBuf>, message: impl Into<String>, kind: WarningKind) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            kind,
        }
    }

    /// Create a warning from an I/O error, classifying permission failures.
    pub fn from_io(path: impl Into<PathBuf>, error: &std::io::Error) -> Self {
        let path = path.into();
        let kind = match error.kind() {
            std::io::ErrorKind::PermissionDenied => WarningKind::PermissionDenied,
            _ => WarningKind::ReadError,
        };
        Self {
            message: format!("{error}"),
            path,
            kind,
        }
    }

    /// Create a missing root warning.
    pub fn missing_root(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            message: format!("Root is not a readable directory: {}", path.display()),
            path,
            kind: WarningKind::MissingRoot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_from_io_permission() {
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let warning = ScanWarning::from_io("/media/locked", &err);
        assert_eq!(warning.kind, WarningKind::PermissionDenied);
        assert!(warning.message.contains("denied"));
    }

    #[test]
    fn test_cancellation_is_not_a_fault() {
        let err = ScanError::Cancelled {
            scan_id: ScanId::from("scan-1"),
        };
        assert!(err.is_cancellation());
        assert!(!ScanError::persistence("db down").is_cancellation());
    }

    #[test]
    fn test_extraction_error_display() {
        let err = ExtractionError::Timeout(Duration::from_secs(30));
        assert!(err.to_string().contains("timed out"));
    }
}
