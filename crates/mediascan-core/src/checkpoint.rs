//! Scan identity, phases and the durable checkpoint record.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Opaque identifier of a single scan run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(String);

impl ScanId {
    /// Generate a fresh, unique scan id.
    pub fn generate() -> Self {
        Self(format!("scan_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScanId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ScanId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Kind of scan.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ScanType {
    /// Re-probe every file and drop index entries that disappeared.
    #[default]
    Full,
    /// Only probe new or changed files; never delete.
    Incremental,
}

/// Sequential stage of a scan.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ScanPhase {
    /// Walking the configured roots.
    #[default]
    Discovery,
    /// Probing files and writing them to the index.
    Metadata,
    /// Final reconciliation against the index.
    Database,
}

/// Durable record of an in-progress scan.
///
/// There is a single checkpoint per deployment; it is upserted after every
/// batch and invalidated when the scan completes or is cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanCheckpoint {
    pub scan_id: ScanId,
    pub scan_type: ScanType,
    pub phase: ScanPhase,
    /// Index of the root the walk had reached.
    pub current_directory_index: usize,
    pub processed_files: u64,
    pub total_files: u64,
    pub last_processed_path: Option<PathBuf>,
    pub metadata_completed: bool,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub is_valid: bool,
}

impl ScanCheckpoint {
    /// Create a fresh, valid checkpoint at the start of a scan.
    pub fn new(scan_id: ScanId, scan_type: ScanType) -> Self {
        let now = Utc::now();
        Self {
            scan_id,
            scan_type,
            phase: ScanPhase::Discovery,
            current_directory_index: 0,
            processed_files: 0,
            total_files: 0,
            last_processed_path: None,
            metadata_completed: false,
            started_at: now,
            last_checkpoint_at: now,
            error_message: None,
            is_valid: true,
        }
    }

    /// Whether the checkpoint is older than the validity window.
    pub fn is_expired(&self, now: DateTime<Utc>, validity: ChronoDuration) -> bool {
        self.last_checkpoint_at < now - validity
    }

    /// Whether a scan may resume from this checkpoint.
    pub fn is_resumable(&self, now: DateTime<Utc>, validity: ChronoDuration) -> bool {
        self.is_valid && !self.is_expired(now, validity)
    }

    /// Rounded completion percentage of the recorded phase.
    pub fn progress_percent(&self) -> u8 {
        if self.total_files == 0 {
            return 0;
        }
        let pct = (self.processed_files as f64 / self.total_files as f64 * 100.0).round();
        pct.clamp(0.0, 100.0) as u8
    }

    /// Summarize this checkpoint for diagnostics.
    pub fn info(&self, now: DateTime<Utc>) -> CheckpointInfo {
        CheckpointInfo {
            exists: true,
            is_valid: self.is_valid,
            age_minutes: (now - self.last_checkpoint_at).num_minutes().max(0),
            phase: Some(self.phase),
            progress: Some(self.progress_percent()),
        }
    }
}

/// Diagnostic view of the stored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointInfo {
    pub exists: bool,
    pub is_valid: bool,
    pub age_minutes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<ScanPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_window() {
        let mut checkpoint = ScanCheckpoint::new(ScanId::from("scan-a"), ScanType::Full);
        let now = Utc::now();
        checkpoint.last_checkpoint_at = now - ChronoDuration::hours(25);

        assert!(checkpoint.is_expired(now, ChronoDuration::hours(24)));
        assert!(!checkpoint.is_resumable(now, ChronoDuration::hours(24)));
        assert!(checkpoint.is_resumable(now, ChronoDuration::hours(48)));
    }

    #[test]
    fn test_progress_percent() {
        let mut checkpoint = ScanCheckpoint::new(ScanId::from("scan-b"), ScanType::Incremental);
        assert_eq!(checkpoint.progress_percent(), 0);

        checkpoint.processed_files = 40;
        checkpoint.total_files = 100;
        assert_eq!(checkpoint.progress_percent(), 40);
    }

    #[test]
    fn test_wire_names() {
        let checkpoint = ScanCheckpoint::new(ScanId::from("scan-c"), ScanType::Full);
        let json = serde_json::to_value(&checkpoint).unwrap();

        assert_eq!(json["scanId"], "scan-c");
        assert_eq!(json["scanType"], "full");
        assert_eq!(json["phase"], "discovery");
        assert_eq!(json["isValid"], true);
        assert!(json["lastProcessedPath"].is_null());
    }

    #[test]
    fn test_phase_from_str() {
        assert_eq!("metadata".parse::<ScanPhase>().unwrap(), ScanPhase::Metadata);
        assert_eq!(ScanType::Incremental.to_string(), "incremental");
        assert!(ScanPhase::Discovery < ScanPhase::Database);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(ScanId::generate(), ScanId::generate());
    }
}
