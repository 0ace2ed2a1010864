//! Scan lifecycle events as delivered to observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{ScanId, ScanPhase};
use crate::error::{ScanError, ScanResult};

/// A timestamped scan event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanProgressEvent {
    #[serde(flatten)]
    pub kind: ScanEvent,
    pub timestamp: DateTime<Utc>,
}

/// Event payload, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanEvent {
    Progress(ProgressPayload),
    Phase(ProgressPayload),
    Complete(ProgressPayload),
    Error(ErrorPayload),
    ControlPause(ControlPayload),
    ControlResume(ControlPayload),
    ControlCancel(ControlPayload),
    Connected(ConnectionPayload),
    Heartbeat(ConnectionPayload),
    ScanStats(StatsPayload),
}

/// Control command carried by a `control_*` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
}

/// Progress snapshot of a running scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub scan_id: ScanId,
    pub phase: ScanPhase,
    /// Overall completion, 0 to 100.
    pub progress: f64,
    pub processed_files: u64,
    pub total_files: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten, default)]
    pub metrics: ProgressMetrics,
}

/// Derived throughput and timing figures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMetrics {
    /// Files per second over the recent window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_speed: Option<f64>,
    /// Seconds left at the current speed. Absent while the speed is unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_start_time: Option<DateTime<Utc>>,
    /// Seconds since the scan started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_elapsed_time: Option<u64>,
    /// Seconds since the current phase started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase_elapsed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub scan_id: ScanId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ScanPhase>,
    pub error: String,
    pub processed_files: u64,
    pub total_files: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPayload {
    pub scan_id: ScanId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPayload {
    pub active_connections: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsPayload {
    pub scan_id: ScanId,
    pub skip_stats: SkipStats,
}

/// How a finished scan split the candidates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipStats {
    pub total_files: u64,
    pub new_files: u64,
    pub changed_files: u64,
    pub unchanged_files: u64,
    pub deleted_files: u64,
    pub unchanged_percentage: f64,
    /// Directories and entries the walker could not read.
    #[serde(default)]
    pub unreadable_entries: u64,
}

impl SkipStats {
    pub fn new(new_files: u64, changed_files: u64, unchanged_files: u64, deleted_files: u64) -> Self {
        let total_files = new_files + changed_files + unchanged_files;
        let unchanged_percentage = if total_files == 0 {
            0.0
        } else {
            (unchanged_files as f64 / total_files as f64 * 1000.0).round() / 10.0
        };
        Self {
            total_files,
            new_files,
            changed_files,
            unchanged_files,
            deleted_files,
            unchanged_percentage,
            unreadable_entries: 0,
        }
    }

    pub fn with_unreadable_entries(mut self, count: u64) -> Self {
        self.unreadable_entries = count;
        self
    }
}

impl ProgressPayload {
    /// Build a validated progress payload.
    ///
    /// `progress` must be a finite value in 0..=100 and `processed_files`
    /// may not exceed `total_files`.
    pub fn new(
        scan_id: ScanId,
        phase: ScanPhase,
        progress: f64,
        processed_files: u64,
        total_files: u64,
    ) -> ScanResult<Self> {
        if !progress.is_finite() || !(0.0..=100.0).contains(&progress) {
            return Err(ScanError::InvalidEvent {
                message: format!("progress out of range: {progress}"),
            });
        }
        if processed_files > total_files {
            return Err(ScanError::InvalidEvent {
                message: format!("processed files {processed_files} exceed total {total_files}"),
            });
        }
        Ok(Self {
            scan_id,
            phase,
            progress,
            processed_files,
            total_files,
            current_file: None,
            message: None,
            metrics: ProgressMetrics::default(),
        })
    }

    pub fn with_current_file(mut self, file: impl Into<String>) -> Self {
        self.current_file = Some(file.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_metrics(mut self, metrics: ProgressMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}

impl ScanProgressEvent {
    fn now(kind: ScanEvent) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn progress(payload: ProgressPayload) -> Self {
        Self::now(ScanEvent::Progress(payload))
    }

    pub fn phase(payload: ProgressPayload) -> Self {
        Self::now(ScanEvent::Phase(payload))
    }

    pub fn complete(payload: ProgressPayload) -> Self {
        Self::now(ScanEvent::Complete(payload))
    }

    pub fn error(
        scan_id: ScanId,
        phase: Option<ScanPhase>,
        error: impl Into<String>,
        processed_files: u64,
        total_files: u64,
    ) -> Self {
        Self::now(ScanEvent::Error(ErrorPayload {
            scan_id,
            phase,
            error: error.into(),
            processed_files,
            total_files,
        }))
    }

    pub fn control(action: ControlAction, scan_id: ScanId, message: Option<String>) -> Self {
        let payload = ControlPayload { scan_id, message };
        Self::now(match action {
            ControlAction::Pause => ScanEvent::ControlPause(payload),
            ControlAction::Resume => ScanEvent::ControlResume(payload),
            ControlAction::Cancel => ScanEvent::ControlCancel(payload),
        })
    }

    pub fn connected(active_connections: usize) -> Self {
        Self::now(ScanEvent::Connected(ConnectionPayload {
            active_connections,
            message: Some("Connected to scan progress stream".to_string()),
        }))
    }

    pub fn heartbeat(active_connections: usize) -> Self {
        Self::now(ScanEvent::Heartbeat(ConnectionPayload {
            active_connections,
            message: None,
        }))
    }

    pub fn scan_stats(scan_id: ScanId, skip_stats: SkipStats) -> Self {
        Self::now(ScanEvent::ScanStats(StatsPayload {
            scan_id,
            skip_stats,
        }))
    }

    /// Wire name of the event type.
    pub fn event_type(&self) -> &'static str {
        match &self.kind {
            ScanEvent::Progress(_) => "progress",
            ScanEvent::Phase(_) => "phase",
            ScanEvent::Complete(_) => "complete",
            ScanEvent::Error(_) => "error",
            ScanEvent::ControlPause(_) => "control_pause",
            ScanEvent::ControlResume(_) => "control_resume",
            ScanEvent::ControlCancel(_) => "control_cancel",
            ScanEvent::Connected(_) => "connected",
            ScanEvent::Heartbeat(_) => "heartbeat",
            ScanEvent::ScanStats(_) => "scan_stats",
        }
    }

    /// Scan this event belongs to, if any.
    pub fn scan_id(&self) -> Option<&ScanId> {
        match &self.kind {
            ScanEvent::Progress(p) | ScanEvent::Phase(p) | ScanEvent::Complete(p) => {
                Some(&p.scan_id)
            }
            ScanEvent::Error(p) => Some(&p.scan_id),
            ScanEvent::ControlPause(p) | ScanEvent::ControlResume(p) | ScanEvent::ControlCancel(p) => {
                Some(&p.scan_id)
            }
            ScanEvent::ScanStats(p) => Some(&p.scan_id),
            ScanEvent::Connected(_) | ScanEvent::Heartbeat(_) => None,
        }
    }

    /// Progress payload of `progress`, `phase` and `complete` events.
    pub fn as_progress(&self) -> Option<&ProgressPayload> {
        match &self.kind {
            ScanEvent::Progress(p) | ScanEvent::Phase(p) | ScanEvent::Complete(p) => Some(p),
            _ => None,
        }
    }

    /// Whether the event describes the scan rather than the connection.
    pub fn is_scan_event(&self) -> bool {
        self.scan_id().is_some()
    }

    /// Whether the event ends a scan.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, ScanEvent::Complete(_) | ScanEvent::Error(_))
    }

    /// Serialize the event as a JSON line.
    pub fn to_json(&self) -> ScanResult<String> {
        serde_json::to_string(self).map_err(|e| ScanError::InvalidEvent {
            message: e.to_string(),
        })
    }
}
