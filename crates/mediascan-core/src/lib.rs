//! Core types for mediascan.
//!
//! This crate provides the data model shared by the scan engine: scan
//! checkpoints, progress events, runtime settings, media index records and
//! the library configuration.

mod checkpoint;
mod config;
mod error;
mod event;
mod media;
mod settings;

pub use checkpoint::{CheckpointInfo, ScanCheckpoint, ScanId, ScanPhase, ScanType};
pub use config::{
    DEFAULT_VIDEO_EXTENSIONS, LibraryConfig, LibraryConfigBuilder, VIDEO_DIRECTORY_ENV,
    parse_root_list,
};
pub use error::{ExtractionError, ScanError, ScanResult, ScanWarning, WarningKind};
pub use event::{
    ConnectionPayload, ControlAction, ControlPayload, ErrorPayload, ProgressMetrics,
    ProgressPayload, ScanEvent, ScanProgressEvent, SkipStats, StatsPayload,
};
pub use media::{Chapter, FileStamp, MediaMetadata, MediaRecord, video_id};
pub use settings::{
    AutoPauseTimeRange, ProcessingPriority, ScanSettings, ScanSettingsBuilder, ScanSettingsPatch,
};
