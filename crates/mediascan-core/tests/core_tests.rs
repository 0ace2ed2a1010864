use chrono::{Duration as ChronoDuration, Utc};
use mediascan_core::{
    LibraryConfig, ProgressPayload, ScanCheckpoint, ScanError, ScanId, ScanPhase,
    ScanProgressEvent, ScanSettings, ScanSettingsPatch, ScanType,
};
use std::path::PathBuf;

#[test]
fn test_checkpoint_serialization_keeps_resume_fields() {
    let mut checkpoint = ScanCheckpoint::new(ScanId::from("scan-42"), ScanType::Incremental);
    checkpoint.phase = ScanPhase::Metadata;
    checkpoint.processed_files = 40;
    checkpoint.total_files = 100;
    checkpoint.current_directory_index = 2;
    checkpoint.last_processed_path = Some(PathBuf::from("/srv/videos/b/ep02.mkv"));

    let json = serde_json::to_string(&checkpoint).unwrap();
    let restored: ScanCheckpoint = serde_json::from_str(&json).unwrap();

    assert_eq!(restored, checkpoint);
    assert_eq!(restored.info(Utc::now()).progress, Some(40));
}

#[test]
fn test_stale_checkpoint_is_not_resumable() {
    let mut checkpoint = ScanCheckpoint::new(ScanId::generate(), ScanType::Full);
    let now = Utc::now();
    checkpoint.last_checkpoint_at = now - ChronoDuration::hours(25);
    assert!(!checkpoint.is_resumable(now, ChronoDuration::hours(24)));

    checkpoint.last_checkpoint_at = now - ChronoDuration::hours(23);
    assert!(checkpoint.is_resumable(now, ChronoDuration::hours(24)));

    checkpoint.is_valid = false;
    assert!(!checkpoint.is_resumable(now, ChronoDuration::hours(24)));
}

#[test]
fn test_settings_patch_from_json() {
    let patch: ScanSettingsPatch =
        serde_json::from_str(r#"{"batchSize": 2, "maxConcurrentOperations": 3}"#).unwrap();
    let settings = ScanSettings::default().merged(&patch).unwrap();

    assert_eq!(settings.batch_size, 2);
    assert_eq!(settings.max_concurrent_operations, 3);
    assert_eq!(settings.sleep_interval_ms, ScanSettings::default().sleep_interval_ms);
}

#[test]
fn test_settings_patch_rejects_invalid_values() {
    let patch: ScanSettingsPatch =
        serde_json::from_str(r#"{"progressUpdateInterval": 5}"#).unwrap();
    let err = ScanSettings::default().merged(&patch).unwrap_err();
    assert!(matches!(err, ScanError::InvalidSettings { .. }));
    assert!(err.to_string().contains("progressUpdateInterval"));
}

#[test]
fn test_progress_event_rejects_partial_values() {
    let scan_id = ScanId::from("scan-7");
    let err = ProgressPayload::new(scan_id.clone(), ScanPhase::Discovery, 150.0, 0, 0).unwrap_err();
    assert!(matches!(err, ScanError::InvalidEvent { .. }));

    let payload = ProgressPayload::new(scan_id, ScanPhase::Database, 100.0, 3, 3).unwrap();
    let event = ScanProgressEvent::complete(payload);
    assert!(event.is_terminal());
    assert_eq!(event.as_progress().map(|p| p.total_files), Some(3));
}

#[test]
fn test_library_config_defaults() {
    let config = LibraryConfig::new(["/srv/videos", "/mnt/archive"]);
    assert_eq!(config.roots.len(), 2);
    assert_eq!(config.stream_threshold, 1000);
    assert!(!config.include_hidden);
    assert!(config.thumbnail_dir.is_none());
    assert!(config.is_video_file("Show.S01E02.WEBM"));
}
