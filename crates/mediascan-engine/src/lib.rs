//! Resumable scan orchestration for mediascan.
//!
//! # Overview
//!
//! `mediascan-engine` drives a library scan through three phases and keeps
//! observers informed:
//!
//! - **Discovery** walks the roots and counts candidate files
//! - **Metadata** probes files in throttled batches and writes them to the
//!   [`MediaIndex`], checkpointing after every batch
//! - **Database** removes index entries whose files are gone (full scans)
//!
//! Pause, resume and cancel take effect at batch boundaries. Progress is
//! fanned out to subscribers through the [`ProgressBus`], and a scan
//! interrupted by a crash resumes from its [`ScanCheckpoint`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use mediascan_engine::{
//!     FfprobeProbe, LibraryConfig, MemoryCheckpointRepository, MemoryIndex, ScanOrchestrator,
//!     ScanSettings, ScanType,
//! };
//!
//! # async fn run() -> mediascan_engine::ScanResult<()> {
//! let config = LibraryConfig::new(["/srv/videos"]);
//! let engine = ScanOrchestrator::new(
//!     config.clone(),
//!     ScanSettings::default(),
//!     Arc::new(FfprobeProbe::new(&config)),
//!     Box::new(MemoryCheckpointRepository::new()),
//!     Arc::new(MemoryIndex::new()),
//! )?;
//!
//! let mut events = engine.subscribe();
//! let scan_id = engine.start_scan(ScanType::Full).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{}", event.to_json()?);
//!     if event.is_terminal() {
//!         break;
//!     }
//! }
//! # let _ = scan_id;
//! # Ok(())
//! # }
//! ```

mod bus;
mod checkpoint;
mod controller;
mod index;
mod metrics;
mod orchestrator;
mod reconcile;
mod throttle;

pub use bus::{BusState, ProgressBus, SubscriberId, Subscription, is_heartbeat};
pub use checkpoint::{
    CheckpointRepository, CheckpointStore, JsonCheckpointRepository, MemoryCheckpointRepository,
};
pub use controller::{ControllerSnapshot, GateDecision, ScanController, ScanState};
pub use index::{IndexSnapshot, JsonFileIndex, MediaIndex, MemoryIndex};
pub use metrics::{ProgressTracker, SPEED_WINDOW};
pub use orchestrator::{ResourceProbeFactory, ScanOrchestrator, ScanStatus};
pub use reconcile::{
    BatchPlan, FileChange, ScanTally, SeenSet, classify, plan_batch, plan_deletes,
};
pub use throttle::{
    BatchThrottle, MAX_BATCH_SIZE, MIN_REDUCED_BATCH_SIZE, Pressure, ResourceProbe,
    ResourceSample, SysinfoProbe,
};

// Re-export the types callers need to drive the engine
pub use mediascan_core::{
    CheckpointInfo, LibraryConfig, MediaRecord, ProgressPayload, ScanCheckpoint, ScanError,
    ScanEvent, ScanId, ScanPhase, ScanProgressEvent, ScanResult, ScanSettings,
    ScanSettingsPatch, ScanType, SkipStats,
};
pub use mediascan_scan::{FfprobeProbe, MediaProbe, ProbeData};
