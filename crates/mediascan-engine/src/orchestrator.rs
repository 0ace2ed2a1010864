//! Sequencing of a scan through discovery, metadata and database phases.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use mediascan_core::{
    CheckpointInfo, LibraryConfig, ProgressPayload, ScanCheckpoint, ScanError, ScanId, ScanPhase,
    ScanProgressEvent, ScanResult, ScanSettings, ScanSettingsPatch, ScanType, ScanWarning,
    WarningKind,
};
use mediascan_scan::{
    DirectoryWalker, DiscoveredFile, MediaProbe, MetadataExtractor, RootSet, WalkItem, WalkStream,
};

use crate::bus::{ProgressBus, SubscriberId, Subscription};
use crate::checkpoint::{CheckpointRepository, CheckpointStore};
use crate::controller::{GateDecision, ScanController, ScanState};
use crate::index::{IndexSnapshot, MediaIndex};
use crate::metrics::ProgressTracker;
use crate::reconcile::{self, FileChange, ScanTally, SeenSet};
use crate::throttle::{BatchThrottle, ResourceProbe, SysinfoProbe};

/// Share of overall progress given to discovery.
const DISCOVERY_WEIGHT: f64 = 10.0;
/// Share of overall progress given to metadata extraction.
const METADATA_WEIGHT: f64 = 80.0;
/// Progress reached once metadata extraction is done.
const METADATA_END: f64 = DISCOVERY_WEIGHT + METADATA_WEIGHT;
/// Highest progress reported before the `complete` event.
const DATABASE_END: f64 = 99.0;
/// Walk items buffered between the walker thread and the scan task.
const WALK_BUFFER: usize = 256;

/// Creates the resource probe of each scan.
pub type ResourceProbeFactory = Arc<dyn Fn() -> Box<dyn ResourceProbe> + Send + Sync>;

/// Aggregated view for status queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanStatus {
    pub scan_id: Option<ScanId>,
    pub state: ScanState,
    pub is_scanning: bool,
    pub is_paused: bool,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<ScanProgressEvent>,
    pub subscriber_count: usize,
}

impl ScanStatus {
    /// Progress payload of the last event, if it carried one.
    pub fn progress(&self) -> Option<&ProgressPayload> {
        self.last_event.as_ref()?.as_progress()
    }
}

struct Shared {
    config: LibraryConfig,
    walker: DirectoryWalker,
    extractor: MetadataExtractor,
    index: Arc<dyn MediaIndex>,
    checkpoints: CheckpointStore,
    bus: Arc<ProgressBus>,
    controller: ScanController,
    settings: watch::Sender<ScanSettings>,
    resource_probe: ResourceProbeFactory,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Entry point of the scan engine.
///
/// Owns the single scan slot: at most one scan runs at a time, on its own
/// Tokio task. Cloning is cheap and every clone drives the same engine.
#[derive(Clone)]
pub struct ScanOrchestrator {
    shared: Arc<Shared>,
}

impl ScanOrchestrator {
    /// Create an engine that samples resources with `sysinfo`.
    pub fn new(
        config: LibraryConfig,
        settings: ScanSettings,
        probe: Arc<dyn MediaProbe>,
        checkpoints: Box<dyn CheckpointRepository>,
        index: Arc<dyn MediaIndex>,
    ) -> ScanResult<Self> {
        Self::with_resource_probe(
            config,
            settings,
            probe,
            checkpoints,
            index,
            Arc::new(|| Box::new(SysinfoProbe::new()) as Box<dyn ResourceProbe>),
        )
    }

    /// Create an engine with a custom resource probe per scan.
    pub fn with_resource_probe(
        config: LibraryConfig,
        settings: ScanSettings,
        probe: Arc<dyn MediaProbe>,
        checkpoints: Box<dyn CheckpointRepository>,
        index: Arc<dyn MediaIndex>,
        resource_probe: ResourceProbeFactory,
    ) -> ScanResult<Self> {
        settings.validate()?;
        let walker = DirectoryWalker::new(&config)?;
        let extractor = MetadataExtractor::new(
            probe,
            RootSet::new(&config.roots),
            config.probe_timeout,
        );
        let bus = Arc::new(ProgressBus::new(
            config.subscriber_capacity,
            config.heartbeat_interval,
        ));
        let controller = ScanController::new(Arc::clone(&bus));
        let checkpoints = CheckpointStore::new(checkpoints, config.checkpoint_validity);
        let (settings, _) = watch::channel(settings);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                walker,
                extractor,
                index,
                checkpoints,
                bus,
                controller,
                settings,
                resource_probe,
                task: Mutex::new(None),
            }),
        })
    }

    /// Start a new scan and return its id.
    ///
    /// Fails with [`ScanError::AlreadyRunning`] while another scan is
    /// running or paused, and with [`ScanError::Configuration`] when there
    /// is nothing to scan or the probe tool is missing.
    pub async fn start_scan(&self, scan_type: ScanType) -> ScanResult<ScanId> {
        let shared = &self.shared;
        shared.config.ensure_scannable()?;
        shared.extractor.probe().ensure_available().await?;

        let scan_id = ScanId::generate();
        shared.controller.begin(scan_id.clone())?;

        let mut checkpoint = ScanCheckpoint::new(scan_id.clone(), scan_type);
        if let Err(e) = shared.checkpoints.save(&mut checkpoint).await {
            shared.controller.finish(ScanState::Failed);
            return Err(e);
        }

        info!(%scan_id, %scan_type, roots = shared.config.roots.len(), "scan started");
        self.spawn(ScanRun::new(Arc::clone(shared), checkpoint, false));
        Ok(scan_id)
    }

    /// Resume the scan recorded in a valid checkpoint, if there is one.
    ///
    /// The resumed scan keeps its original id.
    pub async fn resume_if_checkpoint_valid(&self) -> ScanResult<Option<ScanId>> {
        let shared = &self.shared;
        let Some(checkpoint) = shared.checkpoints.get_valid_checkpoint().await? else {
            debug!("no resumable checkpoint");
            return Ok(None);
        };
        shared.config.ensure_scannable()?;
        shared.extractor.probe().ensure_available().await?;

        let scan_id = checkpoint.scan_id.clone();
        shared.controller.begin(scan_id.clone())?;
        info!(
            %scan_id,
            phase = %checkpoint.phase,
            processed = checkpoint.processed_files,
            total = checkpoint.total_files,
            "resuming scan from checkpoint"
        );
        self.spawn(ScanRun::new(Arc::clone(shared), checkpoint, true));
        Ok(Some(scan_id))
    }

    fn spawn(&self, run: ScanRun) {
        let handle = tokio::spawn(run.run());
        *self
            .shared
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Wait for the current scan task to end and return the final state.
    pub async fn wait(&self) -> ScanState {
        let handle = self
            .shared
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("scan task ended abnormally: {e}");
                if self.shared.controller.state().is_active() {
                    self.shared.controller.finish(ScanState::Failed);
                }
            }
        }
        self.shared.controller.state()
    }

    pub fn pause(&self, scan_id: &ScanId) -> ScanResult<()> {
        self.shared.controller.request_pause(scan_id)
    }

    pub fn resume(&self, scan_id: &ScanId) -> ScanResult<()> {
        self.shared.controller.request_resume(scan_id)
    }

    /// Cancel the scan. Its checkpoint is invalid once this returns.
    pub async fn cancel(&self, scan_id: &ScanId) -> ScanResult<()> {
        self.shared.controller.request_cancel(scan_id)?;
        self.shared.checkpoints.seal(scan_id).await
    }

    /// Current status, combining controller and bus state.
    pub fn get_status(&self) -> ScanStatus {
        let controller = self.shared.controller.snapshot();
        let bus = self.shared.bus.current_state();
        ScanStatus {
            scan_id: controller.scan_id,
            state: controller.state,
            is_scanning: controller.state.is_active(),
            is_paused: controller.state == ScanState::Paused,
            cancel_requested: controller.cancel_requested,
            last_event: bus.last_event.map(|event| (*event).clone()),
            subscriber_count: bus.subscriber_count,
        }
    }

    pub fn get_settings(&self) -> ScanSettings {
        self.shared.settings.borrow().clone()
    }

    /// Apply a partial settings update; a running scan picks it up at its
    /// next batch.
    pub fn update_settings(&self, patch: &ScanSettingsPatch) -> ScanResult<ScanSettings> {
        let next = self.get_settings().merged(patch)?;
        self.shared.settings.send_replace(next.clone());
        info!("scan settings updated");
        Ok(next)
    }

    pub fn reset_settings(&self) -> ScanSettings {
        let defaults = ScanSettings::default();
        self.shared.settings.send_replace(defaults.clone());
        info!("scan settings reset to defaults");
        defaults
    }

    /// Register an event subscriber and start heartbeats.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self) -> Subscription {
        self.shared.bus.start_heartbeat();
        self.shared.bus.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.shared.bus.unsubscribe(id);
    }

    pub fn bus(&self) -> &Arc<ProgressBus> {
        &self.shared.bus
    }

    pub async fn checkpoint_info(&self) -> ScanResult<CheckpointInfo> {
        self.shared.checkpoints.info().await
    }

    /// Invalidate the stored checkpoint. Refused while a scan is active.
    pub async fn clear_checkpoint(&self) -> ScanResult<()> {
        let snapshot = self.shared.controller.snapshot();
        if snapshot.state.is_active() {
            if let Some(scan_id) = snapshot.scan_id {
                return Err(ScanError::AlreadyRunning { scan_id });
            }
        }
        self.shared.checkpoints.invalidate(None).await
    }

    /// Stop heartbeats and disconnect subscribers.
    pub fn shutdown(&self) {
        self.shared.bus.shutdown();
    }
}

/// Source of metadata-phase candidates.
enum Candidates {
    /// Kept in memory from discovery.
    Listed(std::vec::IntoIter<DiscoveredFile>),
    /// Re-walked from the first root.
    Walking(WalkStream),
}

impl Candidates {
    async fn next(&mut self, issues: &mut WalkIssues) -> Option<DiscoveredFile> {
        match self {
            Self::Listed(files) => files.next(),
            Self::Walking(walk) => loop {
                match walk.next().await? {
                    WalkItem::File(file) => return Some(file),
                    WalkItem::Warning(warning) => issues.note(warning),
                    WalkItem::RootFinished { .. } => {}
                }
            },
        }
    }
}

/// Walker warnings seen by one scan, deduplicated across re-walks.
#[derive(Debug, Default)]
struct WalkIssues {
    /// Configured roots that could not be walked.
    missing_roots: HashSet<PathBuf>,
    /// Entries below the roots that could not be read.
    unreadable: HashSet<PathBuf>,
}

impl WalkIssues {
    fn note(&mut self, warning: ScanWarning) {
        if warning.kind == WarningKind::MissingRoot {
            self.missing_roots.insert(warning.path);
        } else {
            self.unreadable.insert(warning.path);
        }
    }
}

/// State of one scan task.
struct ScanRun {
    shared: Arc<Shared>,
    checkpoint: ScanCheckpoint,
    resumed: bool,
    settings: watch::Receiver<ScanSettings>,
    throttle: BatchThrottle,
    tracker: ProgressTracker,
    tally: ScanTally,
    seen: SeenSet,
    /// Whether `seen` holds every file currently under the roots.
    seen_complete: bool,
    candidates: Option<Vec<DiscoveredFile>>,
    issues: WalkIssues,
}

impl ScanRun {
    fn new(shared: Arc<Shared>, checkpoint: ScanCheckpoint, resumed: bool) -> Self {
        let settings = shared.settings.subscribe();
        let throttle = BatchThrottle::new((shared.resource_probe)(), &settings.borrow());
        Self {
            shared,
            checkpoint,
            resumed,
            settings,
            throttle,
            tracker: ProgressTracker::new(),
            tally: ScanTally::default(),
            seen: SeenSet::new(),
            seen_complete: false,
            candidates: None,
            issues: WalkIssues::default(),
        }
    }

    fn scan_id(&self) -> &ScanId {
        &self.checkpoint.scan_id
    }

    async fn run(mut self) {
        match self.execute().await {
            Ok(()) => {}
            Err(e) if e.is_cancellation() => self.on_cancelled().await,
            Err(e) => self.on_failed(e).await,
        }
    }

    async fn execute(&mut self) -> ScanResult<()> {
        if self.checkpoint.phase == ScanPhase::Discovery {
            self.discover().await?;
        }
        if self.checkpoint.phase == ScanPhase::Metadata {
            self.extract_metadata().await?;
        }
        self.reconcile_index().await?;
        self.complete().await
    }

    async fn on_cancelled(&mut self) {
        let scan_id = self.scan_id().clone();
        info!(%scan_id, phase = %self.checkpoint.phase, "scan cancelled");
        self.shared.bus.publish(ScanProgressEvent::error(
            scan_id.clone(),
            Some(self.checkpoint.phase),
            "Scan cancelled",
            self.checkpoint.processed_files,
            self.checkpoint.total_files,
        ));
        if let Err(e) = self.shared.checkpoints.seal(&scan_id).await {
            warn!(%scan_id, "failed to invalidate checkpoint of cancelled scan: {e}");
        }
        self.shared.controller.finish(ScanState::Cancelled);
    }

    async fn on_failed(&mut self, err: ScanError) {
        let scan_id = self.scan_id().clone();
        let message = err.to_string();
        error!(%scan_id, phase = %self.checkpoint.phase, "scan failed: {message}");
        self.shared.bus.publish(ScanProgressEvent::error(
            scan_id.clone(),
            Some(self.checkpoint.phase),
            message.clone(),
            self.checkpoint.processed_files,
            self.checkpoint.total_files,
        ));
        if let Err(e) = self.shared.checkpoints.record_failure(&scan_id, &message).await {
            warn!(%scan_id, "failed to record scan failure: {e}");
        }
        self.shared.controller.finish(ScanState::Failed);
    }

    fn cancelled(&self) -> ScanError {
        ScanError::Cancelled {
            scan_id: self.scan_id().clone(),
        }
    }

    /// Wait out a pause; fails with [`ScanError::Cancelled`] on cancel.
    async fn gate(&self) -> ScanResult<()> {
        match self.shared.controller.checkpoint_gate().await {
            GateDecision::Proceed => Ok(()),
            GateDecision::Cancelled => Err(self.cancelled()),
        }
    }

    fn publish(&self, event: ScanProgressEvent) -> ScanResult<()> {
        if self.shared.controller.publish_if_live(self.scan_id(), event) {
            Ok(())
        } else {
            Err(self.cancelled())
        }
    }

    fn payload(&self, progress: f64, processed: u64, total: u64) -> ScanResult<ProgressPayload> {
        let progress = ((progress * 10.0).round() / 10.0).clamp(0.0, 100.0);
        let payload = ProgressPayload::new(
            self.scan_id().clone(),
            self.tracker.phase(),
            progress,
            processed,
            total,
        )?;
        if self.settings.borrow().enable_performance_metrics {
            Ok(payload.with_metrics(self.tracker.metrics(total.saturating_sub(processed))))
        } else {
            Ok(payload)
        }
    }

    async fn save_checkpoint(&mut self) -> ScanResult<()> {
        self.shared.checkpoints.save(&mut self.checkpoint).await
    }

    async fn discover(&mut self) -> ScanResult<()> {
        self.tracker.enter_phase(ScanPhase::Discovery);
        let root_count = self.shared.walker.roots().len();
        let start_root = self.checkpoint.current_directory_index;
        let threshold = self.shared.config.stream_threshold;
        let mut discovered = self.checkpoint.total_files;
        // Files of roots finished by an earlier run are not in memory.
        let mut kept = (start_root == 0).then(Vec::new);

        let message = if self.resumed {
            "Resuming discovery"
        } else {
            "Discovering video files"
        };
        let payload = self
            .payload(discovery_progress(start_root, root_count), 0, discovered)?
            .with_message(message);
        self.publish(ScanProgressEvent::phase(payload))?;

        let mut walk = self.shared.walker.stream(start_root, WALK_BUFFER);
        while let Some(item) = walk.next().await {
            match item {
                WalkItem::File(file) => {
                    discovered += 1;
                    let interval = self.settings.borrow().progress_update_interval.max(1);
                    let current = (discovered % interval == 0).then(|| file.path.clone());

                    kept = match kept {
                        Some(mut files) if (files.len() as u64) < threshold => {
                            files.push(file);
                            Some(files)
                        }
                        Some(_) => {
                            debug!(threshold, "library exceeds stream threshold, re-walking for metadata");
                            None
                        }
                        None => None,
                    };

                    if let Some(current) = current {
                        self.gate().await?;
                        let progress = discovery_progress(self.checkpoint.current_directory_index, root_count);
                        let payload = self
                            .payload(progress, 0, discovered)?
                            .with_current_file(current.display().to_string());
                        self.publish(ScanProgressEvent::progress(payload))?;
                    }
                }
                WalkItem::RootFinished { root_index } => {
                    self.checkpoint.current_directory_index = root_index + 1;
                    self.checkpoint.total_files = discovered;
                    self.save_checkpoint().await?;
                }
                WalkItem::Warning(warning) => {
                    if warning.kind == WarningKind::MissingRoot {
                        warn!(root = %warning.path.display(), "library root unavailable");
                    }
                    self.issues.note(warning);
                }
            }
        }

        info!(scan_id = %self.scan_id(), files = discovered, "discovery finished");
        self.gate().await?;
        let payload = self
            .payload(DISCOVERY_WEIGHT, 0, discovered)?
            .with_message(format!("Discovered {discovered} video files"));
        self.publish(ScanProgressEvent::progress(payload))?;

        self.candidates = kept;
        self.checkpoint.phase = ScanPhase::Metadata;
        self.checkpoint.total_files = discovered;
        self.checkpoint.processed_files = 0;
        self.checkpoint.last_processed_path = None;
        self.save_checkpoint().await
    }

    async fn extract_metadata(&mut self) -> ScanResult<()> {
        self.tracker.enter_phase(ScanPhase::Metadata);
        let skip = self.checkpoint.processed_files;
        // Baseline so the first batch already has a measurable speed.
        self.tracker.record(skip);
        let mut processed = skip;
        let mut total = self.checkpoint.total_files.max(processed);
        let indexed = self.shared.index.snapshot().await?;

        let payload = self
            .payload(metadata_progress(processed, total), processed, total)?
            .with_message("Extracting metadata");
        self.publish(ScanProgressEvent::phase(payload))?;

        let mut source = match self.candidates.take() {
            Some(files) => Candidates::Listed(files.into_iter()),
            None => Candidates::Walking(self.shared.walker.stream(0, WALK_BUFFER)),
        };

        // Files handled by an earlier run only feed the seen set.
        let mut position = 0;
        while position < skip {
            let Some(file) = source.next(&mut self.issues).await else {
                warn!(skip, found = position, "fewer files than the checkpoint recorded");
                break;
            };
            self.seen.insert(&file.path);
            position += 1;
            if position == skip {
                if let Some(expected) = &self.checkpoint.last_processed_path {
                    if *expected != file.path {
                        warn!(
                            expected = %expected.display(),
                            found = %file.path.display(),
                            "library changed since the checkpoint, resuming by position"
                        );
                    }
                }
            }
        }

        loop {
            let settings = self.settings.borrow().clone();
            let batch_size = self.throttle.next_batch_size(&settings);
            let mut batch = Vec::with_capacity(batch_size);
            while batch.len() < batch_size {
                match source.next(&mut self.issues).await {
                    Some(file) => {
                        self.seen.insert(&file.path);
                        batch.push(file);
                    }
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }

            self.process_batch(&batch, &indexed, &settings).await?;

            processed += batch.len() as u64;
            total = total.max(processed);
            self.checkpoint.processed_files = processed;
            self.checkpoint.total_files = total;
            self.checkpoint.last_processed_path = batch.last().map(|file| file.path.clone());
            self.save_checkpoint().await?;

            self.tracker.record(processed);
            let mut payload = self.payload(metadata_progress(processed, total), processed, total)?;
            if let Some(last) = batch.last() {
                payload = payload.with_current_file(last.file_name.clone());
            }
            self.publish(ScanProgressEvent::progress(payload))?;

            if settings.sleep_interval_ms > 0 {
                tokio::time::sleep(Duration::from_millis(settings.sleep_interval_ms)).await;
            }
        }
        self.seen_complete = true;

        info!(
            scan_id = %self.scan_id(),
            processed,
            new = self.tally.new_files,
            changed = self.tally.changed_files,
            unchanged = self.tally.unchanged_files,
            failed = self.tally.failed_files,
            "metadata phase finished"
        );
        self.checkpoint.phase = ScanPhase::Database;
        self.checkpoint.metadata_completed = true;
        self.save_checkpoint().await
    }

    /// Extract, gate, then write one batch to the index.
    async fn process_batch(
        &mut self,
        batch: &[DiscoveredFile],
        indexed: &IndexSnapshot,
        settings: &ScanSettings,
    ) -> ScanResult<()> {
        let incremental = self.checkpoint.scan_type == ScanType::Incremental;
        let mut to_extract = Vec::with_capacity(batch.len());
        for file in batch {
            let change = reconcile::classify(&file.stamp, indexed.get(&file.path));
            self.tally.record(change);
            if !(incremental && change == FileChange::Unchanged) {
                to_extract.push(file.path.clone());
            }
        }

        let extractions = if to_extract.is_empty() {
            IndexMap::new()
        } else {
            self.shared
                .extractor
                .extract_batch(&to_extract, settings.max_concurrent_operations)
                .await
        };

        self.gate().await?;

        let existing = self.shared.index.lookup(&to_extract).await?;
        let plan = reconcile::plan_batch(extractions, existing, Utc::now());
        self.tally.failed_files += plan.failed;

        if settings.enable_detailed_logging {
            debug!(
                batch = batch.len(),
                probed = to_extract.len(),
                inserted = plan.inserted,
                updated = plan.updated,
                failed = plan.failed,
                "batch planned"
            );
        }
        if settings.show_resource_monitoring {
            debug!(batch_size = self.throttle.current(), "throttle state");
        }

        if !plan.upserts.is_empty() {
            within_transaction(
                self.shared.config.transaction_timeout,
                self.shared.index.apply(plan.upserts),
            )
            .await?;
        }
        Ok(())
    }

    async fn reconcile_index(&mut self) -> ScanResult<()> {
        self.tracker.enter_phase(ScanPhase::Database);
        let processed = self.checkpoint.processed_files;
        let total = self.checkpoint.total_files.max(processed);

        let payload = self
            .payload(METADATA_END, processed, total)?
            .with_message("Reconciling index");
        self.publish(ScanProgressEvent::phase(payload))?;

        if self.checkpoint.scan_type != ScanType::Full {
            return Ok(());
        }

        if !self.seen_complete {
            debug!("re-walking roots to rebuild the seen set");
            let mut walk = Candidates::Walking(self.shared.walker.stream(0, WALK_BUFFER));
            while let Some(file) = walk.next(&mut self.issues).await {
                self.seen.insert(&file.path);
            }
            self.seen_complete = true;
        }

        let walked_roots = self
            .shared
            .config
            .roots
            .iter()
            .filter(|root| !self.issues.missing_roots.contains(*root))
            .cloned()
            .collect_vec();
        if walked_roots.len() < self.shared.config.roots.len() {
            warn!(
                missing = self.issues.missing_roots.len(),
                "keeping index entries under unavailable roots"
            );
        }

        let indexed = self.shared.index.snapshot().await?;
        let deletes = reconcile::plan_deletes(indexed.keys(), &self.seen, &RootSet::new(&walked_roots));
        if deletes.is_empty() {
            return Ok(());
        }

        let chunk_size = self.settings.borrow().batch_size.max(1);
        let mut done = 0;
        for chunk in deletes.chunks(chunk_size) {
            self.gate().await?;
            let removed = within_transaction(
                self.shared.config.transaction_timeout,
                self.shared.index.delete(chunk),
            )
            .await?;
            self.tally.deleted_files += removed as u64;
            done += chunk.len();

            let progress =
                METADATA_END + (DATABASE_END - METADATA_END) * done as f64 / deletes.len() as f64;
            let payload = self
                .payload(progress, processed, total)?
                .with_message(format!("Removed {done} of {} missing files", deletes.len()));
            self.publish(ScanProgressEvent::progress(payload))?;
        }
        info!(scan_id = %self.scan_id(), deleted = self.tally.deleted_files, "removed missing files from the index");
        Ok(())
    }

    async fn complete(&mut self) -> ScanResult<()> {
        self.gate().await?;
        let scan_id = self.scan_id().clone();
        let processed = self.checkpoint.processed_files;
        let total = self.checkpoint.total_files.max(processed);

        self.tally.unreadable_entries = self.issues.unreadable.len() as u64;
        if self.tally.unreadable_entries > 0 {
            warn!(%scan_id, count = self.tally.unreadable_entries, "some library entries could not be read");
        }
        self.publish(ScanProgressEvent::scan_stats(
            scan_id.clone(),
            self.tally.skip_stats(),
        ))?;

        if let Err(e) = self.shared.checkpoints.invalidate(Some(&scan_id)).await {
            warn!(%scan_id, "failed to invalidate checkpoint of finished scan: {e}");
        }

        let payload = self
            .payload(100.0, processed, total)?
            .with_message("Scan completed");
        if !self
            .shared
            .controller
            .complete(&scan_id, ScanProgressEvent::complete(payload))
        {
            return Err(self.cancelled());
        }

        info!(
            %scan_id,
            processed,
            new = self.tally.new_files,
            changed = self.tally.changed_files,
            unchanged = self.tally.unchanged_files,
            deleted = self.tally.deleted_files,
            failed = self.tally.failed_files,
            "scan completed"
        );
        Ok(())
    }
}

/// Run an index write under the transaction time budget.
async fn within_transaction<T>(
    timeout: Duration,
    op: impl Future<Output = ScanResult<T>>,
) -> ScanResult<T> {
    tokio::time::timeout(timeout, op)
        .await
        .map_err(|_| ScanError::TransactionTimeout { timeout })?
}

fn discovery_progress(finished_roots: usize, root_count: usize) -> f64 {
    if root_count == 0 {
        return 0.0;
    }
    DISCOVERY_WEIGHT * finished_roots.min(root_count) as f64 / root_count as f64
}

fn metadata_progress(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return METADATA_END;
    }
    DISCOVERY_WEIGHT + METADATA_WEIGHT * processed as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_weights() {
        assert_eq!(discovery_progress(0, 2), 0.0);
        assert_eq!(discovery_progress(1, 2), 5.0);
        assert_eq!(discovery_progress(3, 2), DISCOVERY_WEIGHT);
        assert_eq!(discovery_progress(0, 0), 0.0);

        assert_eq!(metadata_progress(0, 100), DISCOVERY_WEIGHT);
        assert_eq!(metadata_progress(50, 100), 50.0);
        assert_eq!(metadata_progress(100, 100), METADATA_END);
        assert_eq!(metadata_progress(0, 0), METADATA_END);
    }

    #[tokio::test]
    async fn test_transaction_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ScanError>(())
        };
        let err = within_transaction(Duration::from_millis(10), slow)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::TransactionTimeout { .. }));
    }
}
