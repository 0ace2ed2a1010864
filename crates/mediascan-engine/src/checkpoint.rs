//! Durable storage of the scan checkpoint.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use mediascan_core::{CheckpointInfo, ScanCheckpoint, ScanError, ScanId, ScanResult};

/// Storage for the single checkpoint record.
#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    async fn load(&self) -> ScanResult<Option<ScanCheckpoint>>;

    /// Replace the stored record.
    async fn store(&self, checkpoint: &ScanCheckpoint) -> ScanResult<()>;
}

/// Checkpoint repository held in memory.
#[derive(Debug, Default)]
pub struct MemoryCheckpointRepository {
    slot: Mutex<Option<ScanCheckpoint>>,
}

impl MemoryCheckpointRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointRepository for MemoryCheckpointRepository {
    async fn load(&self) -> ScanResult<Option<ScanCheckpoint>> {
        Ok(self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn store(&self, checkpoint: &ScanCheckpoint) -> ScanResult<()> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(checkpoint.clone());
        Ok(())
    }
}

/// Checkpoint repository backed by a JSON file, replaced atomically.
#[derive(Debug, Clone)]
pub struct JsonCheckpointRepository {
    path: PathBuf,
}

impl JsonCheckpointRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointRepository for JsonCheckpointRepository {
    async fn load(&self) -> ScanResult<Option<ScanCheckpoint>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ScanError::io(&self.path, e)),
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            ScanError::persistence(format!("corrupt checkpoint {}: {e}", self.path.display()))
        })
    }

    async fn store(&self, checkpoint: &ScanCheckpoint) -> ScanResult<()> {
        let bytes = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| ScanError::persistence(e.to_string()))?;
        write_atomic(&self.path, &bytes).await
    }
}

/// Write `bytes` to a sibling temp file and rename it over `path`.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> ScanResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ScanError::io(parent, e))?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| ScanError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| ScanError::io(path, e))
}

/// Validity rules and sealing on top of a [`CheckpointRepository`].
pub struct CheckpointStore {
    repository: Box<dyn CheckpointRepository>,
    validity: ChronoDuration,
    /// Scans whose checkpoint may no longer be written.
    sealed: Mutex<HashSet<ScanId>>,
    /// Serializes read-modify-write sequences.
    op: tokio::sync::Mutex<()>,
}

impl CheckpointStore {
    pub fn new(repository: Box<dyn CheckpointRepository>, validity: std::time::Duration) -> Self {
        Self {
            repository,
            validity: ChronoDuration::from_std(validity).unwrap_or(ChronoDuration::hours(24)),
            sealed: Mutex::new(HashSet::new()),
            op: tokio::sync::Mutex::new(()),
        }
    }

    fn is_sealed(&self, scan_id: &ScanId) -> bool {
        self.sealed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(scan_id)
    }

    /// Upsert the checkpoint, stamping it with the current time.
    ///
    /// Writes for a sealed scan are ignored.
    pub async fn save(&self, checkpoint: &mut ScanCheckpoint) -> ScanResult<()> {
        let _guard = self.op.lock().await;
        if self.is_sealed(&checkpoint.scan_id) {
            debug!(scan_id = %checkpoint.scan_id, "ignoring checkpoint for sealed scan");
            return Ok(());
        }
        checkpoint.last_checkpoint_at = Utc::now();
        checkpoint.is_valid = true;
        self.repository.store(checkpoint).await
    }

    /// The stored checkpoint if it can be resumed.
    ///
    /// An expired checkpoint is invalidated as a side effect.
    pub async fn get_valid_checkpoint(&self) -> ScanResult<Option<ScanCheckpoint>> {
        let _guard = self.op.lock().await;
        let Some(mut checkpoint) = self.repository.load().await? else {
            return Ok(None);
        };
        if !checkpoint.is_valid {
            return Ok(None);
        }
        if checkpoint.is_expired(Utc::now(), self.validity) {
            info!(scan_id = %checkpoint.scan_id, "checkpoint expired, invalidating");
            checkpoint.is_valid = false;
            self.repository.store(&checkpoint).await?;
            return Ok(None);
        }
        Ok(Some(checkpoint))
    }

    pub async fn can_resume(&self) -> ScanResult<bool> {
        Ok(self.get_valid_checkpoint().await?.is_some())
    }

    /// Mark the stored checkpoint invalid.
    ///
    /// With `scan_id` set, only a checkpoint of that scan is touched.
    pub async fn invalidate(&self, scan_id: Option<&ScanId>) -> ScanResult<()> {
        let _guard = self.op.lock().await;
        self.invalidate_locked(scan_id).await
    }

    async fn invalidate_locked(&self, scan_id: Option<&ScanId>) -> ScanResult<()> {
        let Some(mut checkpoint) = self.repository.load().await? else {
            return Ok(());
        };
        if !checkpoint.is_valid || scan_id.is_some_and(|id| *id != checkpoint.scan_id) {
            return Ok(());
        }
        checkpoint.is_valid = false;
        self.repository.store(&checkpoint).await
    }

    /// Invalidate the checkpoint of `scan_id` and refuse later saves for it.
    pub async fn seal(&self, scan_id: &ScanId) -> ScanResult<()> {
        let _guard = self.op.lock().await;
        self.sealed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scan_id.clone());
        self.invalidate_locked(Some(scan_id)).await
    }

    /// Record why `scan_id` failed, keeping its checkpoint resumable.
    pub async fn record_failure(&self, scan_id: &ScanId, message: &str) -> ScanResult<()> {
        let _guard = self.op.lock().await;
        let Some(mut checkpoint) = self.repository.load().await? else {
            return Ok(());
        };
        if checkpoint.scan_id != *scan_id {
            warn!(%scan_id, stored = %checkpoint.scan_id, "failure for a scan without checkpoint");
            return Ok(());
        }
        checkpoint.error_message = Some(message.to_string());
        self.repository.store(&checkpoint).await
    }

    /// Diagnostic summary of the stored checkpoint.
    pub async fn info(&self) -> ScanResult<CheckpointInfo> {
        let _guard = self.op.lock().await;
        let now = Utc::now();
        Ok(match self.repository.load().await? {
            Some(checkpoint) => {
                let mut info = checkpoint.info(now);
                info.is_valid = checkpoint.is_resumable(now, self.validity);
                info
            }
            None => CheckpointInfo::default(),
        })
    }
}
