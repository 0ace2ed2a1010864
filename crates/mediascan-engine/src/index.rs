//! The persistent media index the scan reconciles against.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use mediascan_core::{FileStamp, MediaRecord, ScanError, ScanResult};

use crate::checkpoint::write_atomic;

/// Change-detection view of the index: path to size and mtime.
pub type IndexSnapshot = HashMap<PathBuf, FileStamp>;

/// Keyed store of media records.
#[async_trait]
pub trait MediaIndex: Send + Sync {
    /// Stamps of every indexed record.
    async fn snapshot(&self) -> ScanResult<IndexSnapshot>;

    /// Records for the given paths; unknown paths are left out.
    async fn lookup(&self, paths: &[PathBuf]) -> ScanResult<HashMap<PathBuf, MediaRecord>>;

    /// Upsert every record, or none of them.
    async fn apply(&self, records: Vec<MediaRecord>) -> ScanResult<()>;

    /// Delete records by path, returning how many existed.
    async fn delete(&self, paths: &[PathBuf]) -> ScanResult<usize>;

    /// Number of indexed records.
    async fn len(&self) -> ScanResult<usize>;
}

/// Index held in memory.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    records: Mutex<BTreeMap<PathBuf, MediaRecord>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of a single record.
    pub fn get(&self, path: &Path) -> Option<MediaRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    /// Copy of every record, ordered by path.
    pub fn records(&self) -> Vec<MediaRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

fn snapshot_of(records: &BTreeMap<PathBuf, MediaRecord>) -> IndexSnapshot {
    records
        .iter()
        .map(|(path, record)| (path.clone(), record.stamp()))
        .collect()
}

fn lookup_in(
    records: &BTreeMap<PathBuf, MediaRecord>,
    paths: &[PathBuf],
) -> HashMap<PathBuf, MediaRecord> {
    paths
        .iter()
        .filter_map(|path| records.get(path).map(|r| (path.clone(), r.clone())))
        .collect()
}

#[async_trait]
impl MediaIndex for MemoryIndex {
    async fn snapshot(&self) -> ScanResult<IndexSnapshot> {
        Ok(snapshot_of(
            &self.records.lock().unwrap_or_else(PoisonError::into_inner),
        ))
    }

    async fn lookup(&self, paths: &[PathBuf]) -> ScanResult<HashMap<PathBuf, MediaRecord>> {
        Ok(lookup_in(
            &self.records.lock().unwrap_or_else(PoisonError::into_inner),
            paths,
        ))
    }

    async fn apply(&self, records: Vec<MediaRecord>) -> ScanResult<()> {
        let mut guard = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        for record in records {
            guard.insert(record.file_path.clone(), record);
        }
        Ok(())
    }

    async fn delete(&self, paths: &[PathBuf]) -> ScanResult<usize> {
        let mut guard = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(paths.iter().filter(|p| guard.remove(*p).is_some()).count())
    }

    async fn len(&self) -> ScanResult<usize> {
        Ok(self.records.lock().unwrap_or_else(PoisonError::into_inner).len())
    }
}

/// Index persisted as one JSON document.
///
/// Every write produces a complete new document that atomically replaces the
/// previous one, so a failed write leaves the old index intact.
#[derive(Debug)]
pub struct JsonFileIndex {
    path: PathBuf,
    records: AsyncMutex<BTreeMap<PathBuf, MediaRecord>>,
}

impl JsonFileIndex {
    /// Open the index at `path`, starting empty when the file is absent.
    pub async fn open(path: impl Into<PathBuf>) -> ScanResult<Self> {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let list: Vec<MediaRecord> = serde_json::from_slice(&bytes).map_err(|e| {
                    ScanError::persistence(format!("corrupt index {}: {e}", path.display()))
                })?;
                list.into_iter()
                    .map(|record| (record.file_path.clone(), record))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(ScanError::io(&path, e)),
        };
        Ok(Self {
            path,
            records: AsyncMutex::new(records),
        })
    }

    async fn persist(&self, records: &BTreeMap<PathBuf, MediaRecord>) -> ScanResult<()> {
        let list: Vec<&MediaRecord> = records.values().collect();
        let bytes =
            serde_json::to_vec(&list).map_err(|e| ScanError::persistence(e.to_string()))?;
        write_atomic(&self.path, &bytes).await
    }
}

#[async_trait]
impl MediaIndex for JsonFileIndex {
    async fn snapshot(&self) -> ScanResult<IndexSnapshot> {
        Ok(snapshot_of(&*self.records.lock().await))
    }

    async fn lookup(&self, paths: &[PathBuf]) -> ScanResult<HashMap<PathBuf, MediaRecord>> {
        Ok(lookup_in(&*self.records.lock().await, paths))
    }

    async fn apply(&self, records: Vec<MediaRecord>) -> ScanResult<()> {
        let mut guard = self.records.lock().await;
        let mut next = guard.clone();
        for record in records {
            next.insert(record.file_path.clone(), record);
        }
        self.persist(&next).await?;
        *guard = next;
        Ok(())
    }

    async fn delete(&self, paths: &[PathBuf]) -> ScanResult<usize> {
        let mut guard = self.records.lock().await;
        let mut next = guard.clone();
        let removed = paths.iter().filter(|p| next.remove(*p).is_some()).count();
        if removed > 0 {
            self.persist(&next).await?;
            *guard = next;
        }
        Ok(removed)
    }

    async fn len(&self) -> ScanResult<usize> {
        Ok(self.records.lock().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mediascan_core::{MediaMetadata, video_id};
    use std::time::SystemTime;

    fn record(path: &str, size: u64) -> MediaRecord {
        MediaRecord::from_metadata(
            MediaMetadata {
                path: PathBuf::from(path),
                file_name: path.rsplit('/').next().unwrap_or(path).to_string(),
                stamp: FileStamp::new(size, SystemTime::UNIX_EPOCH),
                duration: None,
                thumbnail: None,
                chapters: Vec::new(),
                title: "t".to_string(),
                episode: None,
                season: None,
                year: None,
                genre: None,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_memory_index_upsert_and_delete() {
        let index = MemoryIndex::new();
        index
            .apply(vec![record("/v/a.mkv", 1), record("/v/b.mkv", 2)])
            .await
            .unwrap();
        index.apply(vec![record("/v/a.mkv", 3)]).await.unwrap();

        let snapshot = index.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[Path::new("/v/a.mkv")].size, 3);

        let removed = index
            .delete(&[PathBuf::from("/v/b.mkv"), PathBuf::from("/v/missing.mkv")])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(index.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_json_index_persists_across_open() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("index.json");

        let index = JsonFileIndex::open(&path).await.unwrap();
        index.apply(vec![record("/v/a.mkv", 1)]).await.unwrap();
        drop(index);

        let reopened = JsonFileIndex::open(&path).await.unwrap();
        let found = reopened
            .lookup(&[PathBuf::from("/v/a.mkv"), PathBuf::from("/v/b.mkv")])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(
            found[Path::new("/v/a.mkv")].video_id,
            video_id(Path::new("/v/a.mkv"))
        );
    }

    #[tokio::test]
    async fn test_json_index_rejects_corrupt_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, "[{").unwrap();
        assert!(matches!(
            JsonFileIndex::open(&path).await,
            Err(ScanError::Persistence { .. })
        ));
    }
}
