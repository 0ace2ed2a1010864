//! Pure planning of index writes from extraction results.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use mediascan_core::{FileStamp, MediaRecord, SkipStats};
use mediascan_scan::{Extraction, RootSet};

/// How a discovered file relates to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    New,
    Changed,
    Unchanged,
}

/// Compare a file on disk against its indexed stamp.
pub fn classify(stamp: &FileStamp, indexed: Option<&FileStamp>) -> FileChange {
    match indexed {
        None => FileChange::New,
        Some(indexed) if indexed.matches(stamp) => FileChange::Unchanged,
        Some(_) => FileChange::Changed,
    }
}

/// Index writes for one batch.
#[derive(Debug, Default)]
pub struct BatchPlan {
    pub upserts: Vec<MediaRecord>,
    pub inserted: u64,
    pub updated: u64,
    /// Files that could not be used at all; the index is left untouched for them.
    pub failed: u64,
}

/// Turn a batch of extractions into upserts.
///
/// Existing records keep their identity and user state.
pub fn plan_batch(
    extractions: IndexMap<PathBuf, Extraction>,
    mut existing: HashMap<PathBuf, MediaRecord>,
    now: DateTime<Utc>,
) -> BatchPlan {
    let mut plan = BatchPlan::default();
    for (path, extraction) in extractions {
        let Some(metadata) = extraction.into_metadata() else {
            plan.failed += 1;
            continue;
        };
        match existing.remove(&path) {
            Some(mut record) => {
                record.refresh(metadata, now);
                plan.updated += 1;
                plan.upserts.push(record);
            }
            None => {
                plan.inserted += 1;
                plan.upserts.push(MediaRecord::from_metadata(metadata, now));
            }
        }
    }
    plan
}

/// Compact set of paths seen during a walk.
#[derive(Debug, Default)]
pub struct SeenSet {
    hashes: HashSet<[u8; 32]>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(path: &Path) -> [u8; 32] {
        *blake3::hash(path.as_os_str().as_encoded_bytes()).as_bytes()
    }

    pub fn insert(&mut self, path: &Path) {
        self.hashes.insert(Self::key(path));
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.hashes.contains(&Self::key(path))
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// Indexed paths under the roots that the walk did not see.
pub fn plan_deletes<'a>(
    indexed: impl IntoIterator<Item = &'a PathBuf>,
    seen: &SeenSet,
    roots: &RootSet,
) -> Vec<PathBuf> {
    let mut deletes: Vec<PathBuf> = indexed
        .into_iter()
        .filter(|path| roots.contains(path) && !seen.contains(path))
        .cloned()
        .collect();
    deletes.sort();
    deletes
}

/// Running tally of how candidates were handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanTally {
    pub new_files: u64,
    pub changed_files: u64,
    pub unchanged_files: u64,
    pub deleted_files: u64,
    pub failed_files: u64,
    pub unreadable_entries: u64,
}

impl ScanTally {
    pub fn record(&mut self, change: FileChange) {
        match change {
            FileChange::New => self.new_files += 1,
            FileChange::Changed => self.changed_files += 1,
            FileChange::Unchanged => self.unchanged_files += 1,
        }
    }

    pub fn skip_stats(&self) -> SkipStats {
        SkipStats::new(
            self.new_files,
            self.changed_files,
            self.unchanged_files,
            self.deleted_files,
        )
        .with_unreadable_entries(self.unreadable_entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediascan_core::{ExtractionError, MediaMetadata};
    use std::time::{Duration, SystemTime};

    fn metadata(path: &str, size: u64) -> MediaMetadata {
        MediaMetadata {
            path: PathBuf::from(path),
            file_name: "x.mkv".to_string(),
            stamp: FileStamp::new(size, SystemTime::UNIX_EPOCH + Duration::from_secs(10)),
            duration: Some(1),
            thumbnail: None,
            chapters: Vec::new(),
            title: "x".to_string(),
            episode: None,
            season: None,
            year: None,
            genre: None,
        }
    }

    #[test]
    fn test_classify() {
        let stamp = FileStamp::new(10, SystemTime::UNIX_EPOCH);
        assert_eq!(classify(&stamp, None), FileChange::New);
        assert_eq!(classify(&stamp, Some(&stamp)), FileChange::Unchanged);
        let grown = FileStamp::new(11, SystemTime::UNIX_EPOCH);
        assert_eq!(classify(&stamp, Some(&grown)), FileChange::Changed);
    }

    #[test]
    fn test_plan_batch_preserves_existing_records() {
        let now = Utc::now();
        let mut old = MediaRecord::from_metadata(metadata("/v/a.mkv", 1), now);
        old.liked = true;
        let existing = HashMap::from([(PathBuf::from("/v/a.mkv"), old)]);

        let mut extractions = IndexMap::new();
        extractions.insert(
            PathBuf::from("/v/a.mkv"),
            Extraction::Complete(metadata("/v/a.mkv", 2)),
        );
        extractions.insert(
            PathBuf::from("/v/b.mkv"),
            Extraction::Partial {
                metadata: metadata("/v/b.mkv", 3),
                error: ExtractionError::Timeout(Duration::from_secs(1)),
            },
        );
        extractions.insert(
            PathBuf::from("/v/c.mkv"),
            Extraction::Failed(ExtractionError::Io("gone".to_string())),
        );

        let plan = plan_batch(extractions, existing, now);
        assert_eq!((plan.inserted, plan.updated, plan.failed), (1, 1, 1));
        assert_eq!(plan.upserts.len(), 2);
        assert!(plan.upserts[0].liked);
        assert_eq!(plan.upserts[0].size, 2);
        assert_eq!(plan.upserts[1].file_path, PathBuf::from("/v/b.mkv"));
    }

    #[test]
    fn test_plan_deletes_is_scoped_to_roots() {
        let roots = RootSet::new(&[PathBuf::from("/v")]);
        let mut seen = SeenSet::new();
        seen.insert(Path::new("/v/a.mkv"));

        let indexed = [
            PathBuf::from("/v/a.mkv"),
            PathBuf::from("/v/gone.mkv"),
            PathBuf::from("/elsewhere/b.mkv"),
        ];
        let deletes = plan_deletes(indexed.iter(), &seen, &roots);
        assert_eq!(deletes, vec![PathBuf::from("/v/gone.mkv")]);
    }

    #[test]
    fn test_tally_skip_stats() {
        let mut tally = ScanTally::default();
        tally.record(FileChange::New);
        tally.record(FileChange::Unchanged);
        tally.record(FileChange::Unchanged);
        tally.record(FileChange::Changed);
        tally.deleted_files = 2;
        tally.unreadable_entries = 1;

        let stats = tally.skip_stats();
        assert_eq!(stats.total_files, 4);
        assert_eq!(stats.unchanged_percentage, 50.0);
        assert_eq!(stats.deleted_files, 2);
        assert_eq!(stats.unreadable_entries, 1);
    }
}
