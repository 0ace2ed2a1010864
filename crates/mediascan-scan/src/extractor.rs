//! Bounded-concurrency metadata extraction.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use tracing::warn;

use mediascan_core::{ExtractionError, FileStamp, MediaMetadata, ScanError};

use crate::naming::parse_file_name;
use crate::probe::MediaProbe;
use crate::roots::RootSet;

/// Outcome of extracting one file.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// Stat and probe both succeeded.
    Complete(MediaMetadata),
    /// The file is usable but the probe failed; metadata has no probe fields.
    Partial {
        metadata: MediaMetadata,
        error: ExtractionError,
    },
    /// The file could not be used at all.
    Failed(ExtractionError),
}

impl Extraction {
    /// Metadata to index, if the file is usable.
    pub fn metadata(&self) -> Option<&MediaMetadata> {
        match self {
            Self::Complete(metadata) | Self::Partial { metadata, .. } => Some(metadata),
            Self::Failed(_) => None,
        }
    }

    pub fn into_metadata(self) -> Option<MediaMetadata> {
        match self {
            Self::Complete(metadata) | Self::Partial { metadata, .. } => Some(metadata),
            Self::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ExtractionError> {
        match self {
            Self::Complete(_) => None,
            Self::Partial { error, .. } | Self::Failed(error) => Some(error),
        }
    }
}

/// Probes files in batches, never failing the batch as a whole.
#[derive(Clone)]
pub struct MetadataExtractor {
    probe: Arc<dyn MediaProbe>,
    roots: RootSet,
    timeout: Duration,
}

impl MetadataExtractor {
    pub fn new(probe: Arc<dyn MediaProbe>, roots: RootSet, timeout: Duration) -> Self {
        Self {
            probe,
            roots,
            timeout,
        }
    }

    /// The underlying probe.
    pub fn probe(&self) -> &Arc<dyn MediaProbe> {
        &self.probe
    }

    /// Extract every path with at most `concurrency_limit` probes in flight.
    ///
    /// Results are keyed by input path, in input order.
    pub async fn extract_batch(
        &self,
        paths: &[PathBuf],
        concurrency_limit: usize,
    ) -> IndexMap<PathBuf, Extraction> {
        stream::iter(paths.iter().cloned())
            .map(|path| async move {
                let extraction = self.extract_one(&path).await;
                (path, extraction)
            })
            .buffered(concurrency_limit.max(1))
            .collect()
            .await
    }

    async fn extract_one(&self, path: &Path) -> Extraction {
        let resolved = match self.roots.sanitize(path) {
            Ok(resolved) => resolved,
            Err(ScanError::OutsideRoots { .. }) => {
                warn!(path = %path.display(), "refusing to probe file outside the library roots");
                return Extraction::Failed(ExtractionError::OutsideRoots);
            }
            Err(e) => return Extraction::Failed(ExtractionError::Io(e.to_string())),
        };

        let stat = match tokio::fs::metadata(&resolved).await {
            Ok(stat) if stat.is_file() => stat,
            Ok(_) => {
                return Extraction::Failed(ExtractionError::Io("not a regular file".to_string()));
            }
            Err(e) => return Extraction::Failed(ExtractionError::Io(e.to_string())),
        };
        let stamp = FileStamp::new(
            stat.len(),
            stat.modified().unwrap_or(std::time::UNIX_EPOCH),
        );

        let parsed = parse_file_name(path);
        let mut metadata = MediaMetadata {
            path: path.to_path_buf(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            stamp,
            duration: None,
            thumbnail: None,
            chapters: Vec::new(),
            title: parsed.title,
            episode: parsed.episode,
            season: parsed.season,
            year: parsed.year,
            genre: None,
        };

        // Dropping the probe future on timeout kills the child process.
        let error = match tokio::time::timeout(self.timeout, self.probe.probe(&resolved, &stamp)).await
        {
            Ok(Ok(data)) => {
                metadata.duration = data.duration;
                metadata.chapters = data.chapters;
                metadata.thumbnail = data.thumbnail;
                metadata.genre = data.genre;
                if metadata.thumbnail.is_none() {
                    if let Some(duration) = metadata.duration {
                        metadata.thumbnail = self.thumbnail(&resolved, &stamp, duration).await;
                    }
                }
                return Extraction::Complete(metadata);
            }
            Ok(Err(error)) => error,
            Err(_) => ExtractionError::Timeout(self.timeout),
        };

        warn!(path = %path.display(), "metadata probe failed: {error}");
        Extraction::Partial { metadata, error }
    }

    /// Thumbnails get a budget of their own; running out only drops the thumbnail.
    async fn thumbnail(&self, path: &Path, stamp: &FileStamp, duration: u64) -> Option<PathBuf> {
        match tokio::time::timeout(self.timeout, self.probe.thumbnail(path, stamp, duration)).await {
            Ok(thumbnail) => thumbnail,
            Err(_) => {
                warn!(path = %path.display(), "thumbnail timed out after {:?}", self.timeout);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeData;
    use async_trait::async_trait;
    use mediascan_core::ScanResult;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Probe that sleeps forever for files named `slow*` and fails for `bad*`.
    /// Thumbnails of `stuck*` files never finish.
    struct ScriptedProbe {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl MediaProbe for ScriptedProbe {
        async fn ensure_available(&self) -> ScanResult<()> {
            Ok(())
        }

        async fn probe(&self, path: &Path, _stamp: &FileStamp) -> Result<ProbeData, ExtractionError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            tokio::time::sleep(Duration::from_millis(20)).await;
            if name.starts_with("slow") {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if name.starts_with("bad") {
                return Err(ExtractionError::ProbeFailed("exit status 1".to_string()));
            }
            Ok(ProbeData {
                duration: Some(60),
                ..Default::default()
            })
        }

        async fn thumbnail(&self, path: &Path, _stamp: &FileStamp, _duration: u64) -> Option<PathBuf> {
            let name = path.file_name()?.to_string_lossy().to_string();
            if name.starts_with("stuck") {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Some(path.with_extension("webp"))
        }
    }

    fn extractor(root: &Path, probe: Arc<ScriptedProbe>) -> MetadataExtractor {
        MetadataExtractor::new(
            probe,
            RootSet::new(&[root.to_path_buf()]),
            Duration::from_millis(300),
        )
    }

    fn scripted() -> Arc<ScriptedProbe> {
        Arc::new(ScriptedProbe {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_file() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        for name in ["a.mkv", "bad.mkv", "slow.mkv", "d.mkv"] {
            fs::write(root.join(name), name).unwrap();
        }
        let paths: Vec<PathBuf> = ["a.mkv", "bad.mkv", "slow.mkv", "d.mkv", "gone.mkv"]
            .iter()
            .map(|name| root.join(name))
            .collect();

        let results = extractor(&root, scripted()).extract_batch(&paths, 2).await;

        let keys: Vec<_> = results.keys().cloned().collect();
        assert_eq!(keys, paths);
        assert!(matches!(results[0], Extraction::Complete(ref m) if m.duration == Some(60)));
        assert!(matches!(
            results[1],
            Extraction::Partial { error: ExtractionError::ProbeFailed(_), .. }
        ));
        assert!(matches!(
            results[2],
            Extraction::Partial { error: ExtractionError::Timeout(_), .. }
        ));
        assert!(matches!(results[3], Extraction::Complete(_)));
        assert!(matches!(results[4], Extraction::Failed(ExtractionError::Io(_))));
        assert_eq!(results[2].metadata().map(|m| m.stamp.size), Some(8));
    }

    #[tokio::test]
    async fn test_slow_thumbnail_keeps_probe_data() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let paths: Vec<PathBuf> = ["ok.mkv", "stuck.mkv"]
            .iter()
            .map(|name| {
                let path = root.join(name);
                fs::write(&path, name).unwrap();
                path
            })
            .collect();

        let results = extractor(&root, scripted()).extract_batch(&paths, 2).await;

        let Extraction::Complete(ok) = &results[0] else {
            panic!("expected complete extraction, got {:?}", results[0]);
        };
        assert_eq!(ok.thumbnail, Some(root.join("ok.webp")));

        let Extraction::Complete(stuck) = &results[1] else {
            panic!("expected complete extraction, got {:?}", results[1]);
        };
        assert_eq!(stuck.duration, Some(60));
        assert_eq!(stuck.thumbnail, None);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let paths: Vec<PathBuf> = (0..8)
            .map(|i| {
                let path = root.join(format!("{i}.mkv"));
                fs::write(&path, "x").unwrap();
                path
            })
            .collect();

        let probe = scripted();
        let results = extractor(&root, Arc::clone(&probe))
            .extract_batch(&paths, 3)
            .await;

        assert_eq!(results.len(), 8);
        assert!(probe.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_outside_roots_is_rejected() {
        let library = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let outside = elsewhere.path().join("x.mkv");
        fs::write(&outside, "x").unwrap();

        let results = extractor(library.path(), scripted())
            .extract_batch(&[outside.clone()], 1)
            .await;
        assert_eq!(
            results[&outside],
            Extraction::Failed(ExtractionError::OutsideRoots)
        );
    }
}
