//! JWalk-based lazy discovery of video files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use jwalk::{DirEntryIter, Parallelism, WalkDir};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use mediascan_core::{FileStamp, LibraryConfig, ScanError, ScanResult, ScanWarning, WarningKind};

/// A candidate video file found by the walker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Index of the configured root this file lives under.
    pub root_index: usize,
    pub path: PathBuf,
    pub file_name: String,
    pub stamp: FileStamp,
}

/// Item yielded by a discovery pass.
#[derive(Debug, Clone)]
pub enum WalkItem {
    File(DiscoveredFile),
    /// Every file of this root has been yielded.
    RootFinished { root_index: usize },
    Warning(ScanWarning),
}

/// Walks the configured roots in a stable order.
///
/// The walker holds no state beyond its options; every call to
/// [`DirectoryWalker::discover`] starts a fresh pass.
#[derive(Debug, Clone)]
pub struct DirectoryWalker {
    roots: Arc<[PathBuf]>,
    options: Arc<WalkOptions>,
}

#[derive(Debug)]
struct WalkOptions {
    config: LibraryConfig,
    excludes: GlobSet,
}

impl DirectoryWalker {
    /// Create a walker over the roots and filters of `config`.
    pub fn new(config: &LibraryConfig) -> ScanResult<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.exclude_patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                ScanError::configuration(format!("invalid exclude pattern {pattern:?}: {e}"))
            })?;
            builder.add(glob);
        }
        let excludes = builder
            .build()
            .map_err(|e| ScanError::configuration(format!("invalid exclude patterns: {e}")))?;

        Ok(Self {
            roots: config.roots.clone().into(),
            options: Arc::new(WalkOptions {
                config: config.clone(),
                excludes,
            }),
        })
    }

    /// Configured roots, in walk order.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Lazily discover files, starting at the root with index `start_root_index`.
    pub fn discover(&self, start_root_index: usize) -> Discovery {
        Discovery {
            roots: Arc::clone(&self.roots),
            options: Arc::clone(&self.options),
            next_root: start_root_index,
            current: None,
            skipped: None,
        }
    }

    /// Run a discovery pass on a blocking thread, handing items over a
    /// bounded channel.
    ///
    /// The walk stops early once the returned stream is dropped.
    pub fn stream(&self, start_root_index: usize, capacity: usize) -> WalkStream {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let discovery = self.discover(start_root_index);
        tokio::task::spawn_blocking(move || {
            for item in discovery {
                if tx.blocking_send(item).is_err() {
                    debug!("walk receiver dropped, stopping discovery");
                    break;
                }
            }
        });
        WalkStream { rx }
    }

    /// Collect every file of a full pass, returning the warnings separately.
    pub fn collect(&self, start_root_index: usize) -> (Vec<DiscoveredFile>, Vec<ScanWarning>) {
        let mut files = Vec::new();
        let mut warnings = Vec::new();
        for item in self.discover(start_root_index) {
            match item {
                WalkItem::File(file) => files.push(file),
                WalkItem::Warning(warning) => warnings.push(warning),
                WalkItem::RootFinished { .. } => {}
            }
        }
        (files, warnings)
    }
}

/// Receiving end of [`DirectoryWalker::stream`].
pub struct WalkStream {
    rx: mpsc::Receiver<WalkItem>,
}

impl WalkStream {
    /// Next discovered item, or `None` once the pass is over.
    pub async fn next(&mut self) -> Option<WalkItem> {
        self.rx.recv().await
    }
}

/// Iterator over one discovery pass.
pub struct Discovery {
    roots: Arc<[PathBuf]>,
    options: Arc<WalkOptions>,
    next_root: usize,
    current: Option<(usize, DirEntryIter<((), ())>)>,
    skipped: Option<usize>,
}

impl Discovery {
    fn open_root(&self, root: &Path) -> Result<DirEntryIter<((), ())>, ScanWarning> {
        // Warnings carry the configured root so callers can match them up.
        let resolved = root
            .canonicalize()
            .map_err(|_| ScanWarning::missing_root(root))?;
        if !resolved.is_dir() {
            return Err(ScanWarning::missing_root(root));
        }

        let options = Arc::clone(&self.options);
        let walker = WalkDir::new(&resolved)
            .parallelism(Parallelism::Serial)
            .sort(true)
            .skip_hidden(!self.options.config.include_hidden)
            .follow_links(self.options.config.follow_symlinks)
            .process_read_dir(move |_depth, _path, _state, children| {
                children.retain(|entry| match entry {
                    Ok(entry) => !options.excludes.is_match(entry.path()),
                    Err(_) => true,
                });
            });
        Ok(walker.into_iter())
    }

    fn visit(
        &self,
        root_index: usize,
        entry: Result<jwalk::DirEntry<((), ())>, jwalk::Error>,
    ) -> Option<WalkItem> {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err.path().map(Path::to_path_buf).unwrap_or_default();
                let warning = match err.io_error() {
                    Some(io) => ScanWarning::from_io(path, io),
                    None => ScanWarning::new(path, err.to_string(), WarningKind::ReadError),
                };
                warn!(path = %warning.path.display(), "skipping unreadable entry: {}", warning.message);
                return Some(WalkItem::Warning(warning));
            }
        };

        if !entry.file_type().is_file() {
            return None;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        if !self.options.config.is_video_file(&file_name) {
            return None;
        }

        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                return Some(WalkItem::Warning(ScanWarning::new(
                    path,
                    err.to_string(),
                    WarningKind::MetadataError,
                )));
            }
        };
        let modified = metadata.modified().unwrap_or(std::time::UNIX_EPOCH);

        Some(WalkItem::File(DiscoveredFile {
            root_index,
            path,
            file_name,
            stamp: FileStamp::new(metadata.len(), modified),
        }))
    }
}

impl Iterator for Discovery {
    type Item = WalkItem;

    fn next(&mut self) -> Option<WalkItem> {
        loop {
            if let Some(root_index) = self.skipped.take() {
                return Some(WalkItem::RootFinished { root_index });
            }

            if let Some((root_index, iter)) = self.current.as_mut() {
                let root_index = *root_index;
                match iter.next() {
                    Some(entry) => {
                        if let Some(item) = self.visit(root_index, entry) {
                            return Some(item);
                        }
                        continue;
                    }
                    None => {
                        self.current = None;
                        return Some(WalkItem::RootFinished { root_index });
                    }
                }
            }

            let root_index = self.next_root;
            let root = self.roots.get(root_index)?.clone();
            self.next_root += 1;

            match self.open_root(&root) {
                Ok(iter) => self.current = Some((root_index, iter)),
                Err(warning) => {
                    warn!(root = %root.display(), "skipping root: {}", warning.message);
                    self.skipped = Some(root_index);
                    return Some(WalkItem::Warning(warning));
                }
            }
        }
    }
}
