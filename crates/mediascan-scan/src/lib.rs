//! Directory walking and metadata extraction for mediascan.
//!
//! # Overview
//!
//! `mediascan-scan` turns the configured library roots into candidate video
//! files and enriches them with probe metadata:
//!
//! - **Lazy discovery** via jwalk, in a stable sorted order and resumable at
//!   a root index
//! - **Backpressure** through a bounded channel when streaming a walk
//! - **Root confinement** of every probed path
//! - **Bounded-concurrency probing** with a per-file timeout
//!
//! # Example
//!
//! ```rust,no_run
//! use mediascan_scan::{DirectoryWalker, LibraryConfig, WalkItem};
//!
//! let config = LibraryConfig::new(["/srv/videos"]);
//! let walker = DirectoryWalker::new(&config).unwrap();
//!
//! for item in walker.discover(0) {
//!     if let WalkItem::File(file) = item {
//!         println!("{} ({} bytes)", file.path.display(), file.stamp.size);
//!     }
//! }
//! ```

mod extractor;
mod naming;
mod probe;
mod roots;
mod walker;

pub use extractor::{Extraction, MetadataExtractor};
pub use naming::{ParsedName, parse_file_name};
pub use probe::{FfprobeProbe, MediaProbe, ProbeData, parse_ffprobe_output};
pub use roots::RootSet;
pub use walker::{DirectoryWalker, DiscoveredFile, Discovery, WalkItem, WalkStream};

// Re-export core types for convenience
pub use mediascan_core::{
    ExtractionError, FileStamp, LibraryConfig, MediaMetadata, ScanError, ScanWarning, WarningKind,
};
