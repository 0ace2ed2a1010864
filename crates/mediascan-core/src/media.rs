//! Media index records and probe results.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier derived from a file path.
pub fn video_id(path: &Path) -> String {
    blake3::hash(path.to_string_lossy().as_bytes())
        .to_hex()
        .to_string()
}

/// Size and modification time used for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStamp {
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

impl FileStamp {
    pub fn new(size: u64, modified: SystemTime) -> Self {
        Self {
            size,
            modified_at: DateTime::<Utc>::from(modified),
        }
    }

    /// Whether both stamps describe the same file contents.
    ///
    /// Modification times are compared at millisecond precision, which is
    /// what survives a round trip through the index.
    pub fn matches(&self, other: &FileStamp) -> bool {
        self.size == other.size
            && self.modified_at.timestamp_millis() == other.modified_at.timestamp_millis()
    }
}

/// A chapter marker reported by the probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub title: Option<String>,
    /// Start offset in seconds.
    pub start: f64,
    /// End offset in seconds.
    pub end: f64,
}

/// What the metadata extractor learned about one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    pub path: PathBuf,
    pub file_name: String,
    pub stamp: FileStamp,
    /// Duration in whole seconds.
    pub duration: Option<u64>,
    pub thumbnail: Option<PathBuf>,
    pub chapters: Vec<Chapter>,
    pub title: String,
    pub episode: Option<u32>,
    pub season: Option<u32>,
    pub year: Option<u16>,
    pub genre: Option<String>,
}

/// One entry of the persistent media index, keyed by `file_path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRecord {
    pub file_path: PathBuf,
    pub file_name: String,
    pub title: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub duration: Option<u64>,
    pub thumbnail: Option<PathBuf>,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    pub episode: Option<u32>,
    pub season: Option<u32>,
    pub year: Option<u16>,
    pub genre: Option<String>,
    pub video_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub watched: bool,
    #[serde(default)]
    pub liked: bool,
}

impl MediaRecord {
    /// Build a fresh record from probe output.
    pub fn from_metadata(metadata: MediaMetadata, now: DateTime<Utc>) -> Self {
        Self {
            video_id: video_id(&metadata.path),
            file_path: metadata.path,
            file_name: metadata.file_name,
            title: metadata.title,
            size: metadata.stamp.size,
            modified_at: metadata.stamp.modified_at,
            duration: metadata.duration,
            thumbnail: metadata.thumbnail,
            chapters: metadata.chapters,
            episode: metadata.episode,
            season: metadata.season,
            year: metadata.year,
            genre: metadata.genre,
            created_at: now,
            updated_at: now,
            watched: false,
            liked: false,
        }
    }

    /// Refresh scan-derived fields, keeping identity and user state.
    pub fn refresh(&mut self, metadata: MediaMetadata, now: DateTime<Utc>) {
        self.file_name = metadata.file_name;
        self.title = metadata.title;
        self.size = metadata.stamp.size;
        self.modified_at = metadata.stamp.modified_at;
        if metadata.duration.is_some() {
            self.duration = metadata.duration;
        }
        if metadata.thumbnail.is_some() {
            self.thumbnail = metadata.thumbnail;
        }
        if !metadata.chapters.is_empty() {
            self.chapters = metadata.chapters;
        }
        self.episode = metadata.episode;
        self.season = metadata.season;
        self.year = metadata.year;
        self.genre = metadata.genre.or(self.genre.take());
        self.updated_at = now;
    }

    pub fn stamp(&self) -> FileStamp {
        FileStamp {
            size: self.size,
            modified_at: self.modified_at,
        }
    }
}
