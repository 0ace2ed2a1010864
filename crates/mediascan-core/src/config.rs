//! Library configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::{ScanError, ScanResult};

/// Environment variable listing video roots, comma separated.
pub const VIDEO_DIRECTORY_ENV: &str = "VIDEO_DIRECTORY";

/// File extensions considered video files (lowercase, without the dot).
pub const DEFAULT_VIDEO_EXTENSIONS: &[&str] =
    &["mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "m4v"];

/// Static configuration of the library being scanned.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
#[serde(rename_all = "snake_case")]
pub struct LibraryConfig {
    /// Video roots, walked in order.
    #[builder(default)]
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    /// Extensions accepted by the walker.
    #[builder(default = "default_extensions()")]
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Glob patterns excluded from the walk.
    #[builder(default)]
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Include hidden files and directories (starting with .).
    #[builder(default = "false")]
    #[serde(default)]
    pub include_hidden: bool,

    /// Follow symbolic links while walking.
    #[builder(default = "false")]
    #[serde(default)]
    pub follow_symlinks: bool,

    /// Age after which a checkpoint can no longer be resumed.
    #[builder(default = "Duration::from_secs(24 * 60 * 60)")]
    #[serde(default = "default_checkpoint_validity", with = "duration_secs")]
    pub checkpoint_validity: Duration,

    /// Candidate count above which discovery stops materializing paths.
    #[builder(default = "1000")]
    #[serde(default = "default_stream_threshold")]
    pub stream_threshold: u64,

    /// Per-file probe time budget.
    #[builder(default = "Duration::from_secs(30)")]
    #[serde(default = "default_probe_timeout", with = "duration_secs")]
    pub probe_timeout: Duration,

    /// Time budget of one index transaction.
    #[builder(default = "Duration::from_secs(600)")]
    #[serde(default = "default_transaction_timeout", with = "duration_secs")]
    pub transaction_timeout: Duration,

    /// Interval between bus heartbeats.
    #[builder(default = "Duration::from_secs(30)")]
    #[serde(default = "default_heartbeat_interval", with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Queue depth of each bus subscriber.
    #[builder(default = "256")]
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,

    /// ffprobe executable.
    #[builder(default = "PathBuf::from(\"ffprobe\")")]
    #[serde(default = "default_ffprobe")]
    pub ffprobe_path: PathBuf,

    /// ffmpeg executable, used for thumbnails.
    #[builder(default = "PathBuf::from(\"ffmpeg\")")]
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: PathBuf,

    /// Thumbnail output directory (None = no thumbnails).
    #[builder(default)]
    #[serde(default)]
    pub thumbnail_dir: Option<PathBuf>,
}

fn default_extensions() -> Vec<String> {
    DEFAULT_VIDEO_EXTENSIONS
        .iter()
        .map(|ext| (*ext).to_string())
        .collect()
}

fn default_checkpoint_validity() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_stream_threshold() -> u64 {
    1000
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_transaction_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_subscriber_capacity() -> usize {
    256
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

impl LibraryConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(ref roots) = self.roots {
            if roots.iter().any(|root| root.as_os_str().is_empty()) {
                return Err("Root path cannot be empty".to_string());
            }
        }
        if let Some(ref extensions) = self.extensions {
            if extensions.is_empty() {
                return Err("At least one extension is required".to_string());
            }
        }
        if self.subscriber_capacity == Some(0) {
            return Err("Subscriber capacity must be positive".to_string());
        }
        if self.probe_timeout == Some(Duration::ZERO) {
            return Err("Probe timeout must be positive".to_string());
        }
        Ok(())
    }
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            extensions: default_extensions(),
            exclude_patterns: Vec::new(),
            include_hidden: false,
            follow_symlinks: false,
            checkpoint_validity: default_checkpoint_validity(),
            stream_threshold: default_stream_threshold(),
            probe_timeout: default_probe_timeout(),
            transaction_timeout: default_transaction_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            subscriber_capacity: default_subscriber_capacity(),
            ffprobe_path: default_ffprobe(),
            ffmpeg_path: default_ffmpeg(),
            thumbnail_dir: None,
        }
    }
}

impl LibraryConfig {
    /// Create a new library config builder.
    pub fn builder() -> LibraryConfigBuilder {
        LibraryConfigBuilder::default()
    }

    /// Create a config with default options for the given roots.
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Default location of the config file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mediascan").join("config.toml"))
    }

    /// Default directory for checkpoint, index and settings files.
    pub fn default_data_dir() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join("mediascan"))
    }

    /// Load a config file, falling back to defaults when absent.
    pub fn load(path: &Path) -> ScanResult<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ScanError::io(path, e)),
        };
        toml::from_str(&content)
            .map_err(|e| ScanError::configuration(format!("{}: {e}", path.display())))
    }

    /// Replace the roots with those listed in `VIDEO_DIRECTORY`, if set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var(VIDEO_DIRECTORY_ENV) {
            let roots = parse_root_list(&value);
            if !roots.is_empty() {
                self.roots = roots;
            }
        }
        self
    }

    /// Ensure the config can drive a scan.
    pub fn ensure_scannable(&self) -> ScanResult<()> {
        if self.roots.is_empty() {
            return Err(ScanError::configuration(format!(
                "no video roots configured (set {VIDEO_DIRECTORY_ENV} or `roots` in config.toml)"
            )));
        }
        Ok(())
    }

    /// Whether a file name carries an accepted extension.
    pub fn is_video_file(&self, name: &str) -> bool {
        let Some((_, ext)) = name.rsplit_once('.') else {
            return false;
        };
        self.extensions
            .iter()
            .any(|accepted| accepted.eq_ignore_ascii_case(ext))
    }
}

/// Split a comma-separated root list, trimming whitespace and quotes.
pub fn parse_root_list(value: &str) -> Vec<PathBuf> {
    value
        .split(',')
        .map(|part| part.trim().trim_matches(|c| c == '"' || c == '\''))
        .filter(|part| !part.is_empty())
        .map(PathBuf::from)
        .collect()
}
