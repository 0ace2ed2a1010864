//! External media probes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use mediascan_core::{
    Chapter, ExtractionError, FileStamp, LibraryConfig, ScanError, ScanResult, video_id,
};

/// What a probe learned about one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeData {
    /// Duration in whole seconds.
    pub duration: Option<u64>,
    pub chapters: Vec<Chapter>,
    pub thumbnail: Option<PathBuf>,
    pub genre: Option<String>,
}

/// Source of per-file media metadata.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Fail with a configuration error when the probe cannot run at all.
    async fn ensure_available(&self) -> ScanResult<()>;

    /// Probe a single file. `path` has already been sanitized.
    async fn probe(&self, path: &Path, stamp: &FileStamp) -> Result<ProbeData, ExtractionError>;

    /// Render or reuse a thumbnail for a file whose duration is known.
    async fn thumbnail(&self, _path: &Path, _stamp: &FileStamp, _duration: u64) -> Option<PathBuf> {
        None
    }
}

/// Probe backed by the `ffprobe` and `ffmpeg` executables.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    ffprobe: PathBuf,
    ffmpeg: PathBuf,
    thumbnail_dir: Option<PathBuf>,
    thumbnail_width: u32,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    chapters: Vec<FfprobeChapter>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeChapter {
    start_time: String,
    end_time: String,
    #[serde(default)]
    tags: HashMap<String, String>,
}

impl FfprobeProbe {
    pub fn new(config: &LibraryConfig) -> Self {
        Self {
            ffprobe: config.ffprobe_path.clone(),
            ffmpeg: config.ffmpeg_path.clone(),
            thumbnail_dir: config.thumbnail_dir.clone(),
            thumbnail_width: 300,
        }
    }

    async fn tool_version(tool: &Path) -> std::io::Result<bool> {
        let status = Command::new(tool)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await?;
        Ok(status.success())
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn ensure_available(&self) -> ScanResult<()> {
        match Self::tool_version(&self.ffprobe).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(ScanError::configuration(format!(
                    "{} -version exited unsuccessfully",
                    self.ffprobe.display()
                )));
            }
            Err(e) => {
                return Err(ScanError::configuration(format!(
                    "metadata probe {} is not available: {e}",
                    self.ffprobe.display()
                )));
            }
        }

        if self.thumbnail_dir.is_some() && !matches!(Self::tool_version(&self.ffmpeg).await, Ok(true))
        {
            warn!(ffmpeg = %self.ffmpeg.display(), "ffmpeg unavailable, thumbnails will be skipped");
        }
        Ok(())
    }

    async fn probe(&self, path: &Path, _stamp: &FileStamp) -> Result<ProbeData, ExtractionError> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_chapters",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExtractionError::ProbeFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(ExtractionError::ProbeFailed(format!(
                "ffprobe exited with {}",
                output.status
            )));
        }

        let data = parse_ffprobe_output(&output.stdout)?;
        debug!(path = %path.display(), duration = ?data.duration, "probed");
        Ok(data)
    }

    async fn thumbnail(&self, path: &Path, stamp: &FileStamp, duration: u64) -> Option<PathBuf> {
        let dir = self.thumbnail_dir.as_ref()?;
        let target = dir.join(format!("{}.webp", video_id(path)));

        if let Ok(existing) = tokio::fs::metadata(&target).await {
            let fresh = existing
                .modified()
                .map(|modified| chrono::DateTime::<chrono::Utc>::from(modified) >= stamp.modified_at)
                .unwrap_or(false);
            if fresh {
                return Some(target);
            }
        }

        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!(dir = %dir.display(), "cannot create thumbnail directory: {e}");
            return None;
        }

        let seek = duration as f64 * 0.33;
        let output = Command::new(&self.ffmpeg)
            .args(["-y", "-v", "error", "-ss"])
            .arg(format!("{seek:.2}"))
            .arg("-i")
            .arg(path)
            .args(["-frames:v", "1", "-vf"])
            .arg(format!("scale={}:-1", self.thumbnail_width))
            .args(["-f", "webp"])
            .arg(&target)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => Some(target),
            Ok(output) => {
                warn!(
                    path = %path.display(),
                    "thumbnail generation failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                None
            }
            Err(e) => {
                warn!(path = %path.display(), "cannot run ffmpeg: {e}");
                None
            }
        }
    }
}

/// Parse the JSON document printed by ffprobe.
pub fn parse_ffprobe_output(stdout: &[u8]) -> Result<ProbeData, ExtractionError> {
    let parsed: FfprobeOutput =
        serde_json::from_slice(stdout).map_err(|e| ExtractionError::Parse(e.to_string()))?;

    let (duration, genre) = match parsed.format {
        Some(format) => {
            let duration = format
                .duration
                .as_deref()
                .and_then(|d| d.parse::<f64>().ok())
                .filter(|d| d.is_finite() && *d >= 0.0)
                .map(|d| d.round() as u64);
            let genre = format
                .tags
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case("genre"))
                .map(|(_, value)| value.clone());
            (duration, genre)
        }
        None => (None, None),
    };

    let chapters = parsed
        .chapters
        .into_iter()
        .filter_map(|chapter| {
            let start = chapter.start_time.parse::<f64>().ok()?;
            let end = chapter.end_time.parse::<f64>().ok()?;
            Some(Chapter {
                title: chapter.tags.get("title").cloned(),
                start,
                end,
            })
        })
        .collect();

    Ok(ProbeData {
        duration,
        chapters,
        thumbnail: None,
        genre,
    })
}
