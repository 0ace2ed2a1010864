//! Runtime-tunable scan settings.

use std::ops::RangeInclusive;
use std::path::Path;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{ScanError, ScanResult};

/// Accepted range for `batch_size`.
pub const BATCH_SIZE_RANGE: RangeInclusive<usize> = 1..=200;
/// Accepted range for `progress_update_interval`.
pub const PROGRESS_UPDATE_INTERVAL_RANGE: RangeInclusive<u64> = 10..=1000;
/// Accepted range for `sleep_interval_ms`.
pub const SLEEP_INTERVAL_RANGE: RangeInclusive<u64> = 0..=100;
/// Accepted range for `max_concurrent_operations`.
pub const CONCURRENT_OPERATIONS_RANGE: RangeInclusive<usize> = 1..=8;
/// Accepted range for `memory_threshold_mb`.
pub const MEMORY_THRESHOLD_RANGE: RangeInclusive<u64> = 50..=2048;
/// Accepted range for `auto_pause_threshold`.
pub const AUTO_PAUSE_THRESHOLD_RANGE: RangeInclusive<u8> = 50..=95;

/// Scheduling priority of the scan relative to the rest of the host.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProcessingPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl ProcessingPriority {
    /// Multiplier applied to the effective batch size.
    pub fn batch_ratio(self) -> f64 {
        match self {
            Self::Low => 0.7,
            Self::Normal => 1.0,
            Self::High => 1.3,
        }
    }
}

/// Hours of the day during which the scan backs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoPauseTimeRange {
    pub enabled: bool,
    pub start_hour: u8,
    pub end_hour: u8,
}

impl Default for AutoPauseTimeRange {
    fn default() -> Self {
        Self {
            enabled: false,
            start_hour: 9,
            end_hour: 18,
        }
    }
}

impl AutoPauseTimeRange {
    /// Whether `hour` falls inside the window. Windows may wrap midnight.
    pub fn contains(&self, hour: u8) -> bool {
        if !self.enabled {
            return false;
        }
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Settings governing batching, throttling and diagnostics of a scan.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
#[serde(rename_all = "camelCase", default)]
pub struct ScanSettings {
    /// Files per metadata batch.
    #[builder(default = "50")]
    pub batch_size: usize,

    /// Files between discovery progress events.
    #[builder(default = "100")]
    pub progress_update_interval: u64,

    /// Cooperative pause between batches, in milliseconds.
    #[builder(default = "1")]
    #[serde(rename = "sleepInterval")]
    pub sleep_interval_ms: u64,

    #[builder(default)]
    pub processing_priority: ProcessingPriority,

    /// Concurrent probes per batch.
    #[builder(default = "1")]
    pub max_concurrent_operations: usize,

    /// Resident memory above which the batch size is reduced.
    #[builder(default = "1024")]
    #[serde(rename = "memoryThresholdMB")]
    pub memory_threshold_mb: u64,

    #[builder(default = "false")]
    #[serde(rename = "autoPauseOnHighCPU")]
    pub auto_pause_on_high_cpu: bool,

    /// CPU usage percentage considered "high".
    #[builder(default = "80")]
    pub auto_pause_threshold: u8,

    #[builder(default)]
    pub auto_pause_time_range: AutoPauseTimeRange,

    #[builder(default = "true")]
    pub enable_detailed_logging: bool,

    #[builder(default = "true")]
    pub show_resource_monitoring: bool,

    #[builder(default = "true")]
    pub enable_performance_metrics: bool,
}

impl ScanSettingsBuilder {
    fn validate(&self) -> Result<(), String> {
        let candidate = ScanSettings {
            batch_size: self.batch_size.unwrap_or(50),
            progress_update_interval: self.progress_update_interval.unwrap_or(100),
            sleep_interval_ms: self.sleep_interval_ms.unwrap_or(1),
            max_concurrent_operations: self.max_concurrent_operations.unwrap_or(1),
            memory_threshold_mb: self.memory_threshold_mb.unwrap_or(1024),
            auto_pause_threshold: self.auto_pause_threshold.unwrap_or(80),
            auto_pause_time_range: self.auto_pause_time_range.unwrap_or_default(),
            ..ScanSettings::default()
        };
        candidate.validate().map_err(|e| e.to_string())
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            progress_update_interval: 100,
            sleep_interval_ms: 1,
            processing_priority: ProcessingPriority::Normal,
            max_concurrent_operations: 1,
            memory_threshold_mb: 1024,
            auto_pause_on_high_cpu: false,
            auto_pause_threshold: 80,
            auto_pause_time_range: AutoPauseTimeRange::default(),
            enable_detailed_logging: true,
            show_resource_monitoring: true,
            enable_performance_metrics: true,
        }
    }
}

fn check_range<T>(name: &str, value: T, range: &RangeInclusive<T>) -> ScanResult<()>
where
    T: PartialOrd + std::fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ScanError::InvalidSettings {
            message: format!(
                "{name} must be between {} and {} (got {value})",
                range.start(),
                range.end()
            ),
        })
    }
}

impl ScanSettings {
    /// Create a new settings builder.
    pub fn builder() -> ScanSettingsBuilder {
        ScanSettingsBuilder::default()
    }

    /// Check every field against its accepted range.
    pub fn validate(&self) -> ScanResult<()> {
        check_range("batchSize", self.batch_size, &BATCH_SIZE_RANGE)?;
        check_range(
            "progressUpdateInterval",
            self.progress_update_interval,
            &PROGRESS_UPDATE_INTERVAL_RANGE,
        )?;
        check_range("sleepInterval", self.sleep_interval_ms, &SLEEP_INTERVAL_RANGE)?;
        check_range(
            "maxConcurrentOperations",
            self.max_concurrent_operations,
            &CONCURRENT_OPERATIONS_RANGE,
        )?;
        check_range(
            "memoryThresholdMB",
            self.memory_threshold_mb,
            &MEMORY_THRESHOLD_RANGE,
        )?;
        check_range(
            "autoPauseThreshold",
            self.auto_pause_threshold,
            &AUTO_PAUSE_THRESHOLD_RANGE,
        )?;
        check_range("startHour", self.auto_pause_time_range.start_hour, &(0..=23))?;
        check_range("endHour", self.auto_pause_time_range.end_hour, &(0..=23))?;
        Ok(())
    }

    /// Apply a partial update, returning the validated result.
    ///
    /// `self` is left untouched when validation fails.
    pub fn merged(&self, patch: &ScanSettingsPatch) -> ScanResult<Self> {
        let mut next = self.clone();
        if let Some(v) = patch.batch_size {
            next.batch_size = v;
        }
        if let Some(v) = patch.progress_update_interval {
            next.progress_update_interval = v;
        }
        if let Some(v) = patch.sleep_interval_ms {
            next.sleep_interval_ms = v;
        }
        if let Some(v) = patch.processing_priority {
            next.processing_priority = v;
        }
        if let Some(v) = patch.max_concurrent_operations {
            next.max_concurrent_operations = v;
        }
        if let Some(v) = patch.memory_threshold_mb {
            next.memory_threshold_mb = v;
        }
        if let Some(v) = patch.auto_pause_on_high_cpu {
            next.auto_pause_on_high_cpu = v;
        }
        if let Some(v) = patch.auto_pause_threshold {
            next.auto_pause_threshold = v;
        }
        if let Some(v) = patch.auto_pause_time_range {
            next.auto_pause_time_range = v;
        }
        if let Some(v) = patch.enable_detailed_logging {
            next.enable_detailed_logging = v;
        }
        if let Some(v) = patch.show_resource_monitoring {
            next.show_resource_monitoring = v;
        }
        if let Some(v) = patch.enable_performance_metrics {
            next.enable_performance_metrics = v;
        }
        next.validate()?;
        Ok(next)
    }

    /// Load settings from a TOML file, falling back to defaults when absent.
    pub fn load(path: &Path) -> ScanResult<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ScanError::io(path, e)),
        };
        let settings: Self = toml::from_str(&content).map_err(|e| ScanError::InvalidSettings {
            message: format!("{}: {e}", path.display()),
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to a TOML file.
    pub fn save(&self, path: &Path) -> ScanResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ScanError::io(parent, e))?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| ScanError::InvalidSettings {
            message: e.to_string(),
        })?;
        std::fs::write(path, content).map_err(|e| ScanError::io(path, e))
    }
}

/// Partial settings update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanSettingsPatch {
    pub batch_size: Option<usize>,
    pub progress_update_interval: Option<u64>,
    #[serde(rename = "sleepInterval")]
    pub sleep_interval_ms: Option<u64>,
    pub processing_priority: Option<ProcessingPriority>,
    pub max_concurrent_operations: Option<usize>,
    #[serde(rename = "memoryThresholdMB")]
    pub memory_threshold_mb: Option<u64>,
    #[serde(rename = "autoPauseOnHighCPU")]
    pub auto_pause_on_high_cpu: Option<bool>,
    pub auto_pause_threshold: Option<u8>,
    pub auto_pause_time_range: Option<AutoPauseTimeRange>,
    pub enable_detailed_logging: Option<bool>,
    pub show_resource_monitoring: Option<bool>,
    pub enable_performance_metrics: Option<bool>,
}
