//! Adaptive batch sizing under resource pressure.

use chrono::Timelike;
use sysinfo::{Pid, System};
use tracing::{debug, info};

use mediascan_core::ScanSettings;

/// Largest batch the throttle ever hands out.
pub const MAX_BATCH_SIZE: usize = 200;
/// Smallest batch a reduction may reach.
pub const MIN_REDUCED_BATCH_SIZE: usize = 5;

const REDUCE_RATIO: f64 = 0.5;
const INCREASE_RATIO: f64 = 1.5;
/// Memory use, relative to the threshold, below which the batch may grow again.
const MEMORY_LOW_RATIO: f64 = 0.4;

/// Resource usage of the scanning process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub memory_mb: u64,
    /// Global CPU usage, 0 to 100.
    pub cpu_percent: f32,
    /// Local hour of day.
    pub hour: u8,
}

/// Source of resource samples.
pub trait ResourceProbe: Send + Sync {
    fn sample(&mut self) -> ResourceSample;
}

/// Samples the current process through `sysinfo`.
pub struct SysinfoProbe {
    system: System,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&mut self) -> ResourceSample {
        self.system.refresh_cpu();
        let memory_mb = match self.pid {
            Some(pid) if self.system.refresh_process(pid) => self
                .system
                .process(pid)
                .map(|process| process.memory() / (1024 * 1024))
                .unwrap_or(0),
            _ => 0,
        };
        ResourceSample {
            memory_mb,
            cpu_percent: self.system.global_cpu_info().cpu_usage(),
            hour: chrono::Local::now().hour() as u8,
        }
    }
}

/// Why the throttle shrank the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    Memory,
    Cpu,
    QuietHours,
}

/// Batch size controller.
///
/// Halves the batch while under pressure, and grows it back by half towards
/// the configured size once pressure subsides.
pub struct BatchThrottle {
    probe: Box<dyn ResourceProbe>,
    current: usize,
}

impl BatchThrottle {
    pub fn new(probe: Box<dyn ResourceProbe>, settings: &ScanSettings) -> Self {
        Self {
            probe,
            current: settings.batch_size,
        }
    }

    /// Unthrottled batch size, with the priority ratio applied.
    pub fn target(settings: &ScanSettings) -> usize {
        let scaled = settings.batch_size as f64 * settings.processing_priority.batch_ratio();
        (scaled.round() as usize).clamp(1, MAX_BATCH_SIZE)
    }

    /// Sample resources and return the batch size to use next.
    pub fn next_batch_size(&mut self, settings: &ScanSettings) -> usize {
        let sample = self.probe.sample();
        self.adjust(settings, sample)
    }

    /// Apply one sample.
    pub fn adjust(&mut self, settings: &ScanSettings, sample: ResourceSample) -> usize {
        let target = Self::target(settings);
        let floor = MIN_REDUCED_BATCH_SIZE.min(target);
        let previous = self.current.clamp(1, MAX_BATCH_SIZE);

        self.current = match pressure(settings, &sample) {
            Some(reason) => {
                let reduced = ((previous as f64 * REDUCE_RATIO) as usize).max(floor);
                if reduced < previous {
                    info!(?reason, from = previous, to = reduced, "reducing batch size");
                }
                reduced.min(target)
            }
            None if previous < target && relaxed(settings, &sample) => {
                let grown = ((previous as f64 * INCREASE_RATIO).ceil() as usize).min(target);
                debug!(from = previous, to = grown, "growing batch size");
                grown
            }
            None => previous.min(target),
        };
        self.current
    }

    pub fn current(&self) -> usize {
        self.current
    }
}

fn pressure(settings: &ScanSettings, sample: &ResourceSample) -> Option<Pressure> {
    if sample.memory_mb > settings.memory_threshold_mb {
        return Some(Pressure::Memory);
    }
    if settings.auto_pause_on_high_cpu
        && sample.cpu_percent >= f32::from(settings.auto_pause_threshold)
    {
        return Some(Pressure::Cpu);
    }
    if settings.auto_pause_time_range.contains(sample.hour) {
        return Some(Pressure::QuietHours);
    }
    None
}

fn relaxed(settings: &ScanSettings, sample: &ResourceSample) -> bool {
    (sample.memory_mb as f64) < settings.memory_threshold_mb as f64 * MEMORY_LOW_RATIO
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediascan_core::{AutoPauseTimeRange, ProcessingPriority};

    struct Fixed(ResourceSample);

    impl ResourceProbe for Fixed {
        fn sample(&mut self) -> ResourceSample {
            self.0
        }
    }

    fn calm() -> ResourceSample {
        ResourceSample {
            memory_mb: 10,
            cpu_percent: 5.0,
            hour: 3,
        }
    }

    fn settings(batch: usize) -> ScanSettings {
        ScanSettings::builder().batch_size(batch).build().unwrap()
    }

    #[test]
    fn test_memory_pressure_halves_to_floor() {
        let settings = settings(50);
        let mut throttle = BatchThrottle::new(Box::new(Fixed(calm())), &settings);
        let heavy = ResourceSample {
            memory_mb: 4096,
            ..calm()
        };

        assert_eq!(throttle.adjust(&settings, heavy), 25);
        assert_eq!(throttle.adjust(&settings, heavy), 12);
        assert_eq!(throttle.adjust(&settings, heavy), 6);
        assert_eq!(throttle.adjust(&settings, heavy), 5);
        assert_eq!(throttle.adjust(&settings, heavy), 5);

        assert_eq!(throttle.adjust(&settings, calm()), 8);
        assert_eq!(throttle.adjust(&settings, calm()), 12);
        for _ in 0..10 {
            throttle.adjust(&settings, calm());
        }
        assert_eq!(throttle.current(), 50);
    }

    #[test]
    fn test_small_batches_are_not_raised() {
        let settings = settings(2);
        let mut throttle = BatchThrottle::new(Box::new(Fixed(calm())), &settings);
        let heavy = ResourceSample {
            memory_mb: 4096,
            ..calm()
        };
        assert_eq!(throttle.adjust(&settings, heavy), 2);
        assert_eq!(throttle.next_batch_size(&settings), 2);
    }

    #[test]
    fn test_cpu_and_quiet_hours() {
        let mut settings = settings(40);
        settings.auto_pause_on_high_cpu = true;
        settings.auto_pause_threshold = 80;
        let mut throttle = BatchThrottle::new(Box::new(Fixed(calm())), &settings);

        let busy = ResourceSample {
            cpu_percent: 95.0,
            ..calm()
        };
        assert_eq!(throttle.adjust(&settings, busy), 20);

        settings.auto_pause_on_high_cpu = false;
        settings.auto_pause_time_range = AutoPauseTimeRange {
            enabled: true,
            start_hour: 1,
            end_hour: 5,
        };
        assert_eq!(throttle.adjust(&settings, calm()), 10);
    }

    #[test]
    fn test_priority_ratio() {
        let mut settings = settings(100);
        settings.processing_priority = ProcessingPriority::Low;
        assert_eq!(BatchThrottle::target(&settings), 70);
        settings.processing_priority = ProcessingPriority::High;
        assert_eq!(BatchThrottle::target(&settings), 130);
        settings.batch_size = 200;
        assert_eq!(BatchThrottle::target(&settings), MAX_BATCH_SIZE);
    }

    #[test]
    fn test_settings_change_takes_effect() {
        let mut throttle = BatchThrottle::new(Box::new(Fixed(calm())), &settings(50));
        assert_eq!(throttle.next_batch_size(&settings(10)), 10);
    }
}
