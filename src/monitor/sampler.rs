//! Load sampling
//!
//! Wraps `sysinfo` behind a small trait so the gate's averaging logic
//! can be driven with scripted samples in tests.

use std::path::Path;

use sysinfo::{Disks, System};
use thiserror::Error;

const MB: u64 = 1024 * 1024;

/// One reading of system load.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LoadSample {
    /// Whole-system CPU usage, 0 to 100.
    pub cpu_percent: f64,
    /// Used memory as a share of total, 0 to 100.
    pub memory_percent: f64,
    /// Memory available to new work, in MB.
    pub available_memory_mb: u64,
    /// Free space on the root filesystem, in MB.
    pub free_disk_mb: u64,
}

/// Failure to read system load.
#[derive(Debug, Clone, Error)]
pub enum SampleError {
    /// The platform reported no disks to read free space from.
    #[error("no disks visible for free space sampling")]
    NoDisks,
}

/// Source of load samples.
pub trait LoadSampler: Send {
    /// Takes one reading.
    ///
    /// # Errors
    ///
    /// Returns `SampleError` when the platform refuses a reading; the
    /// monitor treats that as a transient skip and keeps its previous
    /// values.
    fn sample(&mut self) -> Result<LoadSample, SampleError>;
}

/// `sysinfo` backed sampler used in production.
///
/// Keeps one `System` alive across readings; CPU usage needs a previous
/// refresh to compare against, so the very first reading reports 0%.
pub struct SystemSampler {
    system: System,
    disks: Disks,
}

impl SystemSampler {
    /// Creates a sampler with a fully refreshed system view.
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
            disks: Disks::new_with_refreshed_list(),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSampler for SystemSampler {
    #[allow(clippy::cast_precision_loss)]
    fn sample(&mut self) -> Result<LoadSample, SampleError> {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();
        self.disks.refresh(true);

        let total = self.system.total_memory();
        let available = self.system.available_memory();
        let used = total.saturating_sub(available);
        let memory_percent = if total > 0 {
            (used as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        let root = Path::new("/");
        let free_disk_mb = self
            .disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == root)
            .or_else(|| {
                self.disks
                    .list()
                    .iter()
                    .max_by_key(|disk| disk.available_space())
            })
            .map(|disk| disk.available_space() / MB)
            .ok_or(SampleError::NoDisks)?;

        Ok(LoadSample {
            cpu_percent: f64::from(self.system.global_cpu_usage()),
            memory_percent,
            available_memory_mb: available / MB,
            free_disk_mb,
        })
    }
}

/// Free space in MB on the filesystem holding `path`, by longest
/// matching mount point.
#[must_use]
pub fn free_disk_mb_at(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    let best = disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space() / MB);
    best.or_else(|| {
        disks
            .list()
            .iter()
            .map(|disk| disk.available_space() / MB)
            .max()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_sampler_reads_plausible_values() {
        let mut sampler = SystemSampler::new();
        let sample = sampler.sample().unwrap();

        assert!((0.0..=100.0).contains(&sample.cpu_percent));
        assert!((0.0..=100.0).contains(&sample.memory_percent));
        assert!(sample.available_memory_mb > 0);
    }

    #[test]
    fn test_free_disk_at_workdir() {
        let path = std::env::temp_dir();
        let free = free_disk_mb_at(&path);
        assert!(free.is_some());
    }
}
