//! Resource gate
//!
//! Samples system load on a fixed cadence and answers one question for
//! the agent loop: does this node have room for more work. CPU and
//! memory are judged on a moving average over the last `history_size`
//! samples; free disk space is judged on the latest reading only.
//! Admission checks read the last computed values and never wait for a
//! fresh sample.

pub mod host;
pub mod sampler;

pub use host::HostInfo;
pub use sampler::{free_disk_mb_at, LoadSample, LoadSampler, SampleError, SystemSampler};

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Thresholds and cadence for the resource gate.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    /// Refuse work while the averaged CPU usage exceeds this.
    pub max_cpu_percent: f64,
    /// Refuse work while the averaged memory usage exceeds this.
    pub max_memory_percent: f64,
    /// Refuse work while the latest free disk reading is below this.
    pub min_free_disk_mb: u64,
    /// Time between samples.
    pub sample_interval: Duration,
    /// Number of samples in the averaging window.
    pub history_size: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            max_cpu_percent: 80.0,
            max_memory_percent: 70.0,
            min_free_disk_mb: 1000,
            sample_interval: Duration::from_secs(5),
            history_size: 12,
        }
    }
}

/// Last computed view of system load, for heartbeats.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSnapshot {
    /// Latest CPU reading.
    pub cpu_percent: f64,
    /// Latest memory reading.
    pub memory_percent: f64,
    /// Latest free disk reading, in MB.
    pub free_disk_mb: u64,
    /// Latest available memory reading, in MB.
    pub available_memory_mb: u64,
    /// CPU usage averaged over the window.
    pub avg_cpu_percent: f64,
    /// Memory usage averaged over the window.
    pub avg_memory_percent: f64,
}

#[derive(Default)]
struct MonitorState {
    cpu_history: VecDeque<f64>,
    memory_history: VecDeque<f64>,
    current: LoadSample,
    avg_cpu_percent: f64,
    avg_memory_percent: f64,
}

/// Capacity gate over sampled system load.
///
/// Starts closed: until the first sample lands, the free disk reading
/// is zero and `can_accept_jobs` returns false.
pub struct ResourceMonitor {
    settings: MonitorSettings,
    state: Mutex<MonitorState>,
    sampler: Mutex<Box<dyn LoadSampler>>,
}

impl ResourceMonitor {
    /// Creates a monitor fed by the given sampler.
    #[must_use]
    pub fn new(settings: MonitorSettings, sampler: Box<dyn LoadSampler>) -> Self {
        let settings = MonitorSettings {
            history_size: settings.history_size.max(1),
            ..settings
        };
        Self {
            settings,
            state: Mutex::new(MonitorState::default()),
            sampler: Mutex::new(sampler),
        }
    }

    /// Creates a monitor backed by the production `sysinfo` sampler.
    #[must_use]
    pub fn with_system_sampler(settings: MonitorSettings) -> Self {
        Self::new(settings, Box::new(SystemSampler::new()))
    }

    /// The configured thresholds and cadence.
    #[must_use]
    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Takes one sample and folds it into the window.
    ///
    /// A sampler failure is logged and skipped; previous values stay in
    /// place.
    pub fn sample_once(&self) {
        let reading = self.sampler.lock().sample();
        let sample = match reading {
            Ok(sample) => sample,
            Err(err) => {
                warn!(error = %err, "load sampling failed, keeping previous readings");
                return;
            }
        };

        let mut state = self.state.lock();
        state.current = sample;

        state.cpu_history.push_back(sample.cpu_percent);
        state.memory_history.push_back(sample.memory_percent);
        while state.cpu_history.len() > self.settings.history_size {
            state.cpu_history.pop_front();
        }
        while state.memory_history.len() > self.settings.history_size {
            state.memory_history.pop_front();
        }

        state.avg_cpu_percent = mean(&state.cpu_history);
        state.avg_memory_percent = mean(&state.memory_history);

        if state.avg_cpu_percent > self.settings.max_cpu_percent {
            warn!(
                avg_cpu_percent = state.avg_cpu_percent,
                "system CPU usage is high"
            );
        }
        if state.avg_memory_percent > self.settings.max_memory_percent {
            warn!(
                avg_memory_percent = state.avg_memory_percent,
                "system memory usage is high"
            );
        }
        if state.current.free_disk_mb < self.settings.min_free_disk_mb {
            warn!(
                free_disk_mb = state.current.free_disk_mb,
                "system disk space is low"
            );
        }
    }

    /// Whether the node has headroom for more work.
    #[must_use]
    pub fn can_accept_jobs(&self) -> bool {
        let state = self.state.lock();

        if state.avg_cpu_percent > self.settings.max_cpu_percent {
            debug!(
                avg_cpu_percent = state.avg_cpu_percent,
                "CPU usage too high to accept jobs"
            );
            return false;
        }
        if state.avg_memory_percent > self.settings.max_memory_percent {
            debug!(
                avg_memory_percent = state.avg_memory_percent,
                "memory usage too high to accept jobs"
            );
            return false;
        }
        if state.current.free_disk_mb < self.settings.min_free_disk_mb {
            debug!(
                free_disk_mb = state.current.free_disk_mb,
                "not enough free disk space to accept jobs"
            );
            return false;
        }
        true
    }

    /// Last computed load view.
    #[must_use]
    pub fn current_load(&self) -> ResourceSnapshot {
        let state = self.state.lock();
        ResourceSnapshot {
            cpu_percent: state.current.cpu_percent,
            memory_percent: state.current.memory_percent,
            free_disk_mb: state.current.free_disk_mb,
            available_memory_mb: state.current.available_memory_mb,
            avg_cpu_percent: state.avg_cpu_percent,
            avg_memory_percent: state.avg_memory_percent,
        }
    }

    /// Runs the sampling loop until `shutdown` fires. Samples once
    /// immediately so the gate can open within the first interval.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            max_cpu_percent = self.settings.max_cpu_percent,
            max_memory_percent = self.settings.max_memory_percent,
            min_free_disk_mb = self.settings.min_free_disk_mb,
            "resource monitor started"
        );

        self.sample_once();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.settings.sample_interval) => self.sample_once(),
            }
        }
        info!("resource monitor stopped");
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replays a fixed list of samples, repeating the last one.
    struct ScriptedSampler {
        samples: Vec<Result<LoadSample, SampleError>>,
        index: usize,
    }

    impl ScriptedSampler {
        fn new(samples: Vec<Result<LoadSample, SampleError>>) -> Self {
            Self { samples, index: 0 }
        }
    }

    impl LoadSampler for ScriptedSampler {
        fn sample(&mut self) -> Result<LoadSample, SampleError> {
            let sample = match self.samples.get(self.index) {
                Some(Ok(sample)) => Ok(*sample),
                Some(Err(_)) => Err(SampleError::NoDisks),
                None => match self.samples.last() {
                    Some(Ok(sample)) => Ok(*sample),
                    _ => Err(SampleError::NoDisks),
                },
            };
            self.index += 1;
            sample
        }
    }

    fn healthy(cpu: f64) -> LoadSample {
        LoadSample {
            cpu_percent: cpu,
            memory_percent: 30.0,
            available_memory_mb: 8000,
            free_disk_mb: 50_000,
        }
    }

    fn monitor_with(samples: Vec<Result<LoadSample, SampleError>>) -> ResourceMonitor {
        ResourceMonitor::new(
            MonitorSettings::default(),
            Box::new(ScriptedSampler::new(samples)),
        )
    }

    #[test]
    fn test_starts_closed_until_first_sample() {
        let monitor = monitor_with(vec![Ok(healthy(10.0))]);
        assert!(!monitor.can_accept_jobs(), "no sample yet, disk reads zero");

        monitor.sample_once();
        assert!(monitor.can_accept_jobs());
    }

    #[test]
    fn test_cpu_window_gates_and_recovers() {
        let monitor = monitor_with(vec![Ok(healthy(95.0))]);
        for _ in 0..12 {
            monitor.sample_once();
        }
        assert!(
            !monitor.can_accept_jobs(),
            "twelve samples at 95% average above the 80% threshold"
        );

        // Refit the sampler with low readings and roll the window.
        let monitor = {
            let mut samples = vec![Ok(healthy(95.0)); 12];
            samples.extend(vec![Ok(healthy(10.0)); 12]);
            monitor_with(samples)
        };
        for _ in 0..12 {
            monitor.sample_once();
        }
        assert!(!monitor.can_accept_jobs());

        // (95*10 + 10*2) / 12 = 80.83 stays closed; one more low sample
        // brings the average to 73.75 and opens the gate.
        monitor.sample_once();
        monitor.sample_once();
        assert!(!monitor.can_accept_jobs());
        monitor.sample_once();
        assert!(monitor.can_accept_jobs());
    }

    #[test]
    fn test_boundary_average_is_accepted() {
        // Refusal is strictly greater-than, an average equal to the
        // threshold passes.
        let monitor = monitor_with(vec![Ok(healthy(80.0))]);
        monitor.sample_once();
        assert!(monitor.can_accept_jobs());
    }

    #[test]
    fn test_memory_gate() {
        let mut sample = healthy(10.0);
        sample.memory_percent = 90.0;
        let monitor = monitor_with(vec![Ok(sample)]);
        monitor.sample_once();
        assert!(!monitor.can_accept_jobs());
    }

    #[test]
    fn test_disk_gate_uses_latest_reading_only() {
        let mut low_disk = healthy(10.0);
        low_disk.free_disk_mb = 100;
        let monitor = monitor_with(vec![Ok(low_disk), Ok(healthy(10.0))]);

        monitor.sample_once();
        assert!(!monitor.can_accept_jobs());

        // One healthy reading is enough; disk is not averaged.
        monitor.sample_once();
        assert!(monitor.can_accept_jobs());
    }

    #[test]
    fn test_sampler_failure_keeps_previous_values() {
        let monitor = monitor_with(vec![Ok(healthy(10.0)), Err(SampleError::NoDisks)]);

        monitor.sample_once();
        assert!(monitor.can_accept_jobs());
        let before = monitor.current_load();

        monitor.sample_once();
        assert!(monitor.can_accept_jobs());
        let after = monitor.current_load();
        assert!((after.cpu_percent - before.cpu_percent).abs() < f64::EPSILON);
        assert_eq!(after.free_disk_mb, before.free_disk_mb);
    }

    #[test]
    fn test_partial_window_averages_what_it_has() {
        let monitor = monitor_with(vec![Ok(healthy(40.0)), Ok(healthy(60.0))]);
        monitor.sample_once();
        assert!((monitor.current_load().avg_cpu_percent - 40.0).abs() < f64::EPSILON);

        monitor.sample_once();
        assert!((monitor.current_load().avg_cpu_percent - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_run_samples_until_cancelled() {
        let settings = MonitorSettings {
            sample_interval: Duration::from_millis(10),
            ..MonitorSettings::default()
        };
        let monitor = std::sync::Arc::new(ResourceMonitor::new(
            settings,
            Box::new(ScriptedSampler::new(vec![Ok(healthy(10.0))])),
        ));

        let shutdown = CancellationToken::new();
        let task = {
            let monitor = std::sync::Arc::clone(&monitor);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { monitor.run(shutdown).await })
        };

        let mut waited = 0;
        while !monitor.can_accept_jobs() {
            assert!(waited < 1000, "monitor never opened");
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 10;
        }

        shutdown.cancel();
        task.await.unwrap();
    }
}
