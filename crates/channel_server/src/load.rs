//! # Load Sampling
//!
//! What a channel server tells the master about itself. A [`LoadSampler`]
//! measures the process and the machine; [`SystemSampler`] does so through
//! `sysinfo`. The message rate comes from the host's own counter, see
//! [`MessageRate`].

use std::time::Instant;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// One measurement of the process and the machine it runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostSample {
    /// Process CPU, percent of one core
    pub cpu: f64,
    /// Machine CPU, percent of all cores
    pub host_cpu: f64,
    /// Process resident memory in MB
    pub mem_mb: f64,
    /// Free machine memory, percent
    pub free_mem: f64,
}

pub trait LoadSampler: Send {
    fn sample(&mut self) -> HostSample;
}

/// Always reports the same sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticSampler(pub HostSample);

impl LoadSampler for StaticSampler {
    fn sample(&mut self) -> HostSample {
        self.0
    }
}

/// Samples the process and the machine through `sysinfo`.
///
/// A reading that cannot be taken keeps the previous value. Before the first
/// good reading free memory counts as zero, so a host that cannot measure
/// itself is not mistaken for an idle one.
#[derive(Debug)]
pub struct SystemSampler {
    system: System,
    pid: Option<Pid>,
    last: HostSample,
}

impl SystemSampler {
    pub fn new() -> Self {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            warn!("load sampling is not supported on this platform");
        }
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = e, "cannot identify own process, process load unavailable");
                None
            }
        };
        let mut sampler = Self {
            system: System::new(),
            pid,
            last: HostSample::default(),
        };
        // CPU usage is a difference between two refreshes
        sampler.refresh();
        sampler
    }

    fn refresh(&mut self) {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        if let Some(pid) = self.pid {
            self.system
                .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSampler for SystemSampler {
    fn sample(&mut self) -> HostSample {
        self.refresh();
        let mut sample = self.last;
        if !self.system.cpus().is_empty() {
            sample.host_cpu = clamp_percent(f64::from(self.system.global_cpu_usage()));
        }
        match free_percent(self.system.available_memory(), self.system.total_memory()) {
            Some(free) => sample.free_mem = free,
            None => debug!("machine memory unavailable, keeping previous reading"),
        }
        match self.pid.and_then(|pid| self.system.process(pid)) {
            Some(process) => {
                sample.cpu = f64::from(process.cpu_usage()).max(0.0);
                sample.mem_mb = process.memory() as f64 / BYTES_PER_MB;
            }
            None => debug!("own process not listed, keeping previous reading"),
        }
        self.last = sample;
        sample
    }
}

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Available memory as a percentage of the total, if the total is known.
fn free_percent(available: u64, total: u64) -> Option<f64> {
    (total > 0).then(|| clamp_percent(available as f64 / total as f64 * 100.0))
}

/// Turns the host's monotonic message counter into a per-second rate.
#[derive(Debug, Default)]
pub struct MessageRate {
    last: Option<(u64, Instant)>,
}

impl MessageRate {
    pub fn update(&mut self, count: u64, now: Instant) -> f64 {
        let rate = match self.last {
            Some((last, at)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    count.saturating_sub(last) as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last = Some((count, now));
        rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_free_percent() {
        assert_eq!(free_percent(4_000, 16_000), Some(25.0));
        assert_eq!(free_percent(16_000, 16_000), Some(100.0));
        assert_eq!(free_percent(1, 0), None);
        assert_eq!(clamp_percent(f64::NAN), 0.0);
        assert_eq!(clamp_percent(140.0), 100.0);
    }

    #[test]
    fn test_message_rate() {
        let mut rate = MessageRate::default();
        let start = Instant::now();
        assert_eq!(rate.update(100, start), 0.0);
        let later = start + Duration::from_secs(2);
        assert_eq!(rate.update(300, later), 100.0);
    }

    #[test]
    fn test_system_sampler_measures_this_process() {
        let mut sampler = SystemSampler::new();
        let sample = sampler.sample();
        assert!(sample.cpu >= 0.0);
        assert!((0.0..=100.0).contains(&sample.host_cpu));
        assert!((0.0..=100.0).contains(&sample.free_mem));
        if sysinfo::IS_SUPPORTED_SYSTEM {
            assert!(sample.mem_mb > 0.0);
            assert!(sample.free_mem > 0.0);
        }
    }
}
