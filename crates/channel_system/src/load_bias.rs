//! # Load Bias
//!
//! Turns the metrics a host reports into one placement penalty, its
//! `load_value`. Lower is better. The curve breakpoints and penalties are
//! defaults tuned for one hardware profile and are expected to be retuned
//! per deployment through configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Piecewise-linear penalty curve for one metric.
///
/// Zero up to `safe`, ramps to `loaded_penalty` at `loaded`, ramps on to
/// `max_penalty` at `worst` and stays there. When `worst < safe` the metric
/// is lower-is-worse (free memory); otherwise higher-is-worse (CPU).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiasCurve {
    pub safe: f64,
    pub loaded: f64,
    pub worst: f64,
    pub loaded_penalty: f64,
    pub max_penalty: f64,
}

impl BiasCurve {
    pub const fn new(safe: f64, loaded: f64, worst: f64, loaded_penalty: f64, max_penalty: f64) -> Self {
        Self {
            safe,
            loaded,
            worst,
            loaded_penalty,
            max_penalty,
        }
    }

    pub fn lower_is_worse(&self) -> bool {
        self.worst < self.safe
    }

    /// Penalty for `value`.
    pub fn bias(&self, value: f64) -> f64 {
        // fold lower-is-worse curves onto the higher-is-worse shape
        let sign = if self.lower_is_worse() { -1.0 } else { 1.0 };
        let (v, safe, loaded, worst) = (
            value * sign,
            self.safe * sign,
            self.loaded * sign,
            self.worst * sign,
        );
        if v <= safe {
            0.0
        } else if v <= loaded {
            lerp(safe, loaded, v, 0.0, self.loaded_penalty)
        } else if v < worst {
            lerp(loaded, worst, v, self.loaded_penalty, self.max_penalty)
        } else {
            self.max_penalty
        }
    }
}

fn lerp(from: f64, to: f64, at: f64, low: f64, high: f64) -> f64 {
    if to <= from {
        return high;
    }
    low + (high - low) * (at - from) / (to - from)
}

/// Constants of the load formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadWeights {
    pub free_mem: BiasCurve,
    pub process_cpu: BiasCurve,
    pub host_cpu: BiasCurve,
    /// Memory below this costs nothing
    pub mem_baseline_mb: f64,
    /// Penalty per `mem_step_mb` above the baseline
    pub mem_step_penalty: f64,
    pub mem_step_mb: f64,
    /// Above this the host is treated as nearly full
    pub mem_high_mb: f64,
    pub mem_high_penalty: f64,
    pub mem_high_per_mb: f64,
    /// Added to the host running the master
    pub master_penalty: f64,
}

impl Default for LoadWeights {
    fn default() -> Self {
        Self {
            free_mem: BiasCurve::new(30.0, 25.0, 0.0, 30_000.0, 40_000.0),
            process_cpu: BiasCurve::new(50.0, 60.0, 100.0, 20_000.0, 30_000.0),
            host_cpu: BiasCurve::new(75.0, 80.0, 100.0, 25_000.0, 40_000.0),
            mem_baseline_mb: 400.0,
            mem_step_penalty: 25.0,
            mem_step_mb: 80.0,
            mem_high_mb: 1200.0,
            mem_high_penalty: 10_000.0,
            mem_high_per_mb: 10.0,
            master_penalty: 25_000.0,
        }
    }
}

/// Periodic load report of one host, the payload of the `load` push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadReport {
    /// Process CPU, percent of one core
    pub cpu: f64,
    /// Host CPU, percent of all cores
    pub host_cpu: f64,
    /// Process resident memory in MB
    pub mem_mb: f64,
    /// Free host memory, percent
    pub free_mem: f64,
    pub msgs_per_sec: f64,
    pub worker_counts: HashMap<String, u32>,
    pub debug_addr: Option<String>,
}

impl LoadReport {
    pub fn total_workers(&self) -> u32 {
        self.worker_counts.values().sum()
    }
}

impl LoadWeights {
    /// Scalar penalty of a host.
    pub fn load_value(&self, report: &LoadReport, is_master: bool) -> f64 {
        let mut value = report.cpu;
        value += self.free_mem.bias(report.free_mem);
        value += self.process_cpu.bias(report.cpu);
        value += self.host_cpu.bias(report.host_cpu);
        if self.mem_step_mb > 0.0 {
            value += (self.mem_step_penalty * (report.mem_mb - self.mem_baseline_mb)
                / self.mem_step_mb)
                .max(0.0);
        }
        if report.mem_mb > self.mem_high_mb {
            value += self.mem_high_penalty + (report.mem_mb - self.mem_high_mb) * self.mem_high_per_mb;
        }
        if is_master {
            value += self.master_penalty;
        }
        value
    }

    /// Whether a report shows the host under enough pressure to deserve a
    /// longer liveness timeout.
    pub fn is_heavy(&self, report: &LoadReport) -> bool {
        self.process_cpu.bias(report.cpu) > 0.0
            || self.host_cpu.bias(report.host_cpu) > 0.0
            || self.free_mem.bias(report.free_mem) > 0.0
            || report.mem_mb > self.mem_high_mb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_higher_is_worse_curve() {
        let curve = LoadWeights::default().process_cpu;
        assert_eq!(curve.bias(10.0), 0.0);
        assert_eq!(curve.bias(50.0), 0.0);
        assert!(close(curve.bias(55.0), 10_000.0));
        assert!(close(curve.bias(60.0), 20_000.0));
        assert!(close(curve.bias(80.0), 25_000.0));
        assert_eq!(curve.bias(100.0), 30_000.0);
        assert_eq!(curve.bias(250.0), 30_000.0);
    }

    #[test]
    fn test_lower_is_worse_curve() {
        let curve = LoadWeights::default().free_mem;
        assert!(curve.lower_is_worse());
        assert_eq!(curve.bias(80.0), 0.0);
        assert!(close(curve.bias(27.5), 15_000.0));
        assert!(close(curve.bias(25.0), 30_000.0));
        assert!(close(curve.bias(12.5), 35_000.0));
        assert_eq!(curve.bias(0.0), 40_000.0);
    }

    #[test]
    fn test_idle_host_costs_its_cpu() {
        let weights = LoadWeights::default();
        let report = LoadReport {
            cpu: 12.0,
            host_cpu: 20.0,
            mem_mb: 300.0,
            free_mem: 70.0,
            ..LoadReport::default()
        };
        assert!(close(weights.load_value(&report, false), 12.0));
        assert!(close(weights.load_value(&report, true), 25_012.0));
        assert!(!weights.is_heavy(&report));
    }

    #[test]
    fn test_memory_terms() {
        let weights = LoadWeights::default();
        let report = LoadReport {
            mem_mb: 1300.0,
            free_mem: 50.0,
            ..LoadReport::default()
        };
        // 25 * 900 / 80 + 10000 + 100 * 10
        assert!(close(weights.load_value(&report, false), 281.25 + 11_000.0));
        assert!(weights.is_heavy(&report));
    }
}
