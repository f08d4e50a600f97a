//! Runtime settings shared by every worker on a host.

use crate::ordering::OrderingSettings;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_commit_spacing_ms() -> u64 {
    1000
}

fn default_idle_grace_ms() -> u64 {
    30_000
}

fn default_request_timeout_beats() -> u64 {
    30
}

fn default_packet_log_size() -> usize {
    32
}

fn default_packet_dump_bytes() -> usize {
    256
}

/// Settings of the worker runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Interval of the housekeeping tick (recovery, acks, lifecycle, commits)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Ordering thresholds, in liveness beats
    #[serde(default)]
    pub ordering: OrderingSettings,
    /// Minimum spacing between two datastore writes of one worker
    #[serde(default = "default_commit_spacing_ms")]
    pub commit_spacing_ms: u64,
    /// How long an auto-destroy worker must stay idle before it asks to die
    #[serde(default = "default_idle_grace_ms")]
    pub idle_grace_ms: u64,
    /// Beats an outbound request may wait for its response
    #[serde(default = "default_request_timeout_beats")]
    pub request_timeout_beats: u64,
    /// Packet summaries kept for postmortem dumps
    #[serde(default = "default_packet_log_size")]
    pub packet_log_size: usize,
    /// Bytes of a failing packet included in its dump
    #[serde(default = "default_packet_dump_bytes")]
    pub packet_dump_bytes: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            ordering: OrderingSettings::default(),
            commit_spacing_ms: default_commit_spacing_ms(),
            idle_grace_ms: default_idle_grace_ms(),
            request_timeout_beats: default_request_timeout_beats(),
            packet_log_size: default_packet_log_size(),
            packet_dump_bytes: default_packet_dump_bytes(),
        }
    }
}

impl WorkerSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn commit_spacing(&self) -> Duration {
        Duration::from_millis(self.commit_spacing_ms)
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }

    /// Checks values that would stall or spin the runtime.
    pub fn validate(&self) -> Result<(), String> {
        if self.tick_interval_ms == 0 {
            return Err("worker.tick_interval_ms must be greater than 0".to_string());
        }
        if self.ordering.recovery_beats == 0 {
            return Err("worker.ordering.recovery_beats must be greater than 0".to_string());
        }
        if self.ordering.forget_beats <= self.ordering.recovery_beats {
            return Err(
                "worker.ordering.forget_beats must be larger than recovery_beats".to_string(),
            );
        }
        if self.request_timeout_beats == 0 {
            return Err("worker.request_timeout_beats must be greater than 0".to_string());
        }
        Ok(())
    }
}
