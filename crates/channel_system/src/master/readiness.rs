//! Cluster readiness as seen by the master: client build gating, planned
//! restarts and the deploy quiesce check.

use crate::error::ChannelError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    /// Consecutive quiet deploy checks before a deploy is allowed
    pub quiesce_checks: u32,
    /// Oldest accepted client build per platform, e.g. `ios = "1.4.2"`
    pub min_client_versions: HashMap<String, String>,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            quiesce_checks: 3,
            min_client_versions: HashMap::new(),
        }
    }
}

/// Compares dotted numeric versions; missing or non-numeric parts count as 0.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.trim().parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

#[derive(Debug)]
pub struct Readiness {
    settings: ReadinessSettings,
    quiet_checks: u32,
    forced: bool,
    restart_at: Option<Instant>,
    error_reports: u64,
}

impl Readiness {
    pub fn new(settings: ReadinessSettings) -> Self {
        Self {
            settings,
            quiet_checks: 0,
            forced: false,
            restart_at: None,
            error_reports: 0,
        }
    }

    /// Whether a client of `platform` at `version` should be sent here.
    pub fn ready(&self, platform: Option<&str>, version: Option<&str>, now: Instant) -> Result<(), ChannelError> {
        if let Some(remaining) = self.restart_remaining(now) {
            return Err(ChannelError::Domain(format!(
                "restart in {}s",
                remaining.as_secs()
            )));
        }
        if let (Some(platform), Some(version)) = (platform, version) {
            if let Some(min) = self.settings.min_client_versions.get(platform) {
                if compare_versions(version, min) == Ordering::Less {
                    return Err(ChannelError::Domain(format!(
                        "client {platform} {version} is older than {min}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// One deploy readiness check. `busy` is whether placement has creates
    /// or locks in flight; any busy check restarts the count.
    pub fn deploy_check(&mut self, busy: bool) -> Result<(), ChannelError> {
        if self.forced {
            return Ok(());
        }
        if busy {
            self.quiet_checks = 0;
            return Err(ChannelError::Domain("cluster busy".to_string()));
        }
        self.quiet_checks = self.quiet_checks.saturating_add(1);
        if self.quiet_checks >= self.settings.quiesce_checks {
            Ok(())
        } else {
            Err(ChannelError::Domain(format!(
                "quiescing {}/{}",
                self.quiet_checks, self.settings.quiesce_checks
            )))
        }
    }

    pub fn force_ready(&mut self) {
        self.forced = true;
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    pub fn schedule_restart(&mut self, after: Duration, now: Instant) {
        self.restart_at = Some(now + after);
    }

    pub fn cancel_restart(&mut self) -> bool {
        self.restart_at.take().is_some()
    }

    /// Time left before a scheduled restart; zero once it is due.
    pub fn restart_remaining(&self, now: Instant) -> Option<Duration> {
        self.restart_at.map(|at| at.saturating_duration_since(now))
    }

    pub fn note_error_report(&mut self) {
        self.error_reports += 1;
    }

    pub fn error_reports(&self) -> u64 {
        self.error_reports
    }
}
