//! # Placement
//!
//! The master's bookkeeping for where workers run. Sans-IO: every method
//! takes the current liveness beat and returns [`PlacementEvent`]s the master
//! turns into messages.
//!
//! ## Scoring
//!
//! ```text
//! score = load_value
//!       + estimate(this round) + estimate(previous round)
//!       + error_penalty * unresolved spawn errors
//!       - requester_bias            (only for the requesting host)
//! ```
//!
//! Each spawn decision adds `spawn_estimate` to the chosen host's current
//! round. A load report closes the round: current becomes previous and a new
//! round starts. Two rounds are kept because a report may be taken before
//! spawns decided just ahead of it had any visible effect.
//!
//! ## Create / lock exclusion
//!
//! A channel id is in at most one of `creating` and `locked`. Creates for a
//! locked id wait until the unlock (or lock timeout) and are then placed
//! afresh; a lock is refused while a create is in flight.

use crate::error::ChannelError;
use crate::ids::{ChannelId, ServerId};
use crate::load_bias::{LoadReport, LoadWeights};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Tunables of placement and its timeouts. Durations are in liveness beats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementSettings {
    pub weights: LoadWeights,
    /// Optimistic load added per spawn until the next load report
    pub spawn_estimate: f64,
    /// Subtracted from the requesting host's score
    pub requester_bias: f64,
    /// Added per unresolved spawn error
    pub error_penalty: f64,
    pub error_forget_beats: u64,
    pub host_timeout_beats: u64,
    /// Timeout for hosts whose last report showed them under pressure
    pub heavy_host_timeout_beats: u64,
    pub create_timeout_beats: u64,
    pub lock_timeout_beats: u64,
    /// Window in which a repeated create succeeds without a new spawn
    pub recently_created_beats: u64,
    /// Hosts tried for one create before giving up
    pub spawn_attempts: u32,
}

impl Default for PlacementSettings {
    fn default() -> Self {
        Self {
            weights: LoadWeights::default(),
            spawn_estimate: 20.0,
            requester_bias: 50.0,
            error_penalty: 100_000.0,
            error_forget_beats: 60,
            host_timeout_beats: 15,
            heavy_host_timeout_beats: 45,
            create_timeout_beats: 20,
            lock_timeout_beats: 60,
            recently_created_beats: 5,
            spawn_attempts: 3,
        }
    }
}

/// What the master knows about one host.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelServerLoad {
    pub server: ServerId,
    pub report: LoadReport,
    pub load_value: f64,
    pub hosts_master: bool,
    /// Last report showed pressure; the host gets the longer timeout
    pub heavy: bool,
    pub last_report: u64,
    pub estimate_current: f64,
    pub estimate_previous: f64,
    /// Beats of spawn failures not yet forgotten or resolved by a success
    pub spawn_errors: Vec<u64>,
}

impl ChannelServerLoad {
    fn new(server: ServerId) -> Self {
        Self {
            server,
            report: LoadReport::default(),
            load_value: 0.0,
            hosts_master: false,
            heavy: false,
            last_report: 0,
            estimate_current: 0.0,
            estimate_previous: 0.0,
            spawn_errors: Vec::new(),
        }
    }

    /// Placement score; lower wins.
    pub fn score(&self, settings: &PlacementSettings, requester: Option<&ServerId>) -> f64 {
        let mut score = self.load_value + self.estimate_current + self.estimate_previous;
        score += settings.error_penalty * self.spawn_errors.len() as f64;
        if requester == Some(&self.server) {
            score -= settings.requester_bias;
        }
        score
    }
}

/// Instruction produced by the placement state.
#[derive(Debug, PartialEq)]
pub enum PlacementEvent<W> {
    /// Ask `host` to start `channel`; report back with the same `attempt`
    Spawn {
        channel: ChannelId,
        host: ServerId,
        attempt: u32,
    },
    /// Answer everyone waiting on `channel`
    Resolved {
        channel: ChannelId,
        waiters: Vec<W>,
        result: Result<ServerId, ChannelError>,
    },
}

#[derive(Debug)]
struct Queued<W> {
    waiter: W,
    requester: Option<ServerId>,
}

#[derive(Debug)]
struct Creating<W> {
    host: ServerId,
    started: u64,
    attempt: u32,
    tried: Vec<ServerId>,
    requester: Option<ServerId>,
    waiters: Vec<W>,
}

#[derive(Debug)]
struct Locked<W> {
    host: ServerId,
    since: u64,
    queued: Vec<Queued<W>>,
}

/// Host loads plus in-flight creates and destroy locks.
#[derive(Debug)]
pub struct PlacementState<W> {
    settings: PlacementSettings,
    hosts: BTreeMap<ServerId, ChannelServerLoad>,
    creating: HashMap<ChannelId, Creating<W>>,
    locked: HashMap<ChannelId, Locked<W>>,
    recently_created: HashMap<ChannelId, (ServerId, u64)>,
    spawns: u64,
    lost_hosts: u64,
}

/// A missing host endpoint (`NotFound`) is worth another host; a type no
/// host knows is not.
fn retryable(error: &ChannelError) -> bool {
    !matches!(
        error,
        ChannelError::Config(_)
            | ChannelError::Domain(_)
            | ChannelError::InvalidChannelId(_)
    )
}

impl<W> PlacementState<W> {
    pub fn new(settings: PlacementSettings) -> Self {
        Self {
            settings,
            hosts: BTreeMap::new(),
            creating: HashMap::new(),
            locked: HashMap::new(),
            recently_created: HashMap::new(),
            spawns: 0,
            lost_hosts: 0,
        }
    }

    pub fn settings(&self) -> &PlacementSettings {
        &self.settings
    }

    pub fn host(&self, server: &ServerId) -> Option<&ChannelServerLoad> {
        self.hosts.get(server)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &ChannelServerLoad> {
        self.hosts.values()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_creating(&self, channel: &ChannelId) -> bool {
        self.creating.contains_key(channel)
    }

    pub fn is_locked(&self, channel: &ChannelId) -> bool {
        self.locked.contains_key(channel)
    }

    pub fn creating_count(&self) -> usize {
        self.creating.len()
    }

    pub fn locked_count(&self) -> usize {
        self.locked.len()
    }

    /// Spawn requests issued so far, retries included.
    pub fn spawns(&self) -> u64 {
        self.spawns
    }

    pub fn lost_hosts(&self) -> u64 {
        self.lost_hosts
    }

    /// Records a load report and starts a new estimate round for the host.
    pub fn on_load(&mut self, server: ServerId, report: LoadReport, hosts_master: bool, beat: u64) {
        let weights = &self.settings.weights;
        let load_value = weights.load_value(&report, hosts_master);
        let heavy = weights.is_heavy(&report);
        let record = self.hosts.entry(server.clone()).or_insert_with(|| {
            info!(server = %server, "channel server joined placement");
            ChannelServerLoad::new(server.clone())
        });
        record.report = report;
        record.load_value = load_value;
        record.hosts_master = hosts_master;
        record.heavy = heavy;
        record.last_report = beat;
        record.estimate_previous = record.estimate_current;
        record.estimate_current = 0.0;
    }

    /// Best host for a new worker, skipping `exclude`.
    pub fn choose_host(&self, requester: Option<&ServerId>, exclude: &[ServerId]) -> Option<ServerId> {
        self.hosts
            .values()
            .filter(|h| !exclude.contains(&h.server))
            .min_by(|a, b| {
                a.score(&self.settings, requester)
                    .total_cmp(&b.score(&self.settings, requester))
            })
            .map(|h| h.server.clone())
    }

    fn start_spawn(&mut self, channel: &ChannelId, host: &ServerId, attempt: u32) -> PlacementEvent<W> {
        if let Some(record) = self.hosts.get_mut(host) {
            record.estimate_current += self.settings.spawn_estimate;
        }
        self.spawns += 1;
        debug!(channel = %channel, host = %host, attempt, "placing worker");
        PlacementEvent::Spawn {
            channel: channel.clone(),
            host: host.clone(),
            attempt,
        }
    }

    /// Handles a create request for `channel`.
    pub fn request_create(
        &mut self,
        channel: ChannelId,
        requester: Option<ServerId>,
        waiter: W,
        beat: u64,
    ) -> Vec<PlacementEvent<W>> {
        if let Some((host, _)) = self.recently_created.get(&channel) {
            return vec![PlacementEvent::Resolved {
                channel: channel.clone(),
                waiters: vec![waiter],
                result: Ok(host.clone()),
            }];
        }
        if let Some(lock) = self.locked.get_mut(&channel) {
            debug!(channel = %channel, "create queued behind destroy lock");
            lock.queued.push(Queued { waiter, requester });
            return Vec::new();
        }
        if let Some(creating) = self.creating.get_mut(&channel) {
            creating.waiters.push(waiter);
            return Vec::new();
        }
        let Some(host) = self.choose_host(requester.as_ref(), &[]) else {
            return vec![PlacementEvent::Resolved {
                channel,
                waiters: vec![waiter],
                result: Err(ChannelError::HostLost("no channel servers available".to_string())),
            }];
        };
        let event = self.start_spawn(&channel, &host, 1);
        self.creating.insert(
            channel,
            Creating {
                host: host.clone(),
                started: beat,
                attempt: 1,
                tried: vec![host],
                requester,
                waiters: vec![waiter],
            },
        );
        vec![event]
    }

    /// Handles the answer of a host to a spawn request.
    pub fn spawn_finished(
        &mut self,
        channel: &ChannelId,
        host: &ServerId,
        attempt: u32,
        result: Result<(), ChannelError>,
        beat: u64,
    ) -> Vec<PlacementEvent<W>> {
        let current = self
            .creating
            .get(channel)
            .is_some_and(|c| c.host == *host && c.attempt == attempt);
        if !current {
            debug!(channel = %channel, host = %host, attempt, "stale spawn result ignored");
            return Vec::new();
        }
        let Some(creating) = self.creating.remove(channel) else {
            return Vec::new();
        };
        match result {
            Ok(()) => {
                if let Some(record) = self.hosts.get_mut(host) {
                    record.spawn_errors.clear();
                }
                self.recently_created
                    .insert(channel.clone(), (host.clone(), beat));
                vec![PlacementEvent::Resolved {
                    channel: channel.clone(),
                    waiters: creating.waiters,
                    result: Ok(host.clone()),
                }]
            }
            Err(error) => self.fail_attempt(channel.clone(), creating, error, beat),
        }
    }

    fn fail_attempt(
        &mut self,
        channel: ChannelId,
        mut creating: Creating<W>,
        error: ChannelError,
        beat: u64,
    ) -> Vec<PlacementEvent<W>> {
        warn!(channel = %channel, host = %creating.host, attempt = creating.attempt, error = %error, "spawn failed");
        if let Some(record) = self.hosts.get_mut(&creating.host) {
            record.spawn_errors.push(beat);
        }
        if retryable(&error) && creating.attempt < self.settings.spawn_attempts {
            if let Some(next) = self.choose_host(creating.requester.as_ref(), &creating.tried) {
                creating.attempt += 1;
                creating.host = next.clone();
                creating.started = beat;
                creating.tried.push(next.clone());
                let event = self.start_spawn(&channel, &next, creating.attempt);
                self.creating.insert(channel, creating);
                return vec![event];
            }
        }
        vec![PlacementEvent::Resolved {
            channel,
            waiters: creating.waiters,
            result: Err(error),
        }]
    }

    /// Grants `host` the destroy lock on `channel` unless a create is in
    /// flight or someone else holds it.
    pub fn lock(&mut self, channel: &ChannelId, host: &ServerId, beat: u64) -> bool {
        if self.creating.contains_key(channel) {
            return false;
        }
        if let Some(existing) = self.locked.get_mut(channel) {
            if existing.host != *host {
                return false;
            }
            existing.since = beat;
            return true;
        }
        self.recently_created.remove(channel);
        self.locked.insert(
            channel.clone(),
            Locked {
                host: host.clone(),
                since: beat,
                queued: Vec::new(),
            },
        );
        true
    }

    /// Releases the destroy lock and places any creates that queued behind it.
    pub fn unlock(&mut self, channel: &ChannelId, beat: u64) -> Vec<PlacementEvent<W>> {
        let Some(lock) = self.locked.remove(channel) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        for queued in lock.queued {
            events.extend(self.request_create(channel.clone(), queued.requester, queued.waiter, beat));
        }
        events
    }

    /// Expires hosts, creates, locks, grace windows and old spawn errors.
    pub fn poll(&mut self, beat: u64) -> Vec<PlacementEvent<W>> {
        let mut events = Vec::new();
        let settings = &self.settings;

        let dead: Vec<ServerId> = self
            .hosts
            .values()
            .filter(|h| {
                let timeout = if h.heavy {
                    settings.heavy_host_timeout_beats
                } else {
                    settings.host_timeout_beats
                };
                beat.saturating_sub(h.last_report) > timeout
            })
            .map(|h| h.server.clone())
            .collect();
        for server in dead {
            warn!(server = %server, "channel server stopped reporting, dropping it");
            self.hosts.remove(&server);
            self.lost_hosts += 1;
            self.recently_created.retain(|_, (host, _)| *host != server);

            let lost: Vec<ChannelId> = self
                .creating
                .iter()
                .filter(|(_, c)| c.host == server)
                .map(|(id, _)| id.clone())
                .collect();
            for channel in lost {
                if let Some(creating) = self.creating.remove(&channel) {
                    let error = ChannelError::HostLost(server.to_string());
                    events.extend(self.fail_attempt(channel, creating, error, beat));
                }
            }
            let orphaned: Vec<ChannelId> = self
                .locked
                .iter()
                .filter(|(_, l)| l.host == server)
                .map(|(id, _)| id.clone())
                .collect();
            for channel in orphaned {
                events.extend(self.unlock(&channel, beat));
            }
        }

        let create_timeout = self.settings.create_timeout_beats;
        let stalled: Vec<ChannelId> = self
            .creating
            .iter()
            .filter(|(_, c)| beat.saturating_sub(c.started) >= create_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for channel in stalled {
            if let Some(creating) = self.creating.remove(&channel) {
                let error = ChannelError::Timeout(format!("spawn of {channel} on {}", creating.host));
                events.extend(self.fail_attempt(channel, creating, error, beat));
            }
        }

        let lock_timeout = self.settings.lock_timeout_beats;
        let expired: Vec<ChannelId> = self
            .locked
            .iter()
            .filter(|(_, l)| beat.saturating_sub(l.since) >= lock_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for channel in expired {
            warn!(channel = %channel, "destroy lock timed out, releasing");
            events.extend(self.unlock(&channel, beat));
        }

        let grace = self.settings.recently_created_beats;
        self.recently_created
            .retain(|_, (_, at)| beat.saturating_sub(*at) < grace);

        let forget = self.settings.error_forget_beats;
        for host in self.hosts.values_mut() {
            host.spawn_errors
                .retain(|at| beat.saturating_sub(*at) < forget);
        }
        events
    }
}
