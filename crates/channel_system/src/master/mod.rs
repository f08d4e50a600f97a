//! # Master Worker
//!
//! The singleton `master.0` channel. It tracks the load of every channel
//! server, places new workers, arbitrates auto-destroy locks and answers
//! readiness queries. Its state lives in a [`MasterState`] extension; the
//! handlers below only translate messages to and from it.
//!
//! | verb | kind | effect |
//! |---|---|---|
//! | `worker_create_req` | request | place `{type, subid}`; answers `{channel, server}` |
//! | `load` | push/request | record a host's [`LoadReport`] |
//! | `master_lock` | request | `true` if the caller may destroy `channel` |
//! | `master_unlock` | push | release a lock, replay queued creates |
//! | `error_report` | push | log and count a fatal worker error |
//! | `ready_query` | request | `null` or an error |
//! | `deploy_ready_query` | request | `null` once the cluster is quiet |

pub mod placement;
pub mod readiness;

pub use placement::{ChannelServerLoad, PlacementEvent, PlacementSettings, PlacementState};
pub use readiness::{compare_versions, Readiness, ReadinessSettings};

use crate::error::ChannelError;
use crate::ids::{ChannelId, ServerId, MASTER_TYPE, SERVER_TYPE};
use crate::load_bias::LoadReport;
use crate::worker::{Incoming, Reply, ReplyToken, WorkerContext, WorkerType, WorkerTypeBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Verb a channel server's endpoint handles to start a worker.
pub const WORKER_CREATE_VERB: &str = "worker_create";
/// Verb anyone sends the master to get a worker placed.
pub const WORKER_CREATE_REQ_VERB: &str = "worker_create_req";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterSettings {
    pub placement: PlacementSettings,
    pub readiness: ReadinessSettings,
}

impl MasterSettings {
    /// Checks values that would stall placement or readiness.
    pub fn validate(&self) -> Result<(), String> {
        let p = &self.placement;
        if p.spawn_attempts == 0 {
            return Err("master.placement.spawn_attempts must be at least 1".to_string());
        }
        if p.host_timeout_beats == 0 || p.create_timeout_beats == 0 || p.lock_timeout_beats == 0 {
            return Err("master.placement timeouts must be greater than 0".to_string());
        }
        if p.heavy_host_timeout_beats < p.host_timeout_beats {
            return Err(
                "master.placement.heavy_host_timeout_beats must not be below host_timeout_beats"
                    .to_string(),
            );
        }
        if self.readiness.quiesce_checks == 0 {
            return Err("master.readiness.quiesce_checks must be at least 1".to_string());
        }
        for (platform, version) in &self.readiness.min_client_versions {
            if version.split('.').any(|part| part.trim().parse::<u64>().is_err()) {
                return Err(format!(
                    "master.readiness.min_client_versions.{platform} is not a dotted version: {version:?}"
                ));
            }
        }
        Ok(())
    }
}

/// Body of `worker_create_req`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    #[serde(rename = "type")]
    pub channel_type: String,
    pub subid: String,
    /// Host to favour, normally the requester's own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerId>,
}

impl CreateRequest {
    pub fn new(channel: &ChannelId, requester: Option<&ServerId>) -> Self {
        Self {
            channel_type: channel.channel_type().to_string(),
            subid: channel.subid().to_string(),
            server: requester.cloned(),
        }
    }

    pub fn channel(&self) -> Result<ChannelId, ChannelError> {
        ChannelId::new(&self.channel_type, &self.subid)
    }
}

/// Body of `worker_create`, master to host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    #[serde(rename = "type")]
    pub channel_type: String,
    pub subid: String,
    pub attempt: u32,
    pub server: ServerId,
}

#[derive(Debug, Deserialize)]
struct LockRequest {
    channel: ChannelId,
    server: ServerId,
    #[serde(default)]
    instance: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UnlockRequest {
    channel: ChannelId,
}

#[derive(Debug, Deserialize)]
struct ErrorReport {
    channel: String,
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    verb: String,
    error: String,
}

#[derive(Debug, Default, Deserialize)]
struct ReadyQuery {
    #[serde(default, alias = "plat")]
    platform: Option<String>,
    #[serde(default, alias = "ver")]
    version: Option<String>,
}

/// Master state, one per master instance.
#[derive(Debug)]
pub struct MasterState {
    placement: PlacementState<ReplyToken>,
    readiness: Readiness,
}

impl MasterState {
    pub fn new(settings: MasterSettings) -> Self {
        Self {
            placement: PlacementState::new(settings.placement),
            readiness: Readiness::new(settings.readiness),
        }
    }

    pub fn placement(&self) -> &PlacementState<ReplyToken> {
        &self.placement
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    fn busy(&self) -> bool {
        self.placement.host_count() == 0
            || self.placement.creating_count() > 0
            || self.placement.locked_count() > 0
    }

    /// Human-readable load table for the `load` command.
    pub fn load_summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<16} {:>10} {:>6} {:>6} {:>8} {:>6} {:>8} {:>7} {:>6}",
            "server", "load", "cpu", "host", "mem_mb", "free", "msgs/s", "workers", "errors"
        );
        for host in self.placement.hosts() {
            let r = &host.report;
            let _ = writeln!(
                out,
                "{:<16} {:>10.1} {:>6.1} {:>6.1} {:>8.0} {:>6.1} {:>8.1} {:>7} {:>6}{}",
                host.server.to_string(),
                host.load_value,
                r.cpu,
                r.host_cpu,
                r.mem_mb,
                r.free_mem,
                r.msgs_per_sec,
                r.total_workers(),
                host.spawn_errors.len(),
                if host.hosts_master { " (master)" } else { "" }
            );
        }
        let _ = write!(
            out,
            "creating {} locked {} spawns {} lost hosts {} error reports {}",
            self.placement.creating_count(),
            self.placement.locked_count(),
            self.placement.spawns(),
            self.placement.lost_hosts(),
            self.readiness.error_reports()
        );
        out
    }
}

/// Turns placement events into messages.
fn apply_events(ctx: &mut WorkerContext, events: Vec<PlacementEvent<ReplyToken>>) {
    for event in events {
        match event {
            PlacementEvent::Spawn {
                channel,
                host,
                attempt,
            } => {
                let request = SpawnRequest {
                    channel_type: channel.channel_type().to_string(),
                    subid: channel.subid().to_string(),
                    attempt,
                    server: host.clone(),
                };
                match serde_json::to_value(&request) {
                    Ok(payload) => ctx.request(
                        &ChannelId::server(&host),
                        WORKER_CREATE_VERB,
                        payload,
                        "spawn_result",
                    ),
                    Err(e) => warn!(channel = %channel, error = %e, "cannot encode spawn request"),
                }
            }
            PlacementEvent::Resolved {
                channel,
                waiters,
                result,
            } => {
                match &result {
                    Ok(host) => debug!(channel = %channel, host = %host, waiters = waiters.len(), "create resolved"),
                    Err(e) => warn!(channel = %channel, error = %e, waiters = waiters.len(), "create failed"),
                }
                for token in waiters {
                    let answer = result
                        .clone()
                        .map(|host| json!({ "channel": channel, "server": host }));
                    ctx.respond(token, answer);
                }
            }
        }
    }
}

/// Host a message came from, when it came from a server endpoint.
fn sender_server(from: &ChannelId) -> Option<ServerId> {
    (from.channel_type() == SERVER_TYPE).then(|| ServerId::new(from.subid()))
}

fn create_req(ctx: &mut WorkerContext, incoming: &Incoming) -> Result<Reply, ChannelError> {
    let request: CreateRequest = incoming.parse()?;
    let channel = request.channel()?;
    if channel.is_master() {
        return Err(ChannelError::Domain("the master is not placed".to_string()));
    }
    let requester = request.server.or_else(|| sender_server(&incoming.from));
    let token = ctx.defer().ok_or_else(|| {
        ChannelError::Domain(format!("{WORKER_CREATE_REQ_VERB} must be a request"))
    })?;
    let beat = ctx.beat();
    ctx.with_ext(|state: &mut MasterState, ctx| {
        let events = state
            .placement
            .request_create(channel, requester, token, beat);
        apply_events(ctx, events);
    })?;
    Ok(Reply::Deferred)
}

fn spawn_result(ctx: &mut WorkerContext, incoming: &Incoming) -> Result<Reply, ChannelError> {
    let request: SpawnRequest = incoming.parse()?;
    let channel = ChannelId::new(&request.channel_type, &request.subid)?;
    let result = incoming.response().map(|_| ());
    let beat = ctx.beat();
    ctx.with_ext(|state: &mut MasterState, ctx| {
        let events =
            state
                .placement
                .spawn_finished(&channel, &request.server, request.attempt, result, beat);
        apply_events(ctx, events);
    })?;
    Ok(Reply::ok())
}

fn load(ctx: &mut WorkerContext, incoming: &Incoming) -> Result<Reply, ChannelError> {
    let server = sender_server(&incoming.from).ok_or_else(|| {
        ChannelError::Domain(format!("load report from non-server {}", incoming.from))
    })?;
    let report: LoadReport = incoming.parse()?;
    let hosts_master = server == *ctx.server_id();
    let beat = ctx.beat();
    ctx.with_ext(|state: &mut MasterState, _| {
        state.placement.on_load(server, report, hosts_master, beat);
    })?;
    Ok(Reply::ok())
}

fn master_lock(ctx: &mut WorkerContext, incoming: &Incoming) -> Result<Reply, ChannelError> {
    let request: LockRequest = incoming.parse()?;
    let beat = ctx.beat();
    let granted = ctx.with_ext(|state: &mut MasterState, _| {
        state.placement.lock(&request.channel, &request.server, beat)
    })?;
    debug!(
        channel = %request.channel,
        server = %request.server,
        instance = ?request.instance,
        granted,
        "destroy lock requested"
    );
    Ok(Reply::Value(Value::Bool(granted)))
}

fn master_unlock(ctx: &mut WorkerContext, incoming: &Incoming) -> Result<Reply, ChannelError> {
    let request: UnlockRequest = incoming.parse()?;
    let beat = ctx.beat();
    ctx.with_ext(|state: &mut MasterState, ctx| {
        let events = state.placement.unlock(&request.channel, beat);
        apply_events(ctx, events);
    })?;
    debug!(channel = %request.channel, "destroy lock released");
    Ok(Reply::ok())
}

fn error_report(ctx: &mut WorkerContext, incoming: &Incoming) -> Result<Reply, ChannelError> {
    let report: ErrorReport = incoming.parse()?;
    warn!(
        channel = %report.channel,
        server = report.server.as_deref().unwrap_or("?"),
        verb = %report.verb,
        error = %report.error,
        "worker error reported"
    );
    ctx.with_ext(|state: &mut MasterState, _| state.readiness.note_error_report())?;
    Ok(Reply::ok())
}

fn ready_query(ctx: &mut WorkerContext, incoming: &Incoming) -> Result<Reply, ChannelError> {
    let query: ReadyQuery = if incoming.payload.is_null() {
        ReadyQuery::default()
    } else {
        incoming.parse()?
    };
    let state = ctx
        .ext::<MasterState>()
        .ok_or_else(|| ChannelError::Config("master has no state".to_string()))?;
    if state.placement.host_count() == 0 {
        return Err(ChannelError::Domain("no channel servers reporting".to_string()));
    }
    state
        .readiness
        .ready(query.platform.as_deref(), query.version.as_deref(), Instant::now())?;
    Ok(Reply::ok())
}

fn deploy_ready_query(ctx: &mut WorkerContext, _incoming: &Incoming) -> Result<Reply, ChannelError> {
    ctx.with_ext(|state: &mut MasterState, _| {
        let busy = state.busy();
        state.readiness.deploy_check(busy)
    })??;
    Ok(Reply::ok())
}

fn restart_command(ctx: &mut WorkerContext, args: &[&str]) -> Result<String, ChannelError> {
    let now = Instant::now();
    let state = ctx
        .ext_mut::<MasterState>()
        .ok_or_else(|| ChannelError::Config("master has no state".to_string()))?;
    match args {
        ["cancel"] => Ok(if state.readiness.cancel_restart() {
            info!("restart cancelled");
            "restart cancelled".to_string()
        } else {
            "no restart scheduled".to_string()
        }),
        [secs] => {
            let secs: u64 = secs
                .parse()
                .map_err(|_| ChannelError::Domain(format!("invalid seconds {secs:?}")))?;
            state
                .readiness
                .schedule_restart(Duration::from_secs(secs), now);
            info!(seconds = secs, "restart scheduled");
            Ok(format!("restart in {secs}s, readiness now failing"))
        }
        [] => Ok(match state.readiness.restart_remaining(now) {
            Some(left) => format!("restart in {}s", left.as_secs()),
            None => "no restart scheduled".to_string(),
        }),
        _ => Err(ChannelError::Domain("usage: restart <secs>|cancel".to_string())),
    }
}

fn load_command(ctx: &mut WorkerContext, _args: &[&str]) -> Result<String, ChannelError> {
    ctx.ext::<MasterState>()
        .map(MasterState::load_summary)
        .ok_or_else(|| ChannelError::Config("master has no state".to_string()))
}

fn force_ready_command(ctx: &mut WorkerContext, _args: &[&str]) -> Result<String, ChannelError> {
    ctx.with_ext(|state: &mut MasterState, _| state.readiness.force_ready())?;
    info!("deploy readiness forced");
    Ok("deploy readiness forced".to_string())
}

fn tick(ctx: &mut WorkerContext) {
    let beat = ctx.beat();
    let result = ctx.with_ext(|state: &mut MasterState, ctx| {
        let events = state.placement.poll(beat);
        apply_events(ctx, events);
    });
    if let Err(e) = result {
        warn!(error = %e, "master tick skipped");
    }
}

/// Builds the `master` worker type.
pub fn worker_type(settings: MasterSettings) -> Result<WorkerType, ChannelError> {
    WorkerTypeBuilder::new(MASTER_TYPE)
        .extension_with(move || MasterState::new(settings.clone()))
        .handler(WORKER_CREATE_REQ_VERB, create_req)
        .handler("spawn_result", spawn_result)
        .handler("load", load)
        .handler("master_lock", master_lock)
        .handler("master_unlock", master_unlock)
        .handler(crate::worker::ERROR_REPORT_VERB, error_report)
        .handler("ready_query", ready_query)
        .handler("deploy_ready_query", deploy_ready_query)
        .command("restart", restart_command)
        .command("load", load_command)
        .command("force_ready", force_ready_command)
        .on_tick(tick)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_shape() {
        let channel: ChannelId = "room.42".parse().unwrap();
        let request = CreateRequest::new(&channel, Some(&ServerId::new("h1")));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value, json!({ "type": "room", "subid": "42", "server": "h1" }));
        assert_eq!(request.channel().unwrap(), channel);
    }

    #[test]
    fn test_settings_validation() {
        assert!(MasterSettings::default().validate().is_ok());

        let mut settings = MasterSettings::default();
        settings.placement.spawn_attempts = 0;
        assert!(settings.validate().is_err());

        let mut settings = MasterSettings::default();
        settings.placement.heavy_host_timeout_beats = 1;
        assert!(settings.validate().is_err());

        let mut settings = MasterSettings::default();
        settings
            .readiness
            .min_client_versions
            .insert("ios".to_string(), "1.x".to_string());
        assert!(settings.validate().unwrap_err().contains("ios"));
    }

    #[test]
    fn test_sender_server() {
        let from = ChannelId::server(&ServerId::new("h7"));
        assert_eq!(sender_server(&from), Some(ServerId::new("h7")));
        assert_eq!(sender_server(&"room.1".parse().unwrap()), None);
    }

    #[test]
    fn test_master_type_builds() {
        let master = worker_type(MasterSettings::default()).unwrap();
        assert_eq!(master.name(), MASTER_TYPE);
        assert!(!master.auto_destroy());
        assert_eq!(master.command_names(), vec!["force_ready", "load", "restart"]);
    }

    #[test]
    fn test_load_summary_lists_hosts() {
        let mut state = MasterState::new(MasterSettings::default());
        state
            .placement
            .on_load(ServerId::new("h1"), LoadReport::default(), true, 0);
        let summary = state.load_summary();
        assert!(summary.contains("h1"));
        assert!(summary.contains("(master)"));
        assert!(summary.contains("creating 0"));
    }
}
