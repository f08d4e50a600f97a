//! The `server.<id>` endpoint of a channel server. The master places
//! workers by asking it to start them; it also sends the host's load
//! reports.

use crate::error::ChannelError;
use crate::ids::{ChannelId, SERVER_TYPE};
use crate::master::WORKER_CREATE_VERB;
use crate::worker::{Incoming, Reply, WorkerContext, WorkerType, WorkerTypeBuilder};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct CreatePayload {
    #[serde(rename = "type")]
    channel_type: String,
    subid: String,
    #[serde(default)]
    attempt: u32,
}

fn worker_create(ctx: &mut WorkerContext, incoming: &Incoming) -> Result<Reply, ChannelError> {
    let payload: CreatePayload = incoming.parse()?;
    let channel = ChannelId::new(&payload.channel_type, &payload.subid)?;
    if channel.is_master() || channel.channel_type() == SERVER_TYPE {
        return Err(ChannelError::Domain(format!("{channel} is not placed on request")));
    }
    if !ctx.host().registry().contains(channel.channel_type()) {
        return Err(ChannelError::Config(format!(
            "unknown worker type {}",
            channel.channel_type()
        )));
    }
    if ctx.host().exchange().is_registered(&channel) {
        debug!(channel = %channel, "create for a running worker");
        return Ok(Reply::Value(json!({ "channel": channel, "existing": true })));
    }
    let token = ctx
        .defer()
        .ok_or_else(|| ChannelError::Domain(format!("{WORKER_CREATE_VERB} must be a request")))?;
    let host = Arc::clone(ctx.host());
    let handle = ctx.handle().clone();
    let attempt = payload.attempt;
    tokio::spawn(async move {
        let result = host
            .spawn_worker(channel.clone())
            .await
            .map(|_| json!({ "channel": channel, "existing": false }));
        if let Err(e) = &result {
            warn!(channel = %channel, attempt, error = %e, "worker create failed");
        }
        if handle.complete(token, result).is_err() {
            debug!(channel = %channel, "endpoint gone before create finished");
        }
    });
    Ok(Reply::Deferred)
}

fn worker_list(ctx: &mut WorkerContext, _incoming: &Incoming) -> Result<Reply, ChannelError> {
    let workers: Vec<String> = ctx
        .host()
        .worker_ids()
        .iter()
        .map(|id| id.to_string())
        .collect();
    Ok(Reply::Value(json!({
        "server": ctx.server_id(),
        "workers": workers,
    })))
}

/// Builds the `server` worker type.
pub fn worker_type() -> Result<WorkerType, ChannelError> {
    WorkerTypeBuilder::new(SERVER_TYPE)
        .handler(WORKER_CREATE_VERB, worker_create)
        .handler("worker_list", worker_list)
        .build()
}
