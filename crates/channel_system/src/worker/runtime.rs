//! # Worker Runtime
//!
//! The task driving one worker. It owns everything that must not be shared:
//! the ordering state towards every peer, the lifecycle machine, the commit
//! scheduler and the packet ring. A single `select!` loop multiplexes
//!
//! - frames from the exchange inbox,
//! - commands from [`WorkerHandle`]s,
//! - a housekeeping tick (forced recovery, acks, request timeouts,
//!   auto-destroy, commits).
//!
//! Every step runs to completion before the next one starts, so a handler
//! invocation is atomic with respect to its worker's state. The outbox the
//! handler filled is flushed at the end of the step.

use crate::error::ChannelError;
use crate::host::HostContext;
use crate::ids::ChannelId;
use crate::lifecycle::{Idleness, Lifecycle, LifecycleAction};
use crate::ordering::ReliableOrdering;
use crate::packet::{dump_bytes, Packet, PacketBody};
use crate::packet_log::{Direction, PacketRing, PacketSummary};
use crate::persistence::{CommitScheduler, CommitStart};
use crate::replication::{ReplicaView, SubscribeReply, UpdatePayload, APPLY_VERB, BATCH_VERB};
use crate::tree::{ChannelData, DataKey};
use crate::worker::config::WorkerSettings;
use crate::worker::context::{Continuation, Incoming, Outgoing, Reply, ReplyToken, WorkerContext};
use crate::worker::handle::{WorkerCommand, WorkerHandle};
use serde::Deserialize;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Verb of the fatal error report pushed to the master.
pub const ERROR_REPORT_VERB: &str = "error_report";

enum Waiter {
    External(oneshot::Sender<Result<Value, ChannelError>>),
    Continue(Continuation),
}

struct PendingRequest {
    dest: ChannelId,
    verb: String,
    deadline: u64,
    waiter: Waiter,
}

#[derive(Deserialize)]
struct SubscribePayload {
    #[serde(default)]
    fields: Vec<String>,
}

#[derive(Deserialize)]
struct SetPayload {
    key: String,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    quiet: bool,
}

#[derive(Deserialize)]
struct CommandPayload {
    line: String,
}

/// Starts a worker for `id` on `host`.
pub(crate) async fn spawn(host: Arc<HostContext>, id: ChannelId) -> Result<WorkerHandle, ChannelError> {
    if host.is_closing() {
        return Err(ChannelError::ShuttingDown);
    }
    if let Some(existing) = host.worker(&id) {
        if existing.is_alive() {
            return Ok(existing);
        }
    }
    let worker_type = host
        .registry()
        .get(id.channel_type())
        .ok_or_else(|| ChannelError::NotFound(format!("worker type {}", id.channel_type())))?;

    // claim the id before loading so a second instance fails fast
    let (inbox_tx, inbox) = mpsc::unbounded_channel();
    host.exchange().register(&id, inbox_tx)?;

    let mut commits = CommitScheduler::new(host.settings().commit_spacing());
    let data = if worker_type.persist() {
        match host.datastore().get(&id.storage_key()).await {
            Ok(Some(doc)) => {
                let data = ChannelData::from_persisted(doc);
                if let Ok(bytes) =
                    serde_json::to_vec(&data.persisted_document(worker_type.unpersisted_public()))
                {
                    commits = commits.with_baseline(bytes);
                }
                data
            }
            Ok(None) => ChannelData::default(),
            Err(e) => {
                host.exchange().unregister(&id);
                return Err(e);
            }
        }
    } else {
        ChannelData::default()
    };

    let (command_tx, commands) = mpsc::unbounded_channel();
    let handle = WorkerHandle::new(id.clone(), command_tx);
    let mut ctx = WorkerContext::new(
        id.clone(),
        Arc::clone(&worker_type),
        Arc::clone(&host),
        handle.clone(),
        data,
    );
    ctx.beat = host.exchange().liveness();

    let settings = host.settings().clone();
    let mut runtime = WorkerRuntime {
        ctx,
        inbox,
        commands,
        ordering: ReliableOrdering::new(settings.ordering),
        lifecycle: Lifecycle::new(worker_type.auto_destroy(), settings.idle_grace()),
        commits,
        ring: PacketRing::new(settings.packet_log_size),
        pending: HashMap::new(),
        next_request_id: 0,
        lock_held: false,
        shutdown_waiters: Vec::new(),
        settings,
    };

    if let Some(init) = worker_type.on_init.clone() {
        if let Err(e) = guarded(|| init(&mut runtime.ctx)) {
            host.exchange().unregister(&id);
            return Err(e);
        }
    }
    runtime.finish_step();

    host.insert_worker(handle.clone());
    debug!(channel = %id, server = %host.server_id(), "worker started");
    tokio::spawn(runtime.run());
    Ok(handle)
}

/// Runs handler code, turning a panic into a fatal handler error.
fn guarded<R>(f: impl FnOnce() -> Result<R, ChannelError>) -> Result<R, ChannelError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => Err(ChannelError::Handler(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic".to_string()
    }
}

struct WorkerRuntime {
    ctx: WorkerContext,
    inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    ordering: ReliableOrdering<Packet>,
    lifecycle: Lifecycle,
    commits: CommitScheduler,
    ring: PacketRing,
    pending: HashMap<u64, PendingRequest>,
    next_request_id: u64,
    lock_held: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    settings: WorkerSettings,
}

impl WorkerRuntime {
    async fn run(mut self) {
        let mut ticker = interval(self.settings.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                frame = self.inbox.recv() => match frame {
                    Some(frame) => self.on_frame(frame),
                    None => self.ctx.shutdown_requested = true,
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => self.ctx.shutdown_requested = true,
                },
                _ = ticker.tick() => self.on_tick(),
            }
            self.finish_step();
            if self.ctx.shutdown_requested || self.lifecycle.is_shutting_down() {
                break;
            }
        }
        self.shutdown().await;
    }

    fn id(&self) -> &ChannelId {
        self.ctx.id()
    }

    fn refresh_beat(&mut self) -> u64 {
        self.ctx.beat = self.ctx.host().exchange().liveness();
        self.ctx.beat
    }

    fn on_frame(&mut self, frame: Vec<u8>) {
        self.ctx.host().record_message();
        let beat = self.refresh_beat();
        let packet = match Packet::decode(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(
                    channel = %self.id(),
                    error = %e,
                    packet = %dump_bytes(&frame, self.settings.packet_dump_bytes),
                    "dropping undecodable packet"
                );
                return;
            }
        };
        if packet.seq.is_some() {
            self.ring.record(PacketSummary {
                direction: Direction::Inbound,
                peer: packet.src.clone(),
                seq: packet.seq,
                verb: packet.body.verb().to_string(),
                beat,
                bytes: frame.len(),
            });
        }
        if !packet.body.is_quiet() {
            trace!(channel = %self.id(), peer = %packet.src, seq = ?packet.seq, verb = packet.body.verb(), "packet in");
        }
        if packet.dst != *self.id() {
            warn!(channel = %self.id(), dst = %packet.dst, "dropping misrouted packet");
            return;
        }
        if let Some(ack) = packet.ack {
            self.ordering.on_ack(&packet.src, ack, beat);
        }
        let Some(seq) = packet.seq else {
            return;
        };
        if self.lifecycle.is_shutting_down() {
            self.reject(packet);
            return;
        }
        let src = packet.src.clone();
        let new_seq = packet.new_seq;
        let received = self.ordering.receive(&src, seq, new_seq, packet, beat);
        if received.duplicate {
            trace!(channel = %self.id(), peer = %src, seq, "duplicate packet dropped");
        }
        for packet in received.deliver {
            self.dispatch(packet);
        }
    }

    /// Answers a request that arrived while shutting down.
    fn reject(&mut self, packet: Packet) {
        if let PacketBody::Request { id, .. } = packet.body {
            self.respond(
                ReplyToken { to: packet.src, id },
                Err(ChannelError::ShuttingDown),
            );
        }
    }

    fn dispatch(&mut self, packet: Packet) {
        let incoming = match &packet.body {
            PacketBody::Response { id, result } => {
                let result = result.clone().map_err(ChannelError::from);
                self.on_response(&packet.src, *id, result);
                return;
            }
            PacketBody::Ack => return,
            PacketBody::Request { id, verb, payload } => Incoming {
                from: packet.src.clone(),
                verb: verb.clone(),
                payload: payload.clone(),
                response: None,
                request_id: Some(*id),
            },
            PacketBody::Push { verb, payload, .. } => {
                Incoming::push(packet.src.clone(), verb.clone(), payload.clone())
            }
        };
        self.deliver(incoming, Some(&packet));
    }

    /// Runs one message through its handler and answers it if it is a request.
    fn deliver(&mut self, incoming: Incoming, packet: Option<&Packet>) {
        self.lifecycle.note_activity();
        self.ctx.current = incoming.request_id.map(|id| ReplyToken {
            to: incoming.from.clone(),
            id,
        });
        let result = self.handle(&incoming);
        let token = self.ctx.current.take();
        if let Err(e) = &result {
            self.log_failure(&incoming, e, packet);
        }
        let Some(token) = token else {
            return;
        };
        match result {
            Ok(Reply::Value(value)) => self.respond(token, Ok(value)),
            Ok(Reply::Deferred) => {
                warn!(channel = %self.id(), verb = %incoming.verb, "handler deferred without taking its reply token");
                self.respond(
                    token,
                    Err(ChannelError::Handler(format!("{} left its request unanswered", incoming.verb))),
                );
            }
            Err(e) => self.respond(token, Err(e)),
        }
    }

    fn handle(&mut self, incoming: &Incoming) -> Result<Reply, ChannelError> {
        match incoming.verb.as_str() {
            "subscribe" => self.builtin_subscribe(incoming),
            "unsubscribe" => {
                self.ctx.subscribers.unsubscribe(&incoming.from)?;
                debug!(channel = %self.id(), subscriber = %incoming.from, "unsubscribed");
                Ok(Reply::ok())
            }
            "set_channel_data" => self.builtin_set(incoming),
            APPLY_VERB | BATCH_VERB => {
                let update: UpdatePayload = incoming.parse()?;
                match self.ctx.replicas.get_mut(&incoming.from) {
                    Some(replica) => replica.apply(&update.ops),
                    None => debug!(channel = %self.id(), source = %incoming.from, "update without replica"),
                }
                Ok(Reply::ok())
            }
            "cmd" => self.builtin_command(incoming),
            verb => {
                let handler = self.ctx.worker_type().handler(verb).cloned().ok_or_else(|| {
                    ChannelError::NotFound(format!(
                        "{} has no handler for {verb}",
                        self.ctx.worker_type().name()
                    ))
                })?;
                let ctx = &mut self.ctx;
                guarded(|| handler(ctx, incoming))
            }
        }
    }

    fn builtin_subscribe(&mut self, incoming: &Incoming) -> Result<Reply, ChannelError> {
        let payload: SubscribePayload = if incoming.payload.is_null() {
            SubscribePayload { fields: Vec::new() }
        } else {
            incoming.parse()?
        };
        if let Some(veto) = self.ctx.worker_type().on_subscribe.clone() {
            let ctx = &mut self.ctx;
            guarded(|| veto(ctx, &incoming.from, &payload.fields))?;
        }
        let public = self.ctx.data().public.clone();
        let reply = self
            .ctx
            .subscribers
            .subscribe(incoming.from.clone(), &payload.fields, &public)?;
        debug!(
            channel = %self.id(),
            subscriber = %incoming.from,
            subscribers = self.ctx.subscribers.len(),
            "subscribed"
        );
        Reply::json(&reply)
    }

    fn builtin_set(&mut self, incoming: &Incoming) -> Result<Reply, ChannelError> {
        let payload: SetPayload = incoming.parse()?;
        let result = DataKey::parse(&payload.key).and_then(|key| {
            if !self.ctx.worker_type().is_writable(&key) {
                return Err(ChannelError::FieldMismatch(format!("{key} is not writable")));
            }
            let value = payload.value.filter(|v| !v.is_null());
            self.ctx.set_with(&payload.key, value, payload.quiet)
        });
        match result {
            Ok(()) => Ok(Reply::ok()),
            Err(e) if payload.quiet => Err(ChannelError::Quiet(e.to_string())),
            Err(e) => Err(e),
        }
    }

    fn builtin_command(&mut self, incoming: &Incoming) -> Result<Reply, ChannelError> {
        let payload: CommandPayload = incoming.parse()?;
        let mut words = payload.line.split_whitespace();
        let name = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();
        let command = match self.ctx.worker_type().command(name) {
            Some(command) => command.clone(),
            None => {
                return Err(ChannelError::Domain(format!(
                    "unknown command {name:?}; available: {}",
                    self.ctx.worker_type().command_names().join(", ")
                )))
            }
        };
        info!(channel = %self.id(), from = %incoming.from, command = %payload.line, "admin command");
        let ctx = &mut self.ctx;
        let output = guarded(|| command(ctx, &args))?;
        Ok(Reply::Value(Value::String(output)))
    }

    fn log_failure(&mut self, incoming: &Incoming, error: &ChannelError, packet: Option<&Packet>) {
        if error.is_quiet() {
            trace!(channel = %self.id(), verb = %incoming.verb, error = %error, "quiet rejection");
        } else if error.is_fatal() {
            self.report_fatal(incoming, error, packet);
        } else if error.is_transient() {
            warn!(channel = %self.id(), peer = %incoming.from, verb = %incoming.verb, error = %error, "request failed");
        } else {
            debug!(channel = %self.id(), peer = %incoming.from, verb = %incoming.verb, error = %error, "request rejected");
        }
    }

    fn report_fatal(&mut self, incoming: &Incoming, error: &ChannelError, packet: Option<&Packet>) {
        let dump = packet
            .and_then(|p| p.encode().ok())
            .map(|bytes| dump_bytes(&bytes, self.settings.packet_dump_bytes))
            .unwrap_or_default();
        error!(
            channel = %self.id(),
            peer = %incoming.from,
            verb = %incoming.verb,
            error = %error,
            packet = %dump,
            "handler failed\nrecent packets:\n{}",
            self.ring.render()
        );
        if incoming.verb == ERROR_REPORT_VERB {
            return;
        }
        let report = json!({
            "channel": self.id(),
            "server": self.ctx.server_id(),
            "verb": incoming.verb,
            "error": error.to_string(),
        });
        if let Err(e) = self.send_packet(
            &ChannelId::master(),
            PacketBody::Push {
                verb: ERROR_REPORT_VERB.to_string(),
                payload: report,
                quiet: false,
            },
        ) {
            debug!(channel = %self.id(), error = %e, "could not report failure to master");
        }
    }

    fn on_response(&mut self, src: &ChannelId, id: u64, result: Result<Value, ChannelError>) {
        match self.pending.remove(&id) {
            Some(pending) => {
                if pending.dest != *src {
                    warn!(channel = %self.id(), expected = %pending.dest, got = %src, id, "response from unexpected peer");
                }
                self.complete_waiter(pending.dest, pending.waiter, result);
            }
            None => debug!(channel = %self.id(), peer = %src, id, "late response dropped"),
        }
    }

    fn complete_waiter(&mut self, dest: ChannelId, waiter: Waiter, result: Result<Value, ChannelError>) {
        match waiter {
            Waiter::External(reply) => {
                let _ = reply.send(result);
            }
            Waiter::Continue(Continuation::Handler { verb, payload }) => {
                let incoming = Incoming {
                    from: dest,
                    verb,
                    payload,
                    response: Some(result),
                    request_id: None,
                };
                self.deliver(incoming, None);
            }
            Waiter::Continue(Continuation::Subscribe(source)) => match result
                .and_then(|value| serde_json::from_value::<SubscribeReply>(value).map_err(ChannelError::from))
            {
                Ok(reply) => {
                    debug!(channel = %self.id(), source = %source, "replica installed");
                    self.ctx
                        .replicas
                        .insert(source.clone(), ReplicaView::new(source, reply));
                }
                Err(e) => warn!(channel = %self.id(), source = %source, error = %e, "subscribe failed"),
            },
            Waiter::Continue(Continuation::Lock) => self.on_lock_result(result),
            Waiter::Continue(Continuation::Ignore) => {}
        }
    }

    /// Stamps and sends one sequenced packet.
    fn send_packet(&mut self, dest: &ChannelId, body: PacketBody) -> Result<(), ChannelError> {
        let beat = self.ctx.beat;
        let header = self.ordering.next_send(dest, beat);
        let quiet = body.is_quiet();
        let packet = Packet {
            src: self.id().clone(),
            dst: dest.clone(),
            seq: Some(header.seq),
            new_seq: header.new_seq,
            ack: header.ack,
            body,
        };
        let frame = packet.encode()?;
        self.ring.record(PacketSummary {
            direction: Direction::Outbound,
            peer: dest.clone(),
            seq: Some(header.seq),
            verb: packet.body.verb().to_string(),
            beat,
            bytes: frame.len(),
        });
        if !quiet {
            trace!(channel = %self.id(), peer = %dest, seq = header.seq, new_seq = header.new_seq, verb = packet.body.verb(), "packet out");
        }
        if let Err(e) = self.ctx.host().exchange().send(dest, frame) {
            // the peer never saw this sequence number
            self.ordering.reset_send(dest);
            return Err(e);
        }
        Ok(())
    }

    fn send_request(&mut self, dest: ChannelId, verb: String, payload: Value, waiter: Waiter) {
        self.next_request_id += 1;
        let id = self.next_request_id;
        let body = PacketBody::Request {
            id,
            verb: verb.clone(),
            payload,
        };
        match self.send_packet(&dest, body) {
            Ok(()) => {
                let deadline = self.ctx.beat + self.settings.request_timeout_beats;
                self.pending.insert(
                    id,
                    PendingRequest {
                        dest,
                        verb,
                        deadline,
                        waiter,
                    },
                );
            }
            Err(e) => self.complete_waiter(dest, waiter, Err(e)),
        }
    }

    fn respond(&mut self, token: ReplyToken, result: Result<Value, ChannelError>) {
        let body = PacketBody::Response {
            id: token.id,
            result: result.map_err(|e| e.to_wire()),
        };
        if let Err(e) = self.send_packet(&token.to, body) {
            debug!(channel = %self.id(), peer = %token.to, error = %e, "response undeliverable");
        }
    }

    fn send_ack(&mut self, peer: &ChannelId, seq: u32) {
        let packet = Packet {
            src: self.id().clone(),
            dst: peer.clone(),
            seq: None,
            new_seq: false,
            ack: Some(seq),
            body: PacketBody::Ack,
        };
        let sent = packet
            .encode()
            .and_then(|frame| self.ctx.host().exchange().send(peer, frame));
        if let Err(e) = sent {
            debug!(channel = %self.id(), peer = %peer, seq, error = %e, "ack undeliverable");
        }
    }

    fn on_command(&mut self, command: WorkerCommand) {
        self.refresh_beat();
        match command {
            WorkerCommand::Request {
                dest,
                verb,
                payload,
                reply,
            } => self.send_request(dest, verb, payload, Waiter::External(reply)),
            WorkerCommand::Push {
                dest,
                verb,
                payload,
                quiet,
            } => {
                if let Err(e) = self.send_packet(&dest, PacketBody::Push { verb, payload, quiet }) {
                    debug!(channel = %self.id(), peer = %dest, error = %e, "push undeliverable");
                }
            }
            WorkerCommand::Local { verb, payload } => {
                let incoming = Incoming::push(self.id().clone(), verb, payload);
                self.deliver(incoming, None);
            }
            WorkerCommand::Complete { token, result } => self.respond(token, result),
            WorkerCommand::CommitDone { success } => self.commits.finish(success),
            WorkerCommand::Inspect(inspect) => inspect(&mut self.ctx),
            WorkerCommand::Shutdown { done } => {
                self.shutdown_waiters.push(done);
                self.ctx.shutdown_requested = true;
            }
        }
    }

    fn on_tick(&mut self) {
        let beat = self.refresh_beat();
        for recovered in self.ordering.poll_recovery(beat) {
            for packet in recovered.deliver {
                self.dispatch(packet);
            }
        }
        for (peer, seq) in self.ordering.take_pending_acks() {
            self.send_ack(&peer, seq);
        }
        self.ordering.forget_idle(beat);

        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= beat)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                let error = ChannelError::Timeout(format!("{} to {}", pending.verb, pending.dest));
                self.complete_waiter(pending.dest, pending.waiter, Err(error));
            }
        }

        if let Some(hook) = self.ctx.worker_type().on_tick.clone() {
            let ctx = &mut self.ctx;
            if let Err(e) = guarded(|| {
                hook(ctx);
                Ok(())
            }) {
                let incoming = Incoming::push(self.id().clone(), "on_tick".to_string(), Value::Null);
                self.report_fatal(&incoming, &e, None);
            }
        }

        let idle = self.idleness();
        if self.lifecycle.poll(idle, Instant::now()) == LifecycleAction::RequestLock {
            self.request_lock();
        }
    }

    fn idleness(&self) -> Idleness {
        Idleness {
            subscribers: self.ctx.subscribers.len(),
            pending_inbound: self.ordering.pending_count(),
            pending_write: self.commits.is_pending() || self.ctx.dirty,
            outstanding_requests: self
                .pending
                .values()
                .filter(|p| !matches!(p.waiter, Waiter::Continue(Continuation::Lock)))
                .count(),
        }
    }

    fn request_lock(&mut self) {
        debug!(channel = %self.id(), "idle, asking master for destroy lock");
        let payload = json!({
            "channel": self.id(),
            "server": self.ctx.server_id(),
            "instance": self.ctx.host().instance_id(),
        });
        self.send_request(
            ChannelId::master(),
            "master_lock".to_string(),
            payload,
            Waiter::Continue(Continuation::Lock),
        );
    }

    fn on_lock_result(&mut self, result: Result<Value, ChannelError>) {
        let granted = matches!(result, Ok(Value::Bool(true)));
        if let Err(e) = &result {
            debug!(channel = %self.id(), error = %e, "destroy lock not obtained");
        }
        let idle = self.idleness();
        match self.lifecycle.on_lock_result(granted, idle) {
            LifecycleAction::Shutdown => {
                self.lock_held = true;
                info!(channel = %self.id(), "auto-destroying idle worker");
            }
            LifecycleAction::ReleaseLock => {
                debug!(channel = %self.id(), "activity during lock, staying alive");
                self.send_unlock();
            }
            _ => {}
        }
    }

    fn send_unlock(&mut self) {
        let body = PacketBody::Push {
            verb: "master_unlock".to_string(),
            payload: json!({ "channel": self.id() }),
            quiet: false,
        };
        if let Err(e) = self.send_packet(&ChannelId::master(), body) {
            warn!(channel = %self.id(), error = %e, "could not release destroy lock");
        }
    }

    /// Flushes the outbox and schedules persistence after a step.
    fn finish_step(&mut self) {
        if self.ctx.subscribers.has_batched() {
            self.ctx.flush_batch();
        }
        while !self.ctx.outbox.is_empty() {
            let outbox = std::mem::take(&mut self.ctx.outbox);
            for outgoing in outbox {
                match outgoing {
                    Outgoing::Push {
                        dest,
                        verb,
                        payload,
                        quiet,
                    } => {
                        if let Err(e) =
                            self.send_packet(&dest, PacketBody::Push { verb, payload, quiet })
                        {
                            debug!(channel = %self.id(), peer = %dest, error = %e, "push undeliverable");
                        }
                    }
                    Outgoing::Request {
                        dest,
                        verb,
                        payload,
                        continuation,
                    } => self.send_request(dest, verb, payload, Waiter::Continue(continuation)),
                    Outgoing::Response { token, result } => self.respond(token, result),
                }
            }
        }
        if std::mem::take(&mut self.ctx.dirty) && self.ctx.worker_type().persist() {
            self.commits.mark_dirty();
        }
        self.maybe_commit();
    }

    fn persisted_document(&self) -> Result<(Value, Vec<u8>), ChannelError> {
        let doc = self
            .ctx
            .data()
            .persisted_document(self.ctx.worker_type().unpersisted_public());
        let bytes = serde_json::to_vec(&doc)?;
        Ok((doc, bytes))
    }

    fn maybe_commit(&mut self) {
        let now = Instant::now();
        if !self.commits.due(now) {
            return;
        }
        let (doc, bytes) = match self.persisted_document() {
            Ok(doc) => doc,
            Err(e) => {
                error!(channel = %self.id(), error = %e, "cannot serialize channel data");
                return;
            }
        };
        if self.commits.begin(bytes, now) == CommitStart::Unchanged {
            trace!(channel = %self.id(), "commit skipped, content unchanged");
            return;
        }
        let datastore = Arc::clone(self.ctx.host().datastore());
        let key = self.id().storage_key();
        let handle = self.ctx.handle().clone();
        tokio::spawn(async move {
            let result = datastore.set(&key, doc).await;
            if let Err(e) = &result {
                warn!(key = %key, error = %e, "channel commit failed");
            }
            let _ = handle.command(WorkerCommand::CommitDone {
                success: result.is_ok(),
            });
        });
    }

    /// Waits out an in-flight write, then writes whatever is still dirty.
    async fn final_commit(&mut self) {
        while self.commits.in_flight() {
            match self.commands.recv().await {
                Some(WorkerCommand::CommitDone { success }) => self.commits.finish(success),
                Some(WorkerCommand::Shutdown { done }) => self.shutdown_waiters.push(done),
                Some(_) => {}
                None => break,
            }
        }
        if !self.commits.is_dirty() {
            return;
        }
        let (doc, bytes) = match self.persisted_document() {
            Ok(doc) => doc,
            Err(e) => {
                error!(channel = %self.id(), error = %e, "cannot serialize channel data");
                return;
            }
        };
        if self.commits.begin(bytes, Instant::now()) == CommitStart::Write {
            let key = self.id().storage_key();
            let result = self.ctx.host().datastore().set(&key, doc).await;
            if let Err(e) = &result {
                error!(channel = %self.id(), error = %e, "final commit failed");
            }
            self.commits.finish(result.is_ok());
        }
    }

    async fn shutdown(mut self) {
        let id = self.id().clone();
        let host = Arc::clone(self.ctx.host());
        self.lifecycle.begin_shutdown();
        host.remove_worker(&id);
        host.exchange().unregister(&id);

        while let Ok(frame) = self.inbox.try_recv() {
            if let Ok(packet) = Packet::decode(&frame) {
                if packet.seq.is_some() {
                    self.reject(packet);
                }
            }
        }
        if self.ctx.worker_type().persist() {
            if std::mem::take(&mut self.ctx.dirty) {
                self.commits.mark_dirty();
            }
            self.final_commit().await;
        }
        for (_, pending) in self.pending.drain() {
            if let Waiter::External(reply) = pending.waiter {
                let _ = reply.send(Err(ChannelError::ShuttingDown));
            }
        }
        // handles report the worker dead from here on
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let WorkerCommand::Shutdown { done } = command {
                self.shutdown_waiters.push(done);
            }
        }
        let dropped = self.ctx.subscribers.clear();
        if !dropped.is_empty() {
            debug!(channel = %id, subscribers = dropped.len(), "dropping subscribers");
        }
        if self.lock_held {
            self.send_unlock();
        }
        self.lifecycle.finish();
        info!(channel = %id, server = %host.server_id(), "worker destroyed");
        for done in self.shutdown_waiters.drain(..) {
            let _ = done.send(());
        }
    }
}
