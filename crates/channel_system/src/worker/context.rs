//! # Worker Context
//!
//! The handle a handler gets on its own worker. Everything a handler does
//! goes through it: reading and mutating channel data, replying, messaging
//! other channels, subscribing to them and keeping typed per-instance state.
//!
//! Handlers run to completion without yielding. Messages they produce are
//! queued in an outbox and sent by the runtime, in order, once the handler
//! returns.

use crate::error::ChannelError;
use crate::host::HostContext;
use crate::ids::{ChannelId, ServerId};
use crate::replication::{
    ReplicaView, Subscribers, UpdatePayload, APPLY_VERB, BATCH_VERB,
};
use crate::tree::{ChannelData, DataKey, DataOp};
use crate::worker::descriptor::WorkerType;
use crate::worker::handle::WorkerHandle;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// A message handed to a handler.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub from: ChannelId,
    pub verb: String,
    pub payload: Value,
    /// Result of an earlier [`WorkerContext::request`] this message continues
    pub response: Option<Result<Value, ChannelError>>,
    pub(crate) request_id: Option<u64>,
}

impl Incoming {
    pub(crate) fn push(from: ChannelId, verb: String, payload: Value) -> Self {
        Self {
            from,
            verb,
            payload,
            response: None,
            request_id: None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.request_id.is_some()
    }

    /// Deserializes the payload.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ChannelError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ChannelError::Domain(format!("invalid {} payload: {e}", self.verb)))
    }

    /// The continued request's result.
    pub fn response(&self) -> Result<&Value, ChannelError> {
        match &self.response {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => Err(e.clone()),
            None => Err(ChannelError::Domain(format!(
                "{} is not a response continuation",
                self.verb
            ))),
        }
    }
}

/// What a handler answers.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Respond now; ignored for pushes
    Value(Value),
    /// The handler took the reply token and will respond later
    Deferred,
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Value(Value::Null)
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, ChannelError> {
        Ok(Reply::Value(serde_json::to_value(value)?))
    }
}

/// Right to answer one request, possibly from a later handler or a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyToken {
    pub(crate) to: ChannelId,
    pub(crate) id: u64,
}

impl ReplyToken {
    pub fn requester(&self) -> &ChannelId {
        &self.to
    }
}

/// What the runtime does with a response to an outbound request.
#[derive(Debug, Clone)]
pub(crate) enum Continuation {
    /// Dispatch to the named local handler
    Handler { verb: String, payload: Value },
    /// Install a replica of the source
    Subscribe(ChannelId),
    /// Answer of the master to `master_lock`
    Lock,
    Ignore,
}

#[derive(Debug)]
pub(crate) enum Outgoing {
    Push {
        dest: ChannelId,
        verb: String,
        payload: Value,
        quiet: bool,
    },
    Request {
        dest: ChannelId,
        verb: String,
        payload: Value,
        continuation: Continuation,
    },
    Response {
        token: ReplyToken,
        result: Result<Value, ChannelError>,
    },
}

/// Typed per-instance state, one value per type.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl Extensions {
    pub fn insert<T: Any + Send>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub(crate) fn insert_boxed(&mut self, type_id: TypeId, value: Box<dyn Any + Send>) {
        self.map.insert(type_id, value);
    }

    pub fn get<T: Any + Send>(&self) -> Option<&T> {
        self.map.get(&TypeId::of::<T>())?.downcast_ref::<T>()
    }

    pub fn get_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.map.get_mut(&TypeId::of::<T>())?.downcast_mut::<T>()
    }

    pub fn remove<T: Any + Send>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// A worker's view of itself while handling a message.
pub struct WorkerContext {
    id: ChannelId,
    worker_type: Arc<WorkerType>,
    host: Arc<HostContext>,
    handle: WorkerHandle,
    data: ChannelData,
    pub(crate) subscribers: Subscribers,
    pub(crate) replicas: HashMap<ChannelId, ReplicaView>,
    extensions: Extensions,
    pub(crate) outbox: Vec<Outgoing>,
    pub(crate) dirty: bool,
    pub(crate) beat: u64,
    pub(crate) current: Option<ReplyToken>,
    pub(crate) shutdown_requested: bool,
}

impl WorkerContext {
    pub(crate) fn new(
        id: ChannelId,
        worker_type: Arc<WorkerType>,
        host: Arc<HostContext>,
        handle: WorkerHandle,
        data: ChannelData,
    ) -> Self {
        let mut extensions = Extensions::default();
        for slot in &worker_type.extensions {
            extensions.insert_boxed(slot.type_id, (slot.init)());
        }
        Self {
            id,
            worker_type,
            host,
            handle,
            data,
            subscribers: Subscribers::new(),
            replicas: HashMap::new(),
            extensions,
            outbox: Vec::new(),
            dirty: false,
            beat: 0,
            current: None,
            shutdown_requested: false,
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn worker_type(&self) -> &Arc<WorkerType> {
        &self.worker_type
    }

    pub fn host(&self) -> &Arc<HostContext> {
        &self.host
    }

    pub fn server_id(&self) -> &ServerId {
        self.host.server_id()
    }

    /// Handle for tasks that report back to this worker.
    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    /// Liveness beat at which the current message is handled.
    pub fn beat(&self) -> u64 {
        self.beat
    }

    pub fn data(&self) -> &ChannelData {
        &self.data
    }

    pub fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    /// Reads a full key such as `public.topic`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let key = DataKey::parse(key).ok()?;
        self.data.get(&key)
    }

    /// Sets `key`, deleting it when `value` is `None`, and replicates the
    /// change to matching subscribers right away.
    pub fn set(&mut self, key: &str, value: Option<Value>) -> Result<(), ChannelError> {
        self.set_with(key, value, false)
    }

    /// [`WorkerContext::set`] whose replication pushes skip per-packet logging.
    pub fn set_quiet(&mut self, key: &str, value: Option<Value>) -> Result<(), ChannelError> {
        self.set_with(key, value, true)
    }

    pub(crate) fn set_with(&mut self, key: &str, value: Option<Value>, quiet: bool) -> Result<(), ChannelError> {
        let key = DataKey::parse(key)?;
        let op = self.data.set(&key, value);
        self.record(&key, op, false, quiet);
        Ok(())
    }

    /// Appends to the array at `key`.
    pub fn append(&mut self, key: &str, values: Vec<Value>) -> Result<(), ChannelError> {
        let key = DataKey::parse(key)?;
        let op = self.data.append(&key, values);
        self.record(&key, op, false, false);
        Ok(())
    }

    /// Sets `key` and holds the replication back until [`WorkerContext::flush_batch`].
    pub fn batched_set(&mut self, key: &str, value: Option<Value>) -> Result<(), ChannelError> {
        let key = DataKey::parse(key)?;
        let op = self.data.set(&key, value);
        self.record(&key, op, true, false);
        Ok(())
    }

    /// Sends every subscriber its combined batched changes as one message.
    pub fn flush_batch(&mut self) {
        for (dest, ops) in self.subscribers.take_batches() {
            self.outbox.push(Outgoing::Push {
                dest,
                verb: BATCH_VERB.to_string(),
                payload: json!(UpdatePayload { ops }),
                quiet: false,
            });
        }
    }

    fn record(&mut self, key: &DataKey, op: DataOp, batched: bool, quiet: bool) {
        self.dirty = true;
        if !key.is_public() {
            return;
        }
        if batched {
            self.subscribers.batch(&op, &self.data.public);
            return;
        }
        // keep earlier batched changes ahead of this one
        if self.subscribers.has_batched() {
            self.flush_batch();
        }
        for (dest, ops) in self.subscribers.fanout(&op, &self.data.public) {
            self.outbox.push(Outgoing::Push {
                dest,
                verb: APPLY_VERB.to_string(),
                payload: json!(UpdatePayload { ops }),
                quiet,
            });
        }
    }

    /// One-way message to another channel.
    pub fn send(&mut self, dest: &ChannelId, verb: &str, payload: Value) {
        self.push_message(dest, verb, payload, false);
    }

    /// [`WorkerContext::send`] without per-packet logging.
    pub fn send_quiet(&mut self, dest: &ChannelId, verb: &str, payload: Value) {
        self.push_message(dest, verb, payload, true);
    }

    fn push_message(&mut self, dest: &ChannelId, verb: &str, payload: Value, quiet: bool) {
        self.outbox.push(Outgoing::Push {
            dest: dest.clone(),
            verb: verb.to_string(),
            payload,
            quiet,
        });
    }

    /// Pushes `verb` to every subscriber.
    pub fn broadcast(&mut self, verb: &str, payload: Value, quiet: bool) {
        let subscribers: Vec<ChannelId> = self.subscribers.ids().cloned().collect();
        for dest in subscribers {
            self.push_message(&dest, verb, payload.clone(), quiet);
        }
    }

    /// Sends a request; its result is dispatched later to the local handler
    /// `then`, with the original `payload` and [`Incoming::response`] set.
    pub fn request(&mut self, dest: &ChannelId, verb: &str, payload: Value, then: &str) {
        self.outbox.push(Outgoing::Request {
            dest: dest.clone(),
            verb: verb.to_string(),
            payload: payload.clone(),
            continuation: Continuation::Handler {
                verb: then.to_string(),
                payload,
            },
        });
    }

    /// Takes the reply token of the request being handled. The runtime then
    /// leaves answering to whoever holds the token.
    pub fn defer(&mut self) -> Option<ReplyToken> {
        self.current.take()
    }

    /// Answers a deferred request.
    pub fn respond(&mut self, token: ReplyToken, result: Result<Value, ChannelError>) {
        self.outbox.push(Outgoing::Response { token, result });
    }

    /// Subscribes to `source`; its public data becomes readable through
    /// [`WorkerContext::replica`] once the snapshot arrives.
    pub fn subscribe_to(&mut self, source: &ChannelId, fields: &[&str]) {
        self.outbox.push(Outgoing::Request {
            dest: source.clone(),
            verb: "subscribe".to_string(),
            payload: json!({ "fields": fields }),
            continuation: Continuation::Subscribe(source.clone()),
        });
    }

    pub fn unsubscribe_from(&mut self, source: &ChannelId) {
        if self.replicas.remove(source).is_some() {
            self.outbox.push(Outgoing::Request {
                dest: source.clone(),
                verb: "unsubscribe".to_string(),
                payload: Value::Null,
                continuation: Continuation::Ignore,
            });
        }
    }

    pub fn replica(&self, source: &ChannelId) -> Option<&ReplicaView> {
        self.replicas.get(source)
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub fn ext<T: Any + Send>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }

    pub fn ext_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.extensions.get_mut::<T>()
    }

    /// Runs `f` with the extension `T` taken out of the context, so `f` can
    /// use both.
    pub fn with_ext<T, R, F>(&mut self, f: F) -> Result<R, ChannelError>
    where
        T: Any + Send,
        F: FnOnce(&mut T, &mut WorkerContext) -> R,
    {
        let mut state = self.extensions.remove::<T>().ok_or_else(|| {
            ChannelError::Config(format!(
                "{} has no {} extension",
                self.worker_type.name(),
                type_name::<T>()
            ))
        })?;
        let result = f(&mut state, self);
        self.extensions.insert(state);
        Ok(result)
    }

    /// Asks the runtime to shut this worker down after the current message.
    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }
}
