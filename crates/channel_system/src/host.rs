//! # Host Context
//!
//! Everything a worker needs from the process it runs in: the exchange, the
//! datastore, the worker type registry and runtime settings, plus the table
//! of workers running on this host. One context is created when a channel
//! server starts and torn down by [`HostContext::shutdown`]; it is handed to
//! each worker explicitly, never reached through global state.

use crate::error::ChannelError;
use crate::exchange::Exchange;
use crate::ids::{ChannelId, InstanceId, ServerId};
use crate::persistence::Datastore;
use crate::worker::config::WorkerSettings;
use crate::worker::descriptor::WorkerRegistry;
use crate::worker::handle::WorkerHandle;
use crate::worker::runtime;
use crate::workers::id_mapper::IdAllocator;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub struct HostContext {
    server_id: ServerId,
    instance_id: InstanceId,
    exchange: Arc<dyn Exchange>,
    datastore: Arc<dyn Datastore>,
    registry: WorkerRegistry,
    settings: WorkerSettings,
    id_allocator: Arc<IdAllocator>,
    workers: DashMap<ChannelId, WorkerHandle>,
    messages: AtomicU64,
    closing: AtomicBool,
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("server_id", &self.server_id)
            .field("instance_id", &self.instance_id)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl HostContext {
    pub fn new(
        server_id: ServerId,
        exchange: Arc<dyn Exchange>,
        datastore: Arc<dyn Datastore>,
        registry: WorkerRegistry,
        settings: WorkerSettings,
    ) -> Arc<Self> {
        let id_allocator = Arc::new(IdAllocator::new(Arc::clone(&datastore)));
        Arc::new(Self {
            server_id,
            instance_id: InstanceId::new(),
            exchange,
            datastore,
            id_allocator,
            registry,
            settings,
            workers: DashMap::new(),
            messages: AtomicU64::new(0),
            closing: AtomicBool::new(false),
        })
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Identity of this process run; a restarted host gets a new one.
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn exchange(&self) -> &Arc<dyn Exchange> {
        &self.exchange
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.datastore
    }

    /// User id allocator shared by every `idmap` worker of this host.
    pub fn id_allocator(&self) -> &Arc<IdAllocator> {
        &self.id_allocator
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Starts `id` on this host, or returns the instance already running here.
    pub async fn spawn_worker(self: &Arc<Self>, id: ChannelId) -> Result<WorkerHandle, ChannelError> {
        runtime::spawn(Arc::clone(self), id).await
    }

    pub fn worker(&self, id: &ChannelId) -> Option<WorkerHandle> {
        self.workers.get(id).map(|w| w.value().clone())
    }

    pub fn worker_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.workers.iter().map(|w| w.key().clone()).collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Running workers per type.
    pub fn worker_counts(&self) -> HashMap<String, u32> {
        let mut counts = HashMap::new();
        for worker in self.workers.iter() {
            *counts
                .entry(worker.key().channel_type().to_string())
                .or_insert(0) += 1;
        }
        counts
    }

    pub(crate) fn insert_worker(&self, handle: WorkerHandle) {
        self.workers.insert(handle.id().clone(), handle);
    }

    pub(crate) fn remove_worker(&self, id: &ChannelId) {
        self.workers.remove(id);
    }

    pub(crate) fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Inbound packets handled by all workers of this host so far.
    pub fn message_count(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    /// Stops every worker. The master goes last so the others can still
    /// release their locks with it.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handles: Vec<WorkerHandle> = self.workers.iter().map(|w| w.value().clone()).collect();
        handles.sort_by_key(|h| h.id().is_master());
        info!(server = %self.server_id, workers = handles.len(), "🛑 Stopping workers");
        for handle in handles {
            if let Err(e) = handle.shutdown().await {
                debug!(channel = %handle.id(), error = %e, "worker already stopped");
            }
        }
        self.workers.clear();
    }
}
