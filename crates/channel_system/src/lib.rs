//! # Channel System
//!
//! Addressable actors ("channel workers") for a distributed game backend.
//! Every worker is named `type.subid`, owns a public/private data tree and
//! talks to other workers only through messages carried by an [`Exchange`].
//!
//! ## Core Features
//!
//! - **Ordered messaging**: per-peer sequence numbers restore send order over
//!   a transport that may reorder or duplicate, with forced recovery when a
//!   gap never closes
//! - **Replication**: subscribers get a snapshot of a worker's public data
//!   followed by field-filtered incremental updates
//! - **Persistence**: debounced, content-deduplicated commits to a
//!   [`Datastore`]
//! - **Auto-destroy**: idle workers tear themselves down under a lock held by
//!   the master, so a concurrent create never races the teardown
//! - **Placement**: the master places new workers on the least loaded
//!   channel server, scoring hosts from their periodic load reports
//!
//! ## Architecture Overview
//!
//! The protocol logic is written as plain state machines driven by explicit
//! liveness beats and instants: [`ordering`], [`replication`],
//! [`persistence`], [`lifecycle`], [`master::placement`]. The
//! [`worker`] runtime wraps them in one tokio task per worker, and a
//! [`HostContext`] carries what all workers of one process share.
//!
//! ## Quick Start Example
//!
//! ```rust,no_run
//! use channel_system::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), ChannelError> {
//! let room = WorkerTypeBuilder::new("room")
//!     .auto_destroy(true)
//!     .writable("topic")
//!     .handler("hello", |ctx, incoming| {
//!         ctx.set("public.greeted", Some(incoming.payload.clone()))?;
//!         Ok(Reply::ok())
//!     })
//!     .build()?;
//!
//! let mut registry = WorkerRegistry::new();
//! registry.register(room)?;
//!
//! let exchange = Arc::new(LocalExchange::new());
//! let host = HostContext::new(
//!     ServerId::new("local"),
//!     exchange,
//!     Arc::new(MemoryDatastore::new()),
//!     registry,
//!     WorkerSettings::default(),
//! );
//! let worker = host.spawn_worker("room.1".parse()?).await?;
//! println!("started {}", worker.id());
//! host.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod exchange;
pub mod filter;
pub mod host;
pub mod ids;
pub mod lifecycle;
pub mod load_bias;
pub mod master;
pub mod ordering;
pub mod packet;
pub mod packet_log;
pub mod persistence;
pub mod replication;
pub mod resource_lock;
pub mod tree;
pub mod worker;
pub mod workers;

pub use error::{ChannelError, ErrorKind, WireError};
pub use exchange::{Exchange, FaultInjection, LocalExchange};
pub use host::HostContext;
pub use ids::{ChannelId, InstanceId, ServerId};
pub use load_bias::{BiasCurve, LoadReport, LoadWeights};
pub use master::{MasterSettings, MasterState};
pub use persistence::{Datastore, MemoryDatastore};
pub use replication::ReplicaView;
pub use resource_lock::{ResourceGuard, ResourceLocks};
pub use tree::{ChannelData, DataKey, DataOp};
pub use worker::{
    Incoming, Reply, ReplyToken, WorkerContext, WorkerHandle, WorkerRegistry, WorkerSettings,
    WorkerType, WorkerTypeBuilder,
};
pub use workers::{chattable, ChatPolicy, ChatSettings, DefaultChatPolicy, IdAllocator};

/// Registry holding the framework's own worker types: `master`, `server`
/// and `idmap`. Applications register their types on top.
pub fn default_registry(master: MasterSettings) -> Result<WorkerRegistry, ChannelError> {
    let mut registry = WorkerRegistry::new();
    registry.register(master::worker_type(master)?)?;
    registry.register(workers::server::worker_type()?)?;
    registry.register(workers::id_mapper::worker_type()?)?;
    Ok(registry)
}
