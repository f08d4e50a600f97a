//! # Channel Workers
//!
//! A worker is an addressable actor named by a [`ChannelId`](crate::ChannelId).
//! It owns a public/private data tree, a subscriber set and the ordering state
//! towards its peers, and exposes them to its type's handlers through
//! [`WorkerContext`].
//!
//! - [`descriptor`] - worker type builder, descriptors and registry
//! - [`context`] - what a handler sees and can do
//! - [`handle`] - talking to a running worker from outside
//! - [`config`] - runtime settings
//! - `runtime` - the task that drives a worker

pub mod config;
pub mod context;
pub mod descriptor;
pub mod handle;
pub(crate) mod runtime;

pub use config::WorkerSettings;
pub use context::{Extensions, Incoming, Reply, ReplyToken, WorkerContext};
pub use descriptor::{WorkerRegistry, WorkerType, WorkerTypeBuilder, BUILTIN_VERBS};
pub use handle::WorkerHandle;
pub use runtime::ERROR_REPORT_VERB;
