//! # Channel Server
//!
//! The host process of the channel worker system. A [`ChannelServer`] owns
//! one [`HostContext`](channel_system::HostContext) for its whole life and
//! adds what a running host does besides executing workers:
//!
//! * **Endpoint** - `server.<id>`, through which the master spawns workers here
//! * **Load reports** - a [`LoadSampler`] measurement plus message rate and
//!   worker counts, pushed to the master every `load_report_interval_ms`
//! * **Master election** - candidates race to register `master.0`; the
//!   exchange admits exactly one, and a lost master is re-contested on the
//!   next report tick
//! * **Readiness** - [`ReadinessCheck`] answers for `/api/ready` and
//!   `/api/deployready`
//!
//! ```rust,no_run
//! use channel_server::{ChannelServer, SystemSampler, ServerConfig};
//! use channel_system::{default_registry, LocalExchange, MemoryDatastore, WorkerSettings};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), channel_server::ServerError> {
//! let server = ChannelServer::start(
//!     ServerConfig::default(),
//!     Arc::new(LocalExchange::new()),
//!     Arc::new(MemoryDatastore::new()),
//!     default_registry(Default::default())?,
//!     WorkerSettings::default(),
//!     Box::new(SystemSampler::new()),
//! )
//! .await?;
//! let (status, body) = server.readiness().ready(None, None).await;
//! println!("{status} {body}");
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod load;
pub mod readiness;
pub mod server;

pub use config::ServerConfig;
pub use error::ServerError;
pub use load::{HostSample, LoadSampler, MessageRate, SystemSampler, StaticSampler};
pub use readiness::ReadinessCheck;
pub use server::ChannelServer;
