//! Worker types shipped with the framework.
//!
//! - [`server`] - the per-host `server.<id>` endpoint
//! - [`chat`] - the Chattable mixin
//! - [`id_mapper`] - external account id to user id allocation

pub mod chat;
pub mod id_mapper;
pub mod server;

pub use chat::{chattable, ChatPolicy, ChatSettings, DefaultChatPolicy};
pub use id_mapper::IdAllocator;
