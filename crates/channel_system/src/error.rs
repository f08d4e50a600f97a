//! # Error Taxonomy
//!
//! Errors fall into four groups, and callers are expected to branch on the
//! group rather than the individual variant:
//!
//! * **Protocol errors** ([`ChannelError::AlreadySubscribed`],
//!   [`ChannelError::NotSubscribed`], [`ChannelError::NotFound`],
//!   [`ChannelError::FieldMismatch`]) are returned to the caller and never
//!   retried by the framework.
//! * **Transient errors** ([`ChannelError::Timeout`], [`ChannelError::Exchange`],
//!   [`ChannelError::HostLost`]) are retried by the layer that detected them.
//! * **Fatal errors** ([`ChannelError::Handler`]) are logged with packet
//!   context and reported to the master.
//! * **Quiet errors** ([`ChannelError::Quiet`]) are expected rejections that
//!   are returned to the caller but never logged above `debug`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by channel workers, the exchange and the master.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// The subscriber already holds a subscription on this channel
    #[error("already subscribed")]
    AlreadySubscribed,
    /// The caller has no subscription on this channel
    #[error("not subscribed")]
    NotSubscribed,
    /// Destination channel, handler, command or worker type is unknown
    #[error("not found: {0}")]
    NotFound(String),
    /// A data key is outside of what the caller may touch
    #[error("field mismatch: {0}")]
    FieldMismatch(String),
    /// A request did not complete within its liveness window
    #[error("timed out: {0}")]
    Timeout(String),
    /// The exchange failed to deliver a packet
    #[error("exchange error: {0}")]
    Exchange(String),
    /// The host a request depended on stopped reporting
    #[error("host lost: {0}")]
    HostLost(String),
    /// A message handler failed unexpectedly
    #[error("handler failure: {0}")]
    Handler(String),
    /// Expected, benign rejection that must not raise warnings
    #[error("{0}")]
    Quiet(String),
    /// Rejection decided by the concrete worker type (e.g. subscribe veto)
    #[error("{0}")]
    Domain(String),
    /// The worker is tearing down and accepts no further requests
    #[error("channel is shutting down")]
    ShuttingDown,
    /// Channel id string is malformed
    #[error("invalid channel id: {0}")]
    InvalidChannelId(String),
    /// Packet could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Persistent datastore failure
    #[error("datastore error: {0}")]
    Datastore(String),
    /// Invalid worker type or server configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl ChannelError {
    /// Whether this error must stay out of warning-level logs.
    pub fn is_quiet(&self) -> bool {
        matches!(self, ChannelError::Quiet(_))
    }

    /// Whether the detecting layer should retry the operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChannelError::Timeout(_) | ChannelError::Exchange(_) | ChannelError::HostLost(_)
        )
    }

    /// Whether this is an unexpected failure worth a cluster-wide report.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChannelError::Handler(_))
    }

    /// Converts the error into its wire representation.
    pub fn to_wire(&self) -> WireError {
        let (kind, message) = match self {
            ChannelError::AlreadySubscribed => (ErrorKind::AlreadySubscribed, String::new()),
            ChannelError::NotSubscribed => (ErrorKind::NotSubscribed, String::new()),
            ChannelError::NotFound(m) => (ErrorKind::NotFound, m.clone()),
            ChannelError::FieldMismatch(m) => (ErrorKind::FieldMismatch, m.clone()),
            ChannelError::Timeout(m) => (ErrorKind::Timeout, m.clone()),
            ChannelError::Exchange(m) => (ErrorKind::Exchange, m.clone()),
            ChannelError::HostLost(m) => (ErrorKind::HostLost, m.clone()),
            ChannelError::Handler(m) => (ErrorKind::Handler, m.clone()),
            ChannelError::Quiet(m) => (ErrorKind::Quiet, m.clone()),
            ChannelError::Domain(m) => (ErrorKind::Domain, m.clone()),
            ChannelError::ShuttingDown => (ErrorKind::ShuttingDown, String::new()),
            ChannelError::InvalidChannelId(m) => (ErrorKind::InvalidChannelId, m.clone()),
            ChannelError::Serialization(m) => (ErrorKind::Serialization, m.clone()),
            ChannelError::Datastore(m) => (ErrorKind::Datastore, m.clone()),
            ChannelError::Config(m) => (ErrorKind::Config, m.clone()),
        };
        WireError { kind, message }
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::Serialization(err.to_string())
    }
}

/// Error kinds as they travel between channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AlreadySubscribed,
    NotSubscribed,
    NotFound,
    FieldMismatch,
    Timeout,
    Exchange,
    HostLost,
    Handler,
    Quiet,
    Domain,
    ShuttingDown,
    InvalidChannelId,
    Serialization,
    Datastore,
    Config,
}

/// Serializable error carried in response packets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl From<WireError> for ChannelError {
    fn from(wire: WireError) -> Self {
        let m = wire.message;
        match wire.kind {
            ErrorKind::AlreadySubscribed => ChannelError::AlreadySubscribed,
            ErrorKind::NotSubscribed => ChannelError::NotSubscribed,
            ErrorKind::NotFound => ChannelError::NotFound(m),
            ErrorKind::FieldMismatch => ChannelError::FieldMismatch(m),
            ErrorKind::Timeout => ChannelError::Timeout(m),
            ErrorKind::Exchange => ChannelError::Exchange(m),
            ErrorKind::HostLost => ChannelError::HostLost(m),
            ErrorKind::Handler => ChannelError::Handler(m),
            ErrorKind::Quiet => ChannelError::Quiet(m),
            ErrorKind::Domain => ChannelError::Domain(m),
            ErrorKind::ShuttingDown => ChannelError::ShuttingDown,
            ErrorKind::InvalidChannelId => ChannelError::InvalidChannelId(m),
            ErrorKind::Serialization => ChannelError::Serialization(m),
            ErrorKind::Datastore => ChannelError::Datastore(m),
            ErrorKind::Config => ChannelError::Config(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        assert!(ChannelError::Quiet("stale".into()).is_quiet());
        assert!(ChannelError::Timeout("lock".into()).is_transient());
        assert!(ChannelError::HostLost("cs1".into()).is_transient());
        assert!(!ChannelError::AlreadySubscribed.is_transient());
        assert!(ChannelError::Handler("boom".into()).is_fatal());
    }

    #[test]
    fn test_wire_preserves_kind_and_message() {
        let err = ChannelError::FieldMismatch("public.secret".into());
        let json = serde_json::to_string(&err.to_wire()).unwrap();
        let wire: WireError = serde_json::from_str(&json).unwrap();
        assert_eq!(ChannelError::from(wire), err);

        let wire = ChannelError::ShuttingDown.to_wire();
        assert!(wire.message.is_empty());
        assert_eq!(ChannelError::from(wire), ChannelError::ShuttingDown);
    }
}
