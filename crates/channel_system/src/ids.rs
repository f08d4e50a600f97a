//! # Channel Addressing
//!
//! Every actor in the cluster is addressed by a [`ChannelId`] of the form
//! `<type>.<subid>`. The type selects the worker type that implements the
//! channel; the subid distinguishes instances of that type. Host processes are
//! identified by a [`ServerId`] and expose their own endpoint channel
//! (`server.<id>`).

use crate::error::ChannelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Channel type of the singleton master worker.
pub const MASTER_TYPE: &str = "master";

/// Channel type of the per-host endpoint worker.
pub const SERVER_TYPE: &str = "server";

/// Cluster-wide identifier of one channel worker instance.
///
/// The string form is `<type>.<subid>`. The type may not contain a dot; the
/// subid may (only the first dot separates the two parts).
///
/// # Examples
///
/// ```rust
/// use channel_system::ChannelId;
///
/// let id: ChannelId = "room.42".parse().unwrap();
/// assert_eq!(id.channel_type(), "room");
/// assert_eq!(id.subid(), "42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId {
    full: String,
    split: usize,
}

impl ChannelId {
    /// Builds a channel id from its two parts.
    pub fn new(channel_type: &str, subid: &str) -> Result<Self, ChannelError> {
        if channel_type.is_empty() || channel_type.contains('.') {
            return Err(ChannelError::InvalidChannelId(format!(
                "{channel_type}.{subid}"
            )));
        }
        if subid.is_empty() {
            return Err(ChannelError::InvalidChannelId(format!("{channel_type}.")));
        }
        Ok(Self {
            full: format!("{channel_type}.{subid}"),
            split: channel_type.len(),
        })
    }

    /// The singleton master channel (`master.0`).
    pub fn master() -> Self {
        Self {
            full: format!("{MASTER_TYPE}.0"),
            split: MASTER_TYPE.len(),
        }
    }

    /// The endpoint channel of a host process.
    pub fn server(server_id: &ServerId) -> Self {
        Self {
            full: format!("{SERVER_TYPE}.{}", server_id.0),
            split: SERVER_TYPE.len(),
        }
    }

    /// Worker type portion of the id.
    pub fn channel_type(&self) -> &str {
        &self.full[..self.split]
    }

    /// Instance portion of the id.
    pub fn subid(&self) -> &str {
        &self.full[self.split + 1..]
    }

    /// Full `<type>.<subid>` string.
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// Whether this is the master channel.
    pub fn is_master(&self) -> bool {
        self.channel_type() == MASTER_TYPE
    }

    /// Datastore key under which this channel persists its data.
    pub fn storage_key(&self) -> String {
        format!("channel/{}/{}", self.channel_type(), self.subid())
    }
}

impl FromStr for ChannelId {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((channel_type, subid)) => Self::new(channel_type, subid),
            None => Err(ChannelError::InvalidChannelId(s.to_string())),
        }
    }
}

impl TryFrom<String> for ChannelId {
    type Error = ChannelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.full
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

/// Identifier of a host process ("channel server") in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one run of a host process.
///
/// A restarted host keeps its [`ServerId`] but gets a fresh instance id, which
/// lets the master tell a stale lock holder from a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_on_first_dot() {
        let id: ChannelId = "idmap.steam.123".parse().unwrap();
        assert_eq!(id.channel_type(), "idmap");
        assert_eq!(id.subid(), "steam.123");
        assert_eq!(id.to_string(), "idmap.steam.123");
    }

    #[test]
    fn test_invalid_ids_rejected() {
        assert!("nodot".parse::<ChannelId>().is_err());
        assert!(".42".parse::<ChannelId>().is_err());
        assert!("room.".parse::<ChannelId>().is_err());
    }

    #[test]
    fn test_well_known_channels() {
        assert!(ChannelId::master().is_master());
        let server = ChannelId::server(&ServerId::new("cs1"));
        assert_eq!(server.as_str(), "server.cs1");
        assert_eq!(server.channel_type(), SERVER_TYPE);
    }

    #[test]
    fn test_serde_as_string() {
        let id = ChannelId::new("room", "7").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"room.7\"");
        let back: ChannelId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
