//! # Channel Data Tree
//!
//! Each channel owns a [`ChannelData`] value with two JSON-like subtrees:
//! `public`, which is replicated to subscribers, and `private`, which never
//! leaves the worker. Keys are dotted paths whose first segment selects the
//! subtree (`public.players.7.name`, `private.chat.history`).
//!
//! Absence is always expressed by removing the key. There is no placeholder
//! for "missing", so setting a key to `None` deletes it.
//!
//! All mutation goes through [`DataOp`], the same primitive that is shipped to
//! subscribers. Applying the same sequence of ops to two trees that started
//! equal leaves them equal, which is what replication relies on.

use crate::error::ChannelError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Which subtree a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataRoot {
    Public,
    Private,
}

/// A parsed dotted key, e.g. `public.players.7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataKey {
    root: DataRoot,
    path: Vec<String>,
}

impl DataKey {
    /// Parses a full key including its root segment.
    pub fn parse(key: &str) -> Result<Self, ChannelError> {
        let mut segments = key.split('.');
        let root = match segments.next() {
            Some("public") => DataRoot::Public,
            Some("private") => DataRoot::Private,
            _ => {
                return Err(ChannelError::FieldMismatch(format!(
                    "key must start with public or private: {key}"
                )))
            }
        };
        let path: Vec<String> = segments.map(str::to_string).collect();
        if path.is_empty() || path.iter().any(String::is_empty) {
            return Err(ChannelError::FieldMismatch(format!("malformed key: {key}")));
        }
        Ok(Self { root, path })
    }

    /// Builds a public key from a path relative to the public root.
    pub fn public(relative: &str) -> Result<Self, ChannelError> {
        Self::parse(&format!("public.{relative}"))
    }

    /// Builds a private key from a path relative to the private root.
    pub fn private(relative: &str) -> Result<Self, ChannelError> {
        Self::parse(&format!("private.{relative}"))
    }

    pub fn root(&self) -> DataRoot {
        self.root
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Path relative to the root, joined with dots.
    pub fn relative(&self) -> String {
        self.path.join(".")
    }

    pub fn is_public(&self) -> bool {
        self.root == DataRoot::Public
    }
}

impl fmt::Display for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let root = match self.root {
            DataRoot::Public => "public",
            DataRoot::Private => "private",
        };
        write!(f, "{root}.{}", self.path.join("."))
    }
}

/// One mutation of a data subtree.
///
/// Keys inside an op are relative to the subtree root, so the same op can be
/// applied to the authoritative `public` tree and to a subscriber's copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DataOp {
    /// Replace the value at `key`, creating intermediate objects
    Set { key: String, value: Value },
    /// Remove `key`
    Delete { key: String },
    /// Append to the array at `key`, creating it if absent
    Append { key: String, values: Vec<Value> },
    /// Remove `key`, then remove ancestors left as empty objects
    Clear { key: String },
}

impl DataOp {
    /// The relative key this op touches.
    pub fn key(&self) -> &str {
        match self {
            DataOp::Set { key, .. }
            | DataOp::Delete { key }
            | DataOp::Append { key, .. }
            | DataOp::Clear { key } => key,
        }
    }

    /// Applies the op to a subtree root.
    pub fn apply(&self, root: &mut Value) {
        let path = split_path(self.key());
        if path.is_empty() {
            return;
        }
        match self {
            DataOp::Set { value, .. } => set_path(root, &path, value.clone()),
            DataOp::Delete { .. } => {
                remove_path(root, &path);
            }
            DataOp::Append { values, .. } => append_path(root, &path, values),
            DataOp::Clear { .. } => {
                remove_path(root, &path);
                prune_empty(root, &path[..path.len() - 1]);
            }
        }
    }
}

/// Splits a relative dotted key into segments.
pub fn split_path(key: &str) -> Vec<String> {
    key.split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Looks up a path below `root`.
pub fn get_path<'a, S: AsRef<str>>(root: &'a Value, path: &[S]) -> Option<&'a Value> {
    let mut node = root;
    for segment in path {
        node = node.as_object()?.get(segment.as_ref())?;
    }
    Some(node)
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

fn object_at<'a>(root: &'a mut Value, path: &[String]) -> &'a mut Map<String, Value> {
    let mut node = root;
    for segment in path {
        node = ensure_object(node)
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(node)
}

fn set_path(root: &mut Value, path: &[String], value: Value) {
    let (last, parents) = match path.split_last() {
        Some(split) => split,
        None => return,
    };
    object_at(root, parents).insert(last.clone(), value);
}

fn remove_path(root: &mut Value, path: &[String]) -> Option<Value> {
    let (last, parents) = path.split_last()?;
    let mut node = root;
    for segment in parents {
        node = node.as_object_mut()?.get_mut(segment)?;
    }
    node.as_object_mut()?.remove(last)
}

fn append_path(root: &mut Value, path: &[String], values: &[Value]) {
    let (last, parents) = match path.split_last() {
        Some(split) => split,
        None => return,
    };
    let parent = object_at(root, parents);
    let slot = parent
        .entry(last.clone())
        .or_insert_with(|| Value::Array(Vec::new()));
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    if let Value::Array(items) = slot {
        items.extend(values.iter().cloned());
    }
}

/// Removes empty objects along `path`, deepest first.
fn prune_empty(root: &mut Value, path: &[String]) {
    for depth in (1..=path.len()).rev() {
        let prefix = &path[..depth];
        let empty = get_path(root, prefix)
            .and_then(Value::as_object)
            .is_some_and(Map::is_empty);
        if !empty {
            break;
        }
        remove_path(root, prefix);
    }
}

/// Authoritative data of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelData {
    pub public: Value,
    pub private: Value,
}

impl Default for ChannelData {
    fn default() -> Self {
        Self {
            public: Value::Object(Map::new()),
            private: Value::Object(Map::new()),
        }
    }
}

impl ChannelData {
    /// Restores data from a persisted document, tolerating missing halves.
    pub fn from_persisted(doc: Value) -> Self {
        let mut data = Self::default();
        if let Value::Object(mut map) = doc {
            if let Some(public @ Value::Object(_)) = map.remove("public") {
                data.public = public;
            }
            if let Some(private @ Value::Object(_)) = map.remove("private") {
                data.private = private;
            }
        }
        data
    }

    fn root_mut(&mut self, root: DataRoot) -> &mut Value {
        match root {
            DataRoot::Public => &mut self.public,
            DataRoot::Private => &mut self.private,
        }
    }

    fn root(&self, root: DataRoot) -> &Value {
        match root {
            DataRoot::Public => &self.public,
            DataRoot::Private => &self.private,
        }
    }

    /// Reads the value at `key`.
    pub fn get(&self, key: &DataKey) -> Option<&Value> {
        get_path(self.root(key.root()), key.path())
    }

    /// Sets `key` to `value`, or deletes it when `value` is `None`.
    ///
    /// Returns the op that was applied, relative to the key's root.
    pub fn set(&mut self, key: &DataKey, value: Option<Value>) -> DataOp {
        let op = match value {
            Some(value) => DataOp::Set {
                key: key.relative(),
                value,
            },
            None => DataOp::Delete {
                key: key.relative(),
            },
        };
        op.apply(self.root_mut(key.root()));
        op
    }

    /// Appends items to the array at `key`.
    pub fn append(&mut self, key: &DataKey, values: Vec<Value>) -> DataOp {
        let op = DataOp::Append {
            key: key.relative(),
            values,
        };
        op.apply(self.root_mut(key.root()));
        op
    }

    /// Document written to the datastore: everything except the excluded
    /// public top-level keys.
    pub fn persisted_document(&self, unpersisted_public: &[String]) -> Value {
        let mut public = self.public.clone();
        if let Value::Object(map) = &mut public {
            for key in unpersisted_public {
                map.remove(key);
            }
        }
        serde_json::json!({ "public": public, "private": self.private })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_parsing() {
        let key = DataKey::parse("public.players.7.name").unwrap();
        assert!(key.is_public());
        assert_eq!(key.relative(), "players.7.name");
        assert_eq!(key.to_string(), "public.players.7.name");

        assert!(DataKey::parse("players.7").is_err());
        assert!(DataKey::parse("public").is_err());
        assert!(DataKey::parse("private..x").is_err());
    }

    #[test]
    fn test_set_creates_intermediates_and_none_deletes() {
        let mut data = ChannelData::default();
        let key = DataKey::parse("public.room.topic").unwrap();
        data.set(&key, Some(json!("hello")));
        assert_eq!(data.public, json!({"room": {"topic": "hello"}}));

        data.set(&key, None);
        assert_eq!(data.public, json!({"room": {}}));
        assert!(data.get(&key).is_none());
    }

    #[test]
    fn test_set_replaces_scalar_parent() {
        let mut root = json!({"a": 5});
        DataOp::Set {
            key: "a.b".into(),
            value: json!(1),
        }
        .apply(&mut root);
        assert_eq!(root, json!({"a": {"b": 1}}));
    }

    #[test]
    fn test_append_builds_array() {
        let mut data = ChannelData::default();
        let key = DataKey::parse("private.log").unwrap();
        data.append(&key, vec![json!(1)]);
        data.append(&key, vec![json!(2), json!(3)]);
        assert_eq!(data.private, json!({"log": [1, 2, 3]}));
    }

    #[test]
    fn test_clear_prunes_empty_ancestors() {
        let mut root = json!({"a": {"b": {"c": 1}}, "x": 1});
        DataOp::Clear { key: "a.b.c".into() }.apply(&mut root);
        assert_eq!(root, json!({"x": 1}));

        let mut root = json!({"a": {"b": {"c": 1}, "d": 2}});
        DataOp::Clear { key: "a.b.c".into() }.apply(&mut root);
        assert_eq!(root, json!({"a": {"d": 2}}));
    }

    #[test]
    fn test_persisted_document_skips_excluded_keys() {
        let mut data = ChannelData::default();
        data.set(&DataKey::parse("public.clients").unwrap(), Some(json!(["a"])));
        data.set(&DataKey::parse("public.name").unwrap(), Some(json!("lobby")));
        data.set(&DataKey::parse("private.secret").unwrap(), Some(json!(1)));

        let doc = data.persisted_document(&["clients".to_string()]);
        assert_eq!(
            doc,
            json!({"public": {"name": "lobby"}, "private": {"secret": 1}})
        );
        let restored = ChannelData::from_persisted(doc);
        assert_eq!(restored.private, json!({"secret": 1}));
    }
}
