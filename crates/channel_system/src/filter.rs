//! # Subscription Field Filters
//!
//! A subscriber either receives the whole public tree (`["*"]`) or only the
//! subtrees named by a list of dotted prefixes. [`FieldMap`] answers two
//! questions: what the initial snapshot looks like, and which part of an
//! incremental [`DataOp`] a subscriber is allowed to see.

use crate::error::ChannelError;
use crate::tree::{get_path, split_path, DataOp};
use serde_json::{Map, Value};

/// Public field filter of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldMap {
    /// Full replication
    All,
    /// Only the listed dotted prefixes, relative to `public`
    Prefixes(Vec<Vec<String>>),
}

impl FieldMap {
    /// Builds a filter from the field list sent with a subscribe request.
    ///
    /// Prefixes covered by another listed prefix are dropped so every key
    /// maps onto at most one allowed subtree.
    pub fn from_fields(fields: &[String]) -> Result<Self, ChannelError> {
        if fields.is_empty() || fields.iter().any(|f| f == "*") {
            return Ok(FieldMap::All);
        }
        let mut prefixes: Vec<Vec<String>> = Vec::new();
        for field in fields {
            let relative = field.strip_prefix("public.").unwrap_or(field);
            let path = split_path(relative);
            if path.is_empty() {
                return Err(ChannelError::FieldMismatch(format!(
                    "empty field filter entry: {field:?}"
                )));
            }
            prefixes.push(path);
        }
        prefixes.sort();
        prefixes.dedup();
        let normalized: Vec<Vec<String>> = prefixes
            .iter()
            .filter(|p| {
                !prefixes
                    .iter()
                    .any(|other| other.len() < p.len() && p.starts_with(other))
            })
            .cloned()
            .collect();
        Ok(FieldMap::Prefixes(normalized))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, FieldMap::All)
    }

    /// Whether a relative key falls inside an allowed subtree.
    pub fn allows(&self, key: &str) -> bool {
        match self {
            FieldMap::All => true,
            FieldMap::Prefixes(prefixes) => {
                let path = split_path(key);
                prefixes.iter().any(|p| path.starts_with(p))
            }
        }
    }

    /// Builds the snapshot a new subscriber receives.
    pub fn project(&self, public: &Value) -> Value {
        match self {
            FieldMap::All => public.clone(),
            FieldMap::Prefixes(prefixes) => {
                let mut out = Value::Object(Map::new());
                for prefix in prefixes {
                    if let Some(value) = get_path(public, prefix) {
                        DataOp::Set {
                            key: prefix.join("."),
                            value: value.clone(),
                        }
                        .apply(&mut out);
                    }
                }
                out
            }
        }
    }

    /// Translates an op already applied to `public` into the ops this
    /// subscriber must apply to stay equal to [`FieldMap::project`].
    ///
    /// Ops inside an allowed subtree pass through unchanged. Ops on an
    /// ancestor of allowed subtrees are re-expressed per allowed subtree from
    /// the post-op state.
    pub fn translate(&self, op: &DataOp, public_after: &Value) -> Vec<DataOp> {
        let prefixes = match self {
            FieldMap::All => return vec![op.clone()],
            FieldMap::Prefixes(prefixes) => prefixes,
        };
        let path = split_path(op.key());
        let mut out = Vec::new();
        for prefix in prefixes {
            if path.starts_with(prefix) {
                if path.len() == prefix.len() && matches!(op, DataOp::Delete { .. }) {
                    out.push(DataOp::Clear { key: op.key().to_string() });
                } else {
                    out.push(op.clone());
                }
                // prefixes are disjoint, nothing else can match
                return out;
            }
            if prefix.starts_with(&path) {
                let key = prefix.join(".");
                match get_path(public_after, prefix) {
                    Some(value) => out.push(DataOp::Set {
                        key,
                        value: value.clone(),
                    }),
                    None => out.push(DataOp::Clear { key }),
                }
            }
        }
        out
    }
}
