//! # Subscription Replication
//!
//! Tracks who subscribes to a channel's public data and turns every applied
//! [`DataOp`] into the ops each subscriber must see, honouring its field
//! filter. Immediate mutations are shipped one message per mutation;
//! batched mutations accumulate per subscriber until the batch is flushed.
//!
//! The receiving side keeps a [`ReplicaView`]: the snapshot it got at
//! subscribe time with every later update applied in order.

use crate::error::ChannelError;
use crate::filter::FieldMap;
use crate::ids::ChannelId;
use crate::tree::DataOp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Verb of an immediate incremental update.
pub const APPLY_VERB: &str = "apply_channel_data";

/// Verb of a combined update produced by a batch flush.
pub const BATCH_VERB: &str = "batch_set";

/// One subscriber of a channel.
#[derive(Debug, Clone)]
pub struct SubscriberRecord {
    pub field_map: FieldMap,
    pub subscription_id: String,
    batch: Vec<DataOp>,
}

/// Reply sent to a new subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeReply {
    pub public: Value,
    pub subscription_id: String,
}

/// Payload of [`APPLY_VERB`] and [`BATCH_VERB`] pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub ops: Vec<DataOp>,
}

/// Subscriber set of one channel.
#[derive(Debug, Default)]
pub struct Subscribers {
    records: HashMap<ChannelId, SubscriberRecord>,
    next_token: u32,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber and returns its snapshot of `public`.
    pub fn subscribe(
        &mut self,
        subscriber: ChannelId,
        fields: &[String],
        public: &Value,
    ) -> Result<SubscribeReply, ChannelError> {
        if self.records.contains_key(&subscriber) {
            return Err(ChannelError::AlreadySubscribed);
        }
        let field_map = FieldMap::from_fields(fields)?;
        self.next_token = self.next_token.wrapping_add(1);
        let subscription_id = format!("{:x}", self.next_token);
        let reply = SubscribeReply {
            public: field_map.project(public),
            subscription_id: subscription_id.clone(),
        };
        self.records.insert(
            subscriber,
            SubscriberRecord {
                field_map,
                subscription_id,
                batch: Vec::new(),
            },
        );
        Ok(reply)
    }

    /// Removes a subscriber, discarding any batched ops for it.
    pub fn unsubscribe(&mut self, subscriber: &ChannelId) -> Result<(), ChannelError> {
        self.records
            .remove(subscriber)
            .map(|_| ())
            .ok_or(ChannelError::NotSubscribed)
    }

    pub fn contains(&self, subscriber: &ChannelId) -> bool {
        self.records.contains_key(subscriber)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ChannelId> {
        self.records.keys()
    }

    pub fn get(&self, subscriber: &ChannelId) -> Option<&SubscriberRecord> {
        self.records.get(subscriber)
    }

    /// Drops every subscriber, returning who was subscribed.
    pub fn clear(&mut self) -> Vec<ChannelId> {
        self.records.drain().map(|(id, _)| id).collect()
    }

    /// Per-subscriber translation of one public op, skipping subscribers
    /// that see nothing of it.
    pub fn fanout(&self, op: &DataOp, public_after: &Value) -> Vec<(ChannelId, Vec<DataOp>)> {
        self.records
            .iter()
            .filter_map(|(id, record)| {
                let ops = record.field_map.translate(op, public_after);
                (!ops.is_empty()).then(|| (id.clone(), ops))
            })
            .collect()
    }

    /// Queues the translation of one public op into every subscriber's batch.
    pub fn batch(&mut self, op: &DataOp, public_after: &Value) {
        for record in self.records.values_mut() {
            let ops = record.field_map.translate(op, public_after);
            record.batch.extend(ops);
        }
    }

    pub fn has_batched(&self) -> bool {
        self.records.values().any(|r| !r.batch.is_empty())
    }

    /// Empties all batches, one combined op list per subscriber.
    pub fn take_batches(&mut self) -> Vec<(ChannelId, Vec<DataOp>)> {
        self.records
            .iter_mut()
            .filter(|(_, record)| !record.batch.is_empty())
            .map(|(id, record)| (id.clone(), std::mem::take(&mut record.batch)))
            .collect()
    }
}

/// Local copy of another channel's public data.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaView {
    source: ChannelId,
    subscription_id: String,
    public: Value,
}

impl ReplicaView {
    pub fn new(source: ChannelId, reply: SubscribeReply) -> Self {
        let public = if reply.public.is_object() {
            reply.public
        } else {
            Value::Object(Map::new())
        };
        Self {
            source,
            subscription_id: reply.subscription_id,
            public,
        }
    }

    pub fn source(&self) -> &ChannelId {
        &self.source
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn public(&self) -> &Value {
        &self.public
    }

    pub fn apply(&mut self, ops: &[DataOp]) {
        for op in ops {
            op.apply(&mut self.public);
        }
    }
}
