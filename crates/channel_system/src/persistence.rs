//! # Durable Channel State
//!
//! The datastore contract and the commit scheduler that decides when a
//! channel's data is written back.
//!
//! ## Commit rules
//!
//! - Every mutation marks the channel dirty.
//! - Writes are spaced at least `min_spacing` apart; a burst of mutations
//!   inside that window becomes one write.
//! - Only one write is in flight. A mutation during the write re-marks the
//!   channel dirty, which produces exactly one follow-up write.
//! - A write whose serialized bytes equal the last successful write is
//!   skipped.

use crate::error::ChannelError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{Duration, Instant};

/// Key-value store holding durable channel documents.
///
/// Eventually consistent per key, last writer wins.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, ChannelError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), ChannelError>;
    /// Removes `key`, reporting whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, ChannelError>;
}

/// Process-local datastore.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    entries: DashMap<String, Value>,
    writes: AtomicU64,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` calls that reached the store.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get(&self, key: &str) -> Result<Option<Value>, ChannelError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), ChannelError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, ChannelError> {
        Ok(self.entries.remove(key).is_some())
    }
}

/// Outcome of [`CommitScheduler::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStart {
    /// Write the document now, then call [`CommitScheduler::finish`]
    Write,
    /// Content unchanged since the last successful write
    Unchanged,
}

/// Debounced, single-flight commit state of one channel.
#[derive(Debug)]
pub struct CommitScheduler {
    min_spacing: Duration,
    dirty: bool,
    in_flight: Option<Vec<u8>>,
    last_started: Option<Instant>,
    last_written: Option<Vec<u8>>,
    writes: u64,
    skipped: u64,
}

impl CommitScheduler {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            dirty: false,
            in_flight: None,
            last_started: None,
            last_written: None,
            writes: 0,
            skipped: 0,
        }
    }

    /// Seeds the last-written content, e.g. with the document just loaded.
    pub fn with_baseline(mut self, bytes: Vec<u8>) -> Self {
        self.last_written = Some(bytes);
        self
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// A write is queued or running.
    pub fn is_pending(&self) -> bool {
        self.dirty || self.in_flight.is_some()
    }

    /// Whether a write should start at `now`.
    pub fn due(&self, now: Instant) -> bool {
        self.dirty
            && self.in_flight.is_none()
            && self
                .last_started
                .map_or(true, |started| now.duration_since(started) >= self.min_spacing)
    }

    /// When the next queued write becomes due, if one is queued.
    pub fn next_due(&self) -> Option<Instant> {
        if !self.dirty || self.in_flight.is_some() {
            return None;
        }
        Some(
            self.last_started
                .map(|started| started + self.min_spacing)
                .unwrap_or_else(Instant::now),
        )
    }

    /// Claims the queued write for `bytes`.
    pub fn begin(&mut self, bytes: Vec<u8>, now: Instant) -> CommitStart {
        self.dirty = false;
        if self.last_written.as_deref() == Some(bytes.as_slice()) {
            self.skipped += 1;
            return CommitStart::Unchanged;
        }
        self.last_started = Some(now);
        self.in_flight = Some(bytes);
        CommitStart::Write
    }

    /// Completes the in-flight write. A failed write leaves the channel dirty.
    pub fn finish(&mut self, success: bool) {
        let Some(bytes) = self.in_flight.take() else {
            return;
        };
        if success {
            self.writes += 1;
            self.last_written = Some(bytes);
        } else {
            self.dirty = true;
        }
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SPACING: Duration = Duration::from_millis(500);

    #[test]
    fn test_identical_content_written_once() {
        let now = Instant::now();
        let mut commits = CommitScheduler::new(SPACING);

        commits.mark_dirty();
        assert_eq!(commits.begin(b"{\"a\":1}".to_vec(), now), CommitStart::Write);
        commits.finish(true);

        commits.mark_dirty();
        assert!(commits.due(now + SPACING));
        assert_eq!(
            commits.begin(b"{\"a\":1}".to_vec(), now + SPACING),
            CommitStart::Unchanged
        );
        assert_eq!(commits.writes(), 1);
        assert_eq!(commits.skipped(), 1);
        assert!(!commits.is_pending());
    }

    #[test]
    fn test_spacing_coalesces_bursts() {
        let now = Instant::now();
        let mut commits = CommitScheduler::new(SPACING);
        commits.mark_dirty();
        assert!(commits.due(now));
        commits.begin(b"1".to_vec(), now);
        commits.finish(true);

        commits.mark_dirty();
        commits.mark_dirty();
        assert!(!commits.due(now + Duration::from_millis(100)));
        assert_eq!(commits.next_due(), Some(now + SPACING));
        assert!(commits.due(now + SPACING));
    }

    #[test]
    fn test_mutation_during_write_triggers_one_more() {
        let now = Instant::now();
        let mut commits = CommitScheduler::new(SPACING);
        commits.mark_dirty();
        commits.begin(b"1".to_vec(), now);

        commits.mark_dirty();
        commits.mark_dirty();
        assert!(!commits.due(now + SPACING));
        commits.finish(true);
        assert!(commits.due(now + SPACING));

        commits.begin(b"2".to_vec(), now + SPACING);
        commits.finish(true);
        assert!(!commits.is_pending());
        assert_eq!(commits.writes(), 2);
    }

    #[test]
    fn test_failed_write_stays_dirty() {
        let now = Instant::now();
        let mut commits = CommitScheduler::new(SPACING);
        commits.mark_dirty();
        commits.begin(b"1".to_vec(), now);
        commits.finish(false);
        assert!(commits.is_dirty());
        assert_eq!(commits.begin(b"1".to_vec(), now + SPACING), CommitStart::Write);
    }

    #[tokio::test]
    async fn test_memory_datastore_counts_writes() {
        let store = MemoryDatastore::new();
        assert_eq!(store.get("channel/room/1").await.unwrap(), None);
        store.set("channel/room/1", json!({"public": {}})).await.unwrap();
        assert_eq!(
            store.get("channel/room/1").await.unwrap(),
            Some(json!({"public": {}}))
        );
        assert_eq!(store.write_count(), 1);
    }
}
