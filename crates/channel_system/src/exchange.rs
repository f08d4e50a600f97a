//! # Message Exchange
//!
//! The transport between channels. An exchange routes opaque frames to the
//! inbox registered under a channel id; it may reorder or duplicate frames
//! but never corrupts them. Sending to an id nobody registered fails with
//! [`ChannelError::NotFound`].
//!
//! The exchange also owns the cluster liveness counter. Every timeout in the
//! ordering layer and the master is counted in these beats.

use crate::error::ChannelError;
use crate::ids::ChannelId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, trace};

/// Receiving half of a channel's inbox.
pub type Inbox = mpsc::UnboundedReceiver<Vec<u8>>;

/// Sending half registered with the exchange.
pub type InboxSender = mpsc::UnboundedSender<Vec<u8>>;

/// Routing between channels.
pub trait Exchange: Send + Sync {
    /// Routes frames for `id` to `inbox`. Fails if `id` is already taken.
    fn register(&self, id: &ChannelId, inbox: InboxSender) -> Result<(), ChannelError>;

    /// Stops routing to `id`. Returns whether it was registered.
    fn unregister(&self, id: &ChannelId) -> bool;

    fn is_registered(&self, id: &ChannelId) -> bool;

    /// Delivers one frame to `dest`.
    fn send(&self, dest: &ChannelId, frame: Vec<u8>) -> Result<(), ChannelError>;

    /// Current cluster liveness beat.
    fn liveness(&self) -> u64;
}

/// Delivery faults a [`LocalExchange`] injects, for exercising the ordering
/// layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultInjection {
    /// Deliver every frame twice
    pub duplicate: bool,
    /// Hold each frame until the next one for the same destination and
    /// deliver the pair swapped; held frames are released on [`LocalExchange::tick`]
    pub reorder: bool,
}

/// In-process exchange backed by unbounded tokio channels.
#[derive(Debug, Default)]
pub struct LocalExchange {
    routes: DashMap<ChannelId, InboxSender>,
    held: DashMap<ChannelId, Vec<u8>>,
    liveness: AtomicU64,
    delivered: AtomicU64,
    faults: FaultInjection,
}

impl LocalExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: FaultInjection) -> Self {
        Self {
            faults,
            ..Self::default()
        }
    }

    /// Advances the liveness counter and releases held frames.
    pub fn tick(&self) -> u64 {
        let beat = self.liveness.fetch_add(1, Ordering::SeqCst) + 1;
        let held: Vec<ChannelId> = self.held.iter().map(|e| e.key().clone()).collect();
        for dest in held {
            if let Some((_, frame)) = self.held.remove(&dest) {
                let _ = self.deliver(&dest, frame);
            }
        }
        beat
    }

    /// Ticks the liveness counter on a fixed interval until the exchange is
    /// dropped by everyone else.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let exchange = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match exchange.upgrade() {
                    Some(exchange) => {
                        exchange.tick();
                    }
                    None => break,
                }
            }
        })
    }

    /// Frames handed to an inbox so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn registered(&self) -> Vec<ChannelId> {
        self.routes.iter().map(|e| e.key().clone()).collect()
    }

    fn deliver(&self, dest: &ChannelId, frame: Vec<u8>) -> Result<(), ChannelError> {
        let sender = match self.routes.get(dest) {
            Some(sender) => sender.clone(),
            None => return Err(ChannelError::NotFound(dest.to_string())),
        };
        if sender.send(frame).is_err() {
            // inbox dropped without unregistering
            self.routes.remove(dest);
            return Err(ChannelError::NotFound(dest.to_string()));
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Exchange for LocalExchange {
    fn register(&self, id: &ChannelId, inbox: InboxSender) -> Result<(), ChannelError> {
        match self.routes.entry(id.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_closed() {
                    existing.insert(inbox);
                    Ok(())
                } else {
                    Err(ChannelError::Exchange(format!("{id} is already registered")))
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(inbox);
                debug!(channel = %id, "registered with exchange");
                Ok(())
            }
        }
    }

    fn unregister(&self, id: &ChannelId) -> bool {
        self.held.remove(id);
        let removed = self.routes.remove(id).is_some();
        if removed {
            debug!(channel = %id, "unregistered from exchange");
        }
        removed
    }

    fn is_registered(&self, id: &ChannelId) -> bool {
        self.routes.get(id).is_some_and(|s| !s.is_closed())
    }

    fn send(&self, dest: &ChannelId, frame: Vec<u8>) -> Result<(), ChannelError> {
        if !self.routes.contains_key(dest) {
            return Err(ChannelError::NotFound(dest.to_string()));
        }
        trace!(dest = %dest, bytes = frame.len(), "exchange send");
        if self.faults.duplicate {
            self.deliver(dest, frame.clone())?;
        }
        if self.faults.reorder {
            return match self.held.remove(dest) {
                Some((_, earlier)) => {
                    self.deliver(dest, frame)?;
                    self.deliver(dest, earlier)
                }
                None => {
                    self.held.insert(dest.clone(), frame);
                    Ok(())
                }
            };
        }
        self.deliver(dest, frame)
    }

    fn liveness(&self) -> u64 {
        self.liveness.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ChannelId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_unknown_destination_is_not_found() {
        let exchange = LocalExchange::new();
        assert!(matches!(
            exchange.send(&id("room.1"), vec![1]),
            Err(ChannelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_registration_refused() {
        let exchange = LocalExchange::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        exchange.register(&id("master.0"), tx1).unwrap();
        assert!(exchange.register(&id("master.0"), tx2).is_err());
        assert!(exchange.unregister(&id("master.0")));
        assert!(!exchange.is_registered(&id("master.0")));
    }

    #[tokio::test]
    async fn test_closed_inbox_can_be_replaced() {
        let exchange = LocalExchange::new();
        let (tx1, rx1) = mpsc::unbounded_channel();
        exchange.register(&id("room.1"), tx1).unwrap();
        drop(rx1);
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        exchange.register(&id("room.1"), tx2).unwrap();
        exchange.send(&id("room.1"), vec![9]).unwrap();
        assert_eq!(rx2.recv().await, Some(vec![9]));
    }

    #[tokio::test]
    async fn test_reorder_swaps_pairs_and_tick_releases() {
        let exchange = LocalExchange::with_faults(FaultInjection {
            duplicate: false,
            reorder: true,
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        exchange.register(&id("room.1"), tx).unwrap();
        for b in 1..=3u8 {
            exchange.send(&id("room.1"), vec![b]).unwrap();
        }
        assert_eq!(rx.recv().await, Some(vec![2]));
        assert_eq!(rx.recv().await, Some(vec![1]));
        assert!(rx.try_recv().is_err());
        assert_eq!(exchange.tick(), 1);
        assert_eq!(rx.recv().await, Some(vec![3]));
    }
}
