//! # Reliable Ordered Delivery
//!
//! Per-peer sequencing on top of an exchange that may reorder or duplicate
//! packets. For every peer a channel talks to it keeps:
//!
//! * `recv_seq` - highest sequence accepted in order from that peer
//! * `send_seq` - next sequence to stamp on a packet to that peer
//! * the beat of the last send and the last acknowledgment received
//! * a buffer of out-of-order packets keyed by sequence
//!
//! Time is measured in liveness heartbeats ("beats") supplied by the caller,
//! never wall-clock, so a pause that stalls the whole process does not make
//! buffered packets look overdue.
//!
//! The state machine is IO-free: callers feed packets and beats in and get
//! back the items that are ready for dispatch, in order.

use crate::ids::ChannelId;
use crate::packet::{seq_ahead, seq_distance, seq_next, SEQ_HALF, SEQ_MASK};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

/// Thresholds of the ordering layer, in liveness beats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderingSettings {
    /// Beats a gap may stay open before the oldest buffered packet is forced
    pub recovery_beats: u64,
    /// Beats without sending to a peer after which the next send starts a
    /// new sequence run, since the peer may have been recreated meanwhile
    pub freshness_beats: u64,
    /// Quiet beats after which all state about a peer is dropped
    pub forget_beats: u64,
}

impl Default for OrderingSettings {
    fn default() -> Self {
        Self {
            recovery_beats: 3,
            freshness_beats: 10,
            forget_beats: 120,
        }
    }
}

/// Ordering header stamped on an outbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendHeader {
    pub seq: u32,
    pub new_seq: bool,
    pub ack: Option<u32>,
}

/// What happened to one inbound packet.
#[derive(Debug)]
pub struct Received<T> {
    /// Items ready for dispatch, in send order
    pub deliver: Vec<T>,
    /// The packet was buffered behind a gap
    pub buffered: bool,
    /// The packet was already seen and was dropped
    pub duplicate: bool,
}

impl<T> Received<T> {
    fn dropped() -> Self {
        Self {
            deliver: Vec::new(),
            buffered: false,
            duplicate: true,
        }
    }
}

/// Items forced out of one peer's buffer by the recovery timer.
#[derive(Debug)]
pub struct Recovered<T> {
    pub peer: ChannelId,
    /// Sequence that was forced past the gap
    pub forced_seq: u32,
    pub deliver: Vec<T>,
}

#[derive(Debug)]
struct Buffered<T> {
    item: T,
    arrival: u64,
}

#[derive(Debug)]
struct PeerState<T> {
    recv_seq: Option<u32>,
    run_start: Option<u32>,
    send_seq: u32,
    started_run: bool,
    force_new_seq: bool,
    acked_seq: Option<u32>,
    last_send: Option<u64>,
    ack_sent: Option<u32>,
    pending: HashMap<u32, Buffered<T>>,
    recovery_started: Option<u64>,
    last_activity: u64,
}

impl<T> PeerState<T> {
    fn new(now: u64) -> Self {
        Self {
            recv_seq: None,
            run_start: None,
            // random start so a restarted sender's first run is not mistaken
            // for a replay of its previous one
            send_seq: (Uuid::new_v4().as_u128() as u32) & SEQ_MASK,
            started_run: false,
            force_new_seq: false,
            acked_seq: None,
            last_send: None,
            ack_sent: None,
            pending: HashMap::new(),
            recovery_started: None,
            last_activity: now,
        }
    }

    fn drain(&mut self, deliver: &mut Vec<T>) {
        while let Some(recv) = self.recv_seq {
            let next = seq_next(recv);
            match self.pending.remove(&next) {
                Some(buffered) => {
                    deliver.push(buffered.item);
                    self.recv_seq = Some(next);
                }
                None => break,
            }
        }
        if self.pending.is_empty() {
            self.recovery_started = None;
        }
    }

    /// Buffered sequence that comes first in send order.
    fn oldest_pending(&self) -> Option<u32> {
        let reference = match self.recv_seq {
            Some(recv) => recv,
            None => {
                // no in-order history: anchor a quarter window before the
                // first packet that arrived
                let first = self
                    .pending
                    .iter()
                    .min_by_key(|(_, b)| b.arrival)
                    .map(|(seq, _)| *seq)?;
                first.wrapping_sub(SEQ_HALF / 2) & SEQ_MASK
            }
        };
        self.pending
            .keys()
            .copied()
            .min_by_key(|seq| seq_distance(reference, *seq))
    }
}

/// Sequencing state of one channel towards all of its peers.
#[derive(Debug)]
pub struct ReliableOrdering<T> {
    settings: OrderingSettings,
    peers: HashMap<ChannelId, PeerState<T>>,
    arrivals: u64,
}

impl<T> ReliableOrdering<T> {
    pub fn new(settings: OrderingSettings) -> Self {
        Self {
            settings,
            peers: HashMap::new(),
            arrivals: 0,
        }
    }

    pub fn settings(&self) -> &OrderingSettings {
        &self.settings
    }

    fn peer(&mut self, peer: &ChannelId, now: u64) -> &mut PeerState<T> {
        self.peers
            .entry(peer.clone())
            .or_insert_with(|| PeerState::new(now))
    }

    /// Accepts one sequenced packet from `peer`.
    pub fn receive(
        &mut self,
        peer: &ChannelId,
        seq: u32,
        new_seq: bool,
        item: T,
        now: u64,
    ) -> Received<T> {
        self.arrivals += 1;
        let arrival = self.arrivals;
        let state = self.peer(peer, now);
        state.last_activity = now;

        if new_seq {
            if state.recv_seq == Some(seq) || state.run_start == Some(seq) {
                return Received::dropped();
            }
            state.run_start = Some(seq);
            // a new run supersedes anything buffered from before it
            state.pending.retain(|buffered_seq, _| seq_ahead(seq, *buffered_seq));
            state.recv_seq = Some(seq);
            let mut deliver = vec![item];
            state.drain(&mut deliver);
            return Received {
                deliver,
                buffered: false,
                duplicate: false,
            };
        }

        if let Some(recv) = state.recv_seq {
            if seq == seq_next(recv) {
                state.recv_seq = Some(seq);
                let mut deliver = vec![item];
                state.drain(&mut deliver);
                return Received {
                    deliver,
                    buffered: false,
                    duplicate: false,
                };
            }
            if !seq_ahead(recv, seq) {
                return Received::dropped();
            }
        }

        if state.pending.contains_key(&seq) {
            return Received::dropped();
        }
        if state.pending.is_empty() {
            state.recovery_started = Some(now);
        }
        state.pending.insert(seq, Buffered { item, arrival });
        debug!(peer = %peer, seq, expected = ?state.recv_seq.map(seq_next), "buffered out-of-order packet");
        Received {
            deliver: Vec::new(),
            buffered: true,
            duplicate: false,
        }
    }

    /// Forces the oldest buffered packet of every peer whose gap has been
    /// open for at least `recovery_beats`, then drains what follows it.
    pub fn poll_recovery(&mut self, now: u64) -> Vec<Recovered<T>> {
        let recovery_beats = self.settings.recovery_beats;
        let mut recovered = Vec::new();
        for (peer, state) in self.peers.iter_mut() {
            let Some(started) = state.recovery_started else {
                continue;
            };
            if now.saturating_sub(started) < recovery_beats {
                continue;
            }
            let Some(forced_seq) = state.oldest_pending() else {
                state.recovery_started = None;
                continue;
            };
            let Some(buffered) = state.pending.remove(&forced_seq) else {
                continue;
            };
            warn!(
                peer = %peer,
                forced_seq,
                expected = ?state.recv_seq.map(seq_next),
                waited_beats = now.saturating_sub(started),
                "ordering gap never closed, forcing delivery"
            );
            state.recv_seq = Some(forced_seq);
            state.last_activity = now;
            let mut deliver = vec![buffered.item];
            state.drain(&mut deliver);
            if !state.pending.is_empty() {
                state.recovery_started = Some(now);
            }
            recovered.push(Recovered {
                peer: peer.clone(),
                forced_seq,
                deliver,
            });
        }
        recovered
    }

    /// Stamps the ordering header for the next packet to `peer`.
    pub fn next_send(&mut self, peer: &ChannelId, now: u64) -> SendHeader {
        let freshness = self.settings.freshness_beats;
        let state = self.peer(peer, now);
        let stale = state
            .last_send
            .is_some_and(|sent_at| now.saturating_sub(sent_at) > freshness);
        let new_seq = !state.started_run || state.force_new_seq || stale;
        let seq = state.send_seq;
        state.send_seq = seq_next(seq);
        state.started_run = true;
        state.force_new_seq = false;
        state.last_send = Some(now);
        state.last_activity = now;
        state.ack_sent = state.recv_seq;
        SendHeader {
            seq,
            new_seq,
            ack: state.recv_seq,
        }
    }

    /// Records an acknowledgment received from `peer`.
    pub fn on_ack(&mut self, peer: &ChannelId, acked: u32, now: u64) {
        let Some(state) = self.peers.get_mut(peer) else {
            return;
        };
        state.last_activity = now;
        state.acked_seq = Some(acked);
    }

    /// Makes the next send to `peer` start a new run, e.g. after a failed
    /// delivery consumed a sequence number the peer never saw.
    pub fn reset_send(&mut self, peer: &ChannelId) {
        if let Some(state) = self.peers.get_mut(peer) {
            state.force_new_seq = true;
        }
    }

    /// Peers owed a standalone acknowledgment, with the sequence to ack.
    pub fn take_pending_acks(&mut self) -> Vec<(ChannelId, u32)> {
        let mut acks = Vec::new();
        for (peer, state) in self.peers.iter_mut() {
            if let Some(recv) = state.recv_seq {
                if state.ack_sent != Some(recv) {
                    state.ack_sent = Some(recv);
                    acks.push((peer.clone(), recv));
                }
            }
        }
        acks
    }

    /// Drops peers that have been quiet for `forget_beats` and hold nothing.
    pub fn forget_idle(&mut self, now: u64) -> usize {
        let forget = self.settings.forget_beats;
        let before = self.peers.len();
        self.peers.retain(|_, state| {
            !state.pending.is_empty() || now.saturating_sub(state.last_activity) < forget
        });
        before - self.peers.len()
    }

    /// Packets buffered behind gaps, across all peers.
    pub fn pending_count(&self) -> usize {
        self.peers.values().map(|s| s.pending.len()).sum()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Highest in-order sequence accepted from `peer`.
    pub fn recv_seq(&self, peer: &ChannelId) -> Option<u32> {
        self.peers.get(peer).and_then(|s| s.recv_seq)
    }

    /// Last acknowledgment received from `peer`.
    pub fn acked_seq(&self, peer: &ChannelId) -> Option<u32> {
        self.peers.get(peer).and_then(|s| s.acked_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> ChannelId {
        "room.1".parse().unwrap()
    }

    fn ordering() -> ReliableOrdering<u32> {
        ReliableOrdering::new(OrderingSettings::default())
    }

    /// Feeds packets stamped by a real sender, delivered in `order`.
    fn deliver_in(order: &[usize], count: usize) -> Vec<u32> {
        let mut sender: ReliableOrdering<u32> = ordering();
        let receiver_id: ChannelId = "room.2".parse().unwrap();
        let headers: Vec<SendHeader> = (0..count).map(|_| sender.next_send(&receiver_id, 0)).collect();

        let mut receiver = ordering();
        let mut seen = Vec::new();
        for &i in order {
            let h = headers[i];
            let out = receiver.receive(&peer(), h.seq, h.new_seq, i as u32, 0);
            seen.extend(out.deliver);
        }
        seen
    }

    #[test]
    fn test_in_order_dispatch() {
        assert_eq!(deliver_in(&[0, 1, 2, 3], 4), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_reordered_packets_dispatch_in_send_order() {
        assert_eq!(deliver_in(&[0, 3, 2, 1, 5, 4], 6), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_duplicates_dispatch_once() {
        assert_eq!(deliver_in(&[0, 2, 2, 1, 1, 0, 3], 4), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_replayed_run_start_is_dropped() {
        let mut receiver = ordering();
        receiver.receive(&peer(), 40, true, 40, 0);
        receiver.receive(&peer(), 41, false, 41, 0);
        assert!(receiver.receive(&peer(), 40, true, 40, 0).duplicate);
        assert_eq!(receiver.recv_seq(&peer()), Some(41));
    }

    #[test]
    fn test_first_packet_starts_new_run() {
        let mut sender = ordering();
        let h = sender.next_send(&peer(), 0);
        assert!(h.new_seq);
        assert!(!sender.next_send(&peer(), 0).new_seq);
    }

    #[test]
    fn test_forced_recovery_after_recovery_beats() {
        let mut receiver = ordering();
        assert_eq!(receiver.receive(&peer(), 10, true, 10, 0).deliver, vec![10]);
        // 11 is lost; 12 and 13 wait behind the gap
        assert!(receiver.receive(&peer(), 12, false, 12, 1).buffered);
        assert!(receiver.receive(&peer(), 13, false, 13, 1).buffered);
        assert_eq!(receiver.pending_count(), 2);

        assert!(receiver.poll_recovery(3).is_empty());
        let recovered = receiver.poll_recovery(4);
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].forced_seq, 12);
        assert_eq!(recovered[0].deliver, vec![12, 13]);
        assert_eq!(receiver.pending_count(), 0);

        // the gap is gone, the next packet dispatches immediately
        assert_eq!(receiver.receive(&peer(), 14, false, 14, 5).deliver, vec![14]);
        // the late packet is now behind and dropped
        assert!(receiver.receive(&peer(), 11, false, 11, 5).duplicate);
    }

    #[test]
    fn test_recovery_without_history_picks_earliest_in_send_order() {
        let mut receiver = ordering();
        // receiver restarted: no run start seen
        receiver.receive(&peer(), 58, false, 58, 0);
        receiver.receive(&peer(), 57, false, 57, 0);
        let recovered = receiver.poll_recovery(3);
        assert_eq!(recovered[0].forced_seq, 57);
        assert_eq!(recovered[0].deliver, vec![57, 58]);
    }

    #[test]
    fn test_new_seq_drops_superseded_buffer() {
        let mut receiver = ordering();
        receiver.receive(&peer(), 0, true, 0, 0);
        receiver.receive(&peer(), 5, false, 5, 0);
        let out = receiver.receive(&peer(), 100, true, 100, 0);
        assert_eq!(out.deliver, vec![100]);
        assert_eq!(receiver.pending_count(), 0);
    }

    #[test]
    fn test_wraparound() {
        let mut receiver = ordering();
        receiver.receive(&peer(), SEQ_MASK - 1, true, 0, 0);
        assert!(receiver.receive(&peer(), 0, false, 2, 0).buffered);
        let out = receiver.receive(&peer(), SEQ_MASK, false, 1, 0);
        assert_eq!(out.deliver, vec![1, 2]);
    }

    #[test]
    fn test_quiet_peer_gets_new_run() {
        let mut sender = ordering();
        sender.next_send(&peer(), 0);
        assert!(!sender.next_send(&peer(), 5).new_seq);
        let restarted = sender.next_send(&peer(), 16);
        assert!(restarted.new_seq);
        assert!(!sender.next_send(&peer(), 20).new_seq);
    }

    #[test]
    fn test_acked_quiet_peer_gets_new_run() {
        let receiver_id: ChannelId = "room.2".parse().unwrap();
        let mut sender = ordering();
        let first = sender.next_send(&receiver_id, 0);
        sender.on_ack(&receiver_id, first.seq, 1);
        assert_eq!(sender.acked_seq(&receiver_id), Some(first.seq));

        // the receiver was recreated while the sender was quiet
        let later = sender.next_send(&receiver_id, 200);
        assert!(later.new_seq);
        let mut recreated = ordering();
        let out = recreated.receive(&peer(), later.seq, later.new_seq, 7, 200);
        assert_eq!(out.deliver, vec![7]);
        assert!(!out.buffered);
        assert_eq!(recreated.pending_count(), 0);
    }

    #[test]
    fn test_reset_send_forces_new_run() {
        let mut sender = ordering();
        sender.next_send(&peer(), 0);
        sender.reset_send(&peer());
        assert!(sender.next_send(&peer(), 0).new_seq);
    }

    #[test]
    fn test_pending_acks_and_forgetting() {
        let mut receiver = ordering();
        receiver.receive(&peer(), 3, true, 3, 0);
        assert_eq!(receiver.take_pending_acks(), vec![(peer(), 3)]);
        assert!(receiver.take_pending_acks().is_empty());

        assert_eq!(receiver.forget_idle(119), 0);
        assert_eq!(receiver.forget_idle(120), 1);
        assert_eq!(receiver.peer_count(), 0);
    }
}
