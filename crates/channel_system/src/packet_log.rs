//! Bounded ring of recent packet summaries, dumped next to a failing packet.

use crate::ids::ChannelId;
use std::collections::VecDeque;
use std::fmt;

/// Direction of a logged packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Summary of one packet; bodies are not retained.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketSummary {
    pub direction: Direction,
    pub peer: ChannelId,
    pub seq: Option<u32>,
    pub verb: String,
    pub beat: u64,
    pub bytes: usize,
}

impl fmt::Display for PacketSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.direction {
            Direction::Inbound => "<-",
            Direction::Outbound => "->",
        };
        let seq = self
            .seq
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "[beat {}] {} {} seq={} {} ({}B)",
            self.beat, arrow, self.peer, seq, self.verb, self.bytes
        )
    }
}

/// Fixed-capacity history; the oldest entry is evicted first.
#[derive(Debug)]
pub struct PacketRing {
    entries: VecDeque<PacketSummary>,
    capacity: usize,
}

impl PacketRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, summary: PacketSummary) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(summary);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest-first rendering, one packet per line.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(seq: u32) -> PacketSummary {
        PacketSummary {
            direction: Direction::Inbound,
            peer: "room.1".parse().unwrap(),
            seq: Some(seq),
            verb: "chat_send".into(),
            beat: 4,
            bytes: 10,
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut ring = PacketRing::new(2);
        ring.record(summary(1));
        ring.record(summary(2));
        ring.record(summary(3));
        assert_eq!(ring.len(), 2);
        let rendered = ring.render();
        assert!(!rendered.contains("seq=1 "));
        assert!(rendered.starts_with("[beat 4] <- room.1 seq=2 chat_send"));
    }

    #[test]
    fn test_zero_capacity_records_nothing() {
        let mut ring = PacketRing::new(0);
        ring.record(summary(1));
        assert!(ring.is_empty());
    }
}
