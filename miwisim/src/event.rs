//! Event types and priority queue ordering for the discrete event loop.

use std::cmp::Ordering;

use miwi::{LongAddress, ReceivedFrame, SearchTarget};

/// Unique sequence number for deterministic event ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Scenario actions that can be scheduled during simulation.
#[derive(Debug, Clone)]
pub enum ScenarioAction {
    /// Take down every link between different groups.
    Partition { groups: Vec<Vec<LongAddress>> },
    /// Bring every link back up.
    HealPartition,
    DisableLink { from: LongAddress, to: LongAddress },
    EnableLink { from: LongAddress, to: LongAddress },
    SetLossRate {
        from: LongAddress,
        to: LongAddress,
        rate: f64,
    },
    /// Application send; `to: None` broadcasts.
    Send {
        from: LongAddress,
        to: Option<LongAddress>,
        payload: Vec<u8>,
        secured: bool,
    },
    /// Start a connection search.
    Connect {
        node: LongAddress,
        target: SearchTarget,
    },
    /// Start moving the network to `channel`.
    Hop { node: LongAddress, channel: u8 },
    /// Retune one device without telling anyone.
    SetChannel { node: LongAddress, channel: u8 },
    /// Put the device's radio to sleep.
    Sleep { node: LongAddress },
    /// Wake the device and poll its parent for queued data.
    CheckForData { node: LongAddress },
    ActiveScan {
        node: LongAddress,
        duration_class: u8,
        channel_map: u32,
    },
    EnergyScan {
        node: LongAddress,
        duration_class: u8,
        channel_map: u32,
    },
    /// Look for the peer in `slot` across `channel_map`.
    Resync {
        node: LongAddress,
        slot: usize,
        channel_map: u32,
    },
    /// Energy every radio reads on `channel`.
    SetNoise { channel: u8, level: u8 },
    TakeSnapshot,
}

/// Events in the discrete event simulation.
#[derive(Debug, Clone)]
pub enum Event {
    /// Put a frame into a device's receive bank.
    Deliver {
        to: LongAddress,
        frame: ReceivedFrame,
        /// Channel the frame was sent on.
        channel: u8,
    },
    Action(ScenarioAction),
}

/// A scheduled event with its time and sequence number.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    /// Microseconds since the simulation started.
    pub at: u64,
    /// Tie-break for events due at the same time.
    pub seq: SequenceNumber,
    pub event: Event,
}

impl ScheduledEvent {
    pub fn new(at: u64, seq: SequenceNumber, event: Event) -> Self {
        Self { at, seq, event }
    }
}

// BinaryHeap is a max-heap; reverse so the earliest event pops first.
impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.at.cmp(&self.at) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BinaryHeap;

    use super::*;

    fn heal(at: u64, seq: u64) -> ScheduledEvent {
        ScheduledEvent::new(at, SequenceNumber::new(seq), Event::Action(ScenarioAction::HealPartition))
    }

    #[test]
    fn test_event_ordering() {
        // earlier time is "greater" so it pops first
        assert!(heal(5_000, 2) > heal(10_000, 1));
    }

    #[test]
    fn test_same_time_sequence_ordering() {
        assert!(heal(10_000, 1) > heal(10_000, 2));
    }

    #[test]
    fn test_heap_pops_in_time_then_sequence_order() {
        let mut heap = BinaryHeap::new();
        heap.push(heal(30, 0));
        heap.push(heal(10, 2));
        heap.push(heal(10, 1));
        heap.push(heal(20, 3));
        let order: Vec<_> = std::iter::from_fn(|| heap.pop())
            .map(|e| (e.at, e.seq.value()))
            .collect();
        assert_eq!(order, [(10, 1), (10, 2), (20, 3), (30, 0)]);
    }
}
