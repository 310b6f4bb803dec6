//! Metrics collection for simulation analysis.

use hashbrown::HashMap;
use miwi::LongAddress;

/// Channels and connections of every device at one point in time.
#[derive(Debug, Clone)]
pub struct NetworkSnapshot {
    /// Microseconds since the simulation started.
    pub at: u64,
    pub channels: HashMap<LongAddress, u8>,
    /// Peer addresses bound in each device's connection table.
    pub connections: HashMap<LongAddress, Vec<LongAddress>>,
}

impl NetworkSnapshot {
    pub fn new(at: u64) -> Self {
        Self {
            at,
            channels: HashMap::new(),
            connections: HashMap::new(),
        }
    }

    pub fn record_node(&mut self, node: LongAddress, channel: u8, peers: Vec<LongAddress>) {
        self.channels.insert(node, channel);
        self.connections.insert(node, peers);
    }

    /// Every device is tuned to `channel`.
    pub fn all_on_channel(&self, channel: u8) -> bool {
        self.channels.values().all(|&c| c == channel)
    }

    /// Number of distinct channels in use.
    pub fn channel_count(&self) -> usize {
        let mut channels: Vec<u8> = self.channels.values().copied().collect();
        channels.sort_unstable();
        channels.dedup();
        channels.len()
    }

    /// Both devices hold each other in their connection tables.
    pub fn connected(&self, a: LongAddress, b: LongAddress) -> bool {
        let knows = |x: LongAddress, y: LongAddress| {
            self.connections
                .get(&x)
                .is_some_and(|peers| peers.contains(&y))
        };
        knows(a, b) && knows(b, a)
    }

    pub fn connection_count(&self, node: LongAddress) -> usize {
        self.connections.get(&node).map_or(0, Vec::len)
    }
}

/// Frame counters collected over a run.
#[derive(Debug, Clone, Default)]
pub struct SimMetrics {
    /// Transmissions handed to the air.
    pub frames_sent: u64,
    /// Frames accepted into a receive bank.
    pub frames_delivered: u64,
    /// Frames dropped by link loss.
    pub frames_lost: u64,
    /// Unicasts whose destination had no active link to the sender.
    pub frames_unreachable: u64,
    /// Frames arriving while the receiver was tuned elsewhere.
    pub off_channel: u64,
    /// Frames arriving while the receiver's radio slept.
    pub to_sleeping_radio: u64,
    /// Frames dropped because the receive bank was full.
    pub rx_overflow: u64,
    /// Scheduled actions the engine refused.
    pub failed_actions: u64,
    pub snapshots: Vec<NetworkSnapshot>,
}

impl SimMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_snapshot(&mut self, snapshot: NetworkSnapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn latest_snapshot(&self) -> Option<&NetworkSnapshot> {
        self.snapshots.last()
    }

    /// First time every device was on `channel`.
    pub fn settled_on(&self, channel: u8) -> Option<u64> {
        self.snapshots
            .iter()
            .find(|s| s.all_on_channel(channel))
            .map(|s| s.at)
    }
}

/// Result of running a simulation.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    /// Microseconds since the simulation started.
    pub end: u64,
    pub metrics: SimMetrics,
}

impl SimulationResult {
    /// Every device ended on `channel`.
    pub fn all_on_channel(&self, channel: u8) -> bool {
        self.metrics
            .latest_snapshot()
            .is_some_and(|s| s.all_on_channel(channel))
    }

    pub fn connected(&self, a: LongAddress, b: LongAddress) -> bool {
        self.metrics
            .latest_snapshot()
            .is_some_and(|s| s.connected(a, b))
    }
}
