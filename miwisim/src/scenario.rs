//! Scenario builder for setting up and running simulations.

use miwi::{Duration, Error, LongAddress, SearchTarget, Settings, Tick};

use crate::event::ScenarioAction;
use crate::metrics::SimulationResult;
use crate::sim::{Simulator, DEFAULT_STEP};
use crate::topology::Topology;

/// Address of the `index`-th device of a scenario.
pub fn node_address(index: usize) -> LongAddress {
    LongAddress::from_u64(0x0004_A3FF_FE00_0000 + index as u64 + 1)
}

/// Type of topology to generate.
#[derive(Debug, Clone)]
enum TopologyType {
    FullyConnected,
    /// Each device hears only its neighbours by index.
    Chain,
    /// Device 0 is the hub.
    Star,
    Custom(Topology),
}

/// Builder for simulation scenarios.
///
/// Devices and actions are named by index; addresses come from [`node_address`].
pub struct ScenarioBuilder {
    num_nodes: usize,
    seed: u64,
    topology_type: TopologyType,
    loss_rate: f64,
    delay: Duration,
    step: Duration,
    start: Tick,
    /// Indices of devices that sleep between polls.
    sleeping: Vec<usize>,
    security: bool,
    noise: Vec<(u8, u8)>,
    actions: Vec<(Duration, ScenarioAction)>,
    snapshot_interval: Option<Duration>,
}

impl Default for ScenarioBuilder {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ScenarioBuilder {
    /// Scenario with `num_nodes` fully connected devices on channel 11.
    pub fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            seed: 42,
            topology_type: TopologyType::FullyConnected,
            loss_rate: 0.0,
            delay: Duration::from_millis(1),
            step: DEFAULT_STEP,
            start: Tick::ZERO,
            sleeping: Vec::new(),
            security: false,
            noise: Vec::new(),
            actions: Vec::new(),
            snapshot_interval: None,
        }
    }

    /// Set the RNG seed for frame loss.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Use a custom topology over [`node_address`] addresses.
    pub fn topology(mut self, topo: Topology) -> Self {
        self.topology_type = TopologyType::Custom(topo);
        self
    }

    pub fn fully_connected(mut self) -> Self {
        self.topology_type = TopologyType::FullyConnected;
        self
    }

    pub fn chain_topology(mut self) -> Self {
        self.topology_type = TopologyType::Chain;
        self
    }

    pub fn star_topology(mut self) -> Self {
        self.topology_type = TopologyType::Star;
        self
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Time between two engine polls.
    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    /// Start every clock at `tick`.
    pub fn starting_at(mut self, tick: Tick) -> Self {
        self.start = tick;
        self
    }

    /// Devices at `indices` sleep between polls.
    pub fn with_sleeping(mut self, indices: &[usize]) -> Self {
        self.sleeping.extend_from_slice(indices);
        self
    }

    /// Advertise security on every device.
    pub fn with_security(mut self) -> Self {
        self.security = true;
        self
    }

    /// Energy every radio reads on `channel`.
    pub fn with_noise(mut self, channel: u8, level: u8) -> Self {
        self.noise.push((channel, level));
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self
    }

    /// Schedule any action `at` after the start.
    pub fn action_at(mut self, at: Duration, action: ScenarioAction) -> Self {
        self.actions.push((at, action));
        self
    }

    /// Device `node` starts a connection search.
    pub fn connect_at(self, at: Duration, node: usize) -> Self {
        self.action_at(
            at,
            ScenarioAction::Connect {
                node: node_address(node),
                target: SearchTarget::Any,
            },
        )
    }

    /// Device `from` sends `payload` to `to`, or broadcasts it.
    pub fn send_at(
        self,
        at: Duration,
        from: usize,
        to: Option<usize>,
        payload: &[u8],
        secured: bool,
    ) -> Self {
        self.action_at(
            at,
            ScenarioAction::Send {
                from: node_address(from),
                to: to.map(node_address),
                payload: payload.to_vec(),
                secured,
            },
        )
    }

    pub fn hop_at(self, at: Duration, node: usize, channel: u8) -> Self {
        self.action_at(
            at,
            ScenarioAction::Hop {
                node: node_address(node),
                channel,
            },
        )
    }

    pub fn set_channel_at(self, at: Duration, node: usize, channel: u8) -> Self {
        self.action_at(
            at,
            ScenarioAction::SetChannel {
                node: node_address(node),
                channel,
            },
        )
    }

    pub fn sleep_at(self, at: Duration, node: usize) -> Self {
        self.action_at(
            at,
            ScenarioAction::Sleep {
                node: node_address(node),
            },
        )
    }

    /// Device `node` wakes and polls its parent.
    pub fn check_for_data_at(self, at: Duration, node: usize) -> Self {
        self.action_at(
            at,
            ScenarioAction::CheckForData {
                node: node_address(node),
            },
        )
    }

    pub fn active_scan_at(self, at: Duration, node: usize, duration_class: u8, channel_map: u32) -> Self {
        self.action_at(
            at,
            ScenarioAction::ActiveScan {
                node: node_address(node),
                duration_class,
                channel_map,
            },
        )
    }

    pub fn energy_scan_at(self, at: Duration, node: usize, duration_class: u8, channel_map: u32) -> Self {
        self.action_at(
            at,
            ScenarioAction::EnergyScan {
                node: node_address(node),
                duration_class,
                channel_map,
            },
        )
    }

    pub fn resync_at(self, at: Duration, node: usize, slot: usize, channel_map: u32) -> Self {
        self.action_at(
            at,
            ScenarioAction::Resync {
                node: node_address(node),
                slot,
                channel_map,
            },
        )
    }

    /// Isolate groups of devices from each other.
    pub fn partition_at(self, at: Duration, groups: Vec<Vec<usize>>) -> Self {
        let groups = groups
            .into_iter()
            .map(|g| g.into_iter().map(node_address).collect())
            .collect();
        self.action_at(at, ScenarioAction::Partition { groups })
    }

    pub fn heal_at(self, at: Duration) -> Self {
        self.action_at(at, ScenarioAction::HealPartition)
    }

    /// Build the simulator with every device and scheduled action.
    pub fn build(self) -> Result<(Simulator, Vec<LongAddress>), Error> {
        let addresses: Vec<LongAddress> = (0..self.num_nodes).map(node_address).collect();

        let mut topo = match self.topology_type {
            TopologyType::FullyConnected => Topology::fully_connected(&addresses),
            TopologyType::Chain => Topology::chain(&addresses),
            TopologyType::Star => Topology::star(&addresses),
            TopologyType::Custom(t) => t,
        };
        if self.loss_rate > 0.0 {
            topo.set_global_loss_rate(self.loss_rate);
        }
        topo.set_global_delay(self.delay);

        let mut sim = Simulator::new(self.seed)
            .starting_at(self.start)
            .with_step(self.step)
            .with_topology(topo);
        if let Some(interval) = self.snapshot_interval {
            sim = sim.with_snapshot_interval(interval);
        }

        for &(channel, level) in &self.noise {
            sim.schedule_action(Duration::ZERO, ScenarioAction::SetNoise { channel, level });
        }

        for (i, &address) in addresses.iter().enumerate() {
            let mut settings = Settings::new(address);
            settings.sleeping_device = self.sleeping.contains(&i);
            settings.security = self.security;
            sim.add_node(settings)?;
        }

        for (at, action) in self.actions {
            sim.schedule_action(at, action);
        }
        log::debug!("scenario built with {} device(s)", addresses.len());
        Ok((sim, addresses))
    }

    /// Build and run the simulation for `duration`.
    pub fn run_for(self, duration: Duration) -> Result<SimulationResult, Error> {
        let (mut sim, _) = self.build()?;
        Ok(sim.run_for(duration))
    }
}

/// N fully connected listening devices.
pub fn simple_scenario(num_nodes: usize) -> ScenarioBuilder {
    ScenarioBuilder::new(num_nodes).fully_connected()
}

/// A hub (device 0) with `spokes` sleeping devices around it.
pub fn sleepy_star_scenario(spokes: usize) -> ScenarioBuilder {
    let sleepers: Vec<usize> = (1..=spokes).collect();
    ScenarioBuilder::new(spokes + 1)
        .star_topology()
        .with_sleeping(&sleepers)
}
