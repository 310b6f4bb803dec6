//! Discrete event simulator for miwi networks.
//!
//! Time advances in fixed steps. Each step delivers the frames and actions that
//! fell due, runs every engine once at the new tick, and routes whatever the
//! engines transmitted through the topology.

use std::collections::BinaryHeap;

use hashbrown::HashMap;
use miwi::{AssessmentMode, Duration, Error, LongAddress, PowerMode, ReceivedFrame, Settings, Tick};

use crate::event::{Event, ScenarioAction, ScheduledEvent, SequenceNumber};
use crate::metrics::{NetworkSnapshot, SimMetrics, SimulationResult};
use crate::node::{SimEngine, SimNode, Transmission};
use crate::topology::Topology;

/// Default time between two engine polls.
pub const DEFAULT_STEP: Duration = Duration::from_millis(1);

/// Discrete event simulator.
pub struct Simulator {
    nodes: HashMap<LongAddress, SimNode>,
    /// Insertion order; engines run in this order every step.
    order: Vec<LongAddress>,
    topology: Topology,
    /// Tick every clock reads at elapsed time zero.
    start: Tick,
    /// Microseconds since the simulation started.
    elapsed: u64,
    step: Duration,
    event_queue: BinaryHeap<ScheduledEvent>,
    metrics: SimMetrics,
    next_seq: u64,
    /// RNG state for frame loss.
    rng_state: u64,
    /// Energy level per channel, applied to every radio.
    noise: HashMap<u8, u8>,
    snapshot_interval: Option<Duration>,
    next_snapshot: Option<u64>,
}

impl Simulator {
    /// Create a new simulator with given RNG seed.
    pub fn new(seed: u64) -> Self {
        Self {
            nodes: HashMap::new(),
            order: Vec::new(),
            topology: Topology::new(),
            start: Tick::ZERO,
            elapsed: 0,
            step: DEFAULT_STEP,
            event_queue: BinaryHeap::new(),
            metrics: SimMetrics::new(),
            next_seq: 0,
            rng_state: seed,
            noise: HashMap::new(),
            snapshot_interval: None,
            next_snapshot: None,
        }
    }

    /// Start every clock at `tick` instead of zero.
    ///
    /// Must be called before adding nodes.
    pub fn starting_at(mut self, tick: Tick) -> Self {
        self.start = tick;
        self
    }

    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = if step == Duration::ZERO {
            DEFAULT_STEP
        } else {
            step
        };
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self.next_snapshot = Some(self.elapsed + u64::from(interval.as_micros()));
        self
    }

    /// Bring up a device and add it to the simulation.
    pub fn add_node(&mut self, settings: Settings) -> Result<LongAddress, Error> {
        let mut node = SimNode::new(settings, self.now())?;
        for (&channel, &level) in &self.noise {
            node.radio_mut().set_noise(channel, level);
        }
        let address = node.address();
        if self.nodes.insert(address, node).is_none() {
            self.order.push(address);
        }
        Ok(address)
    }

    pub fn node(&self, address: &LongAddress) -> Option<&SimNode> {
        self.nodes.get(address)
    }

    pub fn node_mut(&mut self, address: &LongAddress) -> Option<&mut SimNode> {
        self.nodes.get_mut(address)
    }

    /// Device addresses in the order they were added.
    pub fn node_ids(&self) -> Vec<LongAddress> {
        self.order.clone()
    }

    /// Tick the engines currently read.
    pub fn now(&self) -> Tick {
        Tick::from_micros(self.start.as_micros().wrapping_add(self.elapsed as u32))
    }

    /// Microseconds since the simulation started.
    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topology
    }

    pub fn metrics(&self) -> &SimMetrics {
        &self.metrics
    }

    /// Schedule an event `at` microseconds after the start.
    pub fn schedule(&mut self, at: u64, event: Event) {
        let seq = SequenceNumber::new(self.next_seq);
        self.next_seq += 1;
        self.event_queue.push(ScheduledEvent::new(at, seq, event));
    }

    /// Schedule a scenario action `after` the start of the simulation.
    pub fn schedule_action(&mut self, after: Duration, action: ScenarioAction) {
        self.schedule(u64::from(after.as_micros()), Event::Action(action));
    }

    /// Run the simulation until `end` microseconds after the start.
    pub fn run_until(&mut self, end: u64) -> SimulationResult {
        let step = u64::from(self.step.as_micros());
        while self.elapsed < end {
            self.elapsed = (self.elapsed + step).min(end);
            self.process_due_events();
            self.step_nodes();
            self.maybe_take_snapshot();
        }
        self.take_snapshot();
        SimulationResult {
            end: self.elapsed,
            metrics: self.metrics.clone(),
        }
    }

    /// Run the simulation for `duration` more.
    pub fn run_for(&mut self, duration: Duration) -> SimulationResult {
        self.run_until(self.elapsed + u64::from(duration.as_micros()))
    }

    fn process_due_events(&mut self) {
        while self
            .event_queue
            .peek()
            .is_some_and(|e| e.at <= self.elapsed)
        {
            let Some(scheduled) = self.event_queue.pop() else {
                break;
            };
            match scheduled.event {
                Event::Deliver { to, frame, channel } => self.deliver(to, frame, channel),
                Event::Action(action) => self.execute_action(action),
            }
        }
    }

    /// Put a frame into a receive bank if the radio can hear it.
    fn deliver(&mut self, to: LongAddress, frame: ReceivedFrame, channel: u8) {
        let Some(node) = self.nodes.get(&to) else {
            return;
        };
        let radio = node.radio();
        if radio.channel() != channel {
            self.metrics.off_channel += 1;
        } else if radio.is_asleep() {
            self.metrics.to_sleeping_radio += 1;
        } else if radio.deliver(frame) {
            self.metrics.frames_delivered += 1;
        } else {
            log::debug!("{} receive bank full", to);
            self.metrics.rx_overflow += 1;
        }
    }

    fn step_nodes(&mut self) {
        let now = self.now();
        for address in self.order.clone() {
            let Some(node) = self.nodes.get_mut(&address) else {
                continue;
            };
            node.step(now);
            self.collect_outgoing(address);
        }
    }

    fn collect_outgoing(&mut self, sender: LongAddress) {
        let (pan, outgoing) = match self.nodes.get_mut(&sender) {
            Some(node) => (node.engine().pan_id(), node.take_outgoing()),
            None => return,
        };
        for transmission in outgoing {
            self.route(sender, pan, transmission);
        }
    }

    /// Schedule deliveries of one transmission to every device that can hear it.
    fn route(&mut self, sender: LongAddress, pan: u16, transmission: Transmission) {
        self.metrics.frames_sent += 1;

        let receivers = match transmission.params.destination {
            Some(destination) if self.topology.is_connected(sender, destination) => {
                vec![destination]
            }
            Some(destination) => {
                log::trace!("{} cannot reach {}", sender, destination);
                self.metrics.frames_unreachable += 1;
                return;
            }
            None => self.topology.neighbors(sender),
        };

        let frame = ReceivedFrame::over_the_air(
            &transmission.params,
            sender,
            pan,
            transmission.payload,
        );
        for receiver in receivers {
            let Some(link) = self.topology.get_link(sender, receiver) else {
                continue;
            };
            let (loss_rate, delay) = (link.loss_rate, link.delay);
            let frame = frame
                .clone()
                .with_link(link.link_quality, link.signal_level);

            if loss_rate > 0.0 && self.random_f64() < loss_rate {
                self.metrics.frames_lost += 1;
                continue;
            }
            self.schedule(
                self.elapsed + u64::from(delay.as_micros()),
                Event::Deliver {
                    to: receiver,
                    frame,
                    channel: transmission.channel,
                },
            );
        }
    }

    fn engine_for(&mut self, node: &LongAddress) -> Result<&mut SimEngine, Error> {
        self.nodes
            .get_mut(node)
            .map(SimNode::engine_mut)
            .ok_or(Error::InvalidInput)
    }

    fn execute_action(&mut self, action: ScenarioAction) {
        let outcome = match &action {
            ScenarioAction::Partition { groups } => {
                self.topology.partition(groups);
                Ok(())
            }
            ScenarioAction::HealPartition => {
                self.topology.heal();
                Ok(())
            }
            ScenarioAction::DisableLink { from, to } => self.update_link(from, to, |link| {
                link.active = false;
            }),
            ScenarioAction::EnableLink { from, to } => self.update_link(from, to, |link| {
                link.active = true;
            }),
            ScenarioAction::SetLossRate { from, to, rate } => {
                self.update_link(from, to, |link| link.loss_rate = rate.clamp(0.0, 1.0))
            }
            ScenarioAction::Send {
                from,
                to,
                payload,
                secured,
            } => self.engine_for(from).and_then(|e| match to {
                Some(destination) => e.unicast_address(*destination, payload, *secured),
                None => e.broadcast(payload, *secured),
            }),
            ScenarioAction::Connect { node, target } => self
                .engine_for(node)
                .and_then(|e| e.start_establish_connection(*target)),
            ScenarioAction::Hop { node, channel } => {
                self.engine_for(node).and_then(|e| e.start_hop(*channel))
            }
            ScenarioAction::SetChannel { node, channel } => {
                self.engine_for(node).and_then(|e| e.set_channel(*channel))
            }
            ScenarioAction::Sleep { node } => self
                .engine_for(node)
                .and_then(|e| e.set_power_state(PowerMode::Sleep)),
            ScenarioAction::CheckForData { node } => self.engine_for(node).and_then(|e| {
                e.set_power_state(PowerMode::Wakeup)?;
                e.check_for_data()
            }),
            ScenarioAction::ActiveScan {
                node,
                duration_class,
                channel_map,
            } => self
                .engine_for(node)
                .and_then(|e| e.start_active_scan(*duration_class, *channel_map)),
            ScenarioAction::EnergyScan {
                node,
                duration_class,
                channel_map,
            } => self.engine_for(node).and_then(|e| {
                e.start_noise_detection(*channel_map, *duration_class, AssessmentMode::Energy)
            }),
            ScenarioAction::Resync {
                node,
                slot,
                channel_map,
            } => self
                .engine_for(node)
                .and_then(|e| e.start_resync(*slot, *channel_map)),
            ScenarioAction::SetNoise { channel, level } => {
                self.noise.insert(*channel, *level);
                for node in self.nodes.values_mut() {
                    node.radio_mut().set_noise(*channel, *level);
                }
                Ok(())
            }
            ScenarioAction::TakeSnapshot => {
                self.take_snapshot();
                Ok(())
            }
        };
        if let Err(e) = outcome {
            log::warn!("action {:?} failed: {}", action, e);
            self.metrics.failed_actions += 1;
        }
    }

    fn update_link(
        &mut self,
        from: &LongAddress,
        to: &LongAddress,
        f: impl FnOnce(&mut crate::topology::Link),
    ) -> Result<(), Error> {
        let link = self
            .topology
            .get_link_mut(*from, *to)
            .ok_or(Error::InvalidInput)?;
        f(link);
        Ok(())
    }

    fn maybe_take_snapshot(&mut self) {
        let (Some(next), Some(interval)) = (self.next_snapshot, self.snapshot_interval) else {
            return;
        };
        if self.elapsed >= next {
            self.take_snapshot();
            self.next_snapshot = Some(next + u64::from(interval.as_micros()));
        }
    }

    /// Record every device's channel and connections.
    pub fn take_snapshot(&mut self) {
        let mut snapshot = NetworkSnapshot::new(self.elapsed);
        for (&address, node) in &self.nodes {
            let peers = node
                .engine()
                .connections()
                .map(|(_, entry)| entry.address)
                .collect();
            snapshot.record_node(address, node.channel(), peers);
        }
        self.metrics.add_snapshot(snapshot);
    }

    /// Generate a random f64 in [0, 1).
    fn random_f64(&mut self) -> f64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        (self.rng_state as f64) / (u64::MAX as f64)
    }
}
