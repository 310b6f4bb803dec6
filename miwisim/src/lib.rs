//! miwisim - Discrete event network simulator for miwi protocol testing.
//!
//! Runs many miwi engines in one process against a shared simulated clock and a
//! configurable radio topology, without real-time delays.
//!
//! # Features
//!
//! - **Fixed-step simulation**: every engine is polled once per step at the same tick
//! - **Simulated radios**: per-device channel, sleep state, receive bank and noise floor
//! - **Configurable topology**: fully connected, chain, star, or custom
//! - **Link properties**: link quality, signal level, frame loss, delay per link
//! - **Scenario builder**: scheduled sends, searches, hops, scans, partitions
//! - **Metrics collection**: delivery counters and channel/connection snapshots
//!
//! # Example
//!
//! ```
//! use miwisim::{node_address, Duration, ScenarioBuilder};
//!
//! // A hub with two spokes that each search for a connection
//! let result = ScenarioBuilder::new(3)
//!     .star_topology()
//!     .connect_at(Duration::from_millis(10), 1)
//!     .connect_at(Duration::from_millis(20), 2)
//!     .run_for(Duration::from_secs(1))
//!     .unwrap();
//!
//! assert!(result.connected(node_address(0), node_address(1)));
//! assert!(result.connected(node_address(0), node_address(2)));
//! ```
//!
//! # Architecture
//!
//! Each step:
//! 1. Advance simulation time by the step
//! 2. Pop due events: frame deliveries into receive banks, scenario actions
//! 3. Poll every engine at the new tick
//! 4. Route transmissions through the topology and schedule deliveries
//!
//! Long-running procedures are always started with the engine's `start_*` calls
//! and finished through `poll`, never with the blocking wrappers, because the
//! simulated clock only moves between steps.

pub mod event;
pub mod metrics;
pub mod node;
pub mod scenario;
pub mod sim;
pub mod topology;

// Re-export main types
pub use event::{Event, ScenarioAction, ScheduledEvent};
pub use metrics::{NetworkSnapshot, SimMetrics, SimulationResult};
pub use miwi::{Duration, LongAddress, Tick};
pub use node::{SimClock, SimNode, SimRadio};
pub use scenario::{node_address, simple_scenario, sleepy_star_scenario, ScenarioBuilder};
pub use sim::Simulator;
pub use topology::{Link, Topology};
