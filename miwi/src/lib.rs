#![forbid(unsafe_code)]
//! miwi - Peer-to-peer protocol engine for low-power IEEE 802.15.4 radios
//!
//! A star/peer-to-peer wireless protocol: devices discover each other with active
//! scans, bind with a connection handshake, exchange direct or secured frames, and
//! park traffic for sleeping peers until they poll for it. A whole network can be
//! moved to a quieter channel (frequency agility), and a device that lost its peer
//! can find it again across channels (resync).
//!
//! This crate is `no_std` but **requires the `alloc` crate**. Every table is
//! allocated once at construction with the capacities of a [`P2pConfig`] and never
//! grows afterwards.
//!
//! # Key Properties
//!
//! - One [`Engine`] owns all protocol state; nothing is global
//! - The radio, cipher, persistence backend and clock are injected through traits
//! - Secured frames carry a per-sender frame counter that must strictly increase
//! - Blocking procedures (connection search, scans, hopping, resync) are also
//!   available as `start_*` + [`Engine::poll`] state machines
//! - Connection table, channel, PAN and frame counter survive a reset (network freezer)
//!
//! # Example (basic usage)
//!
//! Requires the `test-support` feature for the mock collaborators.
//!
//! ```ignore
//! use miwi::{Engine, DefaultConfig, LongAddress, Settings};
//! use miwi::traits::test_impls::{MockClock, MockRadio, MockStore, TestCipher};
//!
//! let settings = Settings::new(LongAddress::from_u64(0x0004_A3FF_FE00_0001));
//! let mut engine = Engine::<_, _, _, _, DefaultConfig>::new(
//!     MockRadio::new(),
//!     TestCipher::new(1),
//!     MockStore::new(),
//!     MockClock::new(),
//!     settings,
//! );
//! engine.init(false).unwrap();
//!
//! assert_eq!(engine.current_channel(), 11);
//! assert_eq!(engine.connection_count(), 0);
//! engine.broadcast(b"hello", false).unwrap();
//! assert_eq!(engine.radio().sent.len(), 1);
//! ```
//!
//! # Example (integration pattern)
//!
//! ```text
//! use miwi::{Engine, Radio, Cipher, Store, Clock, SearchTarget};
//!
//! // Implement the collaborator traits for your transceiver and MCU...
//!
//! // let mut engine = Engine::new(radio, cipher, store, clock, settings);
//! // engine.init(true)?;
//! // engine.establish_connection(SearchTarget::Any)?;
//!
//! // loop {
//! //     if engine.message_available() {
//! //         handle(engine.message());
//! //         engine.discard_message();
//! //     }
//! // }
//! ```
//!
//! # Module Structure
//!
//! - [`types`] - Addresses, capability and status bytes, errors
//! - [`wire`] - Command frame layouts and the security header
//! - [`traits`] - Radio, Cipher, Store and Clock collaborators
//! - [`engine`] - The `Engine` struct, settings and accessors
//! - [`connection`] - Connection table and anti-replay counters
//! - [`indirect`] - Queue for sleeping peers
//! - [`handshake`] - Connection search, admission and removal
//! - [`scan`] - Active scan, noise detection, frequency agility, resync
//! - [`power`] - Sleep, wake and data requests
//! - [`time`] - Tick and Duration types
//! - [`config`] - Compile-time table sizes and timing

#![no_std]

// Prevent test/debug features from being used in release builds.
#[cfg(all(feature = "test-support", not(test), not(debug_assertions)))]
compile_error!(
    "The `test-support` feature must not be enabled in release builds. \
     It includes a mock cipher that is NOT cryptographically secure."
);

#[cfg(all(feature = "debug", not(test), not(debug_assertions)))]
compile_error!(
    "The `debug` feature must not be enabled in release builds. \
     It adds protocol tracing overhead intended only for development and simulation."
);

extern crate alloc;

#[macro_use]
pub mod debug;
pub mod config;
pub mod connection;
mod dispatch;
pub mod engine;
mod freezer;
pub mod handshake;
pub mod indirect;
pub mod power;
pub mod procedure;
pub mod scan;
mod tasks;
pub mod time;
pub mod traits;
pub mod types;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export main types at crate root
pub use config::{DefaultConfig, P2pConfig, SmallConfig};
pub use connection::ConnectionEntry;
pub use engine::{AdmissionPolicy, Engine, RxMessage, Settings};
pub use handshake::{RemovalTarget, SearchTarget};
pub use indirect::{IndirectDestination, IndirectMessage};
pub use procedure::{ChannelEnergy, Completion};
pub use scan::ActiveScanResult;
pub use time::{Duration, Tick};
pub use traits::{
    Cipher, Clock, Field, NoSecurity, Radio, RadioInit, ReceivedFrame, RxBank, SecurityContext,
    Store, TransmitParams,
};
pub use types::{
    AssessmentMode, Capability, ConnectionMode, ConnectionStatus, Error, FrameControl,
    LongAddress, PacketType, PowerMode, PowerState, ProtocolStatus, StartMode, StoreError,
};
pub use wire::{Command, DecodeError, Encode, SecurityHeader};
