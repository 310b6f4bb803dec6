//! Compile-time configuration for table sizes and protocol timing.
//!
//! The `P2pConfig` trait fixes every capacity the engine allocates at construction
//! time, so a device never grows its tables after boot. Use `DefaultConfig` for
//! always-listening coordinators and `SmallConfig` for sleeping end devices.
//!
//! # Memory Footprint
//!
//! | Config | Connections | Indirect queue | Scan results | Suitable MCUs |
//! |--------|------------:|---------------:|-------------:|---------------|
//! | `DefaultConfig` | 10 | 2 | 4 | PIC24/PIC32, SAMR21, nRF52 |
//! | `SmallConfig` | 4 | 1 | 2 | PIC18, ATmega256RFR2 |
//!
//! Rough formula:
//! - `CONNECTION_SIZE * (14 + ADDITIONAL_NODE_ID_SIZE)` bytes (entries + counters)
//! - `INDIRECT_MESSAGE_SIZE * (INDIRECT_BUFFER_SIZE + CONNECTION_SIZE + 20)` bytes
//! - `ACTIVE_SCAN_RESULT_SIZE * (16 + ADDITIONAL_NODE_ID_SIZE)` bytes
//!
//! # Example
//!
//! ```ignore
//! use miwi::{Engine, DefaultConfig, SmallConfig};
//!
//! let coordinator = Engine::<_, _, _, _, DefaultConfig>::new(radio, cipher, store, clock, settings);
//! let sensor = Engine::<_, _, _, _, SmallConfig>::new(radio, cipher, store, clock, settings);
//!
//! struct MyConfig;
//! impl P2pConfig for MyConfig {
//!     const CONNECTION_SIZE: usize = 32;
//!     // ... other constants
//! }
//! ```

use crate::time::Duration;

/// Configuration trait for compile-time table sizes and timing.
///
/// All capacities must be non-zero.
pub trait P2pConfig {
    /// Connection table slots.
    const CONNECTION_SIZE: usize;

    /// Indirect messages held for sleeping peers.
    const INDIRECT_MESSAGE_SIZE: usize;

    /// Distinct peers remembered during one active scan.
    const ACTIVE_SCAN_RESULT_SIZE: usize;

    /// Opaque peer-info bytes exchanged during connection setup.
    const ADDITIONAL_NODE_ID_SIZE: usize;

    /// Largest application payload accepted for a direct send (before security framing).
    const TX_BUFFER_SIZE: usize;

    /// Largest payload an indirect message can hold.
    const INDIRECT_BUFFER_SIZE: usize;

    /// How often a sleeping device wakes to poll for data.
    const RFD_WAKEUP_INTERVAL: Duration;

    /// How long an unclaimed indirect message survives.
    const INDIRECT_MESSAGE_TIMEOUT: Duration =
        Self::RFD_WAKEUP_INTERVAL.saturating_mul(Self::INDIRECT_MESSAGE_SIZE as u32 + 1);

    /// How long a data request waits for the reply.
    const RFD_DATA_WAIT: Duration;

    /// Connection requests sent before giving up.
    const CONNECTION_RETRY_TIMES: u8;

    /// Seconds between connection requests.
    const CONNECTION_INTERVAL: u8;

    /// Copies of the channel-hopping command broadcast before switching.
    const FA_BROADCAST_TIME: u8;

    /// Passes over the channel map before resync gives up.
    const RESYNC_TIMES: u8;

    /// Outgoing frame counter values between persisted checkpoints.
    const FRAME_COUNTER_UPDATE_INTERVAL: u32;

    /// Channels the radio band supports.
    const FULL_CHANNEL_MAP: u32;

    /// Reply slots within one wake interval when time sync is on.
    const TIME_SYNC_SLOTS: u8;

    /// Debounce before a dirty connection table is written out.
    const SAVE_DELAY: Duration = Duration::ONE_SECOND;
}

/// Default configuration for always-listening devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConfig;

impl P2pConfig for DefaultConfig {
    const CONNECTION_SIZE: usize = 10;
    const INDIRECT_MESSAGE_SIZE: usize = 2;
    const ACTIVE_SCAN_RESULT_SIZE: usize = 4;
    const ADDITIONAL_NODE_ID_SIZE: usize = 1;
    const TX_BUFFER_SIZE: usize = 100;
    const INDIRECT_BUFFER_SIZE: usize = 100;
    const RFD_WAKEUP_INTERVAL: Duration = Duration::from_secs(8);
    const RFD_DATA_WAIT: Duration = Duration::from_millis(250);
    const CONNECTION_RETRY_TIMES: u8 = 3;
    const CONNECTION_INTERVAL: u8 = 2;
    const FA_BROADCAST_TIME: u8 = 3;
    const RESYNC_TIMES: u8 = 3;
    const FRAME_COUNTER_UPDATE_INTERVAL: u32 = 1024;
    const FULL_CHANNEL_MAP: u32 = 0x07FF_F800;
    const TIME_SYNC_SLOTS: u8 = 10;
}

/// Small configuration for sleeping end devices with little RAM.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmallConfig;

impl P2pConfig for SmallConfig {
    const CONNECTION_SIZE: usize = 4;
    const INDIRECT_MESSAGE_SIZE: usize = 1;
    const ACTIVE_SCAN_RESULT_SIZE: usize = 2;
    const ADDITIONAL_NODE_ID_SIZE: usize = 1;
    const TX_BUFFER_SIZE: usize = 40;
    const INDIRECT_BUFFER_SIZE: usize = 40;
    const RFD_WAKEUP_INTERVAL: Duration = Duration::from_secs(8);
    const RFD_DATA_WAIT: Duration = Duration::from_millis(250);
    const CONNECTION_RETRY_TIMES: u8 = 3;
    const CONNECTION_INTERVAL: u8 = 2;
    const FA_BROADCAST_TIME: u8 = 3;
    const RESYNC_TIMES: u8 = 3;
    const FRAME_COUNTER_UPDATE_INTERVAL: u32 = 1024;
    const FULL_CHANNEL_MAP: u32 = 0x07FF_F800;
    const TIME_SYNC_SLOTS: u8 = 4;
}
