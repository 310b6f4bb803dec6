//! Engine implementation - the protocol state owner.
//!
//! The `Engine` owns the radio, cipher, persistence backend and clock together
//! with every protocol table. Nothing runs in the background: the application
//! calls [`Engine::tick`] (or [`Engine::poll`] / [`Engine::message_available`])
//! repeatedly and the engine drains one received frame per call.
//!
//! # Usage
//!
//! ```ignore
//! let mut engine = Engine::<_, _, _, _, DefaultConfig>::new(radio, cipher, store, clock, settings);
//! engine.init(false)?;
//! engine.establish_connection(SearchTarget::Any)?;
//!
//! loop {
//!     if engine.message_available() {
//!         if let Some(msg) = engine.message() {
//!             handle(&msg.payload);
//!         }
//!         engine.discard_message();
//!     }
//! }
//! ```
//!
//! The receive, send, procedure, power and persistence paths live in their own
//! modules as further `impl` blocks on `Engine`.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::marker::PhantomData;

use crate::config::{DefaultConfig, P2pConfig};
use crate::connection::{ConnectionEntry, ConnectionTable};
use crate::indirect::{IndirectMessage, IndirectQueue};
use crate::procedure::{Completion, Procedure};
use crate::scan::ActiveScanResult;
use crate::time::{Duration, Tick};
use crate::traits::{Cipher, Clock, Radio, RadioInit, ReceivedFrame, Store};
use crate::types::{
    Capability, ConnectionMode, Error, LongAddress, ProtocolStatus, MAX_CHANNELS,
    UNUSED_SHORT_ADDRESS,
};

#[cfg(any(test, feature = "debug"))]
use crate::debug::{DebugEmitter, DebugEvent};

/// Callback that may veto an otherwise accepted connection request.
///
/// Receives the requester's address, capability byte and additional node ID.
pub type AdmissionPolicy = Box<dyn FnMut(&LongAddress, Capability, &[u8]) -> bool>;

/// Runtime identity and behaviour of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub address: LongAddress,
    pub pan_id: u16,
    /// Channel used when no persisted channel is restored.
    pub channel: u8,
    /// Device turns its receiver off between polls.
    pub sleeping_device: bool,
    /// Advertise security capability.
    pub security: bool,
    /// Exchange wake-up offsets with data-request replies.
    pub time_sync: bool,
    pub cca: bool,
    pub tx_power: u8,
    pub connection_mode: ConnectionMode,
    /// Additional node ID sent to peers (padded or cut to the configured size).
    pub peer_info: Vec<u8>,
}

impl Settings {
    pub fn new(address: LongAddress) -> Self {
        Self {
            address,
            pan_id: 0x1234,
            channel: 11,
            sleeping_device: false,
            security: false,
            time_sync: false,
            cca: true,
            tx_power: 0,
            connection_mode: ConnectionMode::EnableAll,
            peer_info: Vec::new(),
        }
    }
}

/// Application-visible copy of a received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxMessage {
    pub source: Option<LongAddress>,
    pub source_pan: Option<u16>,
    /// Decrypted payload.
    pub payload: Vec<u8>,
    pub broadcast: bool,
    pub secured: bool,
    pub command: bool,
    pub link_quality: u8,
    pub signal_level: u8,
}

impl From<ReceivedFrame> for RxMessage {
    fn from(frame: ReceivedFrame) -> Self {
        Self {
            source: frame.source,
            source_pan: frame.source_pan,
            broadcast: frame.broadcast(),
            secured: frame.secured(),
            command: frame.is_command(),
            payload: frame.payload,
            link_quality: frame.link_quality,
            signal_level: frame.signal_level,
        }
    }
}

/// The P2P protocol engine.
///
/// Generic over:
/// - `R`: Radio driver
/// - `Ci`: Cipher provider
/// - `S`: Persistence backend
/// - `Clk`: Tick source
/// - `C`: Compile-time table sizes and timing
pub struct Engine<R, Ci, S, Clk, C = DefaultConfig> {
    // Dependencies (injected)
    pub(crate) radio: R,
    pub(crate) cipher: Ci,
    pub(crate) store: S,
    pub(crate) clock: Clk,

    // Identity
    pub(crate) settings: Settings,
    pub(crate) capability: Capability,
    pub(crate) pan_id: u16,
    pub(crate) current_channel: u8,
    pub(crate) connection_mode: ConnectionMode,
    pub(crate) peer_info: Vec<u8>,

    // Tables
    pub(crate) connections: ConnectionTable,
    pub(crate) indirect: IndirectQueue,
    pub(crate) scan_results: Vec<ActiveScanResult>,

    // Protocol state
    pub(crate) status: ProtocolStatus,
    pub(crate) latest_connection: Option<usize>,
    pub(crate) rx: Option<RxMessage>,
    /// A polled frame has not been released back to the driver yet.
    pub(crate) rx_held: bool,
    pub(crate) data_request_started: Tick,
    pub(crate) save_requested_at: Tick,

    // Security
    pub(crate) outgoing_counter: u32,
    pub(crate) counter_checkpoint: Option<u32>,

    // Time sync
    pub(crate) next_wake: Duration,
    pub(crate) wake_epoch: Tick,
    pub(crate) sync_slot: u8,

    // Long-running procedures
    pub(crate) procedure: Option<Procedure>,
    pub(crate) completion: Option<Completion>,
    pub(crate) admission: Option<AdmissionPolicy>,

    #[cfg(any(test, feature = "debug"))]
    debug_emitter: Option<Box<dyn DebugEmitter>>,

    _config: PhantomData<C>,
}

impl<R, Ci, S, Clk, C> Engine<R, Ci, S, Clk, C>
where
    R: Radio,
    Ci: Cipher,
    S: Store,
    Clk: Clock,
    C: P2pConfig,
{
    /// Create an engine. Call [`init`](Self::init) before using it.
    pub fn new(radio: R, cipher: Ci, store: S, clock: Clk, settings: Settings) -> Self {
        let mut peer_info = alloc::vec![0u8; C::ADDITIONAL_NODE_ID_SIZE];
        let n = settings.peer_info.len().min(C::ADDITIONAL_NODE_ID_SIZE);
        peer_info[..n].copy_from_slice(&settings.peer_info[..n]);
        let now = clock.now();

        let mut engine = Self {
            radio,
            cipher,
            store,
            clock,
            capability: Capability::default(),
            pan_id: settings.pan_id,
            current_channel: settings.channel,
            connection_mode: settings.connection_mode,
            peer_info,
            settings,
            connections: ConnectionTable::new(C::CONNECTION_SIZE, C::ADDITIONAL_NODE_ID_SIZE),
            indirect: IndirectQueue::new(
                C::INDIRECT_MESSAGE_SIZE,
                C::INDIRECT_BUFFER_SIZE,
                C::INDIRECT_MESSAGE_TIMEOUT,
            ),
            scan_results: Vec::with_capacity(C::ACTIVE_SCAN_RESULT_SIZE),
            status: ProtocolStatus::default(),
            latest_connection: None,
            rx: None,
            rx_held: false,
            data_request_started: now,
            save_requested_at: now,
            outgoing_counter: 1,
            counter_checkpoint: None,
            next_wake: C::RFD_WAKEUP_INTERVAL,
            wake_epoch: now,
            sync_slot: 0,
            procedure: None,
            completion: None,
            admission: None,
            #[cfg(any(test, feature = "debug"))]
            debug_emitter: None,
            _config: PhantomData,
        };
        engine.capability = engine.build_capability();
        engine
    }

    /// Reset protocol state and bring up the radio.
    ///
    /// With `network_freezer` the channel, PAN id, connection mode, connection
    /// table and outgoing frame counter are restored from the store; otherwise
    /// the current settings are written as the new persisted state.
    pub fn init(&mut self, network_freezer: bool) -> Result<(), Error> {
        self.status = ProtocolStatus::default();
        self.connections.clear();
        self.indirect.clear();
        self.scan_results.clear();
        self.release_frame();
        self.rx = None;
        self.procedure = None;
        self.completion = None;
        self.latest_connection = None;
        self.current_channel = self.settings.channel;
        self.pan_id = self.settings.pan_id;
        self.connection_mode = self.settings.connection_mode;
        self.outgoing_counter = 1;
        self.counter_checkpoint = None;
        self.next_wake = C::RFD_WAKEUP_INTERVAL;
        self.wake_epoch = self.clock.now();

        if network_freezer {
            self.restore()?;
        } else {
            self.save_defaults()?;
        }

        let params = RadioInit {
            address: self.settings.address,
            cca_enabled: self.settings.cca,
            network_freezer,
        };
        if !self.radio.init(&params) {
            return Err(Error::TransceiverFailed);
        }
        self.radio.set_alt_address(UNUSED_SHORT_ADDRESS, self.pan_id);
        self.radio.set_power(self.settings.tx_power);
        if !self.radio.set_channel(self.current_channel, 0) {
            return Err(Error::InvalidChannel);
        }
        self.capability = self.build_capability();
        log::info!(
            "p2p engine {} up on channel {} pan {:04X}",
            self.settings.address,
            self.current_channel,
            self.pan_id
        );
        Ok(())
    }

    fn build_capability(&self) -> Capability {
        let mut bits = 0u8;
        if self.settings.sleeping_device {
            bits |= Capability::DATA_REQUEST_NEEDED;
        } else {
            bits |= Capability::RX_ON_WHEN_IDLE;
        }
        if self.settings.time_sync {
            bits |= Capability::TIME_SYNC;
        }
        if self.settings.security {
            bits |= Capability::SECURITY;
        }
        Capability(bits).with_connection_mode(self.connection_mode)
    }

    // --- Application receive path ---

    /// Run one task-loop tick and report whether application data is waiting.
    pub fn message_available(&mut self) -> bool {
        self.tick();
        self.status.contains(ProtocolStatus::RX_HAS_USER_DATA)
    }

    /// The retained application message, if any.
    pub fn message(&self) -> Option<&RxMessage> {
        if self.status.contains(ProtocolStatus::RX_HAS_USER_DATA) {
            self.rx.as_ref()
        } else {
            None
        }
    }

    /// Release the retained message so the next frame can be received.
    ///
    /// Safe to call when nothing is held.
    pub fn discard_message(&mut self) {
        self.status.remove(ProtocolStatus::RX_HAS_USER_DATA);
        self.rx = None;
        self.release_frame();
    }

    /// Hand the polled frame's receive slot back to the driver, at most once.
    pub(crate) fn release_frame(&mut self) {
        if self.rx_held {
            self.rx_held = false;
            self.radio.discard_received();
        }
    }

    // --- Channel, PAN and mode ---

    /// Move to `channel` and persist it.
    pub fn set_channel(&mut self, channel: u8) -> Result<(), Error> {
        self.tune(channel)?;
        self.persist_channel()
    }

    /// Retune the radio without persisting (scans, resync probes).
    pub(crate) fn tune(&mut self, channel: u8) -> Result<(), Error> {
        if channel >= MAX_CHANNELS || !self.radio.set_channel(channel, 0) {
            return Err(Error::InvalidChannel);
        }
        if channel != self.current_channel {
            emit_debug!(
                self,
                DebugEvent::ChannelChanged {
                    from: self.current_channel,
                    to: channel,
                }
            );
        }
        self.current_channel = channel;
        Ok(())
    }

    /// Join a PAN and persist it.
    pub fn set_pan_id(&mut self, pan_id: u16) -> Result<(), Error> {
        self.pan_id = pan_id;
        if !self.radio.set_alt_address(UNUSED_SHORT_ADDRESS, pan_id) {
            return Err(Error::TransceiverFailed);
        }
        self.persist_pan_id()
    }

    pub fn set_tx_power(&mut self, level: u8) -> Result<(), Error> {
        if self.radio.set_power(level) {
            Ok(())
        } else {
            Err(Error::TransceiverFailed)
        }
    }

    /// Change the connection admission policy and advertise it in the capability byte.
    pub fn set_connection_mode(&mut self, mode: ConnectionMode) -> Result<(), Error> {
        self.connection_mode = mode;
        self.capability = self.capability.with_connection_mode(mode);
        self.persist_connection_mode()
    }

    /// Install a callback that can veto incoming connection requests.
    pub fn set_admission_policy<F>(&mut self, policy: F)
    where
        F: FnMut(&LongAddress, Capability, &[u8]) -> bool + 'static,
    {
        self.admission = Some(Box::new(policy));
    }

    // --- Accessors ---

    pub fn address(&self) -> &LongAddress {
        &self.settings.address
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn pan_id(&self) -> u16 {
        self.pan_id
    }

    pub fn current_channel(&self) -> u8 {
        self.current_channel
    }

    pub fn connection_mode(&self) -> ConnectionMode {
        self.connection_mode
    }

    pub fn status(&self) -> ProtocolStatus {
        self.status
    }

    /// Slot bound by the most recent successful handshake.
    pub fn latest_connection(&self) -> Option<usize> {
        self.latest_connection
    }

    pub fn connection(&self, slot: usize) -> Option<&ConnectionEntry> {
        self.connections.get(slot)
    }

    /// Valid connections with their slot indices.
    pub fn connections(&self) -> impl Iterator<Item = (usize, &ConnectionEntry)> {
        self.connections.iter()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn find_connection(&self, address: &LongAddress) -> Option<usize> {
        self.connections.lookup(address)
    }

    /// Last accepted secured frame counter from the peer in `slot`.
    pub fn incoming_frame_counter(&self, slot: usize) -> Option<u32> {
        self.connections.incoming_counter(slot)
    }

    /// Counter the next secured frame will carry.
    pub fn outgoing_frame_counter(&self) -> u32 {
        self.outgoing_counter
    }

    pub fn indirect_message(&self, index: usize) -> Option<&IndirectMessage> {
        self.indirect.get(index)
    }

    pub fn indirect_len(&self) -> usize {
        self.indirect.len()
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn clock(&self) -> &Clk {
        &self.clock
    }

    /// Log every valid connection and return how many there are.
    pub fn dump_connections(&self) -> usize {
        log::info!(
            "connections on channel {} pan {:04X}:",
            self.current_channel,
            self.pan_id
        );
        let mut count = 0;
        for (slot, entry) in self.connections.iter() {
            log::info!(
                "  [{}] {} cap {:02X} info {:02X?} rx_counter {}",
                slot,
                entry.address,
                entry.capability.0,
                entry.peer_info,
                self.connections.incoming_counter(slot).unwrap_or(0)
            );
            count += 1;
        }
        count
    }

    // --- Debug ---

    #[cfg(any(test, feature = "debug"))]
    pub fn set_debug_emitter<E: DebugEmitter + 'static>(&mut self, emitter: E) {
        self.debug_emitter = Some(Box::new(emitter));
    }

    #[cfg(any(test, feature = "debug"))]
    pub(crate) fn emit_debug(&mut self, event: DebugEvent) {
        if let Some(emitter) = self.debug_emitter.as_mut() {
            emitter.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{engine, engine_with};
    use crate::traits::Field;

    #[test]
    fn test_init_programs_radio() {
        let e = engine();
        let init = e.radio().init_params.unwrap();
        assert_eq!(init.address, *e.address());
        assert!(!init.network_freezer);
        assert_eq!(e.radio().alt_address, Some((0xFFFF, 0x1234)));
        assert_eq!(e.radio().channel, 11);
        assert_eq!(e.capability().0, Capability::RX_ON_WHEN_IDLE);
    }

    #[test]
    fn test_init_persists_defaults() {
        let e = engine();
        assert_eq!(e.store().get(Field::CurrentChannel), Some(&[11][..]));
        assert_eq!(e.store().get(Field::PanId), Some(&[0x34, 0x12][..]));
        assert_eq!(e.store().get(Field::ConnectionMode), Some(&[0][..]));
        assert_eq!(e.store().get(Field::OutgoingFrameCounter), Some(&[0, 0, 0, 0][..]));
    }

    #[test]
    fn test_sleeping_security_capability() {
        let e = engine_with(|s| {
            s.sleeping_device = true;
            s.security = true;
        });
        let cap = e.capability();
        assert!(!cap.rx_on_when_idle());
        assert!(cap.data_request_needed());
        assert!(cap.security());
    }

    #[test]
    fn test_connection_mode_updates_capability_and_store() {
        let mut e = engine();
        e.set_connection_mode(ConnectionMode::DisableAll).unwrap();
        assert_eq!(e.capability().connection_mode(), ConnectionMode::DisableAll);
        assert_eq!(e.capability().0 & Capability::RX_ON_WHEN_IDLE, 1);
        assert_eq!(e.store().get(Field::ConnectionMode), Some(&[3][..]));
    }

    #[test]
    fn test_set_channel_rejects_out_of_range() {
        let mut e = engine();
        assert_eq!(e.set_channel(32), Err(Error::InvalidChannel));
        assert_eq!(e.current_channel(), 11);
        e.set_channel(20).unwrap();
        assert_eq!(e.current_channel(), 20);
        assert_eq!(e.store().get(Field::CurrentChannel), Some(&[20][..]));
    }

    #[test]
    fn test_discard_without_frame_is_noop() {
        let mut e = engine();
        e.discard_message();
        e.discard_message();
        assert_eq!(e.radio().spurious_discards, 0);
        assert!(e.message().is_none());
        assert!(!e.status().contains(ProtocolStatus::RX_HAS_USER_DATA));
    }

    #[test]
    fn test_peer_info_padded_to_configured_width() {
        let e = engine_with(|s| s.peer_info = alloc::vec![1, 2, 3]);
        assert_eq!(e.peer_info, [1]);
    }
}
