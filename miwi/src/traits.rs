//! Collaborator traits: radio driver, cipher, persistence and clock.
//!
//! The engine owns one of each and never reaches past these seams, so the same
//! protocol code runs over any transceiver, any cipher engine, any EEPROM/flash
//! backend and both real and simulated time.

use alloc::vec::Vec;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

use crate::time::Tick;
use crate::types::{AssessmentMode, FrameControl, LongAddress, PowerState, StoreError};

/// Frames a driver can buffer between two engine ticks.
pub const RX_BANK_SIZE: usize = 4;

/// Mutex type used for the receive bank.
pub(crate) type ChannelMutex = CriticalSectionRawMutex;

/// Receive bank shared between a radio interrupt handler and the foreground tick.
///
/// The interrupt handler calls `try_send` with a fully assembled frame; the driver's
/// `poll_received` calls `try_receive`. Both run inside a critical section, so the
/// hand-off is atomic with respect to the radio interrupt.
pub type RxBank = Channel<ChannelMutex, ReceivedFrame, RX_BANK_SIZE>;

/// One frame handed from the radio driver to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub frame_control: FrameControl,
    /// Sender's long address, when the frame carries one.
    pub source: Option<LongAddress>,
    /// Sender's PAN id, when the frame carries one.
    pub source_pan: Option<u16>,
    pub payload: Vec<u8>,
    pub link_quality: u8,
    pub signal_level: u8,
}

impl ReceivedFrame {
    /// Frame as the receiving driver reports a transmission described by `params`.
    pub fn over_the_air(
        params: &TransmitParams,
        source: LongAddress,
        source_pan: u16,
        payload: Vec<u8>,
    ) -> Self {
        let fc = params.frame_control;
        Self {
            frame_control: fc,
            source: fc.source_present().then_some(source),
            source_pan: Some(source_pan),
            payload,
            link_quality: 0xFF,
            signal_level: 0xFF,
        }
    }

    /// Set link quality and signal strength.
    pub fn with_link(mut self, link_quality: u8, signal_level: u8) -> Self {
        self.link_quality = link_quality;
        self.signal_level = signal_level;
        self
    }

    pub fn broadcast(&self) -> bool {
        self.frame_control.broadcast()
    }

    pub fn secured(&self) -> bool {
        self.frame_control.secured()
    }

    pub fn is_command(&self) -> bool {
        self.frame_control.is_command()
    }
}

/// Transport parameters for one outgoing frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitParams {
    pub frame_control: FrameControl,
    /// Unicast destination; `None` for broadcast.
    pub destination: Option<LongAddress>,
    pub dest_pan: u16,
}

impl TransmitParams {
    pub fn is_broadcast(&self) -> bool {
        self.frame_control.broadcast()
    }
}

/// Parameters for radio initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioInit {
    pub address: LongAddress,
    pub cca_enabled: bool,
    pub network_freezer: bool,
}

/// Radio/MAC driver consumed by the engine.
///
/// Every frame returned by `poll_received` stays owned by the driver's receive
/// slot until `discard_received` releases it; the engine calls `discard_received`
/// exactly once per polled frame.
pub trait Radio {
    fn init(&mut self, params: &RadioInit) -> bool;

    /// Transmit one frame. Retries, if any, happen inside the driver.
    fn send(&mut self, params: &TransmitParams, payload: &[u8]) -> bool;

    fn poll_received(&mut self) -> Option<ReceivedFrame>;

    /// Release the receive slot of the last polled frame.
    fn discard_received(&mut self);

    fn set_channel(&mut self, channel: u8, offset: u8) -> bool;

    fn set_power(&mut self, level: u8) -> bool;

    fn set_alt_address(&mut self, short_address: u16, pan: u16) -> bool;

    fn power_state(&mut self, state: PowerState) -> bool;

    /// Sample the current channel; higher is busier.
    fn channel_assessment(&mut self, mode: AssessmentMode) -> u8;
}

/// Inputs mixed into the cipher nonce and authentication tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityContext {
    /// Originator of the frame.
    pub source: LongAddress,
    /// Unicast destination; `None` for broadcast.
    pub destination: Option<LongAddress>,
    pub frame_counter: u32,
    pub frame_control: FrameControl,
}

/// Authentication failed while opening a sealed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthFailure;

/// Symmetric cipher provider (CCM-style seal and open).
pub trait Cipher {
    /// Seal `payload`, returning ciphertext plus integrity tag.
    fn encrypt(&mut self, payload: &[u8], ctx: &SecurityContext) -> Vec<u8>;

    /// Open a sealed payload, verifying its tag.
    fn decrypt(&mut self, sealed: &[u8], ctx: &SecurityContext) -> Result<Vec<u8>, AuthFailure>;
}

/// Cipher for builds without security: sealing is a copy, opening always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSecurity;

impl Cipher for NoSecurity {
    fn encrypt(&mut self, payload: &[u8], _ctx: &SecurityContext) -> Vec<u8> {
        payload.to_vec()
    }

    fn decrypt(&mut self, _sealed: &[u8], _ctx: &SecurityContext) -> Result<Vec<u8>, AuthFailure> {
        Err(AuthFailure)
    }
}

/// Persisted protocol state ("network freezer").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    PanId,
    CurrentChannel,
    ConnectionMode,
    /// Every slot record back to back.
    ConnectionTable,
    /// A single slot record inside the table image.
    ConnectionSlot(u8),
    OutgoingFrameCounter,
}

/// Non-volatile storage backend.
///
/// `read` fills `buf` completely or fails. A `ConnectionSlot(i)` write of `n`
/// bytes lands at offset `i * n` of the `ConnectionTable` image.
pub trait Store {
    fn read(&mut self, field: Field, buf: &mut [u8]) -> Result<(), StoreError>;

    fn write(&mut self, field: Field, data: &[u8]) -> Result<(), StoreError>;
}

/// Free-running tick source.
pub trait Clock {
    fn now(&self) -> Tick;
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now(&self) -> Tick {
        (**self).now()
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_impls {
    //! Mock implementations of the collaborator traits for unit tests and the simulator.
    //!
    //! Available when running tests or with the `test-support` feature enabled.

    use alloc::boxed::Box;
    use alloc::collections::BTreeMap;
    use core::cell::Cell;

    use super::*;
    use crate::time::Duration;
    use crate::types::MAX_CHANNELS;

    /// A frame handed to `MockRadio::send`.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SentFrame {
        pub params: TransmitParams,
        pub payload: Vec<u8>,
        /// Channel the radio was tuned to when sending.
        pub channel: u8,
    }

    impl SentFrame {
        pub fn is_broadcast(&self) -> bool {
            self.params.is_broadcast()
        }

        pub fn is_command(&self) -> bool {
            self.params.frame_control.is_command()
        }

        /// First payload byte (the command byte of command frames).
        pub fn command(&self) -> Option<u8> {
            self.payload.first().copied()
        }
    }

    type Responder = Box<dyn FnMut(&SentFrame) -> Vec<ReceivedFrame>>;

    /// Radio that records transmissions and replays injected frames.
    pub struct MockRadio {
        rx: RxBank,
        held: bool,
        responder: Option<Responder>,
        pub sent: Vec<SentFrame>,
        pub channel: u8,
        pub power: PowerState,
        pub tx_power: u8,
        pub alt_address: Option<(u16, u16)>,
        pub init_params: Option<RadioInit>,
        /// Energy reported by `channel_assessment`, per channel.
        pub energy: [u8; MAX_CHANNELS as usize],
        pub fail_send: bool,
        pub fail_power: bool,
        /// Frames released through `discard_received`.
        pub discards: usize,
        /// `discard_received` calls with no frame held.
        pub spurious_discards: usize,
    }

    impl Default for MockRadio {
        fn default() -> Self {
            Self {
                rx: Channel::new(),
                held: false,
                responder: None,
                sent: Vec::new(),
                channel: 0,
                power: PowerState::Operate,
                tx_power: 0,
                alt_address: None,
                init_params: None,
                energy: [0; MAX_CHANNELS as usize],
                fail_send: false,
                fail_power: false,
                discards: 0,
                spurious_discards: 0,
            }
        }
    }

    impl MockRadio {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a frame as if the interrupt handler had received it.
        pub fn inject(&self, frame: ReceivedFrame) -> bool {
            self.rx.try_send(frame).is_ok()
        }

        /// Answer every transmission with the frames the closure returns.
        pub fn set_responder<F>(&mut self, f: F)
        where
            F: FnMut(&SentFrame) -> Vec<ReceivedFrame> + 'static,
        {
            self.responder = Some(Box::new(f));
        }

        pub fn clear_responder(&mut self) {
            self.responder = None;
        }

        pub fn take_sent(&mut self) -> Vec<SentFrame> {
            core::mem::take(&mut self.sent)
        }

        /// True while a polled frame has not been discarded.
        pub fn holding_frame(&self) -> bool {
            self.held
        }
    }

    impl Radio for MockRadio {
        fn init(&mut self, params: &RadioInit) -> bool {
            self.init_params = Some(*params);
            true
        }

        fn send(&mut self, params: &TransmitParams, payload: &[u8]) -> bool {
            if self.fail_send {
                return false;
            }
            let frame = SentFrame {
                params: *params,
                payload: payload.to_vec(),
                channel: self.channel,
            };
            if let Some(responder) = self.responder.as_mut() {
                for reply in responder(&frame) {
                    let _ = self.rx.try_send(reply);
                }
            }
            self.sent.push(frame);
            true
        }

        fn poll_received(&mut self) -> Option<ReceivedFrame> {
            assert!(!self.held, "poll_received while a frame is held");
            let frame = self.rx.try_receive().ok()?;
            self.held = true;
            Some(frame)
        }

        fn discard_received(&mut self) {
            if self.held {
                self.held = false;
                self.discards += 1;
            } else {
                self.spurious_discards += 1;
            }
        }

        fn set_channel(&mut self, channel: u8, _offset: u8) -> bool {
            if channel >= MAX_CHANNELS {
                return false;
            }
            self.channel = channel;
            true
        }

        fn set_power(&mut self, level: u8) -> bool {
            self.tx_power = level;
            true
        }

        fn set_alt_address(&mut self, short_address: u16, pan: u16) -> bool {
            self.alt_address = Some((short_address, pan));
            true
        }

        fn power_state(&mut self, state: PowerState) -> bool {
            if self.fail_power {
                return false;
            }
            self.power = state;
            true
        }

        fn channel_assessment(&mut self, _mode: AssessmentMode) -> u8 {
            self.energy[self.channel as usize]
        }
    }

    /// Mock clock: manual by default, optionally advancing on every read.
    #[derive(Default)]
    pub struct MockClock {
        current: Cell<u32>,
        step: Cell<u32>,
    }

    impl MockClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn at(tick: Tick) -> Self {
            let clock = Self::default();
            clock.current.set(tick.as_micros());
            clock
        }

        /// Clock that moves forward by `step` after every `now()`.
        pub fn auto(step: Duration) -> Self {
            let clock = Self::default();
            clock.step.set(step.as_micros());
            clock
        }

        pub fn set(&self, tick: Tick) {
            self.current.set(tick.as_micros());
        }

        pub fn advance(&self, duration: Duration) {
            self.current
                .set(self.current.get().wrapping_add(duration.as_micros()));
        }

        pub fn set_step(&self, step: Duration) {
            self.step.set(step.as_micros());
        }

        /// Current value without advancing.
        pub fn peek(&self) -> Tick {
            Tick::from_micros(self.current.get())
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> Tick {
            let now = self.current.get();
            self.current.set(now.wrapping_add(self.step.get()));
            Tick::from_micros(now)
        }
    }

    /// In-memory persistence backend.
    #[derive(Default)]
    pub struct MockStore {
        fields: BTreeMap<Field, Vec<u8>>,
        pub fail_writes: bool,
        pub writes: usize,
    }

    impl MockStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Raw bytes of a field (slot writes are folded into the table image).
        pub fn get(&self, field: Field) -> Option<&[u8]> {
            self.fields.get(&field).map(|v| v.as_slice())
        }

        pub fn insert(&mut self, field: Field, data: &[u8]) {
            self.fields.insert(field, data.to_vec());
        }
    }

    impl Store for MockStore {
        fn read(&mut self, field: Field, buf: &mut [u8]) -> Result<(), StoreError> {
            let (key, offset) = match field {
                Field::ConnectionSlot(i) => (Field::ConnectionTable, i as usize * buf.len()),
                other => (other, 0),
            };
            let data = self.fields.get(&key).ok_or(StoreError::Missing)?;
            let src = data
                .get(offset..offset + buf.len())
                .ok_or(StoreError::Corrupt)?;
            buf.copy_from_slice(src);
            Ok(())
        }

        fn write(&mut self, field: Field, data: &[u8]) -> Result<(), StoreError> {
            if self.fail_writes {
                return Err(StoreError::Io);
            }
            self.writes += 1;
            match field {
                Field::ConnectionSlot(i) => {
                    let offset = i as usize * data.len();
                    let image = self.fields.entry(Field::ConnectionTable).or_default();
                    if image.len() < offset + data.len() {
                        image.resize(offset + data.len(), 0);
                    }
                    image[offset..offset + data.len()].copy_from_slice(data);
                }
                other => {
                    self.fields.insert(other, data.to_vec());
                }
            }
            Ok(())
        }
    }

    /// Deterministic test cipher: xxh3 keystream plus a 4-byte xxh3 tag.
    ///
    /// Not secure. Peers sharing a key interoperate; a different key, counter,
    /// source or frame control byte fails authentication.
    #[derive(Debug, Clone, Copy)]
    pub struct TestCipher {
        key: u64,
    }

    /// Bytes of authentication tag appended by `TestCipher`.
    pub const TEST_TAG_LEN: usize = 4;

    impl TestCipher {
        pub fn new(key: u64) -> Self {
            Self { key }
        }

        fn nonce(ctx: &SecurityContext) -> Vec<u8> {
            let mut nonce = Vec::with_capacity(16);
            nonce.extend_from_slice(ctx.source.as_bytes());
            nonce.extend_from_slice(&ctx.frame_counter.to_le_bytes());
            nonce.push(ctx.frame_control.0);
            nonce
        }

        fn apply_keystream(&self, nonce: &[u8], data: &mut [u8]) {
            let mut block_input = nonce.to_vec();
            block_input.push(0);
            for (i, chunk) in data.chunks_mut(8).enumerate() {
                if let Some(last) = block_input.last_mut() {
                    *last = i as u8;
                }
                let ks = xxhash_rust::xxh3::xxh3_64_with_seed(&block_input, self.key).to_le_bytes();
                for (b, k) in chunk.iter_mut().zip(ks.iter()) {
                    *b ^= k;
                }
            }
        }

        fn tag(&self, nonce: &[u8], plaintext: &[u8]) -> [u8; TEST_TAG_LEN] {
            let mut input = nonce.to_vec();
            input.extend_from_slice(plaintext);
            let h = xxhash_rust::xxh3::xxh3_64_with_seed(&input, !self.key);
            let mut tag = [0u8; TEST_TAG_LEN];
            tag.copy_from_slice(&h.to_le_bytes()[..TEST_TAG_LEN]);
            tag
        }
    }

    impl Cipher for TestCipher {
        fn encrypt(&mut self, payload: &[u8], ctx: &SecurityContext) -> Vec<u8> {
            let nonce = Self::nonce(ctx);
            let tag = self.tag(&nonce, payload);
            let mut sealed = payload.to_vec();
            self.apply_keystream(&nonce, &mut sealed);
            sealed.extend_from_slice(&tag);
            sealed
        }

        fn decrypt(&mut self, sealed: &[u8], ctx: &SecurityContext) -> Result<Vec<u8>, AuthFailure> {
            if sealed.len() < TEST_TAG_LEN {
                return Err(AuthFailure);
            }
            let (body, tag) = sealed.split_at(sealed.len() - TEST_TAG_LEN);
            let nonce = Self::nonce(ctx);
            let mut plain = body.to_vec();
            self.apply_keystream(&nonce, &mut plain);
            if self.tag(&nonce, &plain) != tag {
                return Err(AuthFailure);
            }
            Ok(plain)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_impls::*;
    use super::*;
    use crate::time::Duration;
    use crate::types::PacketType;

    fn ctx(counter: u32) -> SecurityContext {
        SecurityContext {
            source: LongAddress::from_u64(0x1111),
            destination: None,
            frame_counter: counter,
            frame_control: FrameControl(PacketType::Data as u8 | FrameControl::SECURED),
        }
    }

    #[test]
    fn test_cipher_opens_what_it_seals() {
        let mut cipher = TestCipher::new(7);
        let sealed = cipher.encrypt(b"hello radio", &ctx(3));
        assert_ne!(&sealed[..11], b"hello radio");
        assert_eq!(sealed.len(), 11 + TEST_TAG_LEN);
        assert_eq!(cipher.decrypt(&sealed, &ctx(3)).unwrap(), b"hello radio");
    }

    #[test]
    fn test_cipher_rejects_wrong_counter_and_key() {
        let mut cipher = TestCipher::new(7);
        let sealed = cipher.encrypt(b"payload", &ctx(3));
        assert_eq!(cipher.decrypt(&sealed, &ctx(4)), Err(AuthFailure));
        assert_eq!(TestCipher::new(8).decrypt(&sealed, &ctx(3)), Err(AuthFailure));
        assert_eq!(cipher.decrypt(&sealed[..2], &ctx(3)), Err(AuthFailure));
    }

    #[test]
    fn test_mock_clock_auto_advance_wraps() {
        let clock = MockClock::auto(Duration::from_micros(10));
        clock.set(Tick::from_micros(u32::MAX - 5));
        let a = clock.now();
        let b = clock.now();
        assert_eq!(b.since(a), Duration::from_micros(10));
        assert_eq!(b.as_micros(), 4);
    }

    #[test]
    fn test_mock_store_slot_writes_patch_table_image() {
        let mut store = MockStore::new();
        store.write(Field::ConnectionTable, &[0u8; 6]).unwrap();
        store.write(Field::ConnectionSlot(1), &[7, 8, 9]).unwrap();
        assert_eq!(store.get(Field::ConnectionTable), Some(&[0, 0, 0, 7, 8, 9][..]));
        let mut slot = [0u8; 3];
        store.read(Field::ConnectionSlot(1), &mut slot).unwrap();
        assert_eq!(slot, [7, 8, 9]);
        let mut buf = [0u8; 2];
        assert_eq!(store.read(Field::PanId, &mut buf), Err(StoreError::Missing));
    }

    #[test]
    fn test_mock_radio_discard_accounting() {
        let mut radio = MockRadio::new();
        radio.discard_received();
        assert_eq!(radio.spurious_discards, 1);

        let frame = ReceivedFrame {
            frame_control: FrameControl(0),
            source: None,
            source_pan: None,
            payload: alloc::vec![1],
            link_quality: 0,
            signal_level: 0,
        };
        assert!(radio.inject(frame.clone()));
        assert_eq!(radio.poll_received(), Some(frame));
        assert!(radio.holding_frame());
        radio.discard_received();
        assert_eq!(radio.discards, 1);
        assert!(radio.poll_received().is_none());
        assert!(!radio.holding_frame());
    }
}
