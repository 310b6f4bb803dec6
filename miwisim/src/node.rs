//! SimNode wrapper for simulated miwi devices.

use std::cell::Cell;

use embassy_sync::channel::TrySendError;
use miwi::debug::EventLog;
use miwi::traits::test_impls::{MockStore, TestCipher};
use miwi::traits::RX_BANK_SIZE;
use miwi::{
    AssessmentMode, Clock, Completion, Engine, Error, LongAddress, PowerState, Radio, RadioInit,
    ReceivedFrame, RxBank, RxMessage, Settings, Tick, TransmitParams,
};

/// Every device in the simulation shares this network key.
pub const SIM_NETWORK_KEY: u64 = 0x5EC0_11AB_0000_0001;

const MAX_CHANNELS: usize = 32;

/// One transmission waiting to be routed by the simulator.
#[derive(Debug, Clone)]
pub struct Transmission {
    pub params: TransmitParams,
    pub payload: Vec<u8>,
    /// Channel the radio was tuned to when sending.
    pub channel: u8,
}

/// Radio driver for simulation.
///
/// Frames are delivered into the same kind of receive bank a real interrupt
/// handler fills; transmissions are queued for the simulator to route.
pub struct SimRadio {
    rx: RxBank,
    held: bool,
    outbox: Vec<Transmission>,
    channel: u8,
    asleep: bool,
    /// Energy read by `channel_assessment`, per channel.
    noise: [u8; MAX_CHANNELS],
}

impl SimRadio {
    pub fn new() -> Self {
        Self {
            rx: RxBank::new(),
            held: false,
            outbox: Vec::new(),
            channel: 0,
            asleep: false,
            noise: [0; MAX_CHANNELS],
        }
    }

    /// Hand a frame to the receive bank. Returns `false` when the bank is full.
    pub fn deliver(&self, frame: ReceivedFrame) -> bool {
        match self.rx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
        }
    }

    /// Frames buffered and not yet polled.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn take_outbox(&mut self) -> Vec<Transmission> {
        std::mem::take(&mut self.outbox)
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn is_asleep(&self) -> bool {
        self.asleep
    }

    pub fn set_noise(&mut self, channel: u8, level: u8) {
        if let Some(slot) = self.noise.get_mut(channel as usize) {
            *slot = level;
        }
    }
}

impl Default for SimRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl Radio for SimRadio {
    fn init(&mut self, _params: &RadioInit) -> bool {
        self.asleep = false;
        true
    }

    fn send(&mut self, params: &TransmitParams, payload: &[u8]) -> bool {
        if self.asleep {
            return false;
        }
        self.outbox.push(Transmission {
            params: *params,
            payload: payload.to_vec(),
            channel: self.channel,
        });
        true
    }

    fn poll_received(&mut self) -> Option<ReceivedFrame> {
        if self.held {
            return None;
        }
        let frame = self.rx.try_receive().ok()?;
        self.held = true;
        Some(frame)
    }

    fn discard_received(&mut self) {
        self.held = false;
    }

    fn set_channel(&mut self, channel: u8, _offset: u8) -> bool {
        if channel as usize >= MAX_CHANNELS {
            return false;
        }
        self.channel = channel;
        true
    }

    fn set_power(&mut self, _level: u8) -> bool {
        true
    }

    fn set_alt_address(&mut self, _short_address: u16, _pan: u16) -> bool {
        true
    }

    fn power_state(&mut self, state: PowerState) -> bool {
        self.asleep = state == PowerState::Sleep;
        true
    }

    fn channel_assessment(&mut self, _mode: AssessmentMode) -> u8 {
        self.noise[self.channel as usize]
    }
}

/// Clock for simulation.
///
/// Time is controlled externally by the simulator.
#[derive(Default)]
pub struct SimClock {
    current: Cell<u32>,
}

impl SimClock {
    pub fn at(tick: Tick) -> Self {
        Self {
            current: Cell::new(tick.as_micros()),
        }
    }

    pub fn set(&self, tick: Tick) {
        self.current.set(tick.as_micros());
    }
}

impl Clock for SimClock {
    fn now(&self) -> Tick {
        Tick::from_micros(self.current.get())
    }
}

/// Type alias for simulated engines.
pub type SimEngine = Engine<SimRadio, TestCipher, MockStore, SimClock>;

/// Wrapper around a miwi engine for simulation.
pub struct SimNode {
    engine: SimEngine,
    events: EventLog,
    inbox: Vec<RxMessage>,
    completions: Vec<Completion>,
}

impl SimNode {
    /// Bring up a device with `settings` at `now`.
    pub fn new(settings: Settings, now: Tick) -> Result<Self, Error> {
        let mut engine = Engine::new(
            SimRadio::new(),
            TestCipher::new(SIM_NETWORK_KEY),
            MockStore::new(),
            SimClock::at(now),
            settings,
        );
        let events = EventLog::new();
        engine.set_debug_emitter(events.clone());
        engine.init(false)?;
        Ok(Self {
            engine,
            events,
            inbox: Vec::new(),
            completions: Vec::new(),
        })
    }

    pub fn address(&self) -> LongAddress {
        *self.engine.address()
    }

    pub fn engine(&self) -> &SimEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SimEngine {
        &mut self.engine
    }

    pub fn radio(&self) -> &SimRadio {
        self.engine.radio()
    }

    pub fn radio_mut(&mut self) -> &mut SimRadio {
        self.engine.radio_mut()
    }

    pub fn channel(&self) -> u8 {
        self.engine.current_channel()
    }

    /// Application messages received so far.
    pub fn inbox(&self) -> &[RxMessage] {
        &self.inbox
    }

    pub fn take_inbox(&mut self) -> Vec<RxMessage> {
        std::mem::take(&mut self.inbox)
    }

    /// Finished procedures, oldest first.
    pub fn completions(&self) -> &[Completion] {
        &self.completions
    }

    /// Protocol trace recorded by the engine.
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Run the engine at `now` until its receive bank is drained.
    ///
    /// Application messages are copied to the inbox and released right away, so
    /// the engine never stalls on a retained frame.
    pub fn step(&mut self, now: Tick) {
        self.engine.clock().set(now);
        for _ in 0..=RX_BANK_SIZE {
            if let Some(done) = self.engine.poll() {
                log::debug!("{} finished {:?}", self.address(), done);
                self.completions.push(done);
            }
            if let Some(message) = self.engine.message() {
                self.inbox.push(message.clone());
                self.engine.discard_message();
            }
            if self.engine.radio().pending() == 0 {
                break;
            }
        }
    }

    pub fn take_outgoing(&mut self) -> Vec<Transmission> {
        self.engine.radio_mut().take_outbox()
    }
}

#[cfg(test)]
mod tests {
    use miwi::debug::DebugEvent;
    use miwi::SearchTarget;

    use super::*;

    fn node(address: u64) -> SimNode {
        SimNode::new(Settings::new(LongAddress::from_u64(address)), Tick::ZERO).unwrap()
    }

    fn carry(from: &mut SimNode, to: &SimNode) -> usize {
        let source = from.address();
        let pan = from.engine().pan_id();
        let sent = from.take_outgoing();
        for t in &sent {
            let frame = ReceivedFrame::over_the_air(&t.params, source, pan, t.payload.clone());
            assert!(to.radio().deliver(frame));
        }
        sent.len()
    }

    #[test]
    fn test_simnode_comes_up_on_default_channel() {
        let n = node(1);
        assert_eq!(n.channel(), 11);
        assert_eq!(n.radio().channel(), 11);
        assert!(!n.radio().is_asleep());
        assert!(n.inbox().is_empty());
    }

    #[test]
    fn test_handshake_between_two_simnodes() {
        let mut a = node(1);
        let mut b = node(2);
        a.engine_mut()
            .start_establish_connection(SearchTarget::Any)
            .unwrap();
        a.step(Tick::from_micros(1_000));
        assert_eq!(carry(&mut a, &b), 1);

        b.step(Tick::from_micros(2_000));
        assert_eq!(b.engine().connection_count(), 1);
        assert_eq!(carry(&mut b, &a), 1);

        a.step(Tick::from_micros(3_000));
        assert_eq!(a.completions(), [Completion::Connection(Some(0))]);
        assert_eq!(a.engine().find_connection(&b.address()), Some(0));
        assert_eq!(
            a.events()
                .count(|e| matches!(e, DebugEvent::ConnectionAdded { .. })),
            1
        );
    }

    #[test]
    fn test_step_drains_full_bank() {
        let mut a = node(1);
        let mut b = node(2);
        for _ in 0..=RX_BANK_SIZE {
            a.engine_mut().broadcast(b"ping", false).unwrap();
        }
        let source = a.address();
        let accepted = a
            .take_outgoing()
            .into_iter()
            .filter(|t| {
                let frame = ReceivedFrame::over_the_air(&t.params, source, 0x1234, t.payload.clone());
                b.radio().deliver(frame)
            })
            .count();
        assert_eq!(accepted, RX_BANK_SIZE);

        b.step(Tick::from_micros(1_000));
        assert_eq!(b.inbox().len(), RX_BANK_SIZE);
        assert!(b.inbox().iter().all(|m| m.payload == b"ping" && m.broadcast));
        assert_eq!(b.radio().pending(), 0);
    }

    #[test]
    fn test_sleeping_radio_refuses_to_send() {
        let mut n = node(1);
        assert!(n.radio_mut().power_state(PowerState::Sleep));
        assert_eq!(n.engine_mut().broadcast(b"x", false), Err(Error::SendFailed));
        assert!(n.take_outgoing().is_empty());
    }

    #[test]
    fn test_noise_is_per_channel() {
        let mut n = node(1);
        n.radio_mut().set_noise(11, 70);
        n.radio_mut().set_noise(40, 1);
        assert_eq!(n.radio_mut().channel_assessment(AssessmentMode::Energy), 70);
        assert!(n.radio_mut().set_channel(12, 0));
        assert_eq!(n.radio_mut().channel_assessment(AssessmentMode::Energy), 0);
    }
}
