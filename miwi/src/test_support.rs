//! Shared fixtures for engine unit tests.

use alloc::vec::Vec;

use crate::config::DefaultConfig;
use crate::engine::{Engine, Settings};
use crate::traits::test_impls::{MockClock, MockRadio, MockStore, TestCipher};
use crate::traits::{Cipher, ReceivedFrame, SecurityContext};
use crate::types::{
    Capability, ConnectionMode, Error, FrameControl, LongAddress, PacketType,
    CMD_ACTIVE_SCAN_RESPONSE, CMD_CONNECTION_RESPONSE,
};
use crate::wire::{Encode, SecurityHeader, Writer};

pub(crate) type TestEngine = Engine<MockRadio, TestCipher, MockStore, MockClock, DefaultConfig>;

pub(crate) const ME: LongAddress = LongAddress::from_u64(0x0004_A3FF_FE00_0001);
pub(crate) const PEER_A: LongAddress = LongAddress::from_u64(0x0004_A3FF_FE00_00A1);
pub(crate) const PEER_B: LongAddress = LongAddress::from_u64(0x0004_A3FF_FE00_00B2);
pub(crate) const SLEEPY: LongAddress = LongAddress::from_u64(0x0004_A3FF_FE00_0053);
pub(crate) const KEY: u64 = 0x5EC0_11AB_0000_0001;

const PAN: u16 = 0x1234;

/// Fresh engine at tick zero, initialized without the network freezer.
pub(crate) fn engine() -> TestEngine {
    engine_with(|_| {})
}

pub(crate) fn engine_with(f: impl FnOnce(&mut Settings)) -> TestEngine {
    let mut settings = Settings::new(ME);
    f(&mut settings);
    let mut e = Engine::new(
        MockRadio::new(),
        TestCipher::new(KEY),
        MockStore::new(),
        MockClock::new(),
        settings,
    );
    e.init(false).unwrap();
    e
}

/// Engine over a prepared store.
pub(crate) fn engine_on(store: MockStore, network_freezer: bool) -> Result<TestEngine, Error> {
    let mut e = Engine::new(
        MockRadio::new(),
        TestCipher::new(KEY),
        store,
        MockClock::new(),
        Settings::new(ME),
    );
    e.init(network_freezer)?;
    Ok(e)
}

/// Bind `address` straight into the connection table.
pub(crate) fn connect_peer(e: &mut TestEngine, address: LongAddress, listening: bool) -> usize {
    let capability = if listening {
        Capability(Capability::RX_ON_WHEN_IDLE)
    } else {
        Capability(Capability::DATA_REQUEST_NEEDED)
    };
    e.connections
        .add_or_refresh(address, Some(capability), &[0], ConnectionMode::EnableAll)
        .slot
        .unwrap()
}

fn unicast(kind: PacketType, secured: bool) -> FrameControl {
    let mut fc = kind as u8
        | FrameControl::SOURCE_PRESENT
        | FrameControl::DEST_PRESENT
        | FrameControl::ACK_REQUEST;
    if secured {
        fc |= FrameControl::SECURED;
    }
    FrameControl(fc)
}

fn frame(fc: FrameControl, source: LongAddress, pan: u16, payload: &[u8]) -> ReceivedFrame {
    ReceivedFrame {
        frame_control: fc,
        source: Some(source),
        source_pan: Some(pan),
        payload: payload.to_vec(),
        link_quality: 0xC8,
        signal_level: 0x40,
    }
}

pub(crate) fn command_from(source: LongAddress, payload: &[u8]) -> ReceivedFrame {
    command_from_pan(source, PAN, payload)
}

pub(crate) fn command_from_pan(source: LongAddress, pan: u16, payload: &[u8]) -> ReceivedFrame {
    frame(unicast(PacketType::Command, false), source, pan, payload)
}

pub(crate) fn data_from(source: LongAddress, payload: &[u8]) -> ReceivedFrame {
    frame(unicast(PacketType::Data, false), source, PAN, payload)
}

/// Unicast data frame to `ME` sealed under `KEY`.
pub(crate) fn secured_from(source: LongAddress, counter: u32, payload: &[u8]) -> ReceivedFrame {
    let fc = unicast(PacketType::Data, true);
    let ctx = SecurityContext {
        source,
        destination: Some(ME),
        frame_counter: counter,
        frame_control: fc,
    };
    let mut w = Writer::new();
    SecurityHeader {
        frame_counter: counter,
        key_sequence: 0,
    }
    .encode(&mut w);
    w.write_bytes(&TestCipher::new(KEY).encrypt(payload, &ctx));
    let sealed: Vec<u8> = w.finish();
    frame(fc, source, PAN, &sealed)
}

pub(crate) fn response_from(source: LongAddress, status: u8, capability: u8) -> ReceivedFrame {
    command_from(source, &[CMD_CONNECTION_RESPONSE, status, capability, 0])
}

pub(crate) fn scan_response_from(source: LongAddress, capability: u8) -> ReceivedFrame {
    command_from(source, &[CMD_ACTIVE_SCAN_RESPONSE, capability, 0])
}
