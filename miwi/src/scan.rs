//! Active scan, noise detection, channel hopping and resync.
//!
//! All four procedures walk a 32-bit channel map (masked with
//! `P2pConfig::FULL_CHANNEL_MAP`) from the lowest channel upwards and retune the
//! radio without persisting; only the channel a hop or resync settles on is saved.

use alloc::vec;
use alloc::vec::Vec;

use crate::config::P2pConfig;
use crate::engine::Engine;
use crate::procedure::{next_channel, ChannelEnergy, Completion, Procedure};
use crate::time::{scan_duration, Duration, Tick, HOP_INTERVAL};
use crate::traits::{Cipher, Clock, Radio, ReceivedFrame, Store};
use crate::types::{
    AssessmentMode, Capability, ConnectionMode, Error, LongAddress, PacketType, ProtocolStatus,
    StartMode, BROADCAST_PAN, MAX_CHANNELS,
};
use crate::wire::{Command, Encode};

#[cfg(any(test, feature = "debug"))]
use crate::debug::DebugEvent;

/// Scan duration class used when picking a channel for frequency agility.
pub const AGILITY_SCAN_CLASS: u8 = 10;

/// One peer heard during an active scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveScanResult {
    pub channel: u8,
    pub address: LongAddress,
    pub pan_id: u16,
    pub signal_level: u8,
    pub link_quality: u8,
    pub capability: Capability,
    pub peer_info: Vec<u8>,
}

pub(crate) struct ActiveScanState {
    remaining: u32,
    dwell: Duration,
    backup_channel: u8,
    dwell_started: Option<Tick>,
}

pub(crate) struct EnergyScanState {
    remaining: u32,
    duration: Duration,
    mode: AssessmentMode,
    backup_channel: u8,
    /// Channel being sampled, when it was tuned, and its loudest sample so far.
    sampling: Option<(u8, Tick, u8)>,
    quietest: Option<ChannelEnergy>,
}

pub(crate) struct HopState {
    target: u8,
    copies_left: u8,
    last_copy: Tick,
}

pub(crate) struct ResyncState {
    peer: LongAddress,
    map: u32,
    remaining: u32,
    passes_left: u8,
    backup_channel: u8,
    last_probe: Tick,
}

impl<R, Ci, S, Clk, C> Engine<R, Ci, S, Clk, C>
where
    R: Radio,
    Ci: Cipher,
    S: Store,
    Clk: Clock,
    C: P2pConfig,
{
    /// Results of the last active scan, in discovery order.
    pub fn scan_results(&self) -> &[ActiveScanResult] {
        &self.scan_results
    }

    // --- Active scan ---

    /// Start probing every channel in `channel_map`; completes with [`Completion::ActiveScan`].
    pub fn start_active_scan(&mut self, duration_class: u8, channel_map: u32) -> Result<(), Error> {
        self.ensure_idle()?;
        let dwell = scan_duration(duration_class).ok_or(Error::InvalidInput)?;
        self.scan_results.clear();
        self.launch(Procedure::ActiveScan(ActiveScanState {
            remaining: channel_map & C::FULL_CHANNEL_MAP,
            dwell,
            backup_channel: self.current_channel,
            dwell_started: None,
        }));
        Ok(())
    }

    /// Probe every channel in `channel_map` and return the number of peers found.
    pub fn active_scan(&mut self, duration_class: u8, channel_map: u32) -> Result<usize, Error> {
        self.start_active_scan(duration_class, channel_map)?;
        match self.finish() {
            Some(Completion::ActiveScan(found)) => Ok(found),
            _ => Ok(self.scan_results.len()),
        }
    }

    pub(crate) fn step_active_scan(&mut self, state: &mut ActiveScanState, now: Tick) -> Option<Completion> {
        if let Some(started) = state.dwell_started {
            if !started.expired(now, state.dwell) {
                return None;
            }
        }
        loop {
            let Some(channel) = next_channel(&mut state.remaining) else {
                if let Err(e) = self.tune(state.backup_channel) {
                    log::warn!("cannot return to channel {}: {}", state.backup_channel, e);
                }
                log::info!("active scan found {} peer(s)", self.scan_results.len());
                return Some(Completion::ActiveScan(self.scan_results.len()));
            };
            if self.tune(channel).is_err() {
                continue;
            }
            let probe = Command::ActiveScanRequest { channel }.encode_to_vec();
            if let Err(e) = self.send_packet(None, PacketType::Command, false, &probe) {
                log::warn!("scan probe on channel {} not sent: {}", channel, e);
            }
            state.dwell_started = Some(now);
            return None;
        }
    }

    // --- Noise detection ---

    /// Start sampling channel energy; completes with [`Completion::EnergyScan`].
    pub fn start_noise_detection(
        &mut self,
        channel_map: u32,
        duration_class: u8,
        mode: AssessmentMode,
    ) -> Result<(), Error> {
        self.ensure_idle()?;
        let duration = scan_duration(duration_class).ok_or(Error::InvalidInput)?;
        self.launch(Procedure::EnergyScan(EnergyScanState {
            remaining: channel_map & C::FULL_CHANNEL_MAP,
            duration,
            mode,
            backup_channel: self.current_channel,
            sampling: None,
            quietest: None,
        }));
        Ok(())
    }

    /// Find the channel whose loudest sample is lowest.
    pub fn noise_detection(
        &mut self,
        channel_map: u32,
        duration_class: u8,
        mode: AssessmentMode,
    ) -> Result<Option<ChannelEnergy>, Error> {
        self.start_noise_detection(channel_map, duration_class, mode)?;
        match self.finish() {
            Some(Completion::EnergyScan(best)) => Ok(best),
            _ => Ok(None),
        }
    }

    pub(crate) fn step_energy_scan(&mut self, state: &mut EnergyScanState, now: Tick) -> Option<Completion> {
        if let Some((channel, started, loudest)) = state.sampling {
            let level = self.radio.channel_assessment(state.mode).max(loudest);
            if !started.expired(now, state.duration) {
                state.sampling = Some((channel, started, level));
                return None;
            }
            log::trace!("channel {} peak energy {}", channel, level);
            if state.quietest.map_or(true, |q| level < q.level) {
                state.quietest = Some(ChannelEnergy { channel, level });
            }
            state.sampling = None;
        }
        loop {
            let Some(channel) = next_channel(&mut state.remaining) else {
                if let Err(e) = self.tune(state.backup_channel) {
                    log::warn!("cannot return to channel {}: {}", state.backup_channel, e);
                }
                return Some(Completion::EnergyScan(state.quietest));
            };
            if self.tune(channel).is_ok() {
                state.sampling = Some((channel, now, 0));
                return None;
            }
        }
    }

    // --- Frequency agility ---

    /// Start announcing a move to `target`; completes with [`Completion::ChannelHop`].
    pub fn start_hop(&mut self, target: u8) -> Result<(), Error> {
        self.ensure_idle()?;
        if target >= MAX_CHANNELS {
            return Err(Error::InvalidChannel);
        }
        log::info!("hopping from channel {} to {}", self.current_channel, target);
        self.launch(Procedure::Hop(HopState {
            target,
            copies_left: C::FA_BROADCAST_TIME,
            last_copy: self.clock.now(),
        }));
        Ok(())
    }

    /// Broadcast the hop command `FA_BROADCAST_TIME` times, then move to `target`.
    pub fn start_channel_hopping(&mut self, target: u8) -> Result<(), Error> {
        self.start_hop(target)?;
        self.finish();
        if self.current_channel == target {
            Ok(())
        } else {
            Err(Error::InvalidChannel)
        }
    }

    pub(crate) fn step_hop(&mut self, state: &mut HopState, now: Tick) -> Option<Completion> {
        if !state.last_copy.expired(now, HOP_INTERVAL) {
            return None;
        }
        state.last_copy = now;
        let announce = Command::ChannelHopping {
            current: self.current_channel,
            target: state.target,
        }
        .encode_to_vec();
        if let Err(e) = self.send_packet(None, PacketType::Command, false, &announce) {
            log::warn!("hop announcement not sent: {}", e);
        }
        state.copies_left = state.copies_left.saturating_sub(1);
        emit_debug!(
            self,
            DebugEvent::HopAnnounced {
                target: state.target,
                copies_left: state.copies_left,
            }
        );
        if state.copies_left > 0 {
            return None;
        }
        if let Err(e) = self.set_channel(state.target) {
            log::warn!("hop to channel {} failed: {}", state.target, e);
        }
        Some(Completion::ChannelHop(self.current_channel))
    }

    /// Pick the quietest channel in `channel_map` and hop the network there.
    ///
    /// Returns `false` when the current channel is already the quietest.
    pub fn init_channel_hopping(&mut self, channel_map: u32) -> Result<bool, Error> {
        self.ensure_idle()?;
        let saved_mode = self.connection_mode;
        let backup_channel = self.current_channel;
        self.connection_mode = ConnectionMode::DisableAll;
        let scanned = self.noise_detection(channel_map, AGILITY_SCAN_CLASS, AssessmentMode::Energy);
        self.connection_mode = saved_mode;
        self.tune(backup_channel)?;

        let Some(best) = scanned? else {
            return Ok(false);
        };
        if best.channel == backup_channel {
            return Ok(false);
        }
        self.start_channel_hopping(best.channel)?;
        Ok(true)
    }

    // --- Resync ---

    /// Start looking for the peer in `slot` across `channel_map`; completes with
    /// [`Completion::Resync`].
    pub fn start_resync(&mut self, slot: usize, channel_map: u32) -> Result<(), Error> {
        self.ensure_idle()?;
        let peer = self.connections.get(slot).ok_or(Error::InvalidSlot)?.address;
        let map = channel_map & C::FULL_CHANNEL_MAP;
        self.status.insert(ProtocolStatus::RESYNC);
        self.launch(Procedure::Resync(ResyncState {
            peer,
            map,
            remaining: map,
            passes_left: C::RESYNC_TIMES,
            backup_channel: self.current_channel,
            last_probe: self.clock.now(),
        }));
        Ok(())
    }

    /// Find the channel the peer in `slot` moved to. Returns whether it answered.
    pub fn resync_connection(&mut self, slot: usize, channel_map: u32) -> Result<bool, Error> {
        self.start_resync(slot, channel_map)?;
        match self.finish() {
            Some(Completion::Resync(found)) => Ok(found),
            _ => Ok(false),
        }
    }

    pub(crate) fn step_resync(&mut self, state: &mut ResyncState, now: Tick) -> Option<Completion> {
        if !self.status.contains(ProtocolStatus::RESYNC) {
            if let Err(e) = self.persist_channel() {
                log::warn!("resync channel not saved: {}", e);
            }
            log::info!("resynchronized on channel {}", self.current_channel);
            emit_debug!(
                self,
                DebugEvent::ResyncFinished {
                    success: true,
                    channel: self.current_channel,
                }
            );
            return Some(Completion::Resync(true));
        }
        if !state.last_probe.expired(now, HOP_INTERVAL) {
            return None;
        }
        state.last_probe = now;
        loop {
            if let Some(channel) = next_channel(&mut state.remaining) {
                if self.tune(channel).is_err() {
                    continue;
                }
                let probe = Command::ActiveScanRequest { channel }.encode_to_vec();
                if let Err(e) = self.send_packet(Some(state.peer), PacketType::Command, false, &probe) {
                    log::debug!("resync probe on channel {} not sent: {}", channel, e);
                }
                return None;
            }
            state.passes_left = state.passes_left.saturating_sub(1);
            if state.passes_left == 0 || state.map == 0 {
                self.status.remove(ProtocolStatus::RESYNC);
                if let Err(e) = self.tune(state.backup_channel) {
                    log::warn!("cannot return to channel {}: {}", state.backup_channel, e);
                }
                log::info!("resync with {} failed", state.peer);
                emit_debug!(
                    self,
                    DebugEvent::ResyncFinished {
                        success: false,
                        channel: self.current_channel,
                    }
                );
                return Some(Completion::Resync(false));
            }
            state.remaining = state.map;
        }
    }

    // --- Starting a network ---

    /// Bring up the PAN, optionally on the quietest channel first.
    pub fn start_connection(
        &mut self,
        mode: StartMode,
        duration_class: u8,
        channel_map: u32,
    ) -> Result<(), Error> {
        match mode {
            StartMode::Direct => {}
            StartMode::EnergyScan => {
                if let Some(best) =
                    self.noise_detection(channel_map, duration_class, AssessmentMode::Energy)?
                {
                    self.set_channel(best.channel)?;
                }
            }
            StartMode::CarrierSense => return Err(Error::NotSupported),
        }
        self.set_pan_id(self.settings.pan_id)
    }

    // --- Handlers ---

    pub(crate) fn on_active_scan_request(&mut self, frame: &ReceivedFrame, channel: u8) {
        self.release_frame();
        if self.connection_mode == ConnectionMode::DisableAll || channel != self.current_channel {
            return;
        }
        let Some(source) = frame.source else {
            return;
        };
        let reply = Command::ActiveScanResponse {
            capability: self.capability,
            extra: &self.peer_info,
        }
        .encode_to_vec();
        if let Err(e) = self.send_packet(Some(source), PacketType::Command, false, &reply) {
            log::debug!("scan response to {} not sent: {}", source, e);
        }
    }

    pub(crate) fn on_active_scan_response(
        &mut self,
        frame: &ReceivedFrame,
        capability: Capability,
        extra: &[u8],
    ) {
        self.release_frame();
        if self.status.contains(ProtocolStatus::RESYNC) {
            self.status.remove(ProtocolStatus::RESYNC);
            return;
        }
        if !matches!(self.procedure, Some(Procedure::ActiveScan(_))) {
            return;
        }
        let Some(address) = frame.source else {
            return;
        };
        let channel = self.current_channel;
        let pan_id = frame.source_pan.unwrap_or(BROADCAST_PAN);
        let known = self
            .scan_results
            .iter()
            .any(|r| r.channel == channel && r.address == address && r.pan_id == pan_id);
        if known || self.scan_results.len() >= C::ACTIVE_SCAN_RESULT_SIZE {
            return;
        }
        let mut peer_info = vec![0u8; C::ADDITIONAL_NODE_ID_SIZE];
        let n = extra.len().min(peer_info.len());
        peer_info[..n].copy_from_slice(&extra[..n]);
        emit_debug!(
            self,
            DebugEvent::ScanResultRecorded {
                channel,
                address: Some(address),
                pan: pan_id,
            }
        );
        self.scan_results.push(ActiveScanResult {
            channel,
            address,
            pan_id,
            signal_level: frame.signal_level,
            link_quality: frame.link_quality,
            capability,
            peer_info,
        });
    }

    pub(crate) fn on_channel_hopping(&mut self, current: u8, target: u8) {
        self.release_frame();
        if current != self.current_channel {
            return;
        }
        if let Err(e) = self.start_hop(target) {
            log::debug!("hop to {} ignored: {}", target, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        command_from, connect_peer, engine, scan_response_from, PEER_A, PEER_B,
    };
    use crate::traits::Field;
    use crate::types::{CMD_ACTIVE_SCAN_REQUEST, CMD_CHANNEL_HOPPING};

    const MAP_11_TO_13: u32 = 0x0000_3800;

    #[test]
    fn test_active_scan_request_answered() {
        let mut e = engine();
        e.radio().inject(command_from(PEER_A, &[0x87, 11]));
        e.tick();
        let sent = e.radio_mut().take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, [0x97, e.capability().0, 0]);
        assert_eq!(sent[0].params.destination, Some(PEER_A));
        assert_eq!(e.connection_count(), 0);
    }

    #[test]
    fn test_active_scan_request_wrong_channel_or_disabled() {
        let mut e = engine();
        e.radio().inject(command_from(PEER_A, &[0x87, 12]));
        e.tick();
        e.set_connection_mode(ConnectionMode::DisableAll).unwrap();
        e.radio().inject(command_from(PEER_A, &[0x87, 11]));
        e.tick();
        assert!(e.radio().sent.is_empty());
    }

    #[test]
    fn test_active_scan_visits_channels_and_dedupes() {
        let mut e = engine();
        e.clock().set_step(Duration::from_millis(1));
        e.radio_mut().set_responder(|sent| {
            if sent.command() != Some(CMD_ACTIVE_SCAN_REQUEST) {
                return Vec::new();
            }
            match sent.channel {
                // two copies of the same answer
                12 => vec![scan_response_from(PEER_A, 0x01), scan_response_from(PEER_A, 0x01)],
                13 => vec![scan_response_from(PEER_B, 0x00)],
                _ => Vec::new(),
            }
        });
        assert_eq!(e.active_scan(3, MAP_11_TO_13), Ok(2));
        let results = e.scan_results();
        assert_eq!(results[0].channel, 12);
        assert_eq!(results[0].address, PEER_A);
        assert_eq!(results[0].pan_id, 0x1234);
        assert_eq!(results[1].channel, 13);
        assert!(!results[1].capability.rx_on_when_idle());
        assert_eq!(e.current_channel(), 11);

        let probes: Vec<u8> = e.radio().sent.iter().map(|f| f.channel).collect();
        assert_eq!(probes, [11, 12, 13]);
    }

    #[test]
    fn test_active_scan_capacity_bound() {
        let mut e = engine();
        e.clock().set_step(Duration::from_millis(1));
        e.radio_mut().set_responder(|sent| {
            let base = 0x7000 + ((sent.channel as u64) << 8);
            (0..3u64)
                .map(|n| scan_response_from(LongAddress::from_u64(base + n), 0x01))
                .collect()
        });
        // six distinct answers over two channels, four result slots
        assert_eq!(e.active_scan(3, 0x0000_1800), Ok(4));
        assert_eq!(e.scan_results()[3].channel, 12);
    }

    #[test]
    fn test_scan_response_outside_scan_ignored() {
        let mut e = engine();
        e.radio().inject(scan_response_from(PEER_A, 0x01));
        e.tick();
        assert!(e.scan_results().is_empty());
    }

    #[test]
    fn test_invalid_duration_class() {
        let mut e = engine();
        assert_eq!(e.active_scan(15, MAP_11_TO_13), Err(Error::InvalidInput));
        assert_eq!(
            e.noise_detection(MAP_11_TO_13, 15, AssessmentMode::Energy),
            Err(Error::InvalidInput)
        );
    }

    #[test]
    fn test_noise_detection_picks_lowest_peak() {
        let mut e = engine();
        e.clock().set_step(Duration::from_micros(500));
        e.radio_mut().energy[11] = 90;
        e.radio_mut().energy[12] = 20;
        e.radio_mut().energy[13] = 40;
        let best = e.noise_detection(MAP_11_TO_13, 2, AssessmentMode::Energy).unwrap();
        assert_eq!(best, Some(ChannelEnergy { channel: 12, level: 20 }));
        assert_eq!(e.current_channel(), 11);
        assert_eq!(e.radio().channel, 11);
    }

    #[test]
    fn test_noise_detection_empty_map() {
        let mut e = engine();
        assert_eq!(e.noise_detection(0x3, 0, AssessmentMode::Energy), Ok(None));
    }

    #[test]
    fn test_hop_announces_then_moves() {
        let mut e = engine();
        e.start_hop(15).unwrap();
        for _ in 0..2 {
            e.clock().advance(HOP_INTERVAL + Duration::from_micros(1));
            assert_eq!(e.poll(), None);
        }
        assert_eq!(e.current_channel(), 11);
        e.clock().advance(HOP_INTERVAL + Duration::from_micros(1));
        assert_eq!(e.poll(), Some(Completion::ChannelHop(15)));
        assert_eq!(e.current_channel(), 15);
        assert_eq!(e.store().get(Field::CurrentChannel), Some(&[15][..]));

        let sent = e.radio_mut().take_sent();
        assert_eq!(sent.len(), 3);
        assert!(sent
            .iter()
            .all(|f| f.is_broadcast() && f.payload == [CMD_CHANNEL_HOPPING, 11, 15]));
    }

    #[test]
    fn test_hop_command_relayed_for_current_channel_only() {
        let mut e = engine();
        e.radio().inject(command_from(PEER_A, &[0x84, 12, 15]));
        e.tick();
        assert!(!e.is_busy());
        e.radio().inject(command_from(PEER_A, &[0x84, 11, 15]));
        e.tick();
        assert!(e.is_busy());
        // a second announcement while hopping is dropped
        e.radio().inject(command_from(PEER_A, &[0x84, 11, 20]));
        e.tick();
        e.clock().set_step(Duration::from_millis(10));
        e.finish();
        assert_eq!(e.current_channel(), 15);
    }

    #[test]
    fn test_hop_target_validated() {
        let mut e = engine();
        assert_eq!(e.start_channel_hopping(32), Err(Error::InvalidChannel));
    }

    #[test]
    fn test_init_channel_hopping_moves_to_quietest() {
        let mut e = engine();
        e.clock().set_step(Duration::from_millis(5));
        e.radio_mut().energy[11] = 80;
        e.radio_mut().energy[13] = 10;
        e.radio_mut().energy[12] = 50;
        assert_eq!(e.init_channel_hopping(MAP_11_TO_13), Ok(true));
        assert_eq!(e.current_channel(), 13);
        assert_eq!(e.connection_mode(), ConnectionMode::EnableAll);
    }

    #[test]
    fn test_init_channel_hopping_stays_when_quietest() {
        let mut e = engine();
        e.clock().set_step(Duration::from_millis(5));
        e.radio_mut().energy[12] = 50;
        e.radio_mut().energy[13] = 50;
        assert_eq!(e.init_channel_hopping(MAP_11_TO_13), Ok(false));
        assert_eq!(e.current_channel(), 11);
        assert!(e.radio().sent.is_empty());
    }

    #[test]
    fn test_resync_finds_peer() {
        let mut e = engine();
        let slot = connect_peer(&mut e, PEER_A, true);
        e.clock().set_step(Duration::from_millis(50));
        e.radio_mut().set_responder(|sent| {
            if sent.channel == 13 && sent.command() == Some(CMD_ACTIVE_SCAN_REQUEST) {
                vec![scan_response_from(PEER_A, 0x01)]
            } else {
                Vec::new()
            }
        });
        assert_eq!(e.resync_connection(slot, MAP_11_TO_13), Ok(true));
        assert_eq!(e.current_channel(), 13);
        assert_eq!(e.store().get(Field::CurrentChannel), Some(&[13][..]));
        assert!(!e.status().contains(ProtocolStatus::RESYNC));
        let probe = &e.radio().sent[0];
        assert_eq!(probe.params.destination, Some(PEER_A));
        assert_eq!(probe.payload, [0x87, 11]);
    }

    #[test]
    fn test_resync_gives_up_and_restores_channel() {
        let mut e = engine();
        let slot = connect_peer(&mut e, PEER_A, true);
        e.clock().set_step(Duration::from_millis(50));
        assert_eq!(e.resync_connection(slot, MAP_11_TO_13), Ok(false));
        assert_eq!(e.current_channel(), 11);
        assert_eq!(e.radio().sent.len(), 9);
        assert!(!e.status().contains(ProtocolStatus::RESYNC));
    }

    #[test]
    fn test_resync_invalid_slot() {
        let mut e = engine();
        assert_eq!(e.resync_connection(3, MAP_11_TO_13), Err(Error::InvalidSlot));
    }

    #[test]
    fn test_start_connection_modes() {
        let mut e = engine();
        assert_eq!(
            e.start_connection(StartMode::CarrierSense, 0, MAP_11_TO_13),
            Err(Error::NotSupported)
        );
        e.clock().set_step(Duration::from_micros(500));
        e.radio_mut().energy[11] = 60;
        e.radio_mut().energy[12] = 30;
        e.radio_mut().energy[13] = 70;
        e.start_connection(StartMode::EnergyScan, 0, MAP_11_TO_13).unwrap();
        assert_eq!(e.current_channel(), 12);
        assert_eq!(e.store().get(Field::PanId), Some(&[0x34, 0x12][..]));
        e.start_connection(StartMode::Direct, 0, 0).unwrap();
        assert_eq!(e.current_channel(), 12);
    }
}
