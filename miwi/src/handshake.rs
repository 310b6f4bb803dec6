//! Connection handshake: search, admission and removal.
//!
//! A searching node broadcasts (or unicasts to a scan result) a connection request
//! every `CONNECTION_INTERVAL` seconds, at most `CONNECTION_RETRY_TIMES` times.
//! The search ends as soon as a handshake in either direction binds a slot.
//!
//! Admission on the responder side:
//!
//! | mode                     | new peer        | known peer      | bare probe     |
//! |--------------------------|-----------------|-----------------|----------------|
//! | EnableAll                | Success (write) | AlreadyExists   | ActiveScanOnly |
//! | EnablePrevious           | NotPermitted    | AlreadyExists   | ActiveScanOnly |
//! | EnableActiveScanResponse | NotPermitted    | NotPermitted    | ActiveScanOnly |
//! | DisableAll               | (silent)        | (silent)        | (silent)       |

use crate::config::P2pConfig;
use crate::engine::Engine;
use crate::procedure::{Completion, Procedure};
use crate::time::{Duration, Tick};
use crate::traits::{Cipher, Clock, Radio, ReceivedFrame, Store};
use crate::types::{
    Capability, ConnectionMode, ConnectionStatus, Error, LongAddress, PacketType,
    ProtocolStatus, BROADCAST_PAN,
};
use crate::wire::{Command, Encode};

#[cfg(any(test, feature = "debug"))]
use crate::debug::DebugEvent;

/// Busy-wait iterations after a removal request, letting the radio finish the frame.
const REMOVAL_SETTLE_SPINS: u32 = 4096;

/// Whom a connection search addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchTarget {
    /// Broadcast on the current channel; anyone may answer.
    Any,
    /// Unicast to an entry of the last active scan, on its channel.
    ScanResult(usize),
}

/// Which connections `remove_connection` tears down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalTarget {
    Slot(usize),
    All,
}

pub(crate) struct SearchState {
    /// Peer and channel for a targeted search.
    target: Option<(LongAddress, u8)>,
    saved_mode: ConnectionMode,
    retries_left: u8,
    intervals_left: u8,
    last_second: Tick,
}

impl<R, Ci, S, Clk, C> Engine<R, Ci, S, Clk, C>
where
    R: Radio,
    Ci: Cipher,
    S: Store,
    Clk: Clock,
    C: P2pConfig,
{
    /// Start a connection search; completes with [`Completion::Connection`].
    ///
    /// Admission is opened to everyone for the duration of the search.
    pub fn start_establish_connection(&mut self, target: SearchTarget) -> Result<(), Error> {
        self.ensure_idle()?;
        let target = match target {
            SearchTarget::Any => None,
            SearchTarget::ScanResult(i) => {
                let result = self.scan_results.get(i).ok_or(Error::InvalidInput)?;
                Some((result.address, result.channel))
            }
        };
        let now = self.clock.now();
        let state = SearchState {
            target,
            saved_mode: self.connection_mode,
            retries_left: C::CONNECTION_RETRY_TIMES,
            intervals_left: 0,
            last_second: now.wrapping_sub(Duration::ONE_SECOND),
        };
        self.connection_mode = ConnectionMode::EnableAll;
        self.latest_connection = None;
        self.status.insert(ProtocolStatus::SEARCH_CONNECTION);
        self.launch(Procedure::Search(state));
        Ok(())
    }

    /// Search for a connection and block until one is bound or retries run out.
    ///
    /// Returns the slot of the new connection, `None` if nobody answered.
    pub fn establish_connection(&mut self, target: SearchTarget) -> Result<Option<usize>, Error> {
        self.start_establish_connection(target)?;
        match self.finish() {
            Some(Completion::Connection(slot)) => Ok(slot),
            _ => Ok(None),
        }
    }

    pub(crate) fn step_search(&mut self, state: &mut SearchState, now: Tick) -> Option<Completion> {
        if !self.status.contains(ProtocolStatus::SEARCH_CONNECTION) {
            self.connection_mode = state.saved_mode;
            log::info!("connection established in slot {:?}", self.latest_connection);
            return Some(Completion::Connection(self.latest_connection));
        }
        if now.since(state.last_second) < Duration::ONE_SECOND {
            return None;
        }
        state.last_second = now;
        if state.intervals_left > 0 {
            state.intervals_left -= 1;
            return None;
        }
        state.intervals_left = C::CONNECTION_INTERVAL.saturating_sub(1);
        if state.retries_left == 0 {
            self.status.remove(ProtocolStatus::SEARCH_CONNECTION);
            self.connection_mode = state.saved_mode;
            log::info!("connection search timed out");
            return Some(Completion::Connection(None));
        }
        state.retries_left -= 1;

        let request = Command::ConnectionRequest {
            channel: self.current_channel,
            capability: Some(self.capability),
            extra: &self.peer_info,
        }
        .encode_to_vec();
        let sent = match state.target {
            None => self.send_packet(None, PacketType::Command, false, &request),
            Some((address, channel)) => {
                let request = if channel == self.current_channel {
                    request
                } else {
                    // the request names the channel it is sent on
                    self.set_channel(channel)
                        .map(|()| {
                            Command::ConnectionRequest {
                                channel,
                                capability: Some(self.capability),
                                extra: &self.peer_info,
                            }
                            .encode_to_vec()
                        })
                        .unwrap_or(request)
                };
                self.send_packet(Some(address), PacketType::Command, false, &request)
            }
        };
        if let Err(e) = sent {
            log::warn!("connection request not sent: {}", e);
        }
        None
    }

    /// Tear down one or every connection.
    ///
    /// Each peer is sent a removal request first; delivery is best effort.
    pub fn remove_connection(&mut self, target: RemovalTarget) -> Result<(), Error> {
        match target {
            RemovalTarget::Slot(slot) => self.remove_slot(slot),
            RemovalTarget::All => {
                let slots: alloc::vec::Vec<usize> =
                    self.connections.iter().map(|(slot, _)| slot).collect();
                for slot in slots {
                    self.remove_slot(slot)?;
                }
                Ok(())
            }
        }
    }

    fn remove_slot(&mut self, slot: usize) -> Result<(), Error> {
        let address = self.connections.get(slot).ok_or(Error::InvalidSlot)?.address;
        let request = Command::RemovalRequest.encode_to_vec();
        if let Err(e) = self.send_command_to(address, &request) {
            log::warn!("removal request to {} not sent: {}", address, e);
        }
        for _ in 0..REMOVAL_SETTLE_SPINS {
            core::hint::spin_loop();
        }
        self.drop_connection(slot, address);
        Ok(())
    }

    fn drop_connection(&mut self, slot: usize, address: LongAddress) {
        self.connections.remove(slot);
        if self.latest_connection == Some(slot) {
            self.latest_connection = None;
        }
        log::info!("connection {} to {} removed", slot, address);
        emit_debug!(self, DebugEvent::ConnectionRemoved { slot, address });
        self.mark_table_dirty();
    }

    // --- Handlers ---

    pub(crate) fn on_connection_request(
        &mut self,
        frame: &ReceivedFrame,
        channel: u8,
        capability: Option<Capability>,
        extra: &[u8],
    ) {
        self.release_frame();
        if self.settings.sleeping_device
            || channel != self.current_channel
            || self.connection_mode == ConnectionMode::DisableAll
        {
            log::trace!("connection request ignored");
            return;
        }
        let Some(source) = frame.source else {
            return;
        };

        let foreign_pan = frame
            .source_pan
            .is_some_and(|pan| pan != BROADCAST_PAN && pan != self.pan_id);
        let (mut status, mut slot) = if foreign_pan && capability.is_some() {
            (ConnectionStatus::NotSamePan, None)
        } else {
            let outcome =
                self.connections
                    .add_or_refresh(source, capability, extra, self.connection_mode);
            (outcome.status, outcome.slot)
        };

        status = match (self.connection_mode, status) {
            (ConnectionMode::EnablePrevious, ConnectionStatus::Success | ConnectionStatus::NoSpace)
            | (ConnectionMode::EnableActiveScanResponse, ConnectionStatus::Success)
            | (ConnectionMode::EnableActiveScanResponse, ConnectionStatus::AlreadyExists)
            | (ConnectionMode::EnableActiveScanResponse, ConnectionStatus::NoSpace) => {
                ConnectionStatus::NotPermitted
            }
            (_, other) => other,
        };
        let fresh = status == ConnectionStatus::Success && slot.is_some();

        if let (true, Some(cap), Some(policy)) =
            (status.is_connected(), capability, self.admission.as_mut())
        {
            if !policy(&source, cap, extra) {
                log::info!("connection from {} vetoed", source);
                if fresh {
                    if let Some(s) = slot {
                        self.connections.remove(s);
                    }
                }
                status = ConnectionStatus::NotPermitted;
                slot = None;
            }
        }

        if let (true, Some(s)) = (status.is_connected(), slot) {
            if fresh {
                log::info!("connection {} bound to {}", s, source);
                emit_debug!(self, DebugEvent::ConnectionAdded { slot: s, address: source });
                self.mark_table_dirty();
            }
            self.latest_connection = Some(s);
            self.status.remove(ProtocolStatus::SEARCH_CONNECTION);
        }
        emit_debug!(self, DebugEvent::ConnectionRequestHandled { from: source, status });

        let reply = Command::ConnectionResponse {
            status,
            capability: Some(self.capability),
            extra: &self.peer_info,
        }
        .encode_to_vec();
        if let Err(e) = self.send_packet(Some(source), PacketType::Command, frame.secured(), &reply) {
            log::warn!("connection response to {} not sent: {}", source, e);
        }
    }

    pub(crate) fn on_connection_response(
        &mut self,
        frame: &ReceivedFrame,
        status: ConnectionStatus,
        capability: Option<Capability>,
        extra: &[u8],
    ) {
        self.release_frame();
        let Some(source) = frame.source else {
            return;
        };
        if !status.is_connected() {
            log::info!("{} refused connection: {:?}", source, status);
            return;
        }
        if self.pan_id == BROADCAST_PAN {
            if let Some(pan) = frame.source_pan {
                if let Err(e) = self.set_pan_id(pan) {
                    log::warn!("adopting pan {:04X} failed: {}", pan, e);
                }
            }
        }
        let outcome = self
            .connections
            .add_or_refresh(source, capability, extra, self.connection_mode);
        let Some(slot) = outcome.slot else {
            log::debug!("response from {} not recorded: {:?}", source, outcome.status);
            return;
        };
        if outcome.status == ConnectionStatus::Success {
            log::info!("connection {} bound to {}", slot, source);
            emit_debug!(self, DebugEvent::ConnectionAdded { slot, address: source });
        }
        self.latest_connection = Some(slot);
        self.status.remove(ProtocolStatus::SEARCH_CONNECTION);
        self.mark_table_dirty();
    }

    pub(crate) fn on_removal_request(&mut self, frame: &ReceivedFrame) {
        self.release_frame();
        let Some(source) = frame.source else {
            return;
        };
        let status = match self.connections.lookup(&source) {
            Some(slot) => {
                self.drop_connection(slot, source);
                ConnectionStatus::Success
            }
            None => ConnectionStatus::EntryNotFound,
        };
        let reply = Command::RemovalResponse { status }.encode_to_vec();
        if let Err(e) = self.send_packet(Some(source), PacketType::Command, frame.secured(), &reply) {
            log::warn!("removal response to {} not sent: {}", source, e);
        }
    }

    pub(crate) fn on_removal_response(&mut self, frame: &ReceivedFrame, status: ConnectionStatus) {
        self.release_frame();
        if status != ConnectionStatus::Success {
            return;
        }
        let Some(source) = frame.source else {
            return;
        };
        if let Some(slot) = self.connections.lookup(&source) {
            self.drop_connection(slot, source);
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use super::*;
    use crate::test_support::{
        command_from, command_from_pan, connect_peer, engine, engine_with, response_from, PEER_A,
        PEER_B, SLEEPY,
    };
    use crate::traits::test_impls::SentFrame;
    use crate::types::CMD_CONNECTION_REQUEST;

    fn request(cap: u8, info: u8) -> Vec<u8> {
        vec![0x81, 11, cap, info]
    }

    fn last_reply(sent: &[SentFrame]) -> &SentFrame {
        sent.last().expect("no reply sent")
    }

    #[test]
    fn test_request_binds_slot_and_replies() {
        let mut e = engine();
        e.radio().inject(command_from(PEER_A, &request(0x01, 0x42)));
        e.tick();
        let entry = e.connection(0).unwrap();
        assert_eq!(entry.address, PEER_A);
        assert!(entry.rx_on_when_idle());
        assert_eq!(entry.peer_info, [0x42]);
        assert_eq!(e.incoming_frame_counter(0), Some(0));
        assert_eq!(e.latest_connection(), Some(0));
        assert!(e.status().contains(ProtocolStatus::SAVE_PENDING));

        let sent = e.radio_mut().take_sent();
        let reply = last_reply(&sent);
        assert_eq!(reply.params.destination, Some(PEER_A));
        assert!(reply.is_command());
        assert_eq!(&reply.payload[..3], &[0x91, 0x00, e.capability().0]);
    }

    #[test]
    fn test_repeat_request_reports_exists() {
        let mut e = engine();
        e.radio().inject(command_from(PEER_A, &request(0x01, 0x42)));
        e.tick();
        e.radio().inject(command_from(PEER_A, &request(0x00, 0x99)));
        e.tick();
        assert_eq!(e.connection_count(), 1);
        assert!(e.connection(0).unwrap().rx_on_when_idle());
        let sent = e.radio_mut().take_sent();
        assert_eq!(last_reply(&sent).payload[1], 0x01);
    }

    #[test]
    fn test_full_table_reports_no_space() {
        let mut e = engine();
        for n in 0..10u64 {
            connect_peer(&mut e, LongAddress::from_u64(0x9000 + n), true);
        }
        e.radio().inject(command_from(PEER_A, &request(0x01, 0)));
        e.tick();
        assert_eq!(e.find_connection(&PEER_A), None);
        let sent = e.radio_mut().take_sent();
        let reply = last_reply(&sent);
        assert_eq!(reply.payload, [0x91, 0xF1]);
    }

    #[test]
    fn test_bare_probe_answered_without_binding() {
        let mut e = engine();
        e.radio().inject(command_from(PEER_A, &[0x81, 11]));
        e.tick();
        assert_eq!(e.connection_count(), 0);
        let sent = e.radio_mut().take_sent();
        assert_eq!(&last_reply(&sent).payload[..2], &[0x91, 0x02]);
    }

    #[test]
    fn test_request_for_other_channel_ignored() {
        let mut e = engine();
        e.radio().inject(command_from(PEER_A, &[0x81, 12, 0x01, 0]));
        e.tick();
        assert_eq!(e.connection_count(), 0);
        assert!(e.radio().sent.is_empty());
        assert_eq!(e.radio().discards, 1);
    }

    #[test]
    fn test_sleeping_device_ignores_requests() {
        let mut e = engine_with(|s| s.sleeping_device = true);
        e.radio().inject(command_from(PEER_A, &request(0x01, 0)));
        e.tick();
        assert_eq!(e.connection_count(), 0);
        assert!(e.radio().sent.is_empty());
    }

    #[test]
    fn test_foreign_pan_rejected() {
        let mut e = engine();
        e.radio().inject(command_from_pan(PEER_A, 0x4321, &request(0x01, 0)));
        e.tick();
        assert_eq!(e.connection_count(), 0);
        let sent = e.radio_mut().take_sent();
        assert_eq!(last_reply(&sent).payload, [0x91, 0xF2]);

        // unjoined requester is welcome
        e.radio().inject(command_from_pan(PEER_B, 0xFFFF, &request(0x01, 0)));
        e.tick();
        assert_eq!(e.find_connection(&PEER_B), Some(0));
    }

    #[test]
    fn test_enable_previous_mode() {
        let mut e = engine();
        connect_peer(&mut e, PEER_A, true);
        e.set_connection_mode(ConnectionMode::EnablePrevious).unwrap();

        e.radio().inject(command_from(PEER_B, &request(0x01, 0)));
        e.tick();
        assert_eq!(e.find_connection(&PEER_B), None);
        assert_eq!(last_reply(&e.radio_mut().take_sent()).payload, [0x91, 0xF3]);

        e.radio().inject(command_from(PEER_A, &request(0x01, 0)));
        e.tick();
        assert_eq!(last_reply(&e.radio_mut().take_sent()).payload[1], 0x01);
    }

    #[test]
    fn test_scan_response_only_mode_refuses_everyone() {
        let mut e = engine();
        connect_peer(&mut e, PEER_A, true);
        e.set_connection_mode(ConnectionMode::EnableActiveScanResponse).unwrap();
        e.radio().inject(command_from(PEER_A, &request(0x01, 0)));
        e.tick();
        assert_eq!(last_reply(&e.radio_mut().take_sent()).payload, [0x91, 0xF3]);
        e.radio().inject(command_from(PEER_B, &[0x81, 11]));
        e.tick();
        assert_eq!(last_reply(&e.radio_mut().take_sent()).payload[1], 0x02);
    }

    #[test]
    fn test_disable_all_is_silent() {
        let mut e = engine();
        e.set_connection_mode(ConnectionMode::DisableAll).unwrap();
        e.radio().inject(command_from(PEER_A, &request(0x01, 0)));
        e.tick();
        assert!(e.radio().sent.is_empty());
    }

    #[test]
    fn test_admission_veto_frees_slot() {
        let mut e = engine();
        e.set_admission_policy(|addr, _cap, _info| *addr != PEER_B);
        e.radio().inject(command_from(PEER_B, &request(0x01, 0)));
        e.tick();
        assert_eq!(e.connection_count(), 0);
        assert_eq!(last_reply(&e.radio_mut().take_sent()).payload, [0x91, 0xF3]);

        e.radio().inject(command_from(PEER_A, &request(0x01, 0)));
        e.tick();
        assert_eq!(e.find_connection(&PEER_A), Some(0));
    }

    #[test]
    fn test_response_binds_and_adopts_pan() {
        let mut e = engine_with(|s| s.pan_id = 0xFFFF);
        e.radio().inject(response_from(PEER_A, 0x00, 0x01));
        e.tick();
        assert_eq!(e.find_connection(&PEER_A), Some(0));
        assert_eq!(e.pan_id(), 0x1234);
        assert_eq!(e.radio().alt_address, Some((0xFFFF, 0x1234)));
    }

    #[test]
    fn test_refusal_response_binds_nothing() {
        let mut e = engine();
        e.radio().inject(command_from(PEER_A, &[0x91, 0xF1]));
        e.tick();
        assert_eq!(e.connection_count(), 0);
    }

    #[test]
    fn test_search_times_out_after_retries() {
        let mut e = engine();
        e.clock().set_step(Duration::from_millis(100));
        assert_eq!(e.establish_connection(SearchTarget::Any), Ok(None));
        let requests: Vec<_> = e
            .radio()
            .sent
            .iter()
            .filter(|f| f.command() == Some(CMD_CONNECTION_REQUEST))
            .collect();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|f| f.is_broadcast()));
        assert_eq!(requests[0].payload, [0x81, 11, e.capability().0, 0]);
        assert!(!e.status().contains(ProtocolStatus::SEARCH_CONNECTION));
        assert_eq!(e.connection_mode(), ConnectionMode::EnableAll);
    }

    #[test]
    fn test_search_restores_mode() {
        let mut e = engine();
        e.set_connection_mode(ConnectionMode::EnablePrevious).unwrap();
        e.clock().set_step(Duration::from_millis(100));
        e.establish_connection(SearchTarget::Any).unwrap();
        assert_eq!(e.connection_mode(), ConnectionMode::EnablePrevious);
    }

    #[test]
    fn test_search_ends_on_response() {
        let mut e = engine();
        e.clock().set_step(Duration::from_millis(10));
        e.radio_mut().set_responder(|sent| {
            if sent.command() == Some(CMD_CONNECTION_REQUEST) {
                vec![response_from(PEER_A, 0x00, 0x01)]
            } else {
                Vec::new()
            }
        });
        assert_eq!(e.establish_connection(SearchTarget::Any), Ok(Some(0)));
        assert_eq!(e.connection(0).unwrap().address, PEER_A);
        assert!(!e.is_busy());
    }

    #[test]
    fn test_search_busy_while_running() {
        let mut e = engine();
        e.start_establish_connection(SearchTarget::Any).unwrap();
        assert_eq!(e.start_establish_connection(SearchTarget::Any), Err(Error::Busy));
        assert_eq!(
            e.establish_connection(SearchTarget::ScanResult(0)),
            Err(Error::Busy)
        );
    }

    #[test]
    fn test_search_target_must_exist() {
        let mut e = engine();
        assert_eq!(
            e.start_establish_connection(SearchTarget::ScanResult(0)),
            Err(Error::InvalidInput)
        );
    }

    #[test]
    fn test_removal_request_from_known_peer() {
        let mut e = engine();
        connect_peer(&mut e, PEER_A, true);
        e.radio().inject(command_from(PEER_A, &[0x82]));
        e.tick();
        assert_eq!(e.connection_count(), 0);
        assert_eq!(last_reply(&e.radio_mut().take_sent()).payload, [0x92, 0x00]);

        e.radio().inject(command_from(PEER_A, &[0x82]));
        e.tick();
        assert_eq!(last_reply(&e.radio_mut().take_sent()).payload, [0x92, 0xF0]);
    }

    #[test]
    fn test_remove_connection_notifies_peer() {
        let mut e = engine();
        let slot = connect_peer(&mut e, PEER_A, true);
        e.remove_connection(RemovalTarget::Slot(slot)).unwrap();
        assert!(e.connection(slot).is_none());
        let sent = e.radio_mut().take_sent();
        assert_eq!(sent[0].payload, [0x82]);
        assert_eq!(sent[0].params.destination, Some(PEER_A));
        assert_eq!(e.remove_connection(RemovalTarget::Slot(slot)), Err(Error::InvalidSlot));
    }

    #[test]
    fn test_remove_all_queues_for_sleepers() {
        let mut e = engine();
        connect_peer(&mut e, PEER_A, true);
        connect_peer(&mut e, SLEEPY, false);
        e.remove_connection(RemovalTarget::All).unwrap();
        assert_eq!(e.connection_count(), 0);
        assert_eq!(e.radio().sent.len(), 1);
        let queued = e.indirect_message(0).unwrap();
        assert!(queued.is_command);
        assert_eq!(queued.payload, [0x82]);
    }
}
