//! The protocol task loop and command dispatch.
//!
//! Each [`Engine::tick`] does the housekeeping (indirect expiry, data-request
//! timeout, deferred table save), takes at most one frame from the radio, opens
//! it if secured, dispatches protocol commands to their handlers and leaves
//! application data retained for the caller. The running procedure, if any, is
//! stepped last.

use crate::config::P2pConfig;
use crate::engine::{Engine, RxMessage};
use crate::time::Tick;
use crate::traits::{Cipher, Clock, Radio, ReceivedFrame, SecurityContext, Store};
use crate::types::ProtocolStatus;
use crate::wire::{Command, DecodeError, SecurityHeader};

#[cfg(any(test, feature = "debug"))]
use crate::debug::DebugEvent;

impl<R, Ci, S, Clk, C> Engine<R, Ci, S, Clk, C>
where
    R: Radio,
    Ci: Cipher,
    S: Store,
    Clk: Clock,
    C: P2pConfig,
{
    /// Run one iteration of the task loop.
    pub fn tick(&mut self) {
        let now = self.clock.now();

        let expired = self.indirect.expire(now);
        if expired > 0 {
            log::debug!("{} indirect message(s) expired", expired);
            emit_debug!(self, DebugEvent::IndirectExpired { count: expired });
        }

        if self.status.contains(ProtocolStatus::DATA_REQUESTING)
            && self.data_request_started.expired(now, C::RFD_DATA_WAIT)
        {
            log::debug!("data request expired");
            self.status.remove(ProtocolStatus::DATA_REQUESTING);
            if self.settings.time_sync {
                self.next_wake = C::RFD_WAKEUP_INTERVAL;
                self.wake_epoch = now;
            }
            emit_debug!(self, DebugEvent::DataRequestTimedOut { at: now });
        }

        if self.status.contains(ProtocolStatus::SAVE_PENDING)
            && self.save_requested_at.expired(now, C::SAVE_DELAY)
        {
            self.flush_deferred(now);
        }

        if !self.status.contains(ProtocolStatus::RX_HAS_USER_DATA) {
            if let Some(frame) = self.radio.poll_received() {
                self.rx_held = true;
                self.receive(frame, now);
            }
        }

        if self.status.contains(ProtocolStatus::RX_HAS_USER_DATA) {
            self.status.remove(ProtocolStatus::DATA_REQUESTING);
            let empty = self.rx.as_ref().map_or(true, |m| m.payload.is_empty());
            let protocol_busy = self
                .status
                .contains(ProtocolStatus::SEARCH_CONNECTION | ProtocolStatus::RESYNC);
            if empty || protocol_busy {
                self.discard_message();
            }
        }

        self.step_procedure(now);
    }

    #[cfg_attr(not(any(test, feature = "debug")), allow(unused_variables))]
    fn receive(&mut self, frame: ReceivedFrame, now: Tick) {
        let frame = if frame.secured() {
            match self.open_frame(frame) {
                Some(opened) => opened,
                None => {
                    self.release_frame();
                    return;
                }
            }
        } else {
            frame
        };

        emit_debug!(
            self,
            DebugEvent::FrameReceived {
                at: now,
                source: frame.source,
                secured: frame.secured(),
                command: if frame.is_command() {
                    frame.payload.first().copied()
                } else {
                    None
                },
                len: frame.payload.len(),
            }
        );

        if !frame.is_command() {
            self.retain(frame);
            return;
        }
        match Command::decode(&frame.payload) {
            Ok(command) => self.handle_command(command, &frame),
            Err(DecodeError::UnknownCommand(cmd)) => {
                // commands outside the protocol set belong to the application
                log::trace!("passing command {:02X} to application", cmd);
                self.retain(frame);
            }
            Err(e) => {
                log::debug!("malformed command frame dropped: {:?}", e);
                emit_debug!(self, DebugEvent::FrameDiscarded { reason: "malformed command" });
                self.release_frame();
            }
        }
    }

    /// Check the replay window and decrypt a secured frame.
    fn open_frame(&mut self, frame: ReceivedFrame) -> Option<ReceivedFrame> {
        let Some(source) = frame.source else {
            emit_debug!(self, DebugEvent::FrameDiscarded { reason: "secured frame without source" });
            return None;
        };
        let Ok((header, sealed)) = SecurityHeader::split(&frame.payload) else {
            emit_debug!(self, DebugEvent::FrameDiscarded { reason: "short security header" });
            return None;
        };

        let slot = self.connections.lookup(&source);
        if let Some(slot) = slot {
            if !self.connections.counter_fresh(slot, header.frame_counter) {
                let last_accepted = self.connections.incoming_counter(slot).unwrap_or(0);
                log::warn!(
                    "replay from {}: counter {} not above {}",
                    source,
                    header.frame_counter,
                    last_accepted
                );
                emit_debug!(
                    self,
                    DebugEvent::ReplayRejected {
                        slot,
                        frame_counter: header.frame_counter,
                        last_accepted,
                    }
                );
                return None;
            }
        }

        let ctx = SecurityContext {
            source,
            destination: (!frame.broadcast()).then_some(self.settings.address),
            frame_counter: header.frame_counter,
            frame_control: frame.frame_control,
        };
        let Ok(payload) = self.cipher.decrypt(sealed, &ctx) else {
            log::warn!("authentication failed for frame from {}", source);
            emit_debug!(self, DebugEvent::DecryptFailed { source: Some(source) });
            return None;
        };
        if let Some(slot) = slot {
            self.connections.commit_counter(slot, header.frame_counter);
        }
        Some(ReceivedFrame { payload, ..frame })
    }

    fn handle_command(&mut self, command: Command<'_>, frame: &ReceivedFrame) {
        match command {
            Command::ConnectionRequest {
                channel,
                capability,
                extra,
            } => self.on_connection_request(frame, channel, capability, extra),
            Command::ConnectionResponse {
                status,
                capability,
                extra,
            } => self.on_connection_response(frame, status, capability, extra),
            Command::RemovalRequest => self.on_removal_request(frame),
            Command::RemovalResponse { status } => self.on_removal_response(frame, status),
            Command::ActiveScanRequest { channel } => self.on_active_scan_request(frame, channel),
            Command::ActiveScanResponse { capability, extra } => {
                self.on_active_scan_response(frame, capability, extra)
            }
            Command::DataRequest => self.on_data_request(frame),
            Command::ChannelHopping { current, target } => {
                self.on_channel_hopping(current, target)
            }
            Command::TimeSync {
                command,
                wake_after,
                payload,
            } => self.on_time_sync(frame, command, wake_after, payload),
        }
    }

    /// Keep the frame for the application; the driver slot stays held.
    pub(crate) fn retain(&mut self, frame: ReceivedFrame) {
        self.rx = Some(RxMessage::from(frame));
        self.status.insert(ProtocolStatus::RX_HAS_USER_DATA);
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::debug::EventLog;
    use crate::test_support::{
        command_from, connect_peer, data_from, engine, secured_from, PEER_A, PEER_B,
    };
    use crate::time::Duration;
    use crate::types::FrameControl;

    #[test]
    fn test_data_frame_retained_until_discard() {
        let mut e = engine();
        e.radio().inject(data_from(PEER_A, b"ping"));
        e.radio().inject(data_from(PEER_B, b"pong"));
        assert!(e.message_available());
        assert_eq!(e.message().unwrap().payload, b"ping");
        assert_eq!(e.message().unwrap().source, Some(PEER_A));
        assert!(e.radio().holding_frame());

        // retained frame blocks further polling
        e.tick();
        assert_eq!(e.message().unwrap().payload, b"ping");

        e.discard_message();
        assert!(!e.radio().holding_frame());
        assert!(e.message_available());
        assert_eq!(e.message().unwrap().payload, b"pong");
        e.discard_message();
        e.discard_message();
        assert_eq!(e.radio().discards, 2);
        assert_eq!(e.radio().spurious_discards, 0);
    }

    #[test]
    fn test_empty_payload_never_surfaces() {
        let mut e = engine();
        e.radio().inject(data_from(PEER_A, b""));
        assert!(!e.message_available());
        assert_eq!(e.radio().discards, 1);
    }

    #[test]
    fn test_unknown_command_goes_to_application() {
        let mut e = engine();
        e.radio().inject(command_from(PEER_A, &[0xC4, 1, 2]));
        assert!(e.message_available());
        let msg = e.message().unwrap();
        assert!(msg.command);
        assert_eq!(msg.payload, [0xC4, 1, 2]);
    }

    #[test]
    fn test_malformed_command_released_once() {
        let mut e = engine();
        // channel hopping without its channel bytes
        e.radio().inject(command_from(PEER_A, &[0x84]));
        assert!(!e.message_available());
        assert_eq!(e.radio().discards, 1);
        assert!(!e.radio().holding_frame());
    }

    #[test]
    fn test_every_command_frame_released_exactly_once() {
        let mut e = engine();
        let frames = [
            vec![0x81, 11, 0x01, 0x00],
            vec![0x81, 11],
            vec![0x82],
            vec![0x92, 0x00],
            vec![0x87, 11],
            vec![0x97, 0x01, 0x00],
            vec![0x83],
            vec![0x04],
            vec![0x91, 0xF3],
            vec![0x84, 5, 6],
        ];
        for payload in frames.iter() {
            e.radio().inject(command_from(PEER_A, payload));
            e.tick();
            assert!(!e.radio().holding_frame(), "frame {:02X?} still held", payload);
        }
        assert_eq!(e.radio().discards, frames.len());
        assert_eq!(e.radio().spurious_discards, 0);
    }

    #[test]
    fn test_secured_frame_decrypted_and_counter_advanced() {
        let mut e = engine();
        let slot = connect_peer(&mut e, PEER_A, true);
        e.radio().inject(secured_from(PEER_A, 3, b"secret"));
        assert!(e.message_available());
        let msg = e.message().unwrap();
        assert_eq!(msg.payload, b"secret");
        assert!(msg.secured);
        assert_eq!(e.incoming_frame_counter(slot), Some(3));
    }

    #[test]
    fn test_replayed_counter_rejected() {
        let mut e = engine();
        let log = EventLog::new();
        e.set_debug_emitter(log.clone());
        let slot = connect_peer(&mut e, PEER_A, true);
        e.connections.commit_counter(slot, 7);

        e.radio().inject(secured_from(PEER_A, 5, b"old"));
        assert!(!e.message_available());
        e.radio().inject(secured_from(PEER_A, 7, b"same"));
        assert!(!e.message_available());
        assert_eq!(e.incoming_frame_counter(slot), Some(7));
        assert_eq!(
            log.count(|ev| matches!(ev, DebugEvent::ReplayRejected { .. })),
            2
        );
        assert_eq!(e.radio().discards, 2);

        e.radio().inject(secured_from(PEER_A, 8, b"new"));
        assert!(e.message_available());
        assert_eq!(e.incoming_frame_counter(slot), Some(8));
    }

    #[test]
    fn test_failed_authentication_does_not_advance_counter() {
        let mut e = engine();
        let slot = connect_peer(&mut e, PEER_A, true);
        let mut frame = secured_from(PEER_A, 9, b"tampered");
        let last = frame.payload.len() - 1;
        frame.payload[last] ^= 0xFF;
        e.radio().inject(frame);
        assert!(!e.message_available());
        assert_eq!(e.incoming_frame_counter(slot), Some(0));
    }

    #[test]
    fn test_unknown_sender_decrypted_without_bookkeeping() {
        let mut e = engine();
        e.radio().inject(secured_from(PEER_B, 1, b"hi"));
        assert!(e.message_available());
        assert_eq!(e.message().unwrap().payload, b"hi");
        e.discard_message();
        e.radio().inject(secured_from(PEER_B, 1, b"hi"));
        assert!(e.message_available());
    }

    #[test]
    fn test_secured_frame_without_source_dropped() {
        let mut e = engine();
        let mut frame = secured_from(PEER_A, 1, b"x");
        frame.source = None;
        frame.frame_control = FrameControl(frame.frame_control.0 & !FrameControl::SOURCE_PRESENT);
        e.radio().inject(frame);
        assert!(!e.message_available());
        assert_eq!(e.radio().discards, 1);
    }

    #[test]
    fn test_indirect_expiry_runs_every_tick() {
        let mut e = engine();
        let slot = connect_peer(&mut e, crate::test_support::SLEEPY, false);
        e.unicast_connection(slot, b"late", false).unwrap();
        e.clock().advance(Duration::from_secs(24));
        e.tick();
        assert_eq!(e.indirect_len(), 1);
        e.clock().advance(Duration::from_micros(1));
        e.tick();
        assert_eq!(e.indirect_len(), 0);
    }

    #[test]
    fn test_data_request_times_out() {
        let mut e = engine();
        e.status.insert(ProtocolStatus::DATA_REQUESTING);
        e.data_request_started = e.clock().peek();
        e.clock().advance(Duration::from_millis(250));
        e.tick();
        assert!(e.status().contains(ProtocolStatus::DATA_REQUESTING));
        e.clock().advance(Duration::from_millis(1));
        e.tick();
        assert!(!e.status().contains(ProtocolStatus::DATA_REQUESTING));
    }

    #[test]
    fn test_search_mode_swallows_application_data() {
        let mut e = engine();
        e.status.insert(ProtocolStatus::SEARCH_CONNECTION);
        e.radio().inject(data_from(PEER_A, b"noise"));
        assert!(!e.message_available());
        assert_eq!(e.radio().discards, 1);
    }
}
