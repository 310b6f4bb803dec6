//! Power management, data requests and time synchronization.
//!
//! A sleeping device wakes, polls its parent with a data request and keeps the
//! radio on until the reply arrives or `RFD_DATA_WAIT` passes. The parent answers
//! each request with one queued indirect message, or an empty data frame when
//! nothing is waiting. With time sync on, the reply is wrapped in a header that
//! tells the sleeper when to wake next.

use alloc::vec::Vec;

use crate::config::P2pConfig;
use crate::engine::{Engine, RxMessage};
use crate::time::{Duration, Tick};
use crate::traits::{Cipher, Clock, Radio, ReceivedFrame, Store};
use crate::types::{Error, PacketType, PowerMode, PowerState, ProtocolStatus};
use crate::wire::{Command, Encode};

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
    /// Move the radio between sleep and operation.
    ///
    /// `WakeupDataRequest` also polls the parent and runs the task loop until the
    /// request completes; a received message is left for [`message`](Self::message).
    pub fn set_power_state(&mut self, mode: PowerMode) -> Result<(), Error> {
        match mode {
            PowerMode::Sleep => {
                if self.status.contains(ProtocolStatus::SAVE_PENDING) {
                    self.flush_table()?;
                }
                if !self.radio.power_state(PowerState::Sleep) {
                    return Err(Error::TransceiverFailed);
                }
                self.status.insert(ProtocolStatus::SLEEPING);
                Ok(())
            }
            PowerMode::Wakeup => self.wake_radio(),
            PowerMode::WakeupDataRequest => {
                self.wake_radio()?;
                self.check_for_data()?;
                while self.status.contains(ProtocolStatus::DATA_REQUESTING)
                    && !self.status.contains(ProtocolStatus::RX_HAS_USER_DATA)
                {
                    self.tick();
                }
                Ok(())
            }
        }
    }

    fn wake_radio(&mut self) -> Result<(), Error> {
        if !self.radio.power_state(PowerState::Operate) {
            return Err(Error::TransceiverFailed);
        }
        self.status.remove(ProtocolStatus::SLEEPING);
        Ok(())
    }

    /// Send a data request to the parent (the first valid connection).
    pub fn check_for_data(&mut self) -> Result<(), Error> {
        let (_, parent) = self.connections.iter().next().ok_or(Error::InvalidSlot)?;
        let parent = parent.address;
        let request = Command::DataRequest.encode_to_vec();
        self.send_packet(Some(parent), PacketType::Command, false, &request)?;
        self.status.insert(ProtocolStatus::DATA_REQUESTING);
        self.data_request_started = self.clock.now();
        Ok(())
    }

    /// Time until the parent expects the next data request, as last announced.
    pub fn next_wake(&self) -> Duration {
        self.next_wake
    }

    /// Offset announced to the next sleeper: the rest of the current wake
    /// interval plus a per-request slot.
    fn wake_offset(&mut self, now: Tick) -> Duration {
        let interval = C::RFD_WAKEUP_INTERVAL.as_micros().max(1);
        let into_interval = now.since(self.wake_epoch).as_micros() % interval;
        let slot_width = interval / C::TIME_SYNC_SLOTS.max(1) as u32;
        let offset = (interval - into_interval) + slot_width * self.sync_slot as u32;
        self.sync_slot = (self.sync_slot + 1) % C::TIME_SYNC_SLOTS.max(1);
        Duration::from_micros(offset)
    }

    // --- Handlers ---

    pub(crate) fn on_data_request(&mut self, frame: &ReceivedFrame) {
        self.release_frame();
        let Some(source) = frame.source else {
            return;
        };
        let now = self.clock.now();
        let slot = self.connections.lookup(&source);
        let delivery = self.indirect.claim(&source, slot, now);
        emit_debug!(
            self,
            DebugEvent::IndirectDelivered {
                to: source,
                empty: delivery.is_none(),
            }
        );
        let (packet_type, secured, payload) = match delivery {
            Some(d) if d.is_command => (PacketType::Command, d.secured, d.payload),
            Some(d) => (PacketType::Data, d.secured, d.payload),
            None => (PacketType::Data, false, Vec::new()),
        };

        let sent = if self.settings.time_sync {
            let wake_after = self.wake_offset(now);
            let wrapped = Command::TimeSync {
                command: packet_type == PacketType::Command,
                wake_after,
                payload: &payload,
            }
            .encode_to_vec();
            self.send_packet(Some(source), PacketType::Command, secured, &wrapped)
        } else {
            self.send_packet(Some(source), packet_type, secured, &payload)
        };
        if let Err(e) = sent {
            log::warn!("data request reply to {} not sent: {}", source, e);
        }
    }

    pub(crate) fn on_time_sync(
        &mut self,
        frame: &ReceivedFrame,
        command: bool,
        wake_after: Duration,
        payload: &[u8],
    ) {
        self.next_wake = wake_after;
        self.wake_epoch = self.clock.now();
        if payload.is_empty() {
            self.status.remove(ProtocolStatus::DATA_REQUESTING);
            self.release_frame();
            return;
        }
        let mut message = RxMessage::from(frame.clone());
        message.payload = payload.to_vec();
        message.command = command;
        self.rx = Some(message);
        self.status.insert(ProtocolStatus::RX_HAS_USER_DATA);
    }
}
