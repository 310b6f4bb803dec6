//! Outgoing frame assembly: direct sends, indirect sends and security framing.
//!
//! Direct sends go straight to the radio and report its verdict. Peers that
//! sleep between polls are served through the indirect queue instead; their
//! payload is sealed only when the peer's data request claims it, so every copy
//! carries a fresh frame counter.

use alloc::vec::Vec;

use crate::config::P2pConfig;
use crate::engine::Engine;
use crate::indirect::{IndirectDestination, IndirectMessage};
use crate::traits::{Cipher, Clock, Radio, SecurityContext, Store, TransmitParams};
use crate::types::{Error, FrameControl, LongAddress, PacketType};
use crate::wire::{Encode, SecurityHeader, Writer};

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
    // --- Application send API ---

    /// Send `payload` to every peer in range.
    ///
    /// Sleeping peers get a queued copy (one indirect entry fanned out over their
    /// slots); listening peers get a direct broadcast. Failure to queue is logged
    /// and does not stop the direct send.
    pub fn broadcast(&mut self, payload: &[u8], secured: bool) -> Result<(), Error> {
        let sleepers = self.connections.sleeping_slots();
        if !sleepers.is_empty() {
            let queued = self.send_indirect(
                IndirectDestination::Broadcast(sleepers),
                false,
                secured,
                payload,
            );
            if let Err(e) = queued {
                log::warn!("broadcast not queued for sleeping peers: {}", e);
            }
        }
        self.send_packet(None, PacketType::Data, secured, payload)
    }

    /// Send `payload` to the peer bound to `slot`.
    pub fn unicast_connection(
        &mut self,
        slot: usize,
        payload: &[u8],
        secured: bool,
    ) -> Result<(), Error> {
        let entry = self.connections.get(slot).ok_or(Error::InvalidSlot)?;
        let address = entry.address;
        if entry.rx_on_when_idle() {
            self.send_packet(Some(address), PacketType::Data, secured, payload)
        } else {
            self.send_indirect(IndirectDestination::Unicast(address), false, secured, payload)
                .map(|_| ())
        }
    }

    /// Send `payload` to an address, known or not.
    pub fn unicast_address(
        &mut self,
        address: LongAddress,
        payload: &[u8],
        secured: bool,
    ) -> Result<(), Error> {
        if self.connections.is_sleeping(&address) {
            self.send_indirect(IndirectDestination::Unicast(address), false, secured, payload)
                .map(|_| ())
        } else {
            self.send_packet(Some(address), PacketType::Data, secured, payload)
        }
    }

    // --- Internal send paths ---

    /// Protocol command to one peer, queued if the peer sleeps.
    pub(crate) fn send_command_to(&mut self, address: LongAddress, payload: &[u8]) -> Result<(), Error> {
        if self.connections.is_sleeping(&address) {
            self.send_indirect(IndirectDestination::Unicast(address), true, false, payload)
                .map(|_| ())
        } else {
            self.send_packet(Some(address), PacketType::Command, false, payload)
        }
    }

    /// Park a payload in the indirect queue.
    pub(crate) fn send_indirect(
        &mut self,
        destination: IndirectDestination,
        is_command: bool,
        secured: bool,
        payload: &[u8],
    ) -> Result<usize, Error> {
        let broadcast = matches!(destination, IndirectDestination::Broadcast(_));
        let index = self.indirect.enqueue(IndirectMessage {
            destination,
            is_command,
            secured,
            payload: payload.to_vec(),
            enqueued_at: self.clock.now(),
        })?;
        log::debug!("indirect message queued at {}", index);
        emit_debug!(self, DebugEvent::IndirectQueued { index, broadcast });
        Ok(index)
    }

    /// Build the transport parameters, seal if requested and hand the frame to the radio.
    ///
    /// `destination` of `None` broadcasts. No retries at this layer.
    pub(crate) fn send_packet(
        &mut self,
        destination: Option<LongAddress>,
        packet_type: PacketType,
        secured: bool,
        payload: &[u8],
    ) -> Result<(), Error> {
        if payload.len() > C::TX_BUFFER_SIZE {
            return Err(Error::PayloadTooLarge);
        }
        let mut bits = packet_type as u8 | FrameControl::SOURCE_PRESENT;
        match destination {
            None => bits |= FrameControl::BROADCAST,
            Some(_) => bits |= FrameControl::ACK_REQUEST | FrameControl::DEST_PRESENT,
        }
        if secured {
            bits |= FrameControl::SECURED;
        }
        let frame_control = FrameControl(bits);

        let params = TransmitParams {
            frame_control,
            destination,
            dest_pan: self.pan_id,
        };
        let sealed;
        let body = if secured {
            sealed = self.seal(destination, frame_control, payload)?;
            sealed.as_slice()
        } else {
            payload
        };
        if self.radio.send(&params, body) {
            Ok(())
        } else {
            Err(Error::SendFailed)
        }
    }

    fn seal(
        &mut self,
        destination: Option<LongAddress>,
        frame_control: FrameControl,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let frame_counter = self.next_frame_counter()?;
        let ctx = SecurityContext {
            source: self.settings.address,
            destination,
            frame_counter,
            frame_control,
        };
        let mut w = Writer::new();
        SecurityHeader {
            frame_counter,
            key_sequence: 0,
        }
        .encode(&mut w);
        w.write_bytes(&self.cipher.encrypt(payload, &ctx));
        Ok(w.finish())
    }

    /// Reserve the next outgoing frame counter.
    ///
    /// Every `FRAME_COUNTER_UPDATE_INTERVAL` values the counter is checkpointed
    /// before use; a failed checkpoint refuses the frame so a restart can never
    /// resume below a counter already on air.
    pub(crate) fn next_frame_counter(&mut self) -> Result<u32, Error> {
        let counter = self.outgoing_counter;
        if counter % C::FRAME_COUNTER_UPDATE_INTERVAL == 0 && self.counter_checkpoint != Some(counter) {
            self.persist_frame_counter(counter)?;
            self.counter_checkpoint = Some(counter);
        }
        self.outgoing_counter = counter.wrapping_add(1);
        Ok(counter)
    }
}
