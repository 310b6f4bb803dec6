//! Network freezer: persisted channel, PAN, mode, connection table and frame counter.
//!
//! Single fields are written through immediately. Connection table changes are
//! coalesced: a mutation marks the table dirty and the task loop writes the whole
//! image once `SAVE_DELAY` has passed without being flushed. The outgoing frame
//! counter is checkpointed every `FRAME_COUNTER_UPDATE_INTERVAL` values and a
//! restore resumes one interval past the checkpoint.

use alloc::vec;

use crate::config::P2pConfig;
use crate::engine::Engine;
use crate::time::Tick;
use crate::traits::{Cipher, Clock, Field, Radio, Store};
use crate::types::{ConnectionMode, Error, ProtocolStatus, StoreError, MAX_CHANNELS};

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
    pub(crate) fn restore(&mut self) -> Result<(), Error> {
        let mut channel = [0u8; 1];
        self.store.read(Field::CurrentChannel, &mut channel)?;
        if channel[0] >= MAX_CHANNELS {
            return Err(Error::InvalidChannel);
        }

        let mut pan = [0u8; 2];
        self.store.read(Field::PanId, &mut pan)?;

        let mut mode = [0u8; 1];
        self.store.read(Field::ConnectionMode, &mut mode)?;
        let mode = ConnectionMode::from_byte(mode[0]).ok_or(StoreError::Corrupt)?;

        let mut image = vec![0u8; self.connections.capacity() * self.connections.record_len()];
        self.store.read(Field::ConnectionTable, &mut image)?;
        self.connections
            .restore_image(&image)
            .map_err(|_| StoreError::Corrupt)?;

        let mut counter = [0u8; 4];
        self.store.read(Field::OutgoingFrameCounter, &mut counter)?;
        let resume = u32::from_le_bytes(counter).wrapping_add(C::FRAME_COUNTER_UPDATE_INTERVAL);
        self.persist_frame_counter(resume)?;

        self.current_channel = channel[0];
        self.pan_id = u16::from_le_bytes(pan);
        self.connection_mode = mode;
        self.outgoing_counter = resume;
        self.counter_checkpoint = Some(resume);
        log::info!(
            "restored {} connection(s), channel {}, frame counter {}",
            self.connections.len(),
            self.current_channel,
            resume
        );
        Ok(())
    }

    pub(crate) fn save_defaults(&mut self) -> Result<(), Error> {
        self.persist_channel()?;
        self.persist_pan_id()?;
        self.persist_connection_mode()?;
        self.flush_table()?;
        self.persist_frame_counter(0)
    }

    pub(crate) fn persist_channel(&mut self) -> Result<(), Error> {
        self.store.write(Field::CurrentChannel, &[self.current_channel])?;
        Ok(())
    }

    pub(crate) fn persist_pan_id(&mut self) -> Result<(), Error> {
        self.store.write(Field::PanId, &self.pan_id.to_le_bytes())?;
        Ok(())
    }

    pub(crate) fn persist_connection_mode(&mut self) -> Result<(), Error> {
        self.store
            .write(Field::ConnectionMode, &[self.connection_mode as u8])?;
        Ok(())
    }

    pub(crate) fn persist_frame_counter(&mut self, value: u32) -> Result<(), Error> {
        self.store
            .write(Field::OutgoingFrameCounter, &value.to_le_bytes())?;
        Ok(())
    }

    /// Persist one slot record right away.
    pub fn save_connection(&mut self, slot: usize) -> Result<(), Error> {
        if slot >= self.connections.capacity() {
            return Err(Error::InvalidSlot);
        }
        let record = self.connections.encode_slot(slot);
        self.store.write(Field::ConnectionSlot(slot as u8), &record)?;
        Ok(())
    }

    pub(crate) fn mark_table_dirty(&mut self) {
        if !self.status.contains(ProtocolStatus::SAVE_PENDING) {
            self.status.insert(ProtocolStatus::SAVE_PENDING);
            self.save_requested_at = self.clock.now();
        }
    }

    /// Write the whole connection table image and clear the pending flag.
    pub(crate) fn flush_table(&mut self) -> Result<(), Error> {
        let image = self.connections.encode_image();
        self.store.write(Field::ConnectionTable, &image)?;
        self.status.remove(ProtocolStatus::SAVE_PENDING);
        Ok(())
    }

    /// Deferred flush from the task loop; a failure re-arms the debounce.
    pub(crate) fn flush_deferred(&mut self, now: Tick) {
        let result = self.flush_table();
        emit_debug!(self, DebugEvent::TableSaved { ok: result.is_ok() });
        match result {
            Ok(()) => log::debug!("connection table saved"),
            Err(e) => {
                log::warn!("connection table not saved, retrying: {}", e);
                self.save_requested_at = now;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{command_from, connect_peer, engine, engine_on, PEER_A, SLEEPY};
    use crate::time::Duration;
    use crate::traits::test_impls::MockStore;

    #[test]
    fn test_deferred_save_coalesces() {
        let mut e = engine();
        let writes = e.store().writes;
        e.radio().inject(command_from(PEER_A, &[0x81, 11, 0x01, 0]));
        e.tick();
        e.radio().inject(command_from(SLEEPY, &[0x81, 11, 0x00, 0]));
        e.tick();
        assert!(e.status().contains(ProtocolStatus::SAVE_PENDING));
        assert_eq!(e.store().writes, writes);

        e.clock().advance(Duration::from_secs(1));
        e.tick();
        assert_eq!(e.store().writes, writes);
        e.clock().advance(Duration::from_micros(1));
        e.tick();
        assert_eq!(e.store().writes, writes + 1);
        assert!(!e.status().contains(ProtocolStatus::SAVE_PENDING));
    }

    #[test]
    fn test_failed_save_retries() {
        let mut e = engine();
        connect_peer(&mut e, PEER_A, true);
        e.mark_table_dirty();
        e.store_mut().fail_writes = true;
        e.clock().advance(Duration::from_secs(2));
        e.tick();
        assert!(e.status().contains(ProtocolStatus::SAVE_PENDING));

        e.store_mut().fail_writes = false;
        e.clock().advance(Duration::from_millis(500));
        e.tick();
        assert!(e.status().contains(ProtocolStatus::SAVE_PENDING));
        e.clock().advance(Duration::from_millis(600));
        e.tick();
        assert!(!e.status().contains(ProtocolStatus::SAVE_PENDING));
    }

    #[test]
    fn test_restore_round_trip() {
        let mut e = engine();
        connect_peer(&mut e, PEER_A, true);
        connect_peer(&mut e, SLEEPY, false);
        e.set_channel(17).unwrap();
        e.set_connection_mode(ConnectionMode::EnablePrevious).unwrap();
        e.flush_table().unwrap();
        e.persist_frame_counter(1024).unwrap();

        let mut store = MockStore::new();
        for field in [
            Field::CurrentChannel,
            Field::PanId,
            Field::ConnectionMode,
            Field::ConnectionTable,
            Field::OutgoingFrameCounter,
        ] {
            store.insert(field, e.store().get(field).unwrap());
        }

        let mut r = engine_on(store, true).unwrap();
        assert_eq!(r.current_channel(), 17);
        assert_eq!(r.radio().channel, 17);
        assert_eq!(r.connection_mode(), ConnectionMode::EnablePrevious);
        assert_eq!(r.find_connection(&PEER_A), Some(0));
        assert!(!r.connection(1).unwrap().rx_on_when_idle());
        assert_eq!(r.incoming_frame_counter(0), Some(0));
        // never below a counter that may have been on air
        assert_eq!(r.outgoing_frame_counter(), 2048);
        assert_eq!(
            r.store().get(Field::OutgoingFrameCounter),
            Some(&2048u32.to_le_bytes()[..])
        );
        assert_eq!(r.next_frame_counter(), Ok(2048));
        assert_eq!(r.store().writes, 1);
    }

    #[test]
    fn test_restore_rejects_bad_channel() {
        let mut store = MockStore::new();
        store.insert(Field::CurrentChannel, &[40]);
        assert!(matches!(engine_on(store, true), Err(Error::InvalidChannel)));
    }

    #[test]
    fn test_restore_without_state_fails() {
        assert!(matches!(
            engine_on(MockStore::new(), true),
            Err(Error::Persistence(StoreError::Missing))
        ));
    }

    #[test]
    fn test_save_single_slot() {
        let mut e = engine();
        let slot = connect_peer(&mut e, SLEEPY, false);
        e.save_connection(slot).unwrap();
        let image = e.store().get(Field::ConnectionTable).unwrap();
        let len = e.connections.record_len();
        assert_eq!(image[slot * len] & 0x80, 0x80);
        assert_eq!(e.save_connection(10), Err(Error::InvalidSlot));
    }
}
