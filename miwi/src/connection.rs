//! Connection table and per-peer anti-replay counters.
//!
//! Slots are allocated once at construction (`P2pConfig::CONNECTION_SIZE`) and a
//! slot index stays bound to its peer until that peer is removed. Each slot has a
//! parallel incoming frame counter: a secured frame from the peer is accepted only
//! if its counter is strictly greater than the stored one.
//!
//! ## Persisted record
//!
//! ```text
//! status (1) || address_len (1) || address (8, zero padded) || peer_info (N)
//!
//! status byte: capability bits of the peer, bit 7 set for a valid slot
//! ```

use alloc::vec;
use alloc::vec::Vec;

use crate::types::{
    Capability, ConnectionMode, ConnectionStatus, LongAddress, MAX_ADDRESS_LEN,
};
use crate::wire::{DecodeError, Reader, Writer};

/// A known peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEntry {
    pub address: LongAddress,
    pub capability: Capability,
    /// Opaque additional node ID supplied by the peer (fixed width).
    pub peer_info: Vec<u8>,
}

impl ConnectionEntry {
    /// Peer keeps its receiver on; otherwise it sleeps and polls for data.
    pub fn rx_on_when_idle(&self) -> bool {
        self.capability.rx_on_when_idle()
    }
}

/// Result of admitting a peer into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    pub status: ConnectionStatus,
    /// Slot holding the peer, when one is bound.
    pub slot: Option<usize>,
}

impl AddOutcome {
    const fn new(status: ConnectionStatus, slot: Option<usize>) -> Self {
        Self { status, slot }
    }
}

/// Fixed-capacity connection table.
pub(crate) struct ConnectionTable {
    slots: Vec<Option<ConnectionEntry>>,
    incoming_counters: Vec<u32>,
    peer_info_len: usize,
}

impl ConnectionTable {
    pub(crate) fn new(capacity: usize, peer_info_len: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            incoming_counters: vec![0; capacity],
            peer_info_len,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.incoming_counters.iter_mut().for_each(|c| *c = 0);
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn get(&self, slot: usize) -> Option<&ConnectionEntry> {
        self.slots.get(slot)?.as_ref()
    }

    /// Slot of the valid entry with this address.
    pub(crate) fn lookup(&self, address: &LongAddress) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|e| e.address == *address))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &ConnectionEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|e| (i, e)))
    }

    pub(crate) fn len(&self) -> usize {
        self.iter().count()
    }

    /// Admit a peer that sent its capability byte (connection request or response).
    ///
    /// Known peers are reported as `AlreadyExists` and left untouched. In
    /// `EnablePrevious` mode (or stricter) a new peer reports `Success` but is not
    /// written.
    pub(crate) fn add_or_refresh(
        &mut self,
        address: LongAddress,
        capability: Option<Capability>,
        extra: &[u8],
        mode: ConnectionMode,
    ) -> AddOutcome {
        let Some(capability) = capability else {
            return AddOutcome::new(ConnectionStatus::ActiveScanOnly, None);
        };
        if let Some(slot) = self.lookup(&address) {
            return AddOutcome::new(ConnectionStatus::AlreadyExists, Some(slot));
        }
        let Some(free) = self.slots.iter().position(Option::is_none) else {
            return AddOutcome::new(ConnectionStatus::NoSpace, None);
        };
        if mode >= ConnectionMode::EnablePrevious {
            return AddOutcome::new(ConnectionStatus::Success, None);
        }

        let mut peer_info = vec![0u8; self.peer_info_len];
        let n = extra.len().min(self.peer_info_len);
        peer_info[..n].copy_from_slice(&extra[..n]);
        self.slots[free] = Some(ConnectionEntry {
            address,
            capability: Capability(capability.0 & !Capability::VALID),
            peer_info,
        });
        self.incoming_counters[free] = 0;
        AddOutcome::new(ConnectionStatus::Success, Some(free))
    }

    /// Invalidate one slot, returning what it held.
    pub(crate) fn remove(&mut self, slot: usize) -> Option<ConnectionEntry> {
        self.slots.get_mut(slot)?.take()
    }

    /// True if the secured frame counter may be accepted for this slot.
    pub(crate) fn counter_fresh(&self, slot: usize, frame_counter: u32) -> bool {
        self.incoming_counters
            .get(slot)
            .is_some_and(|&last| frame_counter > last)
    }

    /// Record an authenticated frame counter. Never moves backwards.
    pub(crate) fn commit_counter(&mut self, slot: usize, frame_counter: u32) {
        if let Some(last) = self.incoming_counters.get_mut(slot) {
            *last = (*last).max(frame_counter);
        }
    }

    pub(crate) fn incoming_counter(&self, slot: usize) -> Option<u32> {
        self.incoming_counters.get(slot).copied()
    }

    /// Slots of valid peers that sleep between polls.
    pub(crate) fn sleeping_slots(&self) -> Vec<u8> {
        self.iter()
            .filter(|(_, e)| !e.rx_on_when_idle())
            .map(|(i, _)| i as u8)
            .collect()
    }

    pub(crate) fn is_sleeping(&self, address: &LongAddress) -> bool {
        self.lookup(address)
            .and_then(|slot| self.get(slot))
            .is_some_and(|e| !e.rx_on_when_idle())
    }

    /// Bytes per persisted slot record.
    pub(crate) fn record_len(&self) -> usize {
        2 + MAX_ADDRESS_LEN + self.peer_info_len
    }

    pub(crate) fn encode_slot(&self, slot: usize) -> Vec<u8> {
        let mut w = Writer::new();
        match self.get(slot) {
            Some(entry) => {
                let mut address = [0u8; MAX_ADDRESS_LEN];
                address[..entry.address.len()].copy_from_slice(entry.address.as_bytes());
                w.write_u8(entry.capability.0 | Capability::VALID);
                w.write_u8(entry.address.len() as u8);
                w.write_bytes(&address);
                w.write_bytes(&entry.peer_info);
            }
            None => w.write_bytes(&vec![0u8; self.record_len()]),
        }
        w.finish()
    }

    pub(crate) fn encode_image(&self) -> Vec<u8> {
        let mut image = Vec::with_capacity(self.capacity() * self.record_len());
        for slot in 0..self.capacity() {
            image.extend_from_slice(&self.encode_slot(slot));
        }
        image
    }

    /// Replace the table with a persisted image. Counters restart at zero.
    pub(crate) fn restore_image(&mut self, image: &[u8]) -> Result<(), DecodeError> {
        let record_len = self.record_len();
        if image.len() != self.capacity() * record_len {
            return Err(DecodeError::InvalidLength);
        }
        let mut restored = Vec::with_capacity(self.capacity());
        for record in image.chunks_exact(record_len) {
            restored.push(self.decode_record(record)?);
        }
        self.slots = restored;
        self.incoming_counters.iter_mut().for_each(|c| *c = 0);
        Ok(())
    }

    fn decode_record(&self, record: &[u8]) -> Result<Option<ConnectionEntry>, DecodeError> {
        let mut r = Reader::new(record);
        let status = r.read_u8()?;
        if status & Capability::VALID == 0 {
            return Ok(None);
        }
        let len = r.read_u8()? as usize;
        let address = r.read_bytes(MAX_ADDRESS_LEN)?;
        let address = address
            .get(..len)
            .and_then(LongAddress::new)
            .ok_or(DecodeError::InvalidValue)?;
        let peer_info = r.read_bytes(self.peer_info_len)?.to_vec();
        Ok(Some(ConnectionEntry {
            address,
            capability: Capability(status & !Capability::VALID),
            peer_info,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u64) -> LongAddress {
        LongAddress::from_u64(n)
    }

    const LISTENING: Option<Capability> = Some(Capability(Capability::RX_ON_WHEN_IDLE));

    #[test]
    fn test_first_request_binds_first_free_slot() {
        let mut table = ConnectionTable::new(3, 1);
        let out = table.add_or_refresh(addr(1), LISTENING, &[0x42], ConnectionMode::EnableAll);
        assert_eq!(out, AddOutcome::new(ConnectionStatus::Success, Some(0)));
        let entry = table.get(0).unwrap();
        assert_eq!(entry.address, addr(1));
        assert_eq!(entry.peer_info, [0x42]);
        assert_eq!(table.incoming_counter(0), Some(0));
    }

    #[test]
    fn test_repeat_request_is_not_a_mutation() {
        let mut table = ConnectionTable::new(3, 1);
        table.add_or_refresh(addr(1), LISTENING, &[0x42], ConnectionMode::EnableAll);
        table.commit_counter(0, 9);
        let out = table.add_or_refresh(addr(1), Some(Capability(0)), &[0x99], ConnectionMode::EnableAll);
        assert_eq!(out.status, ConnectionStatus::AlreadyExists);
        assert_eq!(out.slot, Some(0));
        assert!(table.get(0).unwrap().rx_on_when_idle());
        assert_eq!(table.get(0).unwrap().peer_info, [0x42]);
        assert_eq!(table.incoming_counter(0), Some(9));
    }

    #[test]
    fn test_full_table_reports_no_space() {
        let mut table = ConnectionTable::new(2, 1);
        table.add_or_refresh(addr(1), LISTENING, &[], ConnectionMode::EnableAll);
        table.add_or_refresh(addr(2), LISTENING, &[], ConnectionMode::EnableAll);
        let out = table.add_or_refresh(addr(3), LISTENING, &[], ConnectionMode::EnableAll);
        assert_eq!(out, AddOutcome::new(ConnectionStatus::NoSpace, None));
        assert_eq!(table.lookup(&addr(3)), None);
    }

    #[test]
    fn test_probe_without_capability_writes_nothing() {
        let mut table = ConnectionTable::new(2, 1);
        let out = table.add_or_refresh(addr(1), None, &[], ConnectionMode::EnableAll);
        assert_eq!(out.status, ConnectionStatus::ActiveScanOnly);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_previous_only_mode_reports_success_without_writing() {
        let mut table = ConnectionTable::new(2, 1);
        let out = table.add_or_refresh(addr(1), LISTENING, &[], ConnectionMode::EnablePrevious);
        assert_eq!(out, AddOutcome::new(ConnectionStatus::Success, None));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_removed_slot_is_reused_with_fresh_counter() {
        let mut table = ConnectionTable::new(2, 1);
        table.add_or_refresh(addr(1), LISTENING, &[], ConnectionMode::EnableAll);
        table.add_or_refresh(addr(2), LISTENING, &[], ConnectionMode::EnableAll);
        table.commit_counter(0, 100);
        assert_eq!(table.remove(0).map(|e| e.address), Some(addr(1)));
        assert_eq!(table.lookup(&addr(1)), None);
        let out = table.add_or_refresh(addr(3), LISTENING, &[], ConnectionMode::EnableAll);
        assert_eq!(out.slot, Some(0));
        assert_eq!(table.incoming_counter(0), Some(0));
        assert_eq!(table.lookup(&addr(2)), Some(1));
    }

    #[test]
    fn test_slot_exclusivity_under_random_churn() {
        let mut table = ConnectionTable::new(4, 1);
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        for _ in 0..2000 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let a = addr((state >> 33) % 6);
            if (state >> 20) & 1 == 0 {
                table.add_or_refresh(a, LISTENING, &[], ConnectionMode::EnableAll);
            } else if let Some(slot) = table.lookup(&a) {
                table.remove(slot);
                assert_eq!(table.lookup(&a), None);
            }
            let valid: Vec<_> = table.iter().map(|(_, e)| e.address).collect();
            for (i, x) in valid.iter().enumerate() {
                assert!(!valid[i + 1..].contains(x), "duplicate address {:?}", x);
            }
        }
    }

    #[test]
    fn test_counter_must_strictly_increase() {
        let mut table = ConnectionTable::new(1, 1);
        table.add_or_refresh(addr(1), LISTENING, &[], ConnectionMode::EnableAll);
        assert!(!table.counter_fresh(0, 0));
        assert!(table.counter_fresh(0, 1));
        table.commit_counter(0, 7);
        assert!(!table.counter_fresh(0, 5));
        assert!(!table.counter_fresh(0, 7));
        assert!(table.counter_fresh(0, 8));
        table.commit_counter(0, 3);
        assert_eq!(table.incoming_counter(0), Some(7));
        assert!(!table.counter_fresh(9, 100));
    }

    #[test]
    fn test_sleeping_peers() {
        let mut table = ConnectionTable::new(3, 1);
        table.add_or_refresh(addr(1), LISTENING, &[], ConnectionMode::EnableAll);
        table.add_or_refresh(addr(2), Some(Capability(0)), &[], ConnectionMode::EnableAll);
        assert_eq!(table.sleeping_slots(), [1]);
        assert!(table.is_sleeping(&addr(2)));
        assert!(!table.is_sleeping(&addr(1)));
        assert!(!table.is_sleeping(&addr(9)));
    }

    #[test]
    fn test_image_restores_entries() {
        let mut table = ConnectionTable::new(3, 2);
        let short = LongAddress::new(&[0xAB, 0xCD]).unwrap();
        table.add_or_refresh(addr(1), LISTENING, &[1, 2], ConnectionMode::EnableAll);
        table.add_or_refresh(short, Some(Capability(Capability::SECURITY)), &[3], ConnectionMode::EnableAll);
        table.remove(0);
        let image = table.encode_image();
        assert_eq!(image.len(), 3 * table.record_len());

        let mut restored = ConnectionTable::new(3, 2);
        restored.restore_image(&image).unwrap();
        assert!(restored.get(0).is_none());
        let entry = restored.get(1).unwrap();
        assert_eq!(entry.address, short);
        assert!(entry.capability.security());
        assert_eq!(entry.peer_info, [3, 0]);
        assert!(restored.restore_image(&image[1..]).is_err());
    }
}
