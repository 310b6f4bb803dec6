//! Indirect message queue for peers that sleep between polls.
//!
//! A sleeping peer cannot hear a direct transmission, so its traffic waits here
//! until the peer wakes and sends a data request. Unicast entries are consumed by
//! the first matching request; broadcast entries carry a fan-out list of slot
//! indices and shrink by one slot per request until the list is empty. Anything
//! left unclaimed longer than the configured timeout is dropped.

use alloc::vec;
use alloc::vec::Vec;

use crate::time::{Duration, Tick};
use crate::types::{Error, LongAddress};

/// Who an indirect message is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndirectDestination {
    Unicast(LongAddress),
    /// Connection slots that have not polled yet.
    Broadcast(Vec<u8>),
}

/// One queued payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectMessage {
    pub destination: IndirectDestination,
    pub is_command: bool,
    pub secured: bool,
    pub payload: Vec<u8>,
    pub enqueued_at: Tick,
}

/// Payload handed back to a polling peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Delivery {
    pub is_command: bool,
    pub secured: bool,
    pub payload: Vec<u8>,
}

pub(crate) struct IndirectQueue {
    entries: Vec<Option<IndirectMessage>>,
    max_payload: usize,
    timeout: Duration,
}

impl IndirectQueue {
    pub(crate) fn new(capacity: usize, max_payload: usize, timeout: Duration) -> Self {
        Self {
            entries: vec![None; capacity],
            max_payload,
            timeout,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = None);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&IndirectMessage> {
        self.entries.get(index)?.as_ref()
    }

    /// Store a message in the first free entry.
    pub(crate) fn enqueue(&mut self, message: IndirectMessage) -> Result<usize, Error> {
        if message.payload.len() > self.max_payload {
            return Err(Error::PayloadTooLarge);
        }
        let free = self
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or(Error::QueueFull)?;
        self.entries[free] = Some(message);
        Ok(free)
    }

    /// True while the entry exists and has not outlived the timeout.
    pub(crate) fn is_live(&self, index: usize, now: Tick) -> bool {
        self.get(index)
            .is_some_and(|m| !m.enqueued_at.expired(now, self.timeout))
    }

    /// Drop every entry older than the timeout. Returns how many were dropped.
    pub(crate) fn expire(&mut self, now: Tick) -> usize {
        let timeout = self.timeout;
        let mut dropped = 0;
        for entry in self.entries.iter_mut() {
            if entry
                .as_ref()
                .is_some_and(|m| m.enqueued_at.expired(now, timeout))
            {
                *entry = None;
                dropped += 1;
            }
        }
        dropped
    }

    /// Hand the first live message for a polling peer to the caller.
    ///
    /// `slot` is the requester's connection slot, used to match broadcast fan-out
    /// lists; unknown requesters can only claim unicast messages.
    pub(crate) fn claim(
        &mut self,
        requester: &LongAddress,
        slot: Option<usize>,
        now: Tick,
    ) -> Option<Delivery> {
        let timeout = self.timeout;
        for entry in self.entries.iter_mut() {
            let Some(message) = entry.as_mut() else {
                continue;
            };
            if message.enqueued_at.expired(now, timeout) {
                continue;
            }
            let consumed = match &mut message.destination {
                IndirectDestination::Unicast(dest) => {
                    if *dest != *requester {
                        continue;
                    }
                    true
                }
                IndirectDestination::Broadcast(pending) => {
                    let Some(pos) = slot.and_then(|s| pending.iter().position(|&p| p as usize == s))
                    else {
                        continue;
                    };
                    pending.remove(pos);
                    pending.is_empty()
                }
            };
            let delivery = Delivery {
                is_command: message.is_command,
                secured: message.secured,
                payload: message.payload.clone(),
            };
            if consumed {
                *entry = None;
            }
            return Some(delivery);
        }
        None
    }
}
