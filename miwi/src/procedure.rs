//! Long-running procedures and their completions.
//!
//! Connection search, scans, channel hopping and resync each run as an explicit
//! state machine held in the engine. `start_*` installs the state, every
//! [`Engine::poll`] runs one task-loop tick followed by one procedure step, and the
//! blocking wrappers simply poll until the procedure finishes. Only one procedure
//! runs at a time.

use crate::config::P2pConfig;
use crate::engine::Engine;
use crate::handshake::SearchState;
use crate::scan::{ActiveScanState, EnergyScanState, HopState, ResyncState};
use crate::time::Tick;
use crate::traits::{Cipher, Clock, Radio, Store};
use crate::types::{Error, ProtocolStatus};

/// Quietest channel found by a noise scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEnergy {
    pub channel: u8,
    /// Highest level sampled on the channel.
    pub level: u8,
}

/// Outcome of a finished procedure, returned once by [`Engine::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Connection search ended; slot of the new connection, `None` on timeout.
    Connection(Option<usize>),
    /// Active scan ended with this many unique results.
    ActiveScan(usize),
    /// Noise scan ended; `None` if no channel was sampled.
    EnergyScan(Option<ChannelEnergy>),
    /// Hop finished on this channel.
    ChannelHop(u8),
    /// Resync found the peer (`true`) or gave up.
    Resync(bool),
}

pub(crate) enum Procedure {
    Search(SearchState),
    ActiveScan(ActiveScanState),
    EnergyScan(EnergyScanState),
    Hop(HopState),
    Resync(ResyncState),
}

/// Pop the lowest channel left in `map`.
pub(crate) fn next_channel(map: &mut u32) -> Option<u8> {
    if *map == 0 {
        return None;
    }
    let channel = map.trailing_zeros() as u8;
    *map &= *map - 1;
    Some(channel)
}

impl<R, Ci, S, Clk, C> Engine<R, Ci, S, Clk, C>
where
    R: Radio,
    Ci: Cipher,
    S: Store,
    Clk: Clock,
    C: P2pConfig,
{
    /// Run one task-loop tick and step the running procedure.
    ///
    /// Returns the procedure's result on the tick it finishes.
    pub fn poll(&mut self) -> Option<Completion> {
        self.tick();
        self.completion.take()
    }

    /// True while a procedure is running.
    pub fn is_busy(&self) -> bool {
        self.procedure.is_some()
    }

    pub(crate) fn ensure_idle(&self) -> Result<(), Error> {
        if self.procedure.is_some() {
            Err(Error::Busy)
        } else {
            Ok(())
        }
    }

    pub(crate) fn launch(&mut self, procedure: Procedure) {
        self.completion = None;
        self.procedure = Some(procedure);
    }

    pub(crate) fn step_procedure(&mut self, now: Tick) {
        let Some(mut procedure) = self.procedure.take() else {
            return;
        };
        let done = match &mut procedure {
            Procedure::Search(state) => self.step_search(state, now),
            Procedure::ActiveScan(state) => self.step_active_scan(state, now),
            Procedure::EnergyScan(state) => self.step_energy_scan(state, now),
            Procedure::Hop(state) => self.step_hop(state, now),
            Procedure::Resync(state) => self.step_resync(state, now),
        };
        match done {
            Some(completion) => self.completion = Some(completion),
            None => self.procedure = Some(procedure),
        }
    }

    /// Tick until the running procedure finishes.
    ///
    /// Application data arriving meanwhile is dropped; use `poll` to keep it.
    pub(crate) fn finish(&mut self) -> Option<Completion> {
        while self.procedure.is_some() {
            self.tick();
            if self.status.contains(ProtocolStatus::RX_HAS_USER_DATA) {
                self.discard_message();
            }
        }
        self.completion.take()
    }
}
