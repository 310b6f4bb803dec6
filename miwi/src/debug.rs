//! Debug events for protocol tracing.
//!
//! Enabled in test builds and with the `debug` feature. The simulator and unit
//! tests attach an emitter to follow frames through the engine.

use crate::time::Tick;
use crate::types::{ConnectionStatus, LongAddress};

/// Trait for receiving debug events from an engine.
pub trait DebugEmitter {
    fn emit(&mut self, event: DebugEvent);
}

/// Debug events emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent {
    /// Frame taken from the radio.
    FrameReceived {
        at: Tick,
        source: Option<LongAddress>,
        secured: bool,
        command: Option<u8>,
        len: usize,
    },
    /// Secured frame counter not above the last accepted one.
    ReplayRejected {
        slot: usize,
        frame_counter: u32,
        last_accepted: u32,
    },
    /// Sealed payload failed authentication.
    DecryptFailed { source: Option<LongAddress> },
    /// Frame dropped before dispatch.
    FrameDiscarded { reason: &'static str },
    /// Peer answered a connection request.
    ConnectionRequestHandled {
        from: LongAddress,
        status: ConnectionStatus,
    },
    ConnectionAdded { slot: usize, address: LongAddress },
    ConnectionRemoved { slot: usize, address: LongAddress },
    IndirectQueued { index: usize, broadcast: bool },
    IndirectDelivered { to: LongAddress, empty: bool },
    IndirectExpired { count: usize },
    DataRequestTimedOut { at: Tick },
    /// Deferred connection table write finished.
    TableSaved { ok: bool },
    ChannelChanged { from: u8, to: u8 },
    /// One copy of the channel-hopping command went out.
    HopAnnounced { target: u8, copies_left: u8 },
    ScanResultRecorded {
        channel: u8,
        address: Option<LongAddress>,
        pan: u16,
    },
    ResyncFinished { success: bool, channel: u8 },
}

/// Emit a debug event if tracing is compiled in.
///
/// The event expression is only evaluated when tracing is enabled.
macro_rules! emit_debug {
    ($engine:expr, $event:expr) => {{
        #[cfg(any(test, feature = "debug"))]
        {
            let event = $event;
            $engine.emit_debug(event);
        }
    }};
}

#[cfg(any(test, feature = "test-support"))]
pub use self::recorder::EventLog;

#[cfg(any(test, feature = "test-support"))]
mod recorder {
    use alloc::rc::Rc;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    use super::{DebugEmitter, DebugEvent};

    /// Shared event recorder; clones observe the same log.
    #[derive(Clone, Default)]
    pub struct EventLog {
        events: Rc<RefCell<Vec<DebugEvent>>>,
    }

    impl EventLog {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<DebugEvent> {
            self.events.borrow().clone()
        }

        pub fn take(&self) -> Vec<DebugEvent> {
            core::mem::take(&mut *self.events.borrow_mut())
        }

        pub fn count(&self, pred: impl Fn(&DebugEvent) -> bool) -> usize {
            self.events.borrow().iter().filter(|e| pred(e)).count()
        }
    }

    impl DebugEmitter for EventLog {
        fn emit(&mut self, event: DebugEvent) {
            self.events.borrow_mut().push(event);
        }
    }
}
