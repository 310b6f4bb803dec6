//! Time types for the P2P engine.
//!
//! The engine never reads a hardware timer directly. A [`Clock`](crate::traits::Clock)
//! hands out [`Tick`] values from a free-running 32-bit microsecond counter that
//! rolls over roughly every 71.6 minutes, so ticks are only ever compared through
//! [`Tick::since`], which is wraparound-safe as long as the measured span is shorter
//! than one full counter period.

use core::ops::{Add, AddAssign, Mul};

/// Microseconds per second.
pub const MICROS_PER_SEC: u32 = 1_000_000;

/// Highest valid scan duration class.
pub const MAX_SCAN_DURATION_CLASS: u8 = 14;

/// Point on the free-running microsecond counter.
///
/// Deliberately not `Ord`: after rollover a later tick can be numerically smaller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tick(u32);

impl Tick {
    /// Counter origin.
    pub const ZERO: Tick = Tick(0);

    /// Create a tick from a raw counter value.
    #[inline]
    pub const fn from_micros(us: u32) -> Self {
        Tick(us)
    }

    /// Raw counter value.
    #[inline]
    pub const fn as_micros(self) -> u32 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, correct across one counter rollover.
    #[inline]
    pub const fn since(self, earlier: Tick) -> Duration {
        Duration(self.0.wrapping_sub(earlier.0))
    }

    /// Tick shifted back by `duration`, wrapping like the hardware counter.
    #[inline]
    pub const fn wrapping_sub(self, duration: Duration) -> Tick {
        Tick(self.0.wrapping_sub(duration.0))
    }

    /// True once more than `timeout` has passed since `self`.
    #[inline]
    pub const fn expired(self, now: Tick, timeout: Duration) -> bool {
        now.since(self).0 > timeout.0
    }
}

impl Add<Duration> for Tick {
    type Output = Tick;

    #[inline]
    fn add(self, rhs: Duration) -> Tick {
        Tick(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign<Duration> for Tick {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        self.0 = self.0.wrapping_add(rhs.0);
    }
}

/// Span of time in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(u32);

impl Duration {
    /// Zero duration.
    pub const ZERO: Duration = Duration(0);

    /// One second, the unit of the connection retry interval.
    pub const ONE_SECOND: Duration = Duration(MICROS_PER_SEC);

    #[inline]
    pub const fn from_micros(us: u32) -> Self {
        Duration(us)
    }

    #[inline]
    pub const fn from_millis(ms: u32) -> Self {
        Duration(ms.saturating_mul(1000))
    }

    #[inline]
    pub const fn from_secs(secs: u32) -> Self {
        Duration(secs.saturating_mul(MICROS_PER_SEC))
    }

    #[inline]
    pub const fn as_micros(self) -> u32 {
        self.0
    }

    /// Whole milliseconds (truncated).
    #[inline]
    pub const fn as_millis(self) -> u32 {
        self.0 / 1000
    }

    /// Whole seconds (truncated).
    #[inline]
    pub const fn as_secs(self) -> u32 {
        self.0 / MICROS_PER_SEC
    }

    #[inline]
    pub const fn saturating_add(self, other: Duration) -> Self {
        Duration(self.0.saturating_add(other.0))
    }

    #[inline]
    pub const fn saturating_sub(self, other: Duration) -> Self {
        Duration(self.0.saturating_sub(other.0))
    }

    #[inline]
    pub const fn saturating_mul(self, factor: u32) -> Self {
        Duration(self.0.saturating_mul(factor))
    }
}

impl Add for Duration {
    type Output = Duration;

    #[inline]
    fn add(self, rhs: Duration) -> Duration {
        self.saturating_add(rhs)
    }
}

impl Mul<u32> for Duration {
    type Output = Duration;

    #[inline]
    fn mul(self, rhs: u32) -> Duration {
        self.saturating_mul(rhs)
    }
}

/// Dwell time of a scan duration class.
///
/// Class `n` listens for `60 * (2^n + 1)` symbols of 16 µs each. Returns `None`
/// for classes above [`MAX_SCAN_DURATION_CLASS`].
pub const fn scan_duration(class: u8) -> Option<Duration> {
    if class > MAX_SCAN_DURATION_CLASS {
        return None;
    }
    let symbols = 60 * ((1u32 << class) + 1);
    Some(Duration(symbols * 16))
}

/// Spacing between channel-hopping broadcasts and resync probes (class 9).
pub const HOP_INTERVAL: Duration = Duration(60 * ((1 << 9) + 1) * 16);
