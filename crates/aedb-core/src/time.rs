// ABOUTME: Time base handling for tick-stamped rows: ticks per second and seconds<->ticks conversion.
// ABOUTME: Also defines the one-tick tolerance used when checking time monotonicity.

use serde::{Deserialize, Serialize};

/// Integer ticks since session start.
pub type TimeTick = i64;

/// Maximum backwards step, in ticks, that still counts as monotonic.
///
/// Absorbs rounding when acquisition software converts float seconds to
/// ticks. It is a heuristic: for very coarse time bases one tick can be a
/// noticeable amount of time.
pub const TICK_TOLERANCE: TimeTick = 1;

/// Ticks per second of a store. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeBase(u64);

impl TimeBase {
    /// 100 ns ticks, the resolution used by acquisition hardware.
    pub const DEFAULT: TimeBase = TimeBase(10_000_000);

    /// Returns `None` for a zero time base.
    pub fn new(ticks_per_second: u64) -> Option<Self> {
        (ticks_per_second > 0).then_some(Self(ticks_per_second))
    }

    pub fn ticks_per_second(self) -> u64 {
        self.0
    }

    pub fn to_seconds(self, ticks: TimeTick) -> f64 {
        ticks as f64 / self.0 as f64
    }

    /// Convert seconds to the nearest tick.
    pub fn to_ticks(self, seconds: f64) -> TimeTick {
        (seconds * self.0 as f64).round() as TimeTick
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl std::fmt::Display for TimeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// True if `next` may follow `previous` in a time-ordered sequence.
pub fn is_monotonic(previous: TimeTick, next: TimeTick) -> bool {
    next + TICK_TOLERANCE >= previous
}
