//! Dual clock source: monotonic ticks plus a wall-clock reading.
//!
//! The keeper debits the block window against a monotonic counter that an
//! operator cannot move, and cross-checks it against the wall clock at
//! startup to detect jumps. The two readings must come from independent
//! sources:
//!
//! - `mono_now` is non-decreasing within a process and is unaffected by
//!   administrative wall-clock changes. It resets across reboots.
//! - `wall_now` tracks the administrative wall clock and may move
//!   arbitrarily between calls.
//!
//! [`SystemClock`] is the production implementation; the trait exists so
//! tests can substitute a scripted clock.

use nix::time::{ClockId, clock_gettime};
use thiserror::Error;

/// Tick rate of [`SystemClock`]'s monotonic readings (nanoseconds).
pub const MONO_TICKS_PER_SECOND: u64 = 1_000_000_000;

/// Wall readings are expressed in 100-nanosecond units since the Unix epoch.
pub const WALL_TICKS_PER_MS: i64 = 10_000;

/// Errors raised while constructing a clock source.
#[derive(Debug, Error)]
pub enum ClockError {
    /// No monotonic clock is available on this host.
    ///
    /// The daemon must not run with a single clock; this error is fatal.
    #[error("monotonic clock unavailable: {0}")]
    Unavailable(String),
}

/// Provider of the two independent time readings the keeper depends on.
///
/// Implementations must be cheap to call; readings are taken inside the
/// keeper's critical section.
pub trait ClockSource: Send + Sync {
    /// Current monotonic reading in ticks.
    ///
    /// Non-decreasing within a single process; not meaningful across
    /// reboots.
    fn mono_now(&self) -> i64;

    /// Current wall-clock instant in 100-ns units since the Unix epoch.
    fn wall_now(&self) -> i64;

    /// Ticks per second of the monotonic source.
    ///
    /// Constant for the process lifetime and strictly positive.
    fn mono_frequency(&self) -> u64;
}

/// Production clock backed by the OS.
///
/// Monotonic readings use `CLOCK_BOOTTIME` so that suspended time still
/// counts against the window, falling back to `CLOCK_MONOTONIC` on hosts
/// without boot-time accounting. Wall readings come from the system UTC
/// clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    clock_id: ClockId,
}

impl SystemClock {
    /// Probes the host for a usable monotonic clock.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::Unavailable`] if neither `CLOCK_BOOTTIME` nor
    /// `CLOCK_MONOTONIC` can be read.
    pub fn new() -> Result<Self, ClockError> {
        for clock_id in [ClockId::CLOCK_BOOTTIME, ClockId::CLOCK_MONOTONIC] {
            if clock_gettime(clock_id).is_ok() {
                return Ok(Self { clock_id });
            }
        }
        Err(ClockError::Unavailable(
            "neither CLOCK_BOOTTIME nor CLOCK_MONOTONIC is readable".to_string(),
        ))
    }
}

impl ClockSource for SystemClock {
    fn mono_now(&self) -> i64 {
        // The clock id was probed at construction; a failure here would
        // mean the kernel revoked a clock mid-process.
        clock_gettime(self.clock_id)
            .map_or(0, |ts| ts.tv_sec() * 1_000_000_000 + ts.tv_nsec())
    }

    fn wall_now(&self) -> i64 {
        let now = chrono::Utc::now();
        now.timestamp() * 10_000_000 + i64::from(now.timestamp_subsec_nanos()) / 100
    }

    fn mono_frequency(&self) -> u64 {
        MONO_TICKS_PER_SECOND
    }
}
