use core::time::Duration;
use portable_atomic::{AtomicU64, Ordering};
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

/// Default id epoch: Monday, October 21, 2024 00:00:00 UTC (in seconds).
pub const DEFAULT_EPOCH_SECS: u64 = 1_729_468_800;

/// A trait for wall-clock time sources.
///
/// Everything that stamps data shared between processes (logical cache
/// expiry, id timestamps, physical TTLs in the in-memory store) reads time
/// through this trait so tests and simulations can substitute a controllable
/// clock.
///
/// The unit is **milliseconds since the Unix epoch**. Unlike a monotonic
/// timer, this clock may go backwards if the host clock is adjusted; callers
/// that derive ordering from it inherit that caveat.
///
/// # Example
///
/// ```
/// use flashgate::TimeSource;
///
/// struct FixedTime;
/// impl TimeSource for FixedTime {
///     fn current_millis(&self) -> u64 {
///         1234
///     }
/// }
///
/// assert_eq!(FixedTime.current_millis(), 1234);
/// ```
pub trait TimeSource: Send + Sync + 'static {
    /// Returns the current time in milliseconds since the Unix epoch.
    fn current_millis(&self) -> u64;

    /// Returns the current time in whole seconds since the Unix epoch.
    fn current_secs(&self) -> u64 {
        self.current_millis() / 1_000
    }
}

/// The host wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn current_millis(&self) -> u64 {
        // A host clock before 1970 is treated as the epoch itself.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

/// A manually driven clock shared between clones.
///
/// Every clone observes the same instant, so a test can hand one clone to a
/// store and another to a cache client and move both forward at once.
#[derive(Clone, Debug)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock frozen at `millis` since the Unix epoch.
    pub fn new(millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(millis)),
        }
    }

    /// Creates a clock frozen at the current host time.
    pub fn starting_now() -> Self {
        Self::new(SystemClock.current_millis())
    }

    /// Moves the clock forward by `by`, stopping at `u64::MAX`.
    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        let _ = self
            .millis
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |now| {
                Some(now.saturating_add(by))
            });
    }

    /// Sets the clock to an absolute instant (may move backwards).
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::Release);
    }
}

impl TimeSource for ManualClock {
    fn current_millis(&self) -> u64 {
        self.millis.load(Ordering::Acquire)
    }
}

impl<T: TimeSource> TimeSource for Arc<T> {
    fn current_millis(&self) -> u64 {
        (**self).current_millis()
    }
}
