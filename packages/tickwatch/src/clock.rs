use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time for sample timestamps and tick alignment.
///
/// Timestamps are milliseconds since the Unix epoch. Elapsed-time measurements
/// (see [`Timer`][crate::Timer]) do not use this trait - they use the monotonic clock.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Debug + Send + Sync + 'static {
    /// The current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// The operating system wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(since_epoch) => millis_i64(since_epoch),
            // A clock set before 1970 is unusual but representable.
            Err(e) => millis_i64(e.duration()).wrapping_neg(),
        }
    }
}

/// A clock that only moves when told to.
///
/// Used together with [`ManualScheduler`][crate::ManualScheduler] to drive sampling
/// deterministically, and by hosts that replay recorded data.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    /// Creates a clock that reads `start_millis` until it is moved.
    #[must_use]
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(start_millis),
        }
    }

    /// Moves the clock to an absolute time.
    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::Release);
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(millis_i64(by), Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    #[cfg_attr(test, mutants::skip)] // Trivial accessor.
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::Acquire)
    }
}

/// Whole milliseconds of a duration, saturating at `i64::MAX`.
pub(crate) fn millis_i64(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
