use std::time::Duration;

use crate::clock::millis_i64;

/// Decides whether a repeating event may fire again.
///
/// The guard remembers a baseline: the time of the last firing it allowed, or the time it
/// was armed with [`start()`][Self::start]. An unarmed guard allows the next firing and
/// takes its time as the new baseline.
///
/// * [`once()`][Self::once] allows nothing further once it has a baseline.
/// * [`after_duration()`][Self::after_duration] allows a firing once the given duration has
///   elapsed since the baseline, and moves the baseline to that firing.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use tickwatch::RepetitionGuard;
///
/// let mut guard = RepetitionGuard::after_duration(Duration::from_secs(60));
/// guard.start(0);
///
/// assert!(!guard.check(59_999));
/// assert!(guard.check(60_000));
/// assert!(!guard.check(60_001));
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RepetitionGuard {
    policy: Policy,
    baseline: Option<i64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Policy {
    Once,
    AfterMillis(i64),
}

impl RepetitionGuard {
    /// A guard that allows a single firing until it is reset.
    #[must_use]
    pub fn once() -> Self {
        Self {
            policy: Policy::Once,
            baseline: None,
        }
    }

    /// A guard that allows a firing once `duration` has passed since the last one.
    ///
    /// A zero duration allows every firing.
    #[must_use]
    pub fn after_duration(duration: Duration) -> Self {
        Self {
            policy: Policy::AfterMillis(millis_i64(duration)),
            baseline: None,
        }
    }

    /// Arms the guard as if it had allowed a firing at `now_millis`.
    pub fn start(&mut self, now_millis: i64) {
        self.baseline = Some(now_millis);
    }

    /// Whether a firing at `now_millis` is allowed. An allowed firing becomes the new
    /// baseline.
    pub fn check(&mut self, now_millis: i64) -> bool {
        let allowed = match (self.policy, self.baseline) {
            (_, None) => true,
            (Policy::Once, Some(_)) => false,
            (Policy::AfterMillis(period), Some(baseline)) => {
                now_millis.saturating_sub(baseline) >= period
            }
        };

        if allowed {
            self.baseline = Some(now_millis);
        }

        allowed
    }

    /// Disarms the guard, so the next firing is allowed.
    pub fn reset(&mut self) {
        self.baseline = None;
    }

    /// Whether the guard has a baseline.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.baseline.is_some()
    }

    /// The time of the last allowed firing, or of arming.
    #[must_use]
    pub fn baseline(&self) -> Option<i64> {
        self.baseline
    }
}
