//! Conditions evaluated against a sampled value, both on demand and on every tick.

use std::any::type_name;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    Condition, ListenerHandle, ListenerRegistry, Polled, Result, Sample, Scheduler, TimeSampler,
    is_true,
};

/// The outcome of evaluating a [`Check`] on one tick.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CheckEvent {
    timestamp: i64,
    conditions_met: bool,
    repeating: bool,
    last_change_millis: i64,
}

impl CheckEvent {
    /// Timestamp of the sample the condition was evaluated against.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Whether the condition matched.
    #[must_use]
    pub fn conditions_met(&self) -> bool {
        self.conditions_met
    }

    /// Whether this event repeats an earlier one.
    ///
    /// Checks do not classify repeats: every tick produces an event of the same shape, so
    /// this is always `false`. Rate-limited repeat handling lives in
    /// [`TriggerHolder`][crate::TriggerHolder].
    #[must_use]
    pub fn repeating(&self) -> bool {
        self.repeating
    }

    /// Timestamp of the outcome reported by this event, which is the event's own timestamp.
    #[must_use]
    pub fn last_change_millis(&self) -> i64 {
        self.last_change_millis
    }
}

/// A callback that observes the events of a [`Check`].
pub type CheckListener = dyn Fn(&CheckEvent) + Send + Sync;

/// Evaluates a [`Condition`] against the value of a [`TimeSampler`].
///
/// [`is_conditions_met()`][Self::is_conditions_met] evaluates the condition on demand. It
/// works without any listeners and never starts the sampler.
///
/// Listeners receive a [`CheckEvent`] on every tick of the sampler. The check subscribes to
/// the sampler only while it has listeners of its own, so the first listener may start the
/// sampler and the last one may stop it.
///
/// Cloning yields another handle to the same check.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use tickwatch::{Check, ManualProbe, ManualScheduler, TimeSampler, above};
///
/// let manual = ManualScheduler::new(0);
/// let error_rate = ManualProbe::new(0.01_f64);
///
/// let sampler = TimeSampler::builder(error_rate.clone())
///     .scheduler(&manual.scheduler())
///     .build()
///     .unwrap();
///
/// let too_many_errors = Check::new(&sampler, above(0.05));
/// assert!(!too_many_errors.is_conditions_met());
///
/// error_rate.set(0.2);
/// assert!(too_many_errors.is_conditions_met());
/// ```
pub struct Check<I>
where
    I: Clone + Send + Sync + 'static,
{
    core: Arc<CheckCore<I>>,
}

struct CheckCore<I>
where
    I: Clone + Send + Sync + 'static,
{
    source: TimeSampler<I>,
    condition: Box<dyn Condition<I>>,
    listeners: ListenerRegistry<CheckListener>,

    // While attached, the subscription keeps the core alive. Detaching breaks the cycle.
    upstream: Mutex<Option<ListenerHandle>>,
}

impl<I> Check<I>
where
    I: Clone + Send + Sync + 'static,
{
    /// Creates a check of `condition` against the values of `source`.
    #[must_use]
    pub fn new<C>(source: &TimeSampler<I>, condition: C) -> Self
    where
        C: Condition<I>,
    {
        let core = Arc::new_cyclic(|weak: &Weak<CheckCore<I>>| {
            let weak = weak.clone();

            CheckCore {
                source: source.clone(),
                condition: Box::new(condition),
                listeners: ListenerRegistry::with_change_callback(move |count| {
                    let Some(core) = weak.upgrade() else {
                        return;
                    };

                    if count == 0 {
                        core.detach();
                    }
                }),
                upstream: Mutex::new(None),
            }
        });

        Self { core }
    }

    /// Evaluates the condition against the current value of the sampler.
    ///
    /// The value is pulled with [`TimeSampler::current()`], so pulling never closes the
    /// interval of a stateful sampler. Returns `false` if the sampler has no value to offer,
    /// which only happens for a derived sampler that has not emitted anything yet.
    #[must_use]
    pub fn is_conditions_met(&self) -> bool {
        self.core
            .source
            .current()
            .is_some_and(|value| self.core.condition.matches(&value))
    }

    /// Registers a listener for the outcome of every future tick.
    pub fn subscribe<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&CheckEvent) + Send + Sync + 'static,
    {
        self.add_listener(Arc::new(listener))
    }

    /// Registers a shared listener for the outcome of every future tick.
    pub fn add_listener(&self, listener: Arc<CheckListener>) -> ListenerHandle {
        let handle = self.core.listeners.add(listener);

        // Not from the change callback, which runs under the registry lock.
        self.core.attach();

        handle
    }

    /// Whether the check is currently subscribed to its sampler.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.core.upstream.lock().is_some()
    }

    /// The number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.core.listeners.len()
    }

    /// The sampler the condition is evaluated against.
    #[must_use]
    pub fn source(&self) -> &TimeSampler<I> {
        &self.core.source
    }
}

impl Check<bool> {
    /// Creates a check that polls `probe` every `interval` and is met while it returns `true`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroInterval`][crate::Error::ZeroInterval] if the interval is
    /// shorter than one millisecond.
    pub fn polling<F>(probe: F, interval: Duration, scheduler: &Scheduler) -> Result<Self>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let sampler = TimeSampler::builder(Polled::new(probe))
            .interval(interval)
            .scheduler(scheduler)
            .build()?;

        Ok(Self::new(&sampler, is_true()))
    }
}

impl<I> Clone for Check<I>
where
    I: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<I> fmt::Debug for Check<I>
where
    I: Clone + Send + Sync + 'static,
{
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("source", &self.core.source)
            .field("listeners", &self.listener_count())
            .field("attached", &self.is_attached())
            .finish_non_exhaustive()
    }
}

impl<I> CheckCore<I>
where
    I: Clone + Send + Sync + 'static,
{
    fn attach(self: &Arc<Self>) {
        if self.upstream.lock().is_some() {
            return;
        }

        // Subscribing may synchronously deliver the first sample, so no lock is held here.
        let core = Arc::clone(self);
        let handle = self.source.subscribe(move |sample| core.evaluate(sample));

        let previous = self.upstream.lock().replace(handle);
        drop(previous);

        debug!(value_type = type_name::<I>(), "check attached");

        // The last listener may have left before we recorded the subscription.
        self.listeners.with_population(|count| {
            if count == 0 {
                self.detach();
            }
        });
    }

    fn detach(&self) {
        let upstream = self.upstream.lock().take();

        if upstream.is_some() {
            debug!(value_type = type_name::<I>(), "check detached");
        }

        drop(upstream);
    }

    fn evaluate(&self, sample: &Sample<I>) {
        let event = CheckEvent {
            timestamp: sample.timestamp(),
            conditions_met: self.condition.matches(sample.value()),
            repeating: false,
            last_change_millis: sample.timestamp(),
        };

        self.listeners.for_each(|listener| listener(&event));
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{Delta, ManualProbe, ManualScheduler, Timer, TimerSnapshot, above};

    assert_impl_all!(Check<f64>: Send, Sync, Clone);
    assert_impl_all!(CheckEvent: Send, Sync, Copy);

    fn recorder() -> (Arc<Mutex<Vec<CheckEvent>>>, impl Fn(&CheckEvent) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        (seen, move |event: &CheckEvent| seen_clone.lock().push(*event))
    }

    fn sampler_over(manual: &ManualScheduler, probe: &ManualProbe<i32>) -> TimeSampler<i32> {
        TimeSampler::builder(probe.clone())
            .interval(Duration::from_secs(1))
            .scheduler(&manual.scheduler())
            .build()
            .unwrap()
    }

    #[test]
    fn pull_works_without_listeners() {
        let manual = ManualScheduler::new(0);
        let probe = ManualProbe::new(1);
        let sampler = sampler_over(&manual, &probe);

        let check = Check::new(&sampler, above(10));

        assert!(!check.is_conditions_met());
        probe.set(11);
        assert!(check.is_conditions_met());

        assert!(!check.is_attached());
        assert!(!sampler.is_running());
    }

    #[test]
    fn listeners_see_every_tick() {
        let manual = ManualScheduler::new(0);
        let probe = ManualProbe::new(1);
        let sampler = sampler_over(&manual, &probe);
        let check = Check::new(&sampler, above(10));

        let (seen, listener) = recorder();
        let _handle = check.subscribe(listener);
        assert!(sampler.is_running());

        manual.advance(Duration::from_secs(1));
        probe.set(20);
        manual.advance(Duration::from_secs(1));
        manual.advance(Duration::from_secs(1));

        let met: Vec<_> = seen.lock().iter().map(CheckEvent::conditions_met).collect();
        assert_eq!(met, vec![false, false, true, true]);
    }

    #[test]
    fn repeat_classification_is_unspecified_so_events_never_claim_to_repeat() {
        let manual = ManualScheduler::new(0);
        let probe = ManualProbe::new(1);
        let sampler = sampler_over(&manual, &probe);
        let check = Check::new(&sampler, above(10));

        let (seen, listener) = recorder();
        let _handle = check.subscribe(listener);

        manual.advance(Duration::from_secs(1));
        probe.set(20);
        manual.advance(Duration::from_secs(1));
        manual.advance(Duration::from_secs(1));

        // Unchanged, changed and unchanged-again outcomes all produce the same event shape.
        // Which of them should count as repeating is an open question; nothing is inferred.
        let expected: Vec<_> = [(0, false), (1_000, false), (2_000, true), (3_000, true)]
            .into_iter()
            .map(|(timestamp, conditions_met)| CheckEvent {
                timestamp,
                conditions_met,
                repeating: false,
                last_change_millis: timestamp,
            })
            .collect();

        assert_eq!(*seen.lock(), expected);
    }

    #[test]
    fn last_listener_detaches() {
        let manual = ManualScheduler::new(0);
        let probe = ManualProbe::new(50);
        let sampler = sampler_over(&manual, &probe);
        let check = Check::new(&sampler, above(10));

        drop(check.subscribe(|_| {}));
        assert!(!check.is_attached());
        assert!(!sampler.is_running());

        let (seen, listener) = recorder();
        let _handle = check.subscribe(listener);

        assert!(check.is_attached());
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn repeated_pulls_over_timer_see_the_same_interval() {
        let manual = ManualScheduler::new(0);
        let timer = Timer::new();

        let sampler = TimeSampler::builder(timer.clone())
            .scheduler(&manual.scheduler())
            .build()
            .unwrap();

        let busy = Check::new(&sampler, |snapshot: &TimerSnapshot| snapshot.count() >= 2);

        timer.record(Duration::from_millis(1));
        timer.record(Duration::from_millis(2));

        assert!(busy.is_conditions_met());
        assert!(busy.is_conditions_met());
        assert_eq!(timer.peek().count(), 2);
    }

    #[test]
    fn pulls_over_delta_see_counter_increase() {
        let manual = ManualScheduler::new(0);
        let errors = ManualProbe::new(0_i64);

        let sampler = TimeSampler::builder(Delta::new(errors.clone()))
            .scheduler(&manual.scheduler())
            .build()
            .unwrap();

        let error_burst = Check::new(&sampler, above(50));

        let mut outcomes = Vec::new();

        for _ in 0..3 {
            outcomes.push(error_burst.is_conditions_met());
            errors.set(errors.get() + 100);
        }

        assert_eq!(outcomes, vec![false, true, true]);
    }

    #[test]
    fn polling_check_evaluates_the_function() {
        let manual = ManualScheduler::new(0);
        let healthy = ManualProbe::new(true);
        let healthy_clone = healthy.clone();

        let check = Check::polling(
            move || healthy_clone.get(),
            Duration::from_millis(100),
            &manual.scheduler(),
        )
        .unwrap();

        assert!(check.is_conditions_met());
        healthy.set(false);
        assert!(!check.is_conditions_met());
    }
}
