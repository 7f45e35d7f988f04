//! Rate-limited events raised when a derived value crosses a condition.

use std::any::type_name;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    Condition, ListenerHandle, ListenerRegistry, RepetitionGuard, Sample, SampleListOperation,
    SampleOperation, TimeSampler,
};

/// Derives the value a [`TriggerHolder`] watches from a source [`TimeSampler`].
pub trait Trigger<I, O>: Send + Sync + 'static
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Creates the derived time sampler whose samples the condition is evaluated against.
    fn derive(&self, source: &TimeSampler<I>) -> TimeSampler<O>;
}

/// Watches the raw values of the source.
#[derive(Clone, Copy, Debug, Default)]
pub struct CurrentValue;

impl<T> Trigger<T, T> for CurrentValue
where
    T: Clone + Send + Sync + 'static,
{
    fn derive(&self, source: &TimeSampler<T>) -> TimeSampler<T> {
        source.clone()
    }
}

/// Watches an aggregate over a rolling window of the source's values.
///
/// See [`RollingWindow`][crate::RollingWindow].
#[derive(Clone, Debug)]
pub struct Windowed<L> {
    duration: Duration,
    operation: L,
}

impl<L> Windowed<L> {
    /// Aggregates the samples of the last `duration` with `operation`.
    #[must_use]
    pub fn new(duration: Duration, operation: L) -> Self {
        Self {
            duration,
            operation,
        }
    }
}

impl<I, O, L> Trigger<I, O> for Windowed<L>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    L: SampleListOperation<I, O> + Clone,
{
    fn derive(&self, source: &TimeSampler<I>) -> TimeSampler<O> {
        source.rolling_over(self.duration, self.operation.clone())
    }
}

/// Watches the output of a per-sample operation over the source's values.
#[derive(Clone, Debug)]
pub struct Transformed<Op> {
    operation: Op,
}

impl<Op> Transformed<Op> {
    /// Applies `operation` to every sample of the source.
    #[must_use]
    pub fn new(operation: Op) -> Self {
        Self { operation }
    }
}

impl<I, O, Op> Trigger<I, O> for Transformed<Op>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    Op: SampleOperation<I, O> + Clone,
{
    fn derive(&self, source: &TimeSampler<I>) -> TimeSampler<O> {
        source.apply(self.operation.clone())
    }
}

/// What happened to a [`TriggerHolder`]'s condition.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum TriggerEventKind {
    /// The condition matched and the repetition guard allowed the event.
    Met,

    /// The condition stopped matching after a [`Met`][Self::Met] event.
    NoLongerMet,
}

impl TriggerEventKind {
    /// A short human-readable name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Met => "met",
            Self::NoLongerMet => "no longer met",
        }
    }
}

impl fmt::Display for TriggerEventKind {
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event raised by a [`TriggerHolder`].
#[derive(Clone, Debug, PartialEq)]
pub struct TriggerEvent<O> {
    kind: TriggerEventKind,
    sample: Sample<O>,
}

impl<O> TriggerEvent<O> {
    /// What happened.
    #[must_use]
    pub fn kind(&self) -> TriggerEventKind {
        self.kind
    }

    /// Timestamp of the sample that raised the event.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.sample.timestamp()
    }

    /// The watched value that raised the event.
    #[must_use]
    pub fn value(&self) -> &O {
        self.sample.value()
    }
}

/// A callback that observes the events of a [`TriggerHolder`].
pub type TriggerListener<O> = dyn Fn(&TriggerEvent<O>) + Send + Sync;

/// Raises rate-limited events while a condition over a derived value holds.
///
/// On every sample of the watched value:
///
/// * If the condition matches, a [`Met`][TriggerEventKind::Met] event is raised when the
///   [`RepetitionGuard`] allows it. Otherwise the event is suppressed.
/// * If the condition does not match, an event was raised earlier and
///   [`fire_when_no_longer_met`][TriggerHolderBuilder::fire_when_no_longer_met] is enabled,
///   a [`NoLongerMet`][TriggerEventKind::NoLongerMet] event is raised and the holder is
///   disarmed, so the next match raises an event again.
///
/// Like [`Check`][crate::Check], the holder only subscribes to the watched value while it has
/// listeners.
///
/// Cloning yields another handle to the same holder.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use tickwatch::{
///     ManualProbe, ManualScheduler, TimeSampler, TriggerHolder, WindowAverage, Windowed, above,
/// };
///
/// let manual = ManualScheduler::new(0);
/// let latency_ms = ManualProbe::new(10_u32);
///
/// let sampler = TimeSampler::builder(latency_ms.clone())
///     .scheduler(&manual.scheduler())
///     .build()
///     .unwrap();
///
/// let slow = TriggerHolder::builder(
///     &sampler,
///     Windowed::new(Duration::from_secs(5), WindowAverage),
///     above(100.0),
/// )
/// .max_every(Duration::from_secs(60))
/// .build();
///
/// let _subscription = slow.subscribe(|event| println!("latency {}", event.kind()));
///
/// latency_ms.set(1_000);
/// manual.advance(Duration::from_secs(3));
///
/// assert!(slow.last_fired().is_some());
/// ```
pub struct TriggerHolder<O>
where
    O: Clone + Send + Sync + 'static,
{
    core: Arc<HolderCore<O>>,
}

struct HolderCore<O>
where
    O: Clone + Send + Sync + 'static,
{
    watched: TimeSampler<O>,
    condition: Box<dyn Condition<O>>,
    fire_when_no_longer_met: bool,
    listeners: ListenerRegistry<TriggerListener<O>>,
    state: Mutex<HolderState>,

    // While attached, the subscription keeps the core alive. Detaching breaks the cycle.
    upstream: Mutex<Option<ListenerHandle>>,
}

struct HolderState {
    guard: RepetitionGuard,
    last_fired: Option<i64>,
}

impl<O> TriggerHolder<O>
where
    O: Clone + Send + Sync + 'static,
{
    /// Starts building a holder that watches `trigger`'s view of `source`.
    pub fn builder<I, T, C>(
        source: &TimeSampler<I>,
        trigger: T,
        condition: C,
    ) -> TriggerHolderBuilder<O>
    where
        I: Clone + Send + Sync + 'static,
        T: Trigger<I, O>,
        C: Condition<O>,
    {
        TriggerHolderBuilder {
            watched: trigger.derive(source),
            condition: Box::new(condition),
            guard: RepetitionGuard::after_duration(Duration::ZERO),
            fire_when_no_longer_met: false,
        }
    }

    /// Registers a listener for every future event.
    pub fn subscribe<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&TriggerEvent<O>) + Send + Sync + 'static,
    {
        self.add_listener(Arc::new(listener))
    }

    /// Registers a shared listener for every future event.
    pub fn add_listener(&self, listener: Arc<TriggerListener<O>>) -> ListenerHandle {
        let handle = self.core.listeners.add(listener);

        // Not from the change callback, which runs under the registry lock.
        self.core.attach();

        handle
    }

    /// Timestamp of the last [`Met`][TriggerEventKind::Met] event, unless the holder has
    /// been disarmed since.
    #[must_use]
    pub fn last_fired(&self) -> Option<i64> {
        self.core.state.lock().last_fired
    }

    /// Whether the holder is currently subscribed to the watched value.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.core.upstream.lock().is_some()
    }

    /// The number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.core.listeners.len()
    }

    /// The derived time sampler the condition is evaluated against.
    #[must_use]
    pub fn watched(&self) -> &TimeSampler<O> {
        &self.core.watched
    }
}

impl<O> Clone for TriggerHolder<O>
where
    O: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<O> fmt::Debug for TriggerHolder<O>
where
    O: Clone + Send + Sync + 'static,
{
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("watched", &self.core.watched)
            .field("fire_when_no_longer_met", &self.core.fire_when_no_longer_met)
            .field("last_fired", &self.last_fired())
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

impl<O> HolderCore<O>
where
    O: Clone + Send + Sync + 'static,
{
    fn attach(self: &Arc<Self>) {
        if self.upstream.lock().is_some() {
            return;
        }

        // Subscribing may synchronously deliver the first sample, so no lock is held here.
        let core = Arc::clone(self);
        let handle = self.watched.subscribe(move |sample| core.evaluate(sample));

        let previous = self.upstream.lock().replace(handle);
        drop(previous);

        debug!(value_type = type_name::<O>(), "trigger attached");

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
            debug!(value_type = type_name::<O>(), "trigger detached");
        }

        drop(upstream);
    }

    fn evaluate(&self, sample: &Sample<O>) {
        let met = self.condition.matches(sample.value());
        let now = sample.timestamp();

        let kind = {
            let mut state = self.state.lock();

            if met {
                if state.guard.check(now) {
                    state.last_fired = Some(now);
                    Some(TriggerEventKind::Met)
                } else {
                    None
                }
            } else if self.fire_when_no_longer_met && state.last_fired.is_some() {
                state.last_fired = None;
                state.guard.reset();
                Some(TriggerEventKind::NoLongerMet)
            } else {
                None
            }
        };

        let Some(kind) = kind else {
            return;
        };

        debug!(
            value_type = type_name::<O>(),
            timestamp = now,
            kind = kind.as_str(),
            "trigger fired"
        );

        let event = TriggerEvent {
            kind,
            sample: sample.clone(),
        };

        self.listeners.for_each(|listener| listener(&event));
    }
}

/// Builder for configuring a [`TriggerHolder`].
#[must_use = "the builder does nothing until build() is called"]
pub struct TriggerHolderBuilder<O>
where
    O: Clone + Send + Sync + 'static,
{
    watched: TimeSampler<O>,
    condition: Box<dyn Condition<O>>,
    guard: RepetitionGuard,
    fire_when_no_longer_met: bool,
}

impl<O> TriggerHolderBuilder<O>
where
    O: Clone + Send + Sync + 'static,
{
    /// Raises [`Met`][TriggerEventKind::Met] at most once per `interval` while the
    /// condition keeps matching.
    ///
    /// Default is to raise it on every matching sample.
    pub fn max_every(mut self, interval: Duration) -> Self {
        self.guard = RepetitionGuard::after_duration(interval);
        self
    }

    /// Raises [`Met`][TriggerEventKind::Met] only once, until the holder is disarmed by a
    /// [`NoLongerMet`][TriggerEventKind::NoLongerMet] event.
    pub fn once(mut self) -> Self {
        self.guard = RepetitionGuard::once();
        self
    }

    /// Whether to raise [`NoLongerMet`][TriggerEventKind::NoLongerMet] when the condition
    /// stops matching.
    ///
    /// Default is `false`.
    pub fn fire_when_no_longer_met(mut self, enabled: bool) -> Self {
        self.fire_when_no_longer_met = enabled;
        self
    }

    /// Builds the holder. It stays detached until the first listener subscribes.
    #[must_use]
    pub fn build(self) -> TriggerHolder<O> {
        let core = Arc::new_cyclic(|weak: &Weak<HolderCore<O>>| {
            let weak = weak.clone();

            HolderCore {
                watched: self.watched,
                condition: self.condition,
                fire_when_no_longer_met: self.fire_when_no_longer_met,
                listeners: ListenerRegistry::with_change_callback(move |count| {
                    let Some(core) = weak.upgrade() else {
                        return;
                    };

                    if count == 0 {
                        core.detach();
                    }
                }),
                state: Mutex::new(HolderState {
                    guard: self.guard,
                    last_fired: None,
                }),
                upstream: Mutex::new(None),
            }
        });

        TriggerHolder { core }
    }
}

impl<O> fmt::Debug for TriggerHolderBuilder<O>
where
    O: Clone + Send + Sync + 'static,
{
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("watched", &self.watched)
            .field("guard", &self.guard)
            .field("fire_when_no_longer_met", &self.fire_when_no_longer_met)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{ManualProbe, ManualScheduler, WindowAverage, above};

    assert_impl_all!(TriggerHolder<f64>: Send, Sync, Clone);

    type Seen = Arc<Mutex<Vec<(TriggerEventKind, i64)>>>;

    fn recorder<O>() -> (Seen, impl Fn(&TriggerEvent<O>) + Send + Sync + 'static)
    where
        O: 'static,
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        (seen, move |event: &TriggerEvent<O>| {
            seen_clone.lock().push((event.kind(), event.timestamp()));
        })
    }

    fn setup(initial: i32) -> (ManualScheduler, ManualProbe<i32>, TimeSampler<i32>) {
        let manual = ManualScheduler::new(0);
        let probe = ManualProbe::new(initial);

        let sampler = TimeSampler::builder(probe.clone())
            .interval(Duration::from_secs(1))
            .scheduler(&manual.scheduler())
            .build()
            .unwrap();

        (manual, probe, sampler)
    }

    #[test]
    fn fires_on_every_match_by_default() {
        let (manual, _probe, sampler) = setup(50);

        let holder = TriggerHolder::builder(&sampler, CurrentValue, above(10)).build();
        let (seen, listener) = recorder();
        let _handle = holder.subscribe(listener);

        manual.advance(Duration::from_secs(2));

        assert_eq!(
            *seen.lock(),
            vec![
                (TriggerEventKind::Met, 0),
                (TriggerEventKind::Met, 1_000),
                (TriggerEventKind::Met, 2_000)
            ]
        );
    }

    #[test]
    fn max_every_suppresses_repeats() {
        let (manual, _probe, sampler) = setup(50);

        let holder = TriggerHolder::builder(&sampler, CurrentValue, above(10))
            .max_every(Duration::from_secs(3))
            .build();
        let (seen, listener) = recorder();
        let _handle = holder.subscribe(listener);

        manual.advance(Duration::from_secs(7));

        let timestamps: Vec<_> = seen.lock().iter().map(|(_, ts)| *ts).collect();
        assert_eq!(timestamps, vec![0, 3_000, 6_000]);
        assert_eq!(holder.last_fired(), Some(6_000));
    }

    #[test]
    fn no_longer_met_disarms() {
        let (manual, probe, sampler) = setup(50);

        let holder = TriggerHolder::builder(&sampler, CurrentValue, above(10))
            .once()
            .fire_when_no_longer_met(true)
            .build();
        let (seen, listener) = recorder();
        let _handle = holder.subscribe(listener);

        manual.advance(Duration::from_secs(1));
        probe.set(0);
        manual.advance(Duration::from_secs(2));
        probe.set(99);
        manual.advance(Duration::from_secs(1));

        assert_eq!(
            *seen.lock(),
            vec![
                (TriggerEventKind::Met, 0),
                (TriggerEventKind::NoLongerMet, 2_000),
                (TriggerEventKind::Met, 4_000)
            ]
        );
    }

    #[test]
    fn without_no_longer_met_once_stays_silent() {
        let (manual, probe, sampler) = setup(50);

        let holder = TriggerHolder::builder(&sampler, CurrentValue, above(10))
            .once()
            .build();
        let (seen, listener) = recorder();
        let _handle = holder.subscribe(listener);

        probe.set(0);
        manual.advance(Duration::from_secs(1));
        probe.set(99);
        manual.advance(Duration::from_secs(1));

        assert_eq!(*seen.lock(), vec![(TriggerEventKind::Met, 0)]);
    }

    #[test]
    fn windowed_trigger_watches_the_aggregate() {
        let (manual, probe, sampler) = setup(0);

        let holder = TriggerHolder::builder(
            &sampler,
            Windowed::new(Duration::from_secs(10), WindowAverage),
            above(50.0),
        )
        .build();
        let (seen, listener) = recorder();
        let _handle = holder.subscribe(listener);

        // Window: 0, 100 -> average 50, not above.
        probe.set(100);
        manual.advance(Duration::from_secs(1));
        assert!(seen.lock().is_empty());

        // Window: 0, 100, 100 -> average 66.7.
        manual.advance(Duration::from_secs(1));
        assert_eq!(*seen.lock(), vec![(TriggerEventKind::Met, 2_000)]);
    }

    #[test]
    fn detaches_with_last_listener() {
        let (_manual, _probe, sampler) = setup(50);

        let holder = TriggerHolder::builder(&sampler, CurrentValue, above(10)).build();

        let handle = holder.subscribe(|_| {});
        assert!(holder.is_attached());
        assert!(sampler.is_running());

        drop(handle);
        assert!(!holder.is_attached());
        assert!(!sampler.is_running());
    }
}
