//! The scheduled runtime that drives samplers and fans out their samples.

use std::any::type_name;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, trace};

use crate::{
    Error, ListenerHandle, ListenerRegistry, Result, Sample, SampleOperation, SampledProbe,
    Sampler, ScheduledTask, Scheduler,
};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// A callback that observes the samples of a [`TimeSampler`].
pub type SampleListener<T> = dyn Fn(&Sample<T>) + Send + Sync;

/// Periodically samples a value and delivers each [`Sample`] to its listeners.
///
/// A time sampler owns at most one [`Sampler`] created from its probe. It is inert until the
/// first listener subscribes. At that moment it takes one sample immediately and asks the
/// scheduler to tick it every interval. When the last listener unsubscribes, the scheduled
/// task is cancelled and the sampler is dropped. A later subscription starts it up again.
///
/// Samples from one time sampler are delivered strictly in order, one at a time.
/// A listener that panics is logged and skipped; the others still see the sample.
///
/// Derived time samplers created with [`apply()`][Self::apply] have no schedule of their
/// own. They subscribe to their parent while they themselves have listeners and
/// transform each parent sample.
///
/// Cloning yields another handle to the same time sampler.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use parking_lot::Mutex;
/// use tickwatch::{ManualProbe, ManualScheduler, TimeSampler};
///
/// let manual = ManualScheduler::new(0);
/// let queue_depth = ManualProbe::new(3_u32);
///
/// let sampler = TimeSampler::builder(queue_depth.clone())
///     .interval(Duration::from_secs(1))
///     .scheduler(&manual.scheduler())
///     .build()
///     .unwrap();
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let seen_clone = Arc::clone(&seen);
/// let subscription = sampler.subscribe(move |sample| {
///     seen_clone.lock().push(*sample.value());
/// });
///
/// queue_depth.set(5);
/// manual.advance(Duration::from_secs(1));
///
/// // One immediate sample on subscribe, one on the tick.
/// assert_eq!(*seen.lock(), vec![3, 5]);
///
/// drop(subscription);
/// assert!(!sampler.is_running());
/// ```
pub struct TimeSampler<T>
where
    T: Clone + Send + Sync + 'static,
{
    core: Arc<SamplerCore<T>>,
}

struct SamplerCore<T>
where
    T: Clone + Send + Sync + 'static,
{
    listeners: ListenerRegistry<SampleListener<T>>,
    last: ArcSwapOption<Sample<T>>,
    source: Source<T>,
}

enum Source<T>
where
    T: Clone + Send + Sync + 'static,
{
    Scheduled(Scheduled<T>),
    Derived(Derived<T>),
}

struct Scheduled<T> {
    probe: Box<dyn SampledProbe<T>>,
    interval: Duration,
    scheduler: Scheduler,

    // Held for every emission so the immediate sample and the periodic ticks never overlap.
    // Reentrant because a listener may unsubscribe and resubscribe during an emission.
    tick_lock: ReentrantMutex<()>,

    // Created by the first pull or tick, released on stop. Ticks and pulls share it.
    sampler: Mutex<Option<Box<dyn Sampler<T>>>>,

    // Only dropped, which cancels the task. Present while running.
    task: Mutex<Option<ScheduledTask>>,
}

// While attached, the upstream listener keeps the derived sampler alive. Detaching breaks
// the cycle.
type Attach<T> = Box<dyn Fn(Arc<SamplerCore<T>>) -> ListenerHandle + Send + Sync>;

struct Derived<T>
where
    T: Clone + Send + Sync + 'static,
{
    attach: Attach<T>,
    interval: Duration,
    upstream: Mutex<Option<ListenerHandle>>,
    last_emitted_timestamp: Mutex<Option<i64>>,
}

impl<T> TimeSampler<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Starts building a time sampler over `probe`.
    pub fn builder<P>(probe: P) -> TimeSamplerBuilder<T>
    where
        P: SampledProbe<T>,
    {
        TimeSamplerBuilder {
            probe: Box::new(probe),
            interval: DEFAULT_INTERVAL,
            scheduler: None,
        }
    }

    fn from_source(source: Source<T>) -> Self {
        let core = Arc::new_cyclic(|weak: &Weak<SamplerCore<T>>| {
            let weak = weak.clone();

            SamplerCore {
                listeners: ListenerRegistry::with_change_callback(move |count| {
                    let Some(core) = weak.upgrade() else {
                        return;
                    };

                    if count == 0 {
                        core.stop();
                    }
                }),
                last: ArcSwapOption::empty(),
                source,
            }
        });

        Self { core }
    }

    /// Registers a listener for every future sample.
    ///
    /// The first listener starts sampling. The listener stays registered until the returned
    /// handle is dropped.
    pub fn subscribe<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&Sample<T>) + Send + Sync + 'static,
    {
        self.add_listener(Arc::new(listener))
    }

    /// Registers a shared listener for every future sample.
    pub fn add_listener(&self, listener: Arc<SampleListener<T>>) -> ListenerHandle {
        let handle = self.core.listeners.add(listener);

        // Not from the change callback: starting takes the tick lock, and a tick holds that
        // lock while its listeners may be adding or removing listeners.
        self.core.start();

        handle
    }

    /// The most recently emitted sample, if any.
    ///
    /// Retained across stop and restart, so this reports the final sample of a stopped
    /// time sampler.
    #[must_use]
    pub fn last_sample(&self) -> Option<Sample<T>> {
        self.core.last.load_full().map(|sample| (*sample).clone())
    }

    /// Reads the current value on demand, without notifying listeners.
    ///
    /// While the time sampler is running, this is the value of the latest tick. While it is
    /// inert, the time sampler's own sampler is created if necessary and
    /// [peeked][Sampler::peek], so repeated pulls see the same sampler state and do not
    /// consume an interval. Derived time samplers report the value of their last emitted
    /// sample.
    #[must_use]
    pub fn current(&self) -> Option<T> {
        match &self.core.source {
            Source::Scheduled(scheduled) => {
                if scheduled.task.lock().is_some() {
                    if let Some(last) = self.last_sample() {
                        return Some(last.into_value());
                    }
                }

                let mut sampler = scheduled.sampler.lock();
                Some(
                    sampler
                        .get_or_insert_with(|| scheduled.probe.instantiate())
                        .peek(),
                )
            }
            Source::Derived(_) => self.last_sample().map(Sample::into_value),
        }
    }

    /// Whether the time sampler is currently producing samples.
    #[must_use]
    pub fn is_running(&self) -> bool {
        match &self.core.source {
            Source::Scheduled(scheduled) => scheduled.task.lock().is_some(),
            Source::Derived(derived) => derived.upstream.lock().is_some(),
        }
    }

    /// The number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.core.listeners.len()
    }

    /// How often samples are taken. Derived time samplers report their root's interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        match &self.core.source {
            Source::Scheduled(scheduled) => scheduled.interval,
            Source::Derived(derived) => derived.interval,
        }
    }

    /// Creates a derived time sampler that transforms every sample of this one.
    ///
    /// The derived time sampler owns a private executor of `operation`. It only subscribes
    /// to this time sampler while it has listeners of its own, and it skips any output
    /// whose timestamp equals the previous output's timestamp.
    #[must_use]
    pub fn apply<O, Op>(&self, operation: Op) -> TimeSampler<O>
    where
        O: Clone + Send + Sync + 'static,
        Op: SampleOperation<T, O>,
    {
        let parent = self.clone();
        let operation = Arc::new(operation);

        let attach: Attach<O> = Box::new(move |sink: Arc<SamplerCore<O>>| {
            let executor = Mutex::new(operation.executor());

            parent.subscribe(move |sample| {
                let output = executor.lock().apply(sample);
                sink.publish_derived(output);
            })
        });

        TimeSampler::from_source(Source::Derived(Derived {
            attach,
            interval: self.interval(),
            upstream: Mutex::new(None),
            last_emitted_timestamp: Mutex::new(None),
        }))
    }
}

impl<T> Clone for TimeSampler<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> fmt::Debug for TimeSampler<T>
where
    T: Clone + Send + Sync + 'static,
{
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("interval", &self.interval())
            .field("listeners", &self.listener_count())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl<T> SamplerCore<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn start(self: &Arc<Self>) {
        match &self.source {
            Source::Scheduled(scheduled) => self.start_scheduled(scheduled),
            Source::Derived(derived) => self.start_derived(derived),
        }

        // The last listener may have left before we recorded that we are running.
        self.listeners.with_population(|count| {
            if count == 0 {
                self.stop();
            }
        });
    }

    fn start_scheduled(self: &Arc<Self>, scheduled: &Scheduled<T>) {
        if scheduled.task.lock().is_some() {
            return;
        }

        let _tick = scheduled.tick_lock.lock();

        if scheduled.task.lock().is_some() {
            return;
        }

        // The task keeps the core alive while running, so listeners keep sampling even after
        // every `TimeSampler` handle is gone. Stopping cancels the task and breaks the cycle.
        let core = Arc::clone(self);
        let task = scheduled
            .scheduler
            .schedule_sampling(scheduled.interval, move || core.tick());

        let previous = scheduled.task.lock().replace(task);
        drop(previous);

        debug!(
            value_type = type_name::<T>(),
            interval = ?scheduled.interval,
            "time sampler started"
        );

        self.sample_and_emit(scheduled);
    }

    fn start_derived(self: &Arc<Self>, derived: &Derived<T>) {
        if derived.upstream.lock().is_some() {
            return;
        }

        // Attaching may synchronously emit into this sampler, so no lock is held here.
        let handle = (derived.attach)(Arc::clone(self));

        let previous = derived.upstream.lock().replace(handle);
        drop(previous);

        debug!(value_type = type_name::<T>(), "derived time sampler attached");
    }

    fn stop(&self) {
        match &self.source {
            Source::Scheduled(scheduled) => {
                let task = scheduled.task.lock().take();
                let sampler = scheduled.sampler.lock().take();

                if task.is_some() {
                    debug!(value_type = type_name::<T>(), "time sampler stopped");
                }

                // Dropping cancels the task and releases the sampler, outside the locks.
                drop(task);
                drop(sampler);
            }
            Source::Derived(derived) => {
                let upstream = derived.upstream.lock().take();
                *derived.last_emitted_timestamp.lock() = None;

                if upstream.is_some() {
                    debug!(value_type = type_name::<T>(), "derived time sampler detached");
                }

                drop(upstream);
            }
        }
    }

    fn tick(&self) {
        if let Source::Scheduled(scheduled) = &self.source {
            let _tick = scheduled.tick_lock.lock();
            self.sample_and_emit(scheduled);
        }
    }

    fn sample_and_emit(&self, scheduled: &Scheduled<T>) {
        // Stopped between scheduling and this tick.
        if scheduled.task.lock().is_none() {
            return;
        }

        let value = scheduled
            .sampler
            .lock()
            .get_or_insert_with(|| scheduled.probe.instantiate())
            .sample();

        self.emit(Sample::new(scheduled.scheduler.now_millis(), value));
    }

    fn publish_derived(&self, sample: Sample<T>) {
        let Source::Derived(derived) = &self.source else {
            return;
        };

        {
            let mut last_emitted = derived.last_emitted_timestamp.lock();

            if *last_emitted == Some(sample.timestamp()) {
                return;
            }

            *last_emitted = Some(sample.timestamp());
        }

        self.emit(sample);
    }

    fn emit(&self, sample: Sample<T>) {
        trace!(
            value_type = type_name::<T>(),
            timestamp = sample.timestamp(),
            "emitting sample"
        );

        self.last.store(Some(Arc::new(sample.clone())));
        self.listeners.for_each(|listener| listener(&sample));
    }
}

/// Builder for configuring a [`TimeSampler`].
#[must_use = "the builder does nothing until build() is called"]
pub struct TimeSamplerBuilder<T> {
    probe: Box<dyn SampledProbe<T>>,
    interval: Duration,
    scheduler: Option<Scheduler>,
}

impl<T> TimeSamplerBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Sets how often samples are taken, in whole milliseconds.
    ///
    /// Default is one second.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the scheduler that drives the ticks.
    ///
    /// Default is [`Scheduler::shared()`].
    pub fn scheduler(mut self, scheduler: &Scheduler) -> Self {
        self.scheduler = Some(scheduler.clone());
        self
    }

    /// Builds the time sampler. It stays inert until the first listener subscribes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroInterval`] if the interval is shorter than one millisecond.
    pub fn build(self) -> Result<TimeSampler<T>> {
        if self.interval < Duration::from_millis(1) {
            return Err(Error::ZeroInterval);
        }

        Ok(TimeSampler::from_source(Source::Scheduled(Scheduled {
            probe: self.probe,
            interval: self.interval,
            scheduler: self.scheduler.unwrap_or_else(Scheduler::shared),
            tick_lock: ReentrantMutex::new(()),
            sampler: Mutex::new(None),
            task: Mutex::new(None),
        })))
    }
}

impl<T> fmt::Debug for TimeSamplerBuilder<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("interval", &self.interval)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::{self, JoinHandle};

    use static_assertions::assert_impl_all;
    use testing::with_watchdog;

    use super::*;
    use crate::{Delta, ManualProbe, ManualScheduler, SampledFn, Timer};

    assert_impl_all!(TimeSampler<u64>: Send, Sync, Clone);

    fn recorder<T>() -> (Arc<Mutex<Vec<Sample<T>>>>, impl Fn(&Sample<T>) + Send + Sync + 'static)
    where
        T: Clone + Send + 'static,
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        (seen, move |sample: &Sample<T>| {
            seen_clone.lock().push(sample.clone());
        })
    }

    struct Tracked {
        released: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_probe() -> (Arc<AtomicUsize>, Arc<AtomicUsize>, impl SampledProbe<u32>) {
        let created = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));

        let created_clone = Arc::clone(&created);
        let released_clone = Arc::clone(&released);

        let probe = SampledFn::new(move || {
            created_clone.fetch_add(1, Ordering::SeqCst);
            let tracked = Tracked {
                released: Arc::clone(&released_clone),
            };

            move || {
                let _keep_alive = &tracked;
                7_u32
            }
        });

        (created, released, probe)
    }

    #[test]
    fn zero_interval_is_rejected() {
        let result = TimeSampler::builder(ManualProbe::new(1))
            .interval(Duration::from_micros(10))
            .build();

        assert!(matches!(result, Err(Error::ZeroInterval)));
    }

    #[test]
    fn inert_until_first_listener() {
        let manual = ManualScheduler::new(0);
        let (created, released, probe) = counting_probe();

        let sampler = TimeSampler::builder(probe)
            .scheduler(&manual.scheduler())
            .build()
            .unwrap();

        manual.advance(Duration::from_secs(5));
        assert!(!sampler.is_running());
        assert_eq!(created.load(Ordering::SeqCst), 0);
        assert!(!manual.scheduler().is_running());

        let (seen, listener) = recorder();
        let handle = sampler.subscribe(listener);

        assert!(sampler.is_running());
        assert!(manual.scheduler().is_running());
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock(), vec![Sample::new(5_000, 7)]);

        drop(handle);

        assert!(!sampler.is_running());
        assert!(!manual.scheduler().is_running());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ticks_follow_the_interval() {
        let manual = ManualScheduler::new(500);
        let probe = ManualProbe::new(0_i32);

        let sampler = TimeSampler::builder(probe.clone())
            .interval(Duration::from_secs(1))
            .scheduler(&manual.scheduler())
            .build()
            .unwrap();

        let (seen, listener) = recorder();
        let _handle = sampler.subscribe(listener);

        probe.set(1);
        manual.advance(Duration::from_millis(500));
        probe.set(2);
        manual.advance(Duration::from_secs(1));

        assert_eq!(
            *seen.lock(),
            vec![Sample::new(500, 0), Sample::new(1_000, 1), Sample::new(2_000, 2)]
        );
        assert_eq!(sampler.last_sample(), Some(Sample::new(2_000, 2)));
    }

    #[test]
    fn restart_creates_a_fresh_sampler() {
        let manual = ManualScheduler::new(0);
        let (created, released, probe) = counting_probe();

        let sampler = TimeSampler::builder(probe)
            .scheduler(&manual.scheduler())
            .build()
            .unwrap();

        drop(sampler.subscribe(|_| {}));
        drop(sampler.subscribe(|_| {}));

        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn second_listener_does_not_restart() {
        let manual = ManualScheduler::new(0);
        let (created, _released, probe) = counting_probe();

        let sampler = TimeSampler::builder(probe)
            .scheduler(&manual.scheduler())
            .build()
            .unwrap();

        let first = sampler.subscribe(|_| {});
        let second = sampler.subscribe(|_| {});
        assert_eq!(sampler.listener_count(), 2);

        drop(first);
        assert!(sampler.is_running());

        drop(second);
        assert!(!sampler.is_running());
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_does_not_stop_ticks() {
        let manual = ManualScheduler::new(0);

        let sampler = TimeSampler::builder(ManualProbe::new(1_u8))
            .interval(Duration::from_millis(100))
            .scheduler(&manual.scheduler())
            .build()
            .unwrap();

        let _bad = sampler.subscribe(|_| panic!("listener failure"));
        let (seen, listener) = recorder();
        let _good = sampler.subscribe(listener);

        manual.advance(Duration::from_millis(300));

        assert_eq!(seen.lock().len(), 3);
    }

    #[test]
    fn current_pulls_while_inert() {
        let manual = ManualScheduler::new(0);
        let probe = ManualProbe::new(10_u64);

        let sampler = TimeSampler::builder(probe.clone())
            .scheduler(&manual.scheduler())
            .build()
            .unwrap();

        assert_eq!(sampler.current(), Some(10));
        probe.set(11);
        assert_eq!(sampler.current(), Some(11));
        assert!(!sampler.is_running());
    }

    #[test]
    fn inert_pulls_reuse_one_sampler() {
        let manual = ManualScheduler::new(0);
        let (created, released, probe) = counting_probe();

        let sampler = TimeSampler::builder(probe)
            .scheduler(&manual.scheduler())
            .build()
            .unwrap();

        assert_eq!(sampler.current(), Some(7));
        assert_eq!(sampler.current(), Some(7));
        assert_eq!(created.load(Ordering::SeqCst), 1);

        // Starting adopts the sampler the pulls created; stopping releases it.
        drop(sampler.subscribe(|_| {}));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pulling_a_timer_keeps_its_interval_open() {
        let manual = ManualScheduler::new(0);
        let timer = Timer::new();

        let sampler = TimeSampler::builder(timer.clone())
            .scheduler(&manual.scheduler())
            .build()
            .unwrap();

        timer.record(Duration::from_millis(3));
        timer.record(Duration::from_millis(5));

        assert_eq!(sampler.current().map(|snapshot| snapshot.count()), Some(2));
        assert_eq!(sampler.current().map(|snapshot| snapshot.count()), Some(2));
        assert_eq!(timer.peek().count(), 2);
    }

    #[test]
    fn pulling_a_delta_reports_increase_since_first_pull() {
        let manual = ManualScheduler::new(0);
        let requests = ManualProbe::new(1_000_i64);

        let sampler = TimeSampler::builder(Delta::new(requests.clone()))
            .scheduler(&manual.scheduler())
            .build()
            .unwrap();

        let mut pulled = Vec::new();

        for _ in 0..3 {
            pulled.push(sampler.current());
            requests.set(requests.get() + 100);
        }

        assert_eq!(pulled, vec![Some(0), Some(100), Some(200)]);
    }

    #[test]
    fn restart_during_in_flight_tick_does_not_deadlock() {
        with_watchdog(|| {
            let manual = ManualScheduler::new(0);

            let sampler = TimeSampler::builder(ManualProbe::new(1_u8))
                .interval(Duration::from_secs(1))
                .scheduler(&manual.scheduler())
                .build()
                .unwrap();

            let own = Arc::new(Mutex::new(None::<ListenerHandle>));
            let late = Arc::new(Mutex::new(None::<ListenerHandle>));
            let restarter = Arc::new(Mutex::new(None::<JoinHandle<ListenerHandle>>));
            let calls = Arc::new(AtomicUsize::new(0));

            let listener = {
                let sampler = sampler.clone();
                let own = Arc::clone(&own);
                let late = Arc::clone(&late);
                let restarter = Arc::clone(&restarter);
                let calls = Arc::clone(&calls);

                move |_: &Sample<u8>| {
                    // Only act on the first scheduled tick, not on the immediate sample.
                    if calls.fetch_add(1, Ordering::SeqCst) != 1 {
                        return;
                    }

                    // The last listener leaves while this tick is still in flight.
                    drop(own.lock().take());

                    // Another thread restarts the sampler and has to wait for this tick.
                    let other = sampler.clone();
                    *restarter.lock() = Some(thread::spawn(move || other.subscribe(|_| {})));
                    thread::sleep(Duration::from_millis(50));

                    // Subscribing from within the tick needs the registry lock.
                    *late.lock() = Some(sampler.subscribe(|_| {}));
                }
            };

            *own.lock() = Some(sampler.subscribe(listener));
            manual.advance(Duration::from_secs(1));

            let restarted = restarter.lock().take().unwrap().join().unwrap();

            assert!(sampler.is_running());
            assert_eq!(sampler.listener_count(), 2);

            drop(restarted);
            drop(late.lock().take());
            assert!(!sampler.is_running());
        });
    }

    #[test]
    fn listener_unsubscribing_during_first_sample_stops_sampler() {
        let manual = ManualScheduler::new(0);

        let sampler = TimeSampler::builder(ManualProbe::new(1_u8))
            .scheduler(&manual.scheduler())
            .build()
            .unwrap();

        let slot = Arc::new(Mutex::new(None::<ListenerHandle>));
        let slot_clone = Arc::clone(&slot);

        // The handle is not in the slot yet during the immediate sample, so the listener
        // only removes itself on the first scheduled tick.
        let handle = sampler.subscribe(move |_| {
            drop(slot_clone.lock().take());
        });
        *slot.lock() = Some(handle);

        manual.advance(Duration::from_secs(1));

        assert!(!sampler.is_running());
        assert!(!manual.scheduler().is_running());
    }

    #[test]
    fn derived_sampler_transforms_and_follows_lifecycle() {
        let manual = ManualScheduler::new(0);
        let probe = ManualProbe::new(2_i64);

        let source = TimeSampler::builder(probe.clone())
            .interval(Duration::from_secs(1))
            .scheduler(&manual.scheduler())
            .build()
            .unwrap();

        let doubled = source.apply(crate::Map::new(|value: &i64| value * 2));
        assert!(!source.is_running());

        let (seen, listener) = recorder();
        let handle = doubled.subscribe(listener);
        assert!(source.is_running());
        assert!(doubled.is_running());

        probe.set(5);
        manual.advance(Duration::from_secs(1));

        assert_eq!(*seen.lock(), vec![Sample::new(0, 4), Sample::new(1_000, 10)]);

        drop(handle);
        assert!(!doubled.is_running());
        assert!(!source.is_running());
    }

    #[test]
    fn derived_sampler_suppresses_repeated_timestamps() {
        let manual = ManualScheduler::new(0);
        let probe = ManualProbe::new(1_u32);

        let source = TimeSampler::builder(probe.clone())
            .interval(Duration::from_secs(1))
            .scheduler(&manual.scheduler())
            .build()
            .unwrap();

        let per_ten_seconds = source.apply(crate::BucketedAverage::new(Duration::from_secs(10)));

        let (seen, listener) = recorder();
        let _handle = per_ten_seconds.subscribe(listener);

        manual.advance(Duration::from_secs(25));

        let timestamps: Vec<_> = seen.lock().iter().map(Sample::timestamp).collect();
        assert_eq!(timestamps, vec![0, 10_000, 20_000]);
    }

    #[test]
    fn each_derived_sampler_has_its_own_state() {
        let manual = ManualScheduler::new(0);

        let source = TimeSampler::builder(ManualProbe::new(1_u32))
            .interval(Duration::from_secs(1))
            .scheduler(&manual.scheduler())
            .build()
            .unwrap();

        let first = source.apply(crate::CumulativeSum);
        let (first_seen, first_listener) = recorder();
        let _first = first.subscribe(first_listener);

        manual.advance(Duration::from_secs(2));

        let second = source.apply(crate::CumulativeSum);
        let (second_seen, second_listener) = recorder();
        let _second = second.subscribe(second_listener);

        manual.advance(Duration::from_secs(1));

        let first_last = *first_seen.lock().last().unwrap().value();
        let second_last = *second_seen.lock().last().unwrap().value();

        assert_eq!(first_last, 4.0);
        assert_eq!(second_last, 1.0);
    }
}
