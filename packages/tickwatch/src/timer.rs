//! Duration measurement with percentile tracking.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::{
    Clock, FakePercentileCounter, ListenerHandle, ListenerRegistry, PERCENTILE_UNKNOWN,
    PercentileCounter, PercentileSnapshot, SampledProbe, Sampler, SystemClock,
};

// Min and max are independent statistics; readers accept a momentarily skewed pair.
const EXTREMES_ORDERING: Ordering = Ordering::Relaxed;

// Stored in `min` while nothing has been recorded.
const NO_MIN: u64 = u64::MAX;

/// A callback notified of every measurement, with the wall-clock time of the stop in
/// milliseconds since the Unix epoch and the elapsed time in nanoseconds.
pub type TimerListener = dyn Fn(i64, u64) + Send + Sync;

/// Measures how long operations take.
///
/// Every measurement is recorded in a [`PercentileCounter`] together with a running minimum
/// and maximum. Measurements are made on the caller's thread and are safe to make from
/// any number of threads at once.
///
/// [`peek()`][Self::peek] reads the statistics accumulated so far. [`sample()`][Self::sample]
/// reads them and starts a new interval, which is how a periodically exported timer reports
/// per-interval statistics. A timer used as a [`SampledProbe`] is sampled this way.
///
/// Cloning yields another handle to the same timer.
///
/// # Example
///
/// ```
/// use tickwatch::Timer;
///
/// let timer = Timer::new();
///
/// {
///     let _stopwatch = timer.start();
///     // Timed work happens here.
/// } // Recorded when the stopwatch is dropped.
///
/// let elapsed = timer.start().stop();
///
/// let snapshot = timer.peek();
/// assert_eq!(snapshot.count(), 2);
/// assert!(snapshot.max().unwrap() >= elapsed);
/// ```
#[derive(Clone)]
pub struct Timer {
    core: Arc<TimerCore>,
}

struct TimerCore {
    counter: Arc<dyn PercentileCounter>,
    unit_nanos: u64,
    min_nanos: AtomicU64,
    max_nanos: AtomicU64,
    listeners: ListenerRegistry<TimerListener>,
    clock: Arc<dyn Clock>,
}

impl Timer {
    /// Creates a timer that records nanoseconds into a counter without buckets.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring a timer.
    #[cfg_attr(test, mutants::skip)] // Gets replaced with itself by different name, bad mutation.
    pub fn builder() -> TimerBuilder {
        TimerBuilder::new()
    }

    /// Starts measuring. The measurement is recorded when the stopwatch is stopped or dropped.
    pub fn start(&self) -> Stopwatch {
        Stopwatch {
            timer: self.clone(),
            started: Instant::now(),
            stopped: false,
        }
    }

    /// Measures how long `f` takes.
    pub fn time<R>(&self, f: impl FnOnce() -> R) -> R {
        let _stopwatch = self.start();
        f()
    }

    /// Records a measurement made elsewhere.
    pub fn record(&self, elapsed: Duration) {
        self.core.record(elapsed);
    }

    /// Registers a listener for every future measurement.
    pub fn subscribe<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(i64, u64) + Send + Sync + 'static,
    {
        self.core.listeners.add(Arc::new(listener))
    }

    /// The statistics of the current interval. Does not start a new interval.
    #[must_use]
    pub fn peek(&self) -> TimerSnapshot {
        self.core.snapshot()
    }

    /// The statistics of the current interval, after which a new interval starts.
    ///
    /// Measurements that complete while this runs may be attributed to either interval,
    /// or be partially lost from the percentile counter's buckets.
    #[must_use]
    pub fn sample(&self) -> TimerSnapshot {
        let snapshot = TimerSnapshot {
            percentiles: self.core.counter.get(),
            min_nanos: self.core.min_nanos.swap(NO_MIN, EXTREMES_ORDERING),
            max_nanos: self.core.max_nanos.swap(0, EXTREMES_ORDERING),
            unit_nanos: self.core.unit_nanos,
        };

        self.core.counter.reset();

        snapshot
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Timer {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("counter", &self.core.counter)
            .field("unit_nanos", &self.core.unit_nanos)
            .field("listeners", &self.core.listeners.len())
            .finish_non_exhaustive()
    }
}

impl SampledProbe<TimerSnapshot> for Timer {
    fn instantiate(&self) -> Box<dyn Sampler<TimerSnapshot>> {
        Box::new(IntervalSampler {
            timer: self.clone(),
        })
    }
}

// Each sample closes the timer's interval; peeking leaves it open.
struct IntervalSampler {
    timer: Timer,
}

impl Sampler<TimerSnapshot> for IntervalSampler {
    fn sample(&mut self) -> TimerSnapshot {
        self.timer.sample()
    }

    fn peek(&mut self) -> TimerSnapshot {
        self.timer.peek()
    }
}

impl TimerCore {
    fn record(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);

        let units = nanos.checked_div(self.unit_nanos).unwrap_or(nanos);
        self.counter.add(i64::try_from(units).unwrap_or(i64::MAX));

        // Lock-free read-modify-write; concurrent stops never lose an extreme.
        self.min_nanos.fetch_min(nanos, EXTREMES_ORDERING);
        self.max_nanos.fetch_max(nanos, EXTREMES_ORDERING);

        let now = self.clock.now_millis();
        self.listeners.for_each(|listener| listener(now, nanos));
    }

    fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            percentiles: self.counter.get(),
            min_nanos: self.min_nanos.load(EXTREMES_ORDERING),
            max_nanos: self.max_nanos.load(EXTREMES_ORDERING),
            unit_nanos: self.unit_nanos,
        }
    }
}

/// Builder for configuring a [`Timer`].
#[derive(Debug)]
#[must_use = "the builder does nothing until build() is called"]
pub struct TimerBuilder {
    counter: Option<Arc<dyn PercentileCounter>>,
    unit: Duration,
    clock: Arc<dyn Clock>,
}

impl TimerBuilder {
    fn new() -> Self {
        Self {
            counter: None,
            unit: Duration::from_nanos(1),
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the counter that measurements are recorded in.
    ///
    /// Default is a [`FakePercentileCounter`], which tracks count and total only.
    pub fn counter(mut self, counter: Arc<dyn PercentileCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Sets the unit measurements are recorded in, which is also the unit of the counter's
    /// bucket boundaries. Measurements are truncated to whole units.
    ///
    /// Default is one nanosecond. A zero unit is treated as one nanosecond.
    pub fn unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    /// Sets the wall clock used to timestamp listener notifications.
    ///
    /// Default is the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the timer.
    #[must_use]
    pub fn build(self) -> Timer {
        let unit_nanos = u64::try_from(self.unit.as_nanos())
            .unwrap_or(u64::MAX)
            .max(1);

        Timer {
            core: Arc::new(TimerCore {
                counter: self
                    .counter
                    .unwrap_or_else(|| Arc::new(FakePercentileCounter::new())),
                unit_nanos,
                min_nanos: AtomicU64::new(NO_MIN),
                max_nanos: AtomicU64::new(0),
                listeners: ListenerRegistry::new(),
                clock: self.clock,
            }),
        }
    }
}

/// An in-progress measurement. Records the elapsed time into its [`Timer`] when stopped
/// or dropped.
#[derive(Debug)]
#[must_use = "the measurement is recorded when the stopwatch is dropped"]
pub struct Stopwatch {
    timer: Timer,
    started: Instant,
    stopped: bool,
}

impl Stopwatch {
    /// Time elapsed since the stopwatch was started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Stops the measurement, records it and returns the elapsed time.
    #[expect(
        clippy::must_use_candidate,
        reason = "callers often stop a stopwatch only for the side effect of recording"
    )]
    pub fn stop(mut self) -> Duration {
        self.finish()
    }

    fn finish(&mut self) -> Duration {
        let elapsed = self.started.elapsed();
        self.stopped = true;
        self.timer.core.record(elapsed);
        elapsed
    }
}

impl Drop for Stopwatch {
    fn drop(&mut self) {
        if !self.stopped {
            self.finish();
        }
    }
}

/// The statistics of a [`Timer`] at one point in time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TimerSnapshot {
    percentiles: PercentileSnapshot,
    min_nanos: u64,
    max_nanos: u64,
    unit_nanos: u64,
}

impl TimerSnapshot {
    /// Number of measurements.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.percentiles.count()
    }

    /// Sum of all measurements, truncated to the timer's unit.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.units_to_duration(self.percentiles.total())
    }

    /// Mean measurement, or `None` if nothing was measured.
    #[must_use]
    pub fn mean(&self) -> Option<Duration> {
        let count = u32::try_from(self.count()).unwrap_or(u32::MAX);

        if count == 0 {
            return None;
        }

        self.total().checked_div(count)
    }

    /// Shortest measurement, or `None` if nothing was measured.
    #[must_use]
    pub fn min(&self) -> Option<Duration> {
        (self.min_nanos != NO_MIN).then(|| Duration::from_nanos(self.min_nanos))
    }

    /// Longest measurement, or `None` if nothing was measured.
    #[must_use]
    pub fn max(&self) -> Option<Duration> {
        (self.min_nanos != NO_MIN).then(|| Duration::from_nanos(self.max_nanos))
    }

    /// Estimated percentile, or `None` if it cannot be determined.
    ///
    /// See [`PercentileSnapshot::estimate_percentile()`].
    #[must_use]
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        match self.percentiles.estimate_percentile(percentile) {
            PERCENTILE_UNKNOWN => None,
            units => Some(self.units_to_duration(units)),
        }
    }

    /// The raw percentile counter snapshot, in the timer's unit.
    #[must_use]
    pub fn percentiles(&self) -> &PercentileSnapshot {
        &self.percentiles
    }

    fn units_to_duration(&self, units: i64) -> Duration {
        let units = u64::try_from(units).unwrap_or(0);
        Duration::from_nanos(units.saturating_mul(self.unit_nanos))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use parking_lot::Mutex;
    use static_assertions::assert_impl_all;
    use testing::with_watchdog;

    use super::*;
    use crate::{BucketPercentileCounter, ManualClock};

    assert_impl_all!(Timer: Send, Sync, Clone);
    assert_impl_all!(Stopwatch: Send);
    assert_impl_all!(TimerSnapshot: Send, Sync, Clone);

    #[test]
    fn empty_timer_has_no_extremes() {
        let snapshot = Timer::new().peek();

        assert_eq!(snapshot.count(), 0);
        assert_eq!(snapshot.min(), None);
        assert_eq!(snapshot.max(), None);
        assert_eq!(snapshot.mean(), None);
        assert_eq!(snapshot.percentile(50.0), None);
    }

    #[test]
    fn recorded_durations_feed_statistics() {
        let timer = Timer::new();

        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(30));
        timer.record(Duration::from_millis(20));

        let snapshot = timer.peek();
        assert_eq!(snapshot.count(), 3);
        assert_eq!(snapshot.total(), Duration::from_millis(60));
        assert_eq!(snapshot.mean(), Some(Duration::from_millis(20)));
        assert_eq!(snapshot.min(), Some(Duration::from_millis(10)));
        assert_eq!(snapshot.max(), Some(Duration::from_millis(30)));
    }

    #[test]
    fn peek_keeps_and_sample_resets() {
        let timer = Timer::new();
        timer.record(Duration::from_millis(5));

        assert_eq!(timer.peek().count(), 1);
        assert_eq!(timer.peek().count(), 1);

        let sampled = timer.sample();
        assert_eq!(sampled.count(), 1);
        assert_eq!(sampled.max(), Some(Duration::from_millis(5)));

        let after = timer.peek();
        assert_eq!(after.count(), 0);
        assert_eq!(after.min(), None);
    }

    #[test]
    fn unit_scales_counter_values() {
        let counter = Arc::new(BucketPercentileCounter::new([0, 10, 100]).unwrap());

        let timer = Timer::builder()
            .counter(Arc::clone(&counter) as Arc<dyn PercentileCounter>)
            .unit(Duration::from_millis(1))
            .build();

        timer.record(Duration::from_millis(5));
        timer.record(Duration::from_micros(50_500));

        let snapshot = timer.peek();
        assert_eq!(snapshot.percentiles().bucket_counts(), &[1, 1, 0]);
        assert_eq!(snapshot.total(), Duration::from_millis(55));
        assert_eq!(snapshot.percentile(50.0), Some(Duration::from_millis(10)));

        // Extremes keep full precision.
        assert_eq!(snapshot.max(), Some(Duration::from_micros(50_500)));
    }

    #[test]
    fn listeners_see_wall_clock_and_nanos() {
        let clock = Arc::new(ManualClock::new(42_000));
        let timer = Timer::builder().clock(clock).build();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _handle = timer.subscribe(move |wall_millis, nanos| {
            seen_clone.lock().push((wall_millis, nanos));
        });

        timer.record(Duration::from_micros(3));

        assert_eq!(*seen.lock(), vec![(42_000, 3_000)]);
    }

    #[test]
    fn stopwatch_records_on_drop_once() {
        let timer = Timer::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let _handle = timer.subscribe(move |_, _| {
            calls_clone.fetch_add(1, Ordering::Relaxed);
        });

        let elapsed = timer.start().stop();
        drop(timer.start());
        let value = timer.time(|| 5);

        assert_eq!(value, 5);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(timer.peek().count(), 3);
        assert!(timer.peek().max().unwrap() >= elapsed);
    }

    #[test]
    fn sampled_probe_samples_and_resets() {
        let timer = Timer::new();
        let mut sampler = timer.instantiate();

        timer.record(Duration::from_millis(1));
        assert_eq!(sampler.sample().count(), 1);
        assert_eq!(sampler.sample().count(), 0);
    }

    #[test]
    fn sampler_peek_leaves_interval_open() {
        let timer = Timer::new();
        let mut sampler = timer.instantiate();

        timer.record(Duration::from_millis(1));
        timer.record(Duration::from_millis(2));

        assert_eq!(sampler.peek().count(), 2);
        assert_eq!(sampler.peek().count(), 2);
        assert_eq!(timer.peek().count(), 2);
    }

    #[test]
    fn concurrent_measurements() {
        with_watchdog(|| {
            const THREADS: u64 = 8;

            let timer = Timer::new();
            let measured = Arc::new(Mutex::new(Vec::new()));

            let workers: Vec<_> = (0..THREADS)
                .map(|index| {
                    let timer = timer.clone();
                    let measured = Arc::clone(&measured);

                    thread::spawn(move || {
                        let stopwatch = timer.start();
                        thread::sleep(Duration::from_millis(index.saturating_add(1)));
                        let elapsed = stopwatch.stop();
                        measured.lock().push(elapsed);
                    })
                })
                .collect();

            for worker in workers {
                worker.join().unwrap();
            }

            let snapshot = timer.peek();
            let measured = measured.lock();

            assert_eq!(snapshot.count(), THREADS);

            let min = snapshot.min().unwrap();
            let max = snapshot.max().unwrap();

            for &elapsed in measured.iter() {
                assert!(min <= elapsed);
                assert!(elapsed <= max);
            }

            // Measurements are recorded at nanosecond precision.
            let sum: Duration = measured.iter().sum();
            assert_eq!(snapshot.total(), sum);
        });
    }
}
