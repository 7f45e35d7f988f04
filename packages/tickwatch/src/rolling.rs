//! Time-bounded rolling windows and the aggregations computed over them.

use std::any::type_name;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use num_traits::AsPrimitive;

use crate::clock::millis_i64;
use crate::{
    PercentileSnapshot, Sample, SampleOperation, SampleOperationExecutor, TimeSampler,
};

/// A reusable template for an aggregation over a rolling window of samples.
///
/// Like [`SampleOperation`], the template is stateless and every window gets its own
/// executor.
pub trait SampleListOperation<I, O>: Send + Sync + 'static {
    /// Creates an executor with fresh state.
    fn executor(&self) -> Box<dyn SampleListExecutor<I, O>>;
}

/// The stateful half of a [`SampleListOperation`].
///
/// The window notifies the executor of every sample entering and leaving it, passing the
/// retained samples as they are after the change.
pub trait SampleListExecutor<I, O>: Send + 'static {
    /// A sample was appended to the window.
    fn add(&mut self, sample: &Sample<I>, window: &VecDeque<Sample<I>>);

    /// The oldest sample was evicted from the window.
    fn remove(&mut self, sample: &Sample<I>, window: &VecDeque<Sample<I>>);

    /// The aggregate over the current window.
    fn get(&self) -> O;
}

/// Aggregates the samples of the last `duration` with a [`SampleListOperation`].
///
/// The window is bounded by time, not by count. When a sample arrives at time `t`, every
/// retained sample older than `t - duration` is evicted, oldest first. The new sample is
/// then appended and the aggregate is emitted with timestamp `t`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use tickwatch::{RollingWindow, Sample, SampleOperation, WindowAverage};
///
/// let window = RollingWindow::new(Duration::from_secs(10), WindowAverage);
/// let mut executor = SampleOperation::<u32, f64>::executor(&window);
///
/// assert_eq!(*executor.apply(&Sample::new(0, 10)).value(), 10.0);
/// assert_eq!(*executor.apply(&Sample::new(5_000, 20)).value(), 15.0);
///
/// // The first sample is now older than ten seconds.
/// assert_eq!(*executor.apply(&Sample::new(10_001, 30)).value(), 25.0);
/// ```
pub struct RollingWindow<L, I, O> {
    duration_millis: i64,
    operation: L,
    _types: PhantomData<fn(I) -> O>,
}

impl<L, I, O> RollingWindow<L, I, O>
where
    L: SampleListOperation<I, O>,
{
    /// Creates a window of the given length.
    #[must_use]
    pub fn new(duration: Duration, operation: L) -> Self {
        Self {
            duration_millis: millis_i64(duration),
            operation,
            _types: PhantomData,
        }
    }
}

impl<L, I, O> fmt::Debug for RollingWindow<L, I, O> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("duration_millis", &self.duration_millis)
            .finish_non_exhaustive()
    }
}

impl<L, I, O> SampleOperation<I, O> for RollingWindow<L, I, O>
where
    L: SampleListOperation<I, O>,
    I: Clone + Send + 'static,
    O: 'static,
{
    fn executor(&self) -> Box<dyn SampleOperationExecutor<I, O>> {
        Box::new(RollingExecutor {
            duration_millis: self.duration_millis,
            window: VecDeque::new(),
            operation: self.operation.executor(),
        })
    }
}

struct RollingExecutor<I, O> {
    duration_millis: i64,
    window: VecDeque<Sample<I>>,
    operation: Box<dyn SampleListExecutor<I, O>>,
}

impl<I, O> SampleOperationExecutor<I, O> for RollingExecutor<I, O>
where
    I: Clone + Send + 'static,
    O: 'static,
{
    fn apply(&mut self, sample: &Sample<I>) -> Sample<O> {
        let now = sample.timestamp();
        let cutoff = now.saturating_sub(self.duration_millis);

        while self
            .window
            .front()
            .is_some_and(|oldest| oldest.timestamp() < cutoff)
        {
            if let Some(oldest) = self.window.pop_front() {
                self.operation.remove(&oldest, &self.window);
            }
        }

        self.window.push_back(sample.clone());

        if let Some(newest) = self.window.back() {
            self.operation.add(newest, &self.window);
        }

        Sample::new(now, self.operation.get())
    }
}

impl<T> TimeSampler<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a derived time sampler that aggregates the samples of the last `duration`.
    ///
    /// Shorthand for `apply(RollingWindow::new(duration, operation))`.
    #[must_use]
    pub fn rolling_over<O, L>(&self, duration: Duration, operation: L) -> TimeSampler<O>
    where
        O: Clone + Send + Sync + 'static,
        L: SampleListOperation<T, O>,
    {
        self.apply(RollingWindow::new(duration, operation))
    }
}

/// Sum of the values in the window, maintained incrementally.
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowSum;

impl<I> SampleListOperation<I, f64> for WindowSum
where
    I: AsPrimitive<f64> + Send + Sync,
{
    fn executor(&self) -> Box<dyn SampleListExecutor<I, f64>> {
        Box::new(SumExecutor { sum: 0.0 })
    }
}

struct SumExecutor {
    sum: f64,
}

impl<I> SampleListExecutor<I, f64> for SumExecutor
where
    I: AsPrimitive<f64>,
{
    fn add(&mut self, sample: &Sample<I>, _window: &VecDeque<Sample<I>>) {
        self.sum += sample.value().as_();
    }

    fn remove(&mut self, sample: &Sample<I>, _window: &VecDeque<Sample<I>>) {
        self.sum -= sample.value().as_();
    }

    fn get(&self) -> f64 {
        self.sum
    }
}

/// Mean of the values in the window, maintained incrementally.
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowAverage;

impl<I> SampleListOperation<I, f64> for WindowAverage
where
    I: AsPrimitive<f64> + Send + Sync,
{
    fn executor(&self) -> Box<dyn SampleListExecutor<I, f64>> {
        Box::new(AverageExecutor { sum: 0.0, count: 0 })
    }
}

struct AverageExecutor {
    sum: f64,
    count: usize,
}

impl<I> SampleListExecutor<I, f64> for AverageExecutor
where
    I: AsPrimitive<f64>,
{
    fn add(&mut self, sample: &Sample<I>, _window: &VecDeque<Sample<I>>) {
        self.sum += sample.value().as_();
        self.count = self.count.saturating_add(1);
    }

    fn remove(&mut self, sample: &Sample<I>, _window: &VecDeque<Sample<I>>) {
        self.sum -= sample.value().as_();
        self.count = self.count.saturating_sub(1);
    }

    #[expect(
        clippy::cast_precision_loss,
        reason = "windows hold far fewer samples than f64 can count exactly"
    )]
    fn get(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }

        self.sum / self.count as f64
    }
}

#[derive(Clone, Copy, Debug)]
enum Extreme {
    Min,
    Max,
}

/// Smallest value in the window. Zero while the window is empty.
///
/// Recomputed by scanning the whole window on every new sample, which is cheap for the
/// short windows typical of monitoring but not meant for very long windows at high
/// sampling rates.
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowMin;

impl<I> SampleListOperation<I, f64> for WindowMin
where
    I: AsPrimitive<f64> + Send + Sync,
{
    fn executor(&self) -> Box<dyn SampleListExecutor<I, f64>> {
        Box::new(ExtremeExecutor {
            extreme: Extreme::Min,
            value: None,
        })
    }
}

/// Largest value in the window. Zero while the window is empty.
///
/// Recomputed by scanning the whole window on every new sample, with the same trade-off
/// as [`WindowMin`].
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowMax;

impl<I> SampleListOperation<I, f64> for WindowMax
where
    I: AsPrimitive<f64> + Send + Sync,
{
    fn executor(&self) -> Box<dyn SampleListExecutor<I, f64>> {
        Box::new(ExtremeExecutor {
            extreme: Extreme::Max,
            value: None,
        })
    }
}

struct ExtremeExecutor {
    extreme: Extreme,
    value: Option<f64>,
}

impl<I> SampleListExecutor<I, f64> for ExtremeExecutor
where
    I: AsPrimitive<f64>,
{
    fn add(&mut self, _sample: &Sample<I>, window: &VecDeque<Sample<I>>) {
        self.value = scan(window, self.extreme);
    }

    fn remove(&mut self, _sample: &Sample<I>, _window: &VecDeque<Sample<I>>) {
        // Every removal is followed by an add, which rescans.
    }

    fn get(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

/// Spread between the largest and smallest value in the window.
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowRange;

impl<I> SampleListOperation<I, f64> for WindowRange
where
    I: AsPrimitive<f64> + Send + Sync,
{
    fn executor(&self) -> Box<dyn SampleListExecutor<I, f64>> {
        Box::new(RangeExecutor { range: 0.0 })
    }
}

struct RangeExecutor {
    range: f64,
}

impl<I> SampleListExecutor<I, f64> for RangeExecutor
where
    I: AsPrimitive<f64>,
{
    fn add(&mut self, _sample: &Sample<I>, window: &VecDeque<Sample<I>>) {
        self.range = match (scan(window, Extreme::Max), scan(window, Extreme::Min)) {
            (Some(max), Some(min)) => max - min,
            _ => 0.0,
        };
    }

    fn remove(&mut self, _sample: &Sample<I>, _window: &VecDeque<Sample<I>>) {}

    fn get(&self) -> f64 {
        self.range
    }
}

fn scan<I>(window: &VecDeque<Sample<I>>, extreme: Extreme) -> Option<f64>
where
    I: AsPrimitive<f64>,
{
    let values = window.iter().map(|sample| sample.value().as_());

    match extreme {
        Extreme::Min => values.reduce(f64::min),
        Extreme::Max => values.reduce(f64::max),
    }
}

/// Combines the percentile snapshots in the window into one.
///
/// Intended for samples that each hold the values of one interval, such as the snapshots
/// a [`Timer`][crate::Timer] produces when sampled. The combined snapshot is maintained
/// by adding entering snapshots and removing evicted ones.
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowSnapshots;

impl SampleListOperation<PercentileSnapshot, PercentileSnapshot> for WindowSnapshots {
    fn executor(&self) -> Box<dyn SampleListExecutor<PercentileSnapshot, PercentileSnapshot>> {
        Box::new(SnapshotsExecutor { combined: None })
    }
}

struct SnapshotsExecutor {
    combined: Option<PercentileSnapshot>,
}

impl SampleListExecutor<PercentileSnapshot, PercentileSnapshot> for SnapshotsExecutor {
    fn add(
        &mut self,
        sample: &Sample<PercentileSnapshot>,
        _window: &VecDeque<Sample<PercentileSnapshot>>,
    ) {
        self.combined = Some(match &self.combined {
            Some(combined) => combined.add(sample.value()),
            None => sample.value().clone(),
        });
    }

    fn remove(
        &mut self,
        sample: &Sample<PercentileSnapshot>,
        _window: &VecDeque<Sample<PercentileSnapshot>>,
    ) {
        if let Some(combined) = &self.combined {
            self.combined = Some(combined.remove(sample.value()));
        }
    }

    fn get(&self) -> PercentileSnapshot {
        self.combined.clone().unwrap_or_default()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    #![allow(clippy::indexing_slicing, reason = "panic is fine in tests")]

    use std::sync::Arc;

    use parking_lot::Mutex;
    use testing::assert_close;

    use super::*;
    use crate::{
        BucketPercentileCounter, ManualProbe, ManualScheduler, PercentileCounter,
    };

    const WINDOW: Duration = Duration::from_secs(10);

    fn run<L>(operation: L, inputs: &[(i64, i64)]) -> Vec<f64>
    where
        L: SampleListOperation<i64, f64>,
    {
        let window: RollingWindow<L, i64, f64> = RollingWindow::new(WINDOW, operation);
        let mut executor = window.executor();

        inputs
            .iter()
            .map(|&(timestamp, value)| *executor.apply(&Sample::new(timestamp, value)).value())
            .collect()
    }

    #[test]
    fn average_evicts_by_time() {
        // t, t + D/2, then past t + D.
        let output = run(WindowAverage, &[(1_000, 10), (6_000, 20), (11_001, 60)]);

        assert_eq!(output, vec![10.0, 15.0, 40.0]);
    }

    #[test]
    fn sample_exactly_at_cutoff_is_retained() {
        let output = run(WindowSum, &[(1_000, 1), (11_000, 2)]);

        assert_eq!(output, vec![1.0, 3.0]);
    }

    #[test]
    fn retention_follows_time_not_count() {
        // A long gap evicts everything that came before it.
        let output = run(
            WindowSum,
            &[(0, 1), (1_000, 1), (2_000, 1), (3_000, 1), (60_000, 5)],
        );

        assert_eq!(output, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn min_max_range() {
        let inputs = [(0, 5), (1_000, 2), (2_000, 9), (11_500, 4)];

        assert_eq!(run(WindowMin, &inputs), vec![5.0, 2.0, 2.0, 4.0]);
        assert_eq!(run(WindowMax, &inputs), vec![5.0, 5.0, 9.0, 9.0]);
        assert_eq!(run(WindowRange, &inputs), vec![0.0, 3.0, 7.0, 5.0]);
    }

    #[test]
    fn snapshots_window_combines_and_differences() {
        let counter = BucketPercentileCounter::new([0, 10, 100]).unwrap();

        let window: RollingWindow<_, PercentileSnapshot, PercentileSnapshot> =
            RollingWindow::new(WINDOW, WindowSnapshots);
        let mut executor = window.executor();

        counter.add(5);
        counter.add(50);
        let first = executor.apply(&Sample::new(0, counter.take()));
        assert_eq!(first.value().count(), 2);

        counter.add(500);
        let second = executor.apply(&Sample::new(5_000, counter.take()));
        assert_eq!(second.value().count(), 3);
        assert_eq!(second.value().bucket_counts(), &[1, 1, 1]);

        counter.add(7);
        let third = executor.apply(&Sample::new(12_000, counter.take()));
        assert_eq!(third.value().count(), 2);
        assert_eq!(third.value().bucket_counts(), &[1, 0, 1]);
    }

    #[test]
    fn rolling_over_time_sampler() {
        let manual = ManualScheduler::new(0);
        let probe = ManualProbe::new(10_i64);

        let source = TimeSampler::builder(probe.clone())
            .interval(Duration::from_secs(5))
            .scheduler(&manual.scheduler())
            .build()
            .unwrap();

        let average = source.rolling_over(WINDOW, WindowAverage);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _handle = average.subscribe(move |sample| {
            seen_clone.lock().push(*sample.value());
        });

        // Samples: 0 -> 10, 5000 -> 20, 10000 -> 30, 15000 -> 30.
        probe.set(20);
        manual.advance(Duration::from_secs(5));
        probe.set(30);
        manual.advance(Duration::from_secs(10));

        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        assert_close(seen[1], 15.0);
        assert_close(seen[2], 20.0);

        // At 15000 the cutoff is 5000, so the sample at 0 is gone.
        assert_close(seen[3], 80.0 / 3.0);
    }
}
