//! Per-sample transforms applied to derived samplers.

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use num_traits::AsPrimitive;

use crate::Sample;
use crate::clock::millis_i64;

/// A reusable template for a one-in-one-out sample transform.
///
/// The template itself is stateless. Every attachment point (for example every
/// [`TimeSampler::apply()`][crate::TimeSampler::apply] call) gets its own executor from
/// [`executor()`][Self::executor], so accumulated state is never shared between two
/// derived samplers.
pub trait SampleOperation<I, O>: Send + Sync + 'static {
    /// Creates an executor with fresh state.
    fn executor(&self) -> Box<dyn SampleOperationExecutor<I, O>>;
}

/// The stateful half of a [`SampleOperation`].
pub trait SampleOperationExecutor<I, O>: Send + 'static {
    /// Consumes one input sample and produces one output sample.
    fn apply(&mut self, sample: &Sample<I>) -> Sample<O>;
}

/// Average of every value seen since the executor was created.
#[derive(Clone, Copy, Debug, Default)]
pub struct CumulativeAverage;

impl<I> SampleOperation<I, f64> for CumulativeAverage
where
    I: AsPrimitive<f64> + Send + Sync,
{
    fn executor(&self) -> Box<dyn SampleOperationExecutor<I, f64>> {
        Box::new(CumulativeAverageExecutor { sum: 0.0, count: 0 })
    }
}

struct CumulativeAverageExecutor {
    sum: f64,
    count: u64,
}

impl<I> SampleOperationExecutor<I, f64> for CumulativeAverageExecutor
where
    I: AsPrimitive<f64>,
{
    #[expect(
        clippy::cast_precision_loss,
        reason = "sample counts stay far below the point where f64 loses integer precision"
    )]
    fn apply(&mut self, sample: &Sample<I>) -> Sample<f64> {
        self.sum += sample.value().as_();
        self.count = self.count.saturating_add(1);

        Sample::new(sample.timestamp(), self.sum / self.count as f64)
    }
}

/// Sum of every value seen since the executor was created.
#[derive(Clone, Copy, Debug, Default)]
pub struct CumulativeSum;

impl<I> SampleOperation<I, f64> for CumulativeSum
where
    I: AsPrimitive<f64> + Send + Sync,
{
    fn executor(&self) -> Box<dyn SampleOperationExecutor<I, f64>> {
        Box::new(CumulativeSumExecutor { sum: 0.0 })
    }
}

struct CumulativeSumExecutor {
    sum: f64,
}

impl<I> SampleOperationExecutor<I, f64> for CumulativeSumExecutor
where
    I: AsPrimitive<f64>,
{
    fn apply(&mut self, sample: &Sample<I>) -> Sample<f64> {
        self.sum += sample.value().as_();

        Sample::new(sample.timestamp(), self.sum)
    }
}

/// Difference between each value and the one before it. The first result is zero.
#[derive(Clone, Copy, Debug, Default)]
pub struct Change;

impl<I> SampleOperation<I, f64> for Change
where
    I: AsPrimitive<f64> + Send + Sync,
{
    fn executor(&self) -> Box<dyn SampleOperationExecutor<I, f64>> {
        Box::new(ChangeExecutor { previous: None })
    }
}

struct ChangeExecutor {
    previous: Option<f64>,
}

impl<I> SampleOperationExecutor<I, f64> for ChangeExecutor
where
    I: AsPrimitive<f64>,
{
    fn apply(&mut self, sample: &Sample<I>) -> Sample<f64> {
        let current = sample.value().as_();
        let change = self.previous.map_or(0.0, |previous| current - previous);
        self.previous = Some(current);

        Sample::new(sample.timestamp(), change)
    }
}

/// Ratio between each value and the one before it.
///
/// The first result is `1.0`, as is the ratio between two zeros. A non-zero value
/// following a zero yields an infinite ratio.
#[derive(Clone, Copy, Debug, Default)]
pub struct FractionalChange;

impl<I> SampleOperation<I, f64> for FractionalChange
where
    I: AsPrimitive<f64> + Send + Sync,
{
    fn executor(&self) -> Box<dyn SampleOperationExecutor<I, f64>> {
        Box::new(FractionalChangeExecutor { previous: None })
    }
}

struct FractionalChangeExecutor {
    previous: Option<f64>,
}

impl<I> SampleOperationExecutor<I, f64> for FractionalChangeExecutor
where
    I: AsPrimitive<f64>,
{
    fn apply(&mut self, sample: &Sample<I>) -> Sample<f64> {
        let current = sample.value().as_();

        let ratio = match self.previous {
            None => 1.0,
            Some(previous) if previous == 0.0 && current == 0.0 => 1.0,
            Some(previous) => current / previous,
        };

        self.previous = Some(current);

        Sample::new(sample.timestamp(), ratio)
    }
}

/// Linear transform `value * factor + offset`, optionally rounded.
///
/// # Example
///
/// ```
/// use tickwatch::{Sample, SampleOperation, Scale};
///
/// // Bytes to megabytes with two decimals.
/// let scale = Scale::divide(1_048_576.0).round_to(2);
/// let mut executor = SampleOperation::<u64, f64>::executor(&scale);
///
/// let output = executor.apply(&Sample::new(0, 5_000_000_u64));
/// assert_eq!(*output.value(), 4.77);
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Scale {
    factor: f64,
    offset: f64,
    decimals: Option<u32>,
}

impl Scale {
    /// `value * factor + offset`.
    #[must_use]
    pub fn linear(factor: f64, offset: f64) -> Self {
        Self {
            factor,
            offset,
            decimals: None,
        }
    }

    /// `value * factor`.
    #[must_use]
    pub fn multiply(factor: f64) -> Self {
        Self::linear(factor, 0.0)
    }

    /// `value / divisor`.
    #[must_use]
    pub fn divide(divisor: f64) -> Self {
        Self::linear(divisor.recip(), 0.0)
    }

    /// Rounds results to the given number of decimal places.
    #[must_use]
    pub fn round_to(mut self, decimals: u32) -> Self {
        self.decimals = Some(decimals);
        self
    }

    /// Applies the transform to one value.
    #[must_use]
    pub fn transform(&self, value: f64) -> f64 {
        let scaled = value.mul_add(self.factor, self.offset);

        match self.decimals {
            Some(decimals) => {
                let multiplier = 10_f64.powi(i32::try_from(decimals).unwrap_or(i32::MAX));
                (scaled * multiplier).round() / multiplier
            }
            None => scaled,
        }
    }
}

impl<I> SampleOperation<I, f64> for Scale
where
    I: AsPrimitive<f64> + Send + Sync,
{
    fn executor(&self) -> Box<dyn SampleOperationExecutor<I, f64>> {
        Box::new(*self)
    }
}

impl<I> SampleOperationExecutor<I, f64> for Scale
where
    I: AsPrimitive<f64>,
{
    fn apply(&mut self, sample: &Sample<I>) -> Sample<f64> {
        Sample::new(sample.timestamp(), self.transform(sample.value().as_()))
    }
}

/// Stateless value mapping.
///
/// ```
/// use tickwatch::{Map, Sample, SampleOperation};
///
/// let as_text = Map::new(|bytes: &u64| format!("{bytes} B"));
/// let mut executor = as_text.executor();
///
/// assert_eq!(*executor.apply(&Sample::new(0, 42)).value(), "42 B");
/// ```
pub struct Map<F, I, O> {
    f: Arc<F>,
    _types: PhantomData<fn(I) -> O>,
}

impl<F, I, O> Map<F, I, O>
where
    F: Fn(&I) -> O + Send + Sync + 'static,
{
    /// Wraps a mapping function.
    #[must_use]
    pub fn new(f: F) -> Self {
        Self {
            f: Arc::new(f),
            _types: PhantomData,
        }
    }
}

impl<F, I, O> fmt::Debug for Map<F, I, O> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>()).finish_non_exhaustive()
    }
}

impl<F, I, O> SampleOperation<I, O> for Map<F, I, O>
where
    F: Fn(&I) -> O + Send + Sync + 'static,
    I: 'static,
    O: 'static,
{
    fn executor(&self) -> Box<dyn SampleOperationExecutor<I, O>> {
        Box::new(MapExecutor {
            f: Arc::clone(&self.f),
            _types: PhantomData,
        })
    }
}

struct MapExecutor<F, I, O> {
    f: Arc<F>,
    _types: PhantomData<fn(I) -> O>,
}

impl<F, I, O> SampleOperationExecutor<I, O> for MapExecutor<F, I, O>
where
    F: Fn(&I) -> O + Send + Sync + 'static,
    I: 'static,
    O: 'static,
{
    fn apply(&mut self, sample: &Sample<I>) -> Sample<O> {
        Sample::new(sample.timestamp(), (self.f)(sample.value()))
    }
}

/// Averages the samples that fall into each fixed-length accounting period.
///
/// Periods are aligned to multiples of their length since the Unix epoch. Each output
/// carries the start of its period as the timestamp and the average of the period's
/// samples so far as the value. Because a derived sampler only re-emits when the timestamp
/// changes, a sampler built with this operation emits once per period.
#[derive(Clone, Copy, Debug)]
pub struct BucketedAverage {
    period_millis: i64,
}

impl BucketedAverage {
    /// Creates the operation. Periods shorter than a millisecond count as one millisecond.
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period_millis: millis_i64(period).max(1),
        }
    }
}

impl<I> SampleOperation<I, f64> for BucketedAverage
where
    I: AsPrimitive<f64> + Send + Sync,
{
    fn executor(&self) -> Box<dyn SampleOperationExecutor<I, f64>> {
        Box::new(BucketedAverageExecutor {
            period_millis: self.period_millis,
            period_start: None,
            sum: 0.0,
            count: 0,
        })
    }
}

struct BucketedAverageExecutor {
    period_millis: i64,
    period_start: Option<i64>,
    sum: f64,
    count: u64,
}

impl<I> SampleOperationExecutor<I, f64> for BucketedAverageExecutor
where
    I: AsPrimitive<f64>,
{
    #[expect(
        clippy::cast_precision_loss,
        reason = "per-period sample counts are tiny"
    )]
    fn apply(&mut self, sample: &Sample<I>) -> Sample<f64> {
        let timestamp = sample.timestamp();
        let period_start = timestamp.saturating_sub(timestamp.rem_euclid(self.period_millis));

        if self.period_start != Some(period_start) {
            self.period_start = Some(period_start);
            self.sum = 0.0;
            self.count = 0;
        }

        self.sum += sample.value().as_();
        self.count = self.count.saturating_add(1);

        Sample::new(period_start, self.sum / self.count as f64)
    }
}
