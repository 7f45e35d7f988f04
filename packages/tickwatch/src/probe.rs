//! Sources of values: stateless probes and stateful samplers.

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

/// An on-demand accessor producing one value per call.
///
/// Probes are stateless from the caller's point of view: calling one twice in a row
/// returns the current value twice, not a difference. Any `Fn() -> T` closure is a probe.
pub trait Probe<T>: Send + Sync + 'static {
    /// Reads the current value.
    fn probe(&self) -> T;
}

impl<T, F> Probe<T> for F
where
    F: Fn() -> T + Send + Sync + 'static,
{
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    fn probe(&self) -> T {
        self()
    }
}

/// A running, stateful value source created from a [`SampledProbe`].
///
/// A sampler is created once, sampled repeatedly and released by dropping it. Any
/// `FnMut() -> T` closure is a sampler.
pub trait Sampler<T>: Send + 'static {
    /// Reads a value. May update internal state used by the next call.
    fn sample(&mut self) -> T;

    /// Reads the value [`sample()`][Self::sample] would return, without closing the
    /// interval it reports on.
    ///
    /// Used for on-demand pulls. Samplers whose `sample()` resets or advances state
    /// override this; the default simply samples.
    fn peek(&mut self) -> T {
        self.sample()
    }
}

impl<T, F> Sampler<T> for F
where
    F: FnMut() -> T + Send + 'static,
{
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    fn sample(&mut self) -> T {
        self()
    }
}

/// A template for [`Sampler`] instances.
///
/// One template may back many samplers at once, each with its own independent state.
/// A [`TimeSampler`][crate::TimeSampler] instantiates a sampler when it starts and drops
/// it when it stops.
pub trait SampledProbe<T>: Send + Sync + 'static {
    /// Creates a new sampler with fresh state.
    fn instantiate(&self) -> Box<dyn Sampler<T>>;
}

impl<T, P> SampledProbe<T> for Arc<P>
where
    P: SampledProbe<T> + ?Sized,
{
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    fn instantiate(&self) -> Box<dyn Sampler<T>> {
        self.as_ref().instantiate()
    }
}

/// A value set by the application and read by probes and samplers.
///
/// Cloning yields another handle to the same value.
///
/// # Example
///
/// ```
/// use tickwatch::{ManualProbe, Probe};
///
/// let queue_depth = ManualProbe::new(0_u64);
/// queue_depth.set(17);
///
/// assert_eq!(queue_depth.probe(), 17);
/// ```
pub struct ManualProbe<T> {
    value: Arc<Mutex<T>>,
}

impl<T> ManualProbe<T>
where
    T: Clone + Send + 'static,
{
    /// Creates a probe holding `initial`.
    #[must_use]
    pub fn new(initial: T) -> Self {
        Self {
            value: Arc::new(Mutex::new(initial)),
        }
    }

    /// Replaces the value.
    pub fn set(&self, value: T) {
        *self.value.lock() = value;
    }

    /// Reads the value.
    #[must_use]
    pub fn get(&self) -> T {
        self.value.lock().clone()
    }
}

impl<T> Clone for ManualProbe<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
        }
    }
}

impl<T> fmt::Debug for ManualProbe<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("value", &*self.value.lock())
            .finish()
    }
}

impl<T> Probe<T> for ManualProbe<T>
where
    T: Clone + Send + 'static,
{
    fn probe(&self) -> T {
        self.get()
    }
}

impl<T> SampledProbe<T> for ManualProbe<T>
where
    T: Clone + Send + 'static,
{
    fn instantiate(&self) -> Box<dyn Sampler<T>> {
        let probe = self.clone();
        Box::new(move || probe.get())
    }
}

/// Adapts a stateless [`Probe`] into a [`SampledProbe`] whose samplers simply call it.
pub struct Polled<P, T> {
    probe: Arc<P>,
    _value: PhantomData<fn() -> T>,
}

impl<P, T> Polled<P, T>
where
    P: Probe<T>,
{
    /// Wraps a probe.
    #[must_use]
    pub fn new(probe: P) -> Self {
        Self {
            probe: Arc::new(probe),
            _value: PhantomData,
        }
    }
}

impl<P, T> fmt::Debug for Polled<P, T> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>()).finish_non_exhaustive()
    }
}

impl<P, T> SampledProbe<T> for Polled<P, T>
where
    P: Probe<T>,
    T: 'static,
{
    fn instantiate(&self) -> Box<dyn Sampler<T>> {
        let probe = Arc::clone(&self.probe);
        Box::new(move || probe.probe())
    }
}

/// Turns an ever-increasing counter into per-sample increments.
///
/// Every sampler remembers the reading it last saw, so two samplers created from the same
/// `Delta` report independent increments. The first reading of each sampler is zero.
/// [`peek()`][Sampler::peek] reports the increase since the last sample without moving
/// the baseline.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicI64, Ordering};
///
/// use tickwatch::{Delta, SampledProbe};
///
/// let requests = Arc::new(AtomicI64::new(100));
///
/// let requests_clone = Arc::clone(&requests);
/// let delta = Delta::new(move || requests_clone.load(Ordering::Relaxed));
///
/// let mut sampler = delta.instantiate();
/// assert_eq!(sampler.sample(), 0);
///
/// requests.fetch_add(5, Ordering::Relaxed);
/// assert_eq!(sampler.peek(), 5);
///
/// requests.fetch_add(5, Ordering::Relaxed);
/// assert_eq!(sampler.sample(), 10);
/// assert_eq!(sampler.sample(), 0);
/// ```
pub struct Delta<P> {
    counter: Arc<P>,
}

impl<P> Delta<P>
where
    P: Probe<i64>,
{
    /// Wraps a counter probe.
    #[must_use]
    pub fn new(counter: P) -> Self {
        Self {
            counter: Arc::new(counter),
        }
    }
}

impl<P> fmt::Debug for Delta<P> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>()).finish_non_exhaustive()
    }
}

impl<P> SampledProbe<i64> for Delta<P>
where
    P: Probe<i64>,
{
    fn instantiate(&self) -> Box<dyn Sampler<i64>> {
        Box::new(DeltaSampler {
            counter: Arc::clone(&self.counter),
            baseline: None,
        })
    }
}

struct DeltaSampler<P> {
    counter: Arc<P>,
    baseline: Option<i64>,
}

impl<P> DeltaSampler<P>
where
    P: Probe<i64>,
{
    fn increase(&mut self) -> (i64, i64) {
        let current = self.counter.probe();

        // The very first reading only establishes the baseline.
        let baseline = *self.baseline.get_or_insert(current);

        (current, current.saturating_sub(baseline))
    }
}

impl<P> Sampler<i64> for DeltaSampler<P>
where
    P: Probe<i64>,
{
    fn sample(&mut self) -> i64 {
        let (current, increase) = self.increase();
        self.baseline = Some(current);
        increase
    }

    fn peek(&mut self) -> i64 {
        self.increase().1
    }
}

/// A [`SampledProbe`] built from a function that creates samplers.
///
/// # Example
///
/// ```
/// use tickwatch::{SampledFn, SampledProbe};
///
/// let ticks = SampledFn::new(|| {
///     let mut count = 0_u32;
///     move || {
///         count += 1;
///         count
///     }
/// });
///
/// let mut first = ticks.instantiate();
/// let mut second = ticks.instantiate();
///
/// assert_eq!(first.sample(), 1);
/// assert_eq!(first.sample(), 2);
///
/// // Each sampler has its own state.
/// assert_eq!(second.sample(), 1);
/// ```
pub struct SampledFn<F> {
    factory: F,
}

impl<F> SampledFn<F> {
    /// Wraps a sampler factory.
    #[must_use]
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<F> fmt::Debug for SampledFn<F> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>()).finish_non_exhaustive()
    }
}

impl<T, S, F> SampledProbe<T> for SampledFn<F>
where
    F: Fn() -> S + Send + Sync + 'static,
    S: Sampler<T>,
{
    fn instantiate(&self) -> Box<dyn Sampler<T>> {
        Box::new((self.factory)())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(ManualProbe<u64>: Send, Sync, Clone);
    assert_impl_all!(Delta<fn() -> i64>: Send, Sync);

    #[test]
    fn closures_are_probes() {
        let probe = || 7_u8;
        assert_eq!(probe.probe(), 7);
    }

    #[test]
    fn manual_probe_clones_share_value() {
        let probe = ManualProbe::new(1);
        let clone = probe.clone();

        clone.set(5);

        assert_eq!(probe.get(), 5);
        assert_eq!(probe.instantiate().sample(), 5);
    }

    #[test]
    fn polled_samplers_call_the_probe() {
        let value = Arc::new(AtomicI64::new(3));

        let value_clone = Arc::clone(&value);
        let polled = Polled::new(move || value_clone.load(Ordering::Relaxed));
        let mut sampler = polled.instantiate();

        assert_eq!(sampler.sample(), 3);
        value.store(9, Ordering::Relaxed);
        assert_eq!(sampler.sample(), 9);
    }

    #[test]
    fn delta_samplers_track_state_independently() {
        let counter = ManualProbe::new(10_i64);
        let delta = Delta::new(counter.clone());

        let mut first = delta.instantiate();
        assert_eq!(first.sample(), 0);

        counter.set(15);
        assert_eq!(first.sample(), 5);

        // A new sampler starts from the current reading, unaffected by the first.
        let mut second = delta.instantiate();
        assert_eq!(second.sample(), 0);

        counter.set(22);
        assert_eq!(first.sample(), 7);
        assert_eq!(second.sample(), 7);
        assert_eq!(first.sample(), 0);
    }

    #[test]
    fn delta_peek_keeps_the_baseline() {
        let counter = ManualProbe::new(0_i64);
        let mut sampler = Delta::new(counter.clone()).instantiate();

        // First contact establishes the baseline, whether it is a peek or a sample.
        assert_eq!(sampler.peek(), 0);

        counter.set(100);
        assert_eq!(sampler.peek(), 100);

        counter.set(200);
        assert_eq!(sampler.peek(), 200);
        assert_eq!(sampler.sample(), 200);
        assert_eq!(sampler.peek(), 0);
    }

    #[test]
    fn default_peek_samples() {
        let mut count = 0_u32;
        let mut sampler = move || {
            count += 1;
            count
        };

        assert_eq!(Sampler::peek(&mut sampler), 1);
        assert_eq!(Sampler::sample(&mut sampler), 2);
    }

    #[test]
    fn arc_of_sampled_probe_is_sampled_probe() {
        let probe = Arc::new(ManualProbe::new("x"));
        assert_eq!(probe.instantiate().sample(), "x");
    }
}
