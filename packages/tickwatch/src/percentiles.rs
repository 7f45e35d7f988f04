//! Histogram-based percentile estimation for latency-style values.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use arc_swap::ArcSwap;

use crate::{Error, Result};

/// Returned by percentile estimation when the percentile cannot be determined.
pub const PERCENTILE_UNKNOWN: i64 = -1;

// Counters are updated from many threads and read periodically. Readers tolerate a
// momentarily inconsistent view, so we never pay for ordering.
const COUNTER_ORDERING: Ordering = Ordering::Relaxed;

/// Accumulates values (typically durations) for later percentile estimation.
///
/// Implementations tolerate concurrent [`add()`][Self::add] from any number of threads
/// alongside periodic [`get()`][Self::get] and [`reset()`][Self::reset]. The count, the
/// total and the bucket counts are updated separately, so a snapshot taken during a
/// concurrent update may include a value in some of them but not yet in others.
pub trait PercentileCounter: fmt::Debug + Send + Sync + 'static {
    /// Records one value.
    fn add(&self, value: i64);

    /// Takes a snapshot of everything recorded since the last reset.
    fn get(&self) -> PercentileSnapshot;

    /// Forgets everything recorded so far.
    fn reset(&self);

    /// Takes a snapshot and then resets. Values recorded between the two steps are lost.
    fn take(&self) -> PercentileSnapshot {
        let snapshot = self.get();
        self.reset();
        snapshot
    }
}

/// Counts values into fixed buckets for percentile estimation.
///
/// Bucket `i` covers `[boundaries[i], boundaries[i + 1])` and the last bucket is open-ended.
/// Values below the first boundary are discarded: they are not counted anywhere.
///
/// # Example
///
/// ```
/// use tickwatch::{BucketPercentileCounter, PercentileCounter};
///
/// let counter = BucketPercentileCounter::new([0, 100, 200]).unwrap();
///
/// for value in [101, 102, 200, 1, 4, 400] {
///     counter.add(value);
/// }
///
/// let snapshot = counter.get();
/// assert_eq!(snapshot.estimate_percentile(70.0), 200);
///
/// // The 95th percentile lands in the open-ended last bucket.
/// assert_eq!(snapshot.estimate_percentile(95.0), -1);
/// ```
pub struct BucketPercentileCounter {
    boundaries: Arc<[i64]>,

    // Swapped out wholesale by `reset()`.
    buckets: ArcSwap<Box<[AtomicU64]>>,

    count: AtomicU64,
    total: AtomicI64,
}

impl BucketPercentileCounter {
    /// Creates a counter with the given bucket boundaries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyBoundaries`] if no boundaries are given and
    /// [`Error::NonAscendingBoundaries`] if they are not strictly ascending.
    pub fn new(boundaries: impl Into<Vec<i64>>) -> Result<Self> {
        let boundaries = boundaries.into();
        validate_boundaries(&boundaries)?;

        Ok(Self::with_validated(boundaries.into()))
    }

    pub(crate) fn with_validated(boundaries: Arc<[i64]>) -> Self {
        let buckets = zeroed_buckets(boundaries.len());

        Self {
            boundaries,
            buckets: ArcSwap::from_pointee(buckets),
            count: AtomicU64::new(0),
            total: AtomicI64::new(0),
        }
    }

    /// The bucket boundaries, in ascending order.
    #[must_use]
    pub fn boundaries(&self) -> &[i64] {
        &self.boundaries
    }

    /// The index of the bucket `value` belongs to, or `None` if it is below the first
    /// boundary and would be discarded.
    #[must_use]
    pub fn bucket_index(&self, value: i64) -> Option<usize> {
        bucket_index(&self.boundaries, value)
    }
}

impl PercentileCounter for BucketPercentileCounter {
    fn add(&self, value: i64) {
        let Some(index) = self.bucket_index(value) else {
            return;
        };

        self.buckets
            .load()
            .get(index)
            .expect("bucket index is always within the boundaries it was derived from")
            .fetch_add(1, COUNTER_ORDERING);

        self.count.fetch_add(1, COUNTER_ORDERING);
        self.total.fetch_add(value, COUNTER_ORDERING);
    }

    fn get(&self) -> PercentileSnapshot {
        let buckets = self
            .buckets
            .load()
            .iter()
            .map(|bucket| bucket.load(COUNTER_ORDERING))
            .collect();

        PercentileSnapshot {
            boundaries: Arc::clone(&self.boundaries),
            buckets,
            count: self.count.load(COUNTER_ORDERING),
            total: self.total.load(COUNTER_ORDERING),
        }
    }

    fn reset(&self) {
        self.buckets
            .store(Arc::new(zeroed_buckets(self.boundaries.len())));
        self.count.store(0, COUNTER_ORDERING);
        self.total.store(0, COUNTER_ORDERING);
    }
}

impl fmt::Debug for BucketPercentileCounter {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("boundaries", &self.boundaries)
            .field("count", &self.count.load(COUNTER_ORDERING))
            .finish_non_exhaustive()
    }
}

/// A counter that only tracks the count and total of values.
///
/// Used when no bucket boundaries are configured. Percentile estimates are always
/// [`PERCENTILE_UNKNOWN`].
#[derive(Debug, Default)]
pub struct FakePercentileCounter {
    count: AtomicU64,
    total: AtomicI64,
}

impl FakePercentileCounter {
    /// Creates an empty counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PercentileCounter for FakePercentileCounter {
    fn add(&self, value: i64) {
        self.count.fetch_add(1, COUNTER_ORDERING);
        self.total.fetch_add(value, COUNTER_ORDERING);
    }

    fn get(&self) -> PercentileSnapshot {
        PercentileSnapshot {
            boundaries: Arc::from([]),
            buckets: Vec::new(),
            count: self.count.load(COUNTER_ORDERING),
            total: self.total.load(COUNTER_ORDERING),
        }
    }

    fn reset(&self) {
        self.count.store(0, COUNTER_ORDERING);
        self.total.store(0, COUNTER_ORDERING);
    }
}

/// An immutable point-in-time view of a [`PercentileCounter`].
///
/// Snapshots taken from identically configured counters can be combined with
/// [`add()`][Self::add] and differenced with [`remove()`][Self::remove], for example to
/// derive the statistics of a time window from two cumulative snapshots.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PercentileSnapshot {
    boundaries: Arc<[i64]>,
    buckets: Vec<u64>,
    count: u64,
    total: i64,
}

impl PercentileSnapshot {
    /// The bucket boundaries of the counter this came from. Empty for counters that do
    /// not keep buckets.
    #[must_use]
    pub fn boundaries(&self) -> &[i64] {
        &self.boundaries
    }

    /// Number of values in each bucket, in boundary order.
    #[must_use]
    pub fn bucket_counts(&self) -> &[u64] {
        &self.buckets
    }

    /// Number of recorded values.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum of recorded values.
    #[must_use]
    pub fn total(&self) -> i64 {
        self.total
    }

    /// Mean of recorded values, or `None` if nothing was recorded.
    #[must_use]
    #[expect(
        clippy::cast_precision_loss,
        reason = "precision loss is acceptable for a statistical mean"
    )]
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }

        Some(self.total as f64 / self.count as f64)
    }

    /// Estimates the value below which `percentile` percent of the values fall.
    ///
    /// The estimate is the upper boundary of the first bucket at which the running count
    /// reaches `ceil(percentile / 100 * count) - 1`. Returns [`PERCENTILE_UNKNOWN`] if
    /// nothing was recorded or if that bucket is the open-ended last one.
    #[must_use]
    #[expect(
        clippy::cast_precision_loss,
        reason = "counts far beyond f64 integer precision are not realistic"
    )]
    #[expect(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "the cutoff is clamped to be non-negative and bounded by the count"
    )]
    pub fn estimate_percentile(&self, percentile: f64) -> i64 {
        if self.count == 0 {
            return PERCENTILE_UNKNOWN;
        }

        let cutoff = ((percentile / 100.0 * self.count as f64).ceil() - 1.0).max(0.0) as u64;

        let mut cumulative: u64 = 0;

        for (index, &bucket) in self.buckets.iter().enumerate() {
            cumulative = cumulative.saturating_add(bucket);

            if cumulative > 0 && cumulative >= cutoff {
                return self
                    .boundaries
                    .get(index.saturating_add(1))
                    .copied()
                    .unwrap_or(PERCENTILE_UNKNOWN);
            }
        }

        PERCENTILE_UNKNOWN
    }

    /// Combines two snapshots by adding their counts together.
    ///
    /// # Panics
    ///
    /// Panics if the snapshots come from counters with different bucket boundaries.
    #[must_use]
    pub fn add(&self, other: &Self) -> Self {
        self.assert_compatible(other);

        Self {
            boundaries: Arc::clone(&self.boundaries),
            buckets: self
                .buckets
                .iter()
                .zip(&other.buckets)
                .map(|(a, b)| a.wrapping_add(*b))
                .collect(),
            count: self.count.wrapping_add(other.count),
            total: self.total.wrapping_add(other.total),
        }
    }

    /// Subtracts the counts of `other`, which must be contained in `self`.
    ///
    /// # Panics
    ///
    /// Panics if the snapshots come from counters with different bucket boundaries.
    #[must_use]
    pub fn remove(&self, other: &Self) -> Self {
        self.assert_compatible(other);

        Self {
            boundaries: Arc::clone(&self.boundaries),
            buckets: self
                .buckets
                .iter()
                .zip(&other.buckets)
                .map(|(a, b)| a.saturating_sub(*b))
                .collect(),
            count: self.count.saturating_sub(other.count),
            total: self.total.wrapping_sub(other.total),
        }
    }

    fn assert_compatible(&self, other: &Self) {
        // We cannot combine snapshots with different bucket boundaries.
        assert_eq!(
            self.boundaries, other.boundaries,
            "percentile snapshots must come from identically configured counters"
        );

        // Extra sanity check for maximum paranoia.
        assert_eq!(self.buckets.len(), other.buckets.len());
    }
}

/// Checks that boundaries are non-empty and strictly ascending.
pub(crate) fn validate_boundaries(boundaries: &[i64]) -> Result<()> {
    if boundaries.is_empty() {
        return Err(Error::EmptyBoundaries);
    }

    if boundaries.windows(2).any(|pair| pair.first() >= pair.last()) {
        return Err(Error::NonAscendingBoundaries {
            boundaries: boundaries.to_vec(),
        });
    }

    Ok(())
}

fn bucket_index(boundaries: &[i64], value: i64) -> Option<usize> {
    // Number of boundaries at or below the value, found by binary search.
    boundaries
        .partition_point(|&boundary| boundary <= value)
        .checked_sub(1)
}

fn zeroed_buckets(len: usize) -> Box<[AtomicU64]> {
    (0..len).map(|_| AtomicU64::new(0)).collect()
}
