/// A value observed at a point in time.
///
/// The timestamp is in milliseconds since the Unix epoch, as reported by the
/// [`Clock`][crate::Clock] of the scheduler that produced the sample.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Sample<T> {
    timestamp: i64,
    value: T,
}

impl<T> Sample<T> {
    /// Creates a sample.
    #[must_use]
    pub fn new(timestamp: i64, value: T) -> Self {
        Self { timestamp, value }
    }

    /// When the value was observed, in milliseconds since the Unix epoch.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// The observed value.
    #[must_use]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Consumes the sample, returning the value.
    #[must_use]
    pub fn into_value(self) -> T {
        self.value
    }

    /// Transforms the value, keeping the timestamp.
    #[must_use]
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Sample<U> {
        Sample {
            timestamp: self.timestamp,
            value: f(self.value),
        }
    }

    /// Replaces the timestamp, keeping the value.
    ///
    /// Operations that report per-period results use this to stamp a sample with the
    /// boundary of its period instead of the raw observation time.
    #[must_use]
    pub fn with_timestamp(self, timestamp: i64) -> Self {
        Self {
            timestamp,
            value: self.value,
        }
    }
}
