use std::sync::Arc;

use foldhash::{HashMap, HashMapExt};

use crate::{
    BucketPercentileCounter, Error, FakePercentileCounter, PercentileCounter, Result,
    validate_boundaries,
};

/// Named bucket layouts for percentile counters.
///
/// Applications typically define a handful of layouts ("fast-call", "http-request") once
/// and refer to them by name when creating timers. Unknown names are rejected when a
/// counter is requested, not when it is first used.
///
/// # Example
///
/// ```
/// use tickwatch::PercentileLayouts;
///
/// let layouts = PercentileLayouts::new()
///     .with_layout("http", [0, 10, 50, 100, 500, 1000])?
///     .with_default("http")?;
///
/// let named = layouts.counter(Some("http"))?;
/// let default = layouts.counter(None)?;
///
/// assert_eq!(named.get().boundaries(), default.get().boundaries());
/// assert!(layouts.counter(Some("grpc")).is_err());
/// # Ok::<(), tickwatch::Error>(())
/// ```
#[derive(Clone, Debug, Default)]
pub struct PercentileLayouts {
    layouts: HashMap<String, Arc<[i64]>>,
    default: Option<String>,
}

impl PercentileLayouts {
    /// Creates an empty set of layouts. Without a default layout, unnamed requests get a
    /// [`FakePercentileCounter`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            layouts: HashMap::new(),
            default: None,
        }
    }

    /// Registers a layout, replacing any existing layout with the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if the boundaries are empty or not strictly ascending.
    pub fn with_layout(
        mut self,
        name: impl Into<String>,
        boundaries: impl Into<Vec<i64>>,
    ) -> Result<Self> {
        let boundaries = boundaries.into();
        validate_boundaries(&boundaries)?;

        self.layouts.insert(name.into(), boundaries.into());
        Ok(self)
    }

    /// Makes a registered layout the one used for unnamed requests.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownLayout`] if no layout with this name is registered.
    pub fn with_default(mut self, name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        if !self.layouts.contains_key(&name) {
            return Err(Error::UnknownLayout { name });
        }

        self.default = Some(name);
        Ok(self)
    }

    /// The boundaries of a registered layout.
    #[must_use]
    pub fn boundaries(&self, name: &str) -> Option<&[i64]> {
        self.layouts.get(name).map(AsRef::as_ref)
    }

    /// Names of all registered layouts, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.layouts.keys().map(String::as_str)
    }

    /// Creates a new counter using the named layout, or the default layout if no name
    /// is given.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownLayout`] if a name is given but not registered.
    pub fn counter(&self, name: Option<&str>) -> Result<Arc<dyn PercentileCounter>> {
        let name = match name {
            Some(name) => Some(name),
            None => self.default.as_deref(),
        };

        let Some(name) = name else {
            return Ok(Arc::new(FakePercentileCounter::new()));
        };

        let boundaries = self
            .layouts
            .get(name)
            .ok_or_else(|| Error::UnknownLayout {
                name: name.to_string(),
            })?;

        Ok(Arc::new(BucketPercentileCounter::with_validated(Arc::clone(
            boundaries,
        ))))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn unnamed_without_default_is_fake() {
        let layouts = PercentileLayouts::new();

        let counter = layouts.counter(None).unwrap();
        counter.add(5);

        let snapshot = counter.get();
        assert_eq!(snapshot.count(), 1);
        assert!(snapshot.boundaries().is_empty());
    }

    #[test]
    fn named_layout_gets_buckets() {
        let layouts = PercentileLayouts::new()
            .with_layout("fast", [0, 1, 2])
            .unwrap();

        let counter = layouts.counter(Some("fast")).unwrap();
        assert_eq!(counter.get().boundaries(), &[0, 1, 2]);
        assert_eq!(layouts.boundaries("fast"), Some(&[0_i64, 1, 2][..]));
        assert_eq!(layouts.names().collect::<Vec<_>>(), vec!["fast"]);
    }

    #[test]
    fn counters_from_one_layout_are_independent() {
        let layouts = PercentileLayouts::new().with_layout("x", [0, 10]).unwrap();

        let first = layouts.counter(Some("x")).unwrap();
        let second = layouts.counter(Some("x")).unwrap();
        first.add(1);

        assert_eq!(second.get().count(), 0);
    }

    #[test]
    fn unknown_names_fail_fast() {
        let layouts = PercentileLayouts::new();

        assert!(matches!(
            layouts.counter(Some("missing")),
            Err(Error::UnknownLayout { name }) if name == "missing"
        ));

        assert!(matches!(
            PercentileLayouts::new().with_default("missing"),
            Err(Error::UnknownLayout { .. })
        ));
    }

    #[test]
    fn invalid_layouts_are_rejected() {
        assert!(matches!(
            PercentileLayouts::new().with_layout("bad", [3, 2, 1]),
            Err(Error::NonAscendingBoundaries { .. })
        ));
    }
}
