use thiserror::Error;

/// Errors returned when configuring or wiring up tickwatch components.
///
/// All of these are configuration errors, reported when a component is built rather than
/// deferred until it is first used.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Percentile bucket boundaries must be strictly ascending.
    #[error("bucket boundaries must be strictly ascending: {boundaries:?}")]
    NonAscendingBoundaries {
        /// The rejected boundaries, in the order they were supplied.
        boundaries: Vec<i64>,
    },

    /// A bucket-based percentile counter needs at least one boundary.
    #[error("bucket boundaries must not be empty")]
    EmptyBoundaries,

    /// A named percentile layout was requested but no layout with that name is registered.
    #[error("unknown percentile layout '{name}'")]
    UnknownLayout {
        /// The name that was looked up.
        name: String,
    },

    /// Sampling intervals are measured in whole milliseconds and must be at least one.
    #[error("sampling interval must be at least one millisecond")]
    ZeroInterval,

    /// An export was requested without a path.
    #[error("export path is required")]
    MissingExportPath,

    /// The export path is not a valid `/`-separated hierarchical name.
    #[error("invalid export path '{path}': {problem}")]
    InvalidExportPath {
        /// The path as supplied by the caller.
        path: String,

        /// A human-readable description of the problem.
        problem: String,
    },

    /// Something is already exported under this path.
    #[error("'{path}' is already exported")]
    DuplicateExport {
        /// The conflicting path.
        path: String,
    },

    /// An exporter backend refused to register an item.
    #[error("exporter failed for '{path}': {message}")]
    Backend {
        /// The path that was being exported.
        path: String,

        /// The backend's description of the failure.
        message: String,
    },
}

/// A specialized `Result` type for tickwatch operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;
