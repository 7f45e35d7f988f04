//! The contract between instrumented code and exporter backends.

use std::any::type_name;
use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Weak};

use foldhash::HashSet;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    Check, CheckListener, Error, ListenerHandle, Probe, Result, TimeSampler, Timer,
    TriggerEvent, TriggerHolder,
};

const SEPARATOR: char = '/';

/// A hierarchical name under which an item is exported, such as `http/server/latency`.
///
/// Paths consist of one or more non-empty segments separated by `/`.
///
/// # Example
///
/// ```
/// use tickwatch::ExportPath;
///
/// let path = ExportPath::new("http/server")?.child("latency")?;
///
/// assert_eq!(path.as_str(), "http/server/latency");
/// assert_eq!(path.segments().collect::<Vec<_>>(), ["http", "server", "latency"]);
///
/// assert!(ExportPath::new("http//latency").is_err());
/// assert!(ExportPath::from_segments(["http", "server/latency"]).is_err());
/// # Ok::<(), tickwatch::Error>(())
/// ```
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ExportPath(String);

impl ExportPath {
    /// Parses a `/`-separated path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingExportPath`] for an empty path and
    /// [`Error::InvalidExportPath`] if any segment is empty.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();

        if path.is_empty() {
            return Err(Error::MissingExportPath);
        }

        if path.split(SEPARATOR).any(str::is_empty) {
            return Err(Error::InvalidExportPath {
                path,
                problem: "path contains an empty segment".to_string(),
            });
        }

        Ok(Self(path))
    }

    /// Joins individual segments into a path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingExportPath`] if there are no segments and
    /// [`Error::InvalidExportPath`] if a segment is empty or itself contains `/`.
    pub fn from_segments<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut path = String::new();

        for segment in segments {
            let segment = segment.as_ref();
            validate_segment(&path, segment)?;

            if !path.is_empty() {
                path.push(SEPARATOR);
            }

            path.push_str(segment);
        }

        Self::new(path)
    }

    /// Appends one segment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExportPath`] if the segment is empty or contains `/`.
    pub fn child(&self, segment: &str) -> Result<Self> {
        validate_segment(&self.0, segment)?;

        Ok(Self(format!("{}{SEPARATOR}{segment}", self.0)))
    }

    /// The individual segments, outermost first.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    /// The path in its `/`-separated form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ExportPath {
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_segment(parent: &str, segment: &str) -> Result<()> {
    let problem = if segment.is_empty() {
        "path contains an empty segment"
    } else if segment.contains(SEPARATOR) {
        "segment contains '/'"
    } else {
        return Ok(());
    };

    let path = if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{parent}{SEPARATOR}{segment}")
    };

    Err(Error::InvalidExportPath {
        path,
        problem: problem.to_string(),
    })
}

/// A discrete event in a form every exporter backend understands.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExportedEvent {
    timestamp: i64,
    kind: String,
    detail: String,
}

impl ExportedEvent {
    /// Creates an event.
    #[must_use]
    pub fn new(timestamp: i64, kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            timestamp,
            kind: kind.into(),
            detail: detail.into(),
        }
    }

    /// When the event happened, in milliseconds since the Unix epoch.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// A short description of what happened.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Free-form details, such as the value that raised the event.
    #[must_use]
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

/// A callback that observes exported events.
pub type EventListener = dyn Fn(&ExportedEvent) + Send + Sync;

/// Something that raises discrete events a backend may forward.
pub trait EventSource: Send + Sync + 'static {
    /// Registers a listener for every future event.
    fn subscribe_events(&self, listener: Arc<EventListener>) -> ListenerHandle;
}

impl<O> EventSource for TriggerHolder<O>
where
    O: Clone + fmt::Debug + Send + Sync + 'static,
{
    fn subscribe_events(&self, listener: Arc<EventListener>) -> ListenerHandle {
        self.subscribe(move |event: &TriggerEvent<O>| {
            listener(&ExportedEvent::new(
                event.timestamp(),
                event.kind().as_str(),
                format!("{:?}", event.value()),
            ));
        })
    }
}

/// A condition a backend may report on or evaluate on demand.
pub trait CheckSource: Send + Sync + 'static {
    /// Evaluates the condition now.
    fn is_conditions_met(&self) -> bool;

    /// Registers a listener for the outcome of every future tick.
    fn subscribe_checks(&self, listener: Arc<CheckListener>) -> ListenerHandle;
}

impl<I> CheckSource for Check<I>
where
    I: Clone + Send + Sync + 'static,
{
    fn is_conditions_met(&self) -> bool {
        Check::is_conditions_met(self)
    }

    fn subscribe_checks(&self, listener: Arc<CheckListener>) -> ListenerHandle {
        self.add_listener(listener)
    }
}

/// An item handed to exporter backends.
///
/// Backends observe exported items only through their public API: reading probes,
/// subscribing to samplers, events and checks, and sampling timers.
#[derive(Clone)]
#[non_exhaustive]
pub enum Export {
    /// A value read on demand, for example when a management console asks for it.
    Probe(Arc<dyn Probe<f64>>),

    /// A periodically sampled value.
    Sampler(TimeSampler<f64>),

    /// A timer, typically sampled once per reporting interval with [`Timer::sample()`].
    Timer(Timer),

    /// A source of discrete events.
    Events(Arc<dyn EventSource>),

    /// A condition.
    Check(Arc<dyn CheckSource>),
}

impl Export {
    /// A short name for the kind of item.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Probe(_) => "probe",
            Self::Sampler(_) => "sampler",
            Self::Timer(_) => "timer",
            Self::Events(_) => "events",
            Self::Check(_) => "check",
        }
    }
}

impl fmt::Debug for Export {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sampler(sampler) => f.debug_tuple("Sampler").field(sampler).finish(),
            Self::Timer(timer) => f.debug_tuple("Timer").field(timer).finish(),
            _ => f.debug_tuple(self.kind()).finish_non_exhaustive(),
        }
    }
}

/// The error type exporter backends report failures with.
pub type ExporterError = Box<dyn StdError + Send + Sync>;

/// A backend that makes exported items visible outside the process.
///
/// Backends typically subscribe to the item in [`export()`][Self::export] and drop that
/// subscription in [`unexport()`][Self::unexport].
#[cfg_attr(test, mockall::automock)]
pub trait Exporter: Send + Sync + 'static {
    /// Starts exporting `item` under `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot export the item. The export is then
    /// abandoned for every backend.
    fn export(&self, path: &ExportPath, item: &Export) -> std::result::Result<(), ExporterError>;

    /// Stops exporting whatever was exported under `path`.
    fn unexport(&self, path: &ExportPath);
}

/// The registry that routes exported items to every registered backend.
///
/// Each path can be exported once at a time. The returned [`ExportHandle`] keeps the item
/// exported; dropping it unexports the item from every backend and frees the path.
///
/// Backends only see items exported after they were added.
///
/// Cloning yields another handle to the same registry.
///
/// # Example
///
/// ```
/// use tickwatch::{Export, Exports, Timer};
///
/// let exports = Exports::new();
/// let timer = Timer::new();
///
/// let handle = exports.export("db/query", Export::Timer(timer.clone()))?;
/// assert!(exports.is_exported("db/query"));
///
/// // One item per path.
/// assert!(exports.export("db/query", Export::Timer(timer)).is_err());
///
/// drop(handle);
/// assert!(!exports.is_exported("db/query"));
/// # Ok::<(), tickwatch::Error>(())
/// ```
#[derive(Clone, Default)]
pub struct Exports {
    core: Arc<ExportsCore>,
}

#[derive(Default)]
struct ExportsCore {
    exporters: Mutex<Vec<Arc<dyn Exporter>>>,
    paths: Mutex<HashSet<ExportPath>>,
}

impl Exports {
    /// Creates a registry without any backends.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a backend for every future export.
    pub fn add_exporter(&self, exporter: Arc<dyn Exporter>) {
        self.core.exporters.lock().push(exporter);
    }

    /// Exports `item` under `path` to every backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid, if something is already exported under it
    /// or if a backend fails. After a backend failure the item is unexported from the
    /// backends that had already accepted it.
    pub fn export(&self, path: &str, item: Export) -> Result<ExportHandle> {
        let path = ExportPath::new(path)?;

        if !self.core.paths.lock().insert(path.clone()) {
            return Err(Error::DuplicateExport {
                path: path.into_string(),
            });
        }

        // Backends are called without holding the lock; they may subscribe and emit.
        let exporters = self.core.exporters.lock().clone();

        for (index, exporter) in exporters.iter().enumerate() {
            if let Err(e) = exporter.export(&path, &item) {
                warn!(
                    path = path.as_str(),
                    kind = item.kind(),
                    error = %e,
                    "exporter rejected item, abandoning export"
                );

                for accepted in exporters.iter().take(index) {
                    accepted.unexport(&path);
                }

                self.core.paths.lock().remove(&path);

                return Err(Error::Backend {
                    path: path.into_string(),
                    message: e.to_string(),
                });
            }
        }

        debug!(
            path = path.as_str(),
            kind = item.kind(),
            backends = exporters.len(),
            "item exported"
        );

        Ok(ExportHandle {
            registry: Arc::downgrade(&self.core),
            path: Some(path),
            exporters,
        })
    }

    /// Whether something is exported under `path`.
    #[must_use]
    pub fn is_exported(&self, path: &str) -> bool {
        ExportPath::new(path).is_ok_and(|path| self.core.paths.lock().contains(&path))
    }

    /// Every currently exported path, sorted.
    #[must_use]
    pub fn exported_paths(&self) -> Vec<ExportPath> {
        let mut paths: Vec<_> = self.core.paths.lock().iter().cloned().collect();
        paths.sort();
        paths
    }
}

impl fmt::Debug for Exports {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("exporters", &self.core.exporters.lock().len())
            .field("paths", &self.core.paths.lock().len())
            .finish_non_exhaustive()
    }
}

/// Keeps an item exported. Dropping the handle unexports it.
#[must_use = "the item is unexported as soon as the handle is dropped"]
pub struct ExportHandle {
    registry: Weak<ExportsCore>,

    // Taken on drop.
    path: Option<ExportPath>,

    // The backends that accepted the item.
    exporters: Vec<Arc<dyn Exporter>>,
}

impl ExportHandle {
    /// The path the item is exported under.
    #[must_use]
    pub fn path(&self) -> Option<&ExportPath> {
        self.path.as_ref()
    }

    /// Unexports the item now. Equivalent to dropping the handle.
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ExportHandle {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };

        for exporter in &self.exporters {
            exporter.unexport(&path);
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.paths.lock().remove(&path);
        }

        debug!(path = path.as_str(), "item unexported");
    }
}

impl fmt::Debug for ExportHandle {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("path", &self.path)
            .field("exporters", &self.exporters.len())
            .finish()
    }
}
