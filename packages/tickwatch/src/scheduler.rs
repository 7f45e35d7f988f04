//! Periodic task scheduling shared by all time samplers.

use std::any::type_name;
use std::fmt;
use std::num::NonZero;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use tracing::debug;

use crate::clock::millis_i64;
use crate::{Clock, ManualBackend, SystemClock, ThreadedBackend};

const DEFAULT_WORKER_COUNT: NonZero<usize> = NonZero::new(2).expect("2 is not zero");

static SHARED: LazyLock<Scheduler> = LazyLock::new(Scheduler::new);

pub(crate) type TaskAction = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct TaskId(pub(crate) u64);

/// Runs periodic tasks on a small pool of background threads.
///
/// This is the only source of "time passing" for periodic samplers. Worker threads are
/// created lazily when the first task is scheduled and torn down when the last scheduled
/// task is cancelled, so an idle scheduler costs nothing.
///
/// Ticks are aligned to the wall clock: a task with a 10 second interval runs at
/// :00, :10, :20 and so on, not at "now + 10 seconds".
///
/// Each task's executions are strictly sequential. Different tasks may execute
/// concurrently on different worker threads.
///
/// # Cloning
///
/// Schedulers are cheaply cloneable. All clones share the same worker pool.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::time::Duration;
///
/// use tickwatch::Scheduler;
///
/// let scheduler = Scheduler::new();
/// let ticks = Arc::new(AtomicUsize::new(0));
///
/// let ticks_clone = Arc::clone(&ticks);
/// let task = scheduler.schedule_sampling(Duration::from_millis(10), move || {
///     ticks_clone.fetch_add(1, Ordering::Relaxed);
/// });
///
/// assert!(scheduler.is_running());
///
/// // Cancelling the last task shuts the worker pool down.
/// task.cancel();
/// assert!(!scheduler.is_running());
/// ```
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

pub(crate) struct SchedulerInner {
    clock: Arc<dyn Clock>,
    backend: Backend,
}

pub(crate) enum Backend {
    Threads(ThreadedBackend),
    Manual(Arc<ManualBackend>),
}

impl Scheduler {
    /// Creates a scheduler with default settings.
    ///
    /// Most applications should use [`Scheduler::shared()`] instead, so that all samplers
    /// in the process share one worker pool.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring a scheduler.
    #[cfg_attr(test, mutants::skip)] // Gets replaced with itself by different name, bad mutation.
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// The process-wide scheduler, created on first use.
    ///
    /// Builders throughout this crate use it whenever no scheduler is given explicitly.
    #[must_use]
    pub fn shared() -> Self {
        SHARED.clone()
    }

    pub(crate) fn from_manual(clock: Arc<dyn Clock>, backend: Arc<ManualBackend>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                clock,
                backend: Backend::Manual(backend),
            }),
        }
    }

    /// The clock used to timestamp samples and align ticks.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// The current time according to [`clock()`][Self::clock].
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    pub fn now_millis(&self) -> i64 {
        self.inner.clock.now_millis()
    }

    /// Schedules `action` to run every `interval`, starting at the next multiple of
    /// `interval` since the Unix epoch.
    ///
    /// Intervals are truncated to whole milliseconds; anything shorter than a millisecond
    /// is treated as one millisecond.
    ///
    /// The task runs until the returned handle is cancelled or dropped.
    pub fn schedule_sampling<F>(&self, interval: Duration, action: F) -> ScheduledTask
    where
        F: Fn() + Send + Sync + 'static,
    {
        let interval_millis = millis_i64(interval).max(1);
        let delay_millis = initial_delay_millis(self.now_millis(), interval_millis);

        let action: TaskAction = Arc::new(action);

        let id = match &self.inner.backend {
            Backend::Threads(threads) => threads.schedule(
                Duration::from_millis(u64::try_from(delay_millis).unwrap_or(0)),
                Duration::from_millis(u64::try_from(interval_millis).unwrap_or(1)),
                action,
            ),
            Backend::Manual(manual) => manual.schedule(delay_millis, interval_millis, action),
        };

        debug!(
            task = id.0,
            interval_millis, delay_millis, "scheduled periodic task"
        );

        ScheduledTask {
            scheduler: Arc::clone(&self.inner),
            id,
            cancelled: AtomicBool::new(false),
        }
    }

    /// The number of scheduled tasks that have not been cancelled.
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        match &self.inner.backend {
            Backend::Threads(threads) => threads.active_tasks(),
            Backend::Manual(manual) => manual.active_tasks(),
        }
    }

    /// Whether the scheduler currently has live workers, which is the case
    /// exactly when at least one task is scheduled.
    #[must_use]
    pub fn is_running(&self) -> bool {
        match &self.inner.backend {
            Backend::Threads(threads) => threads.is_running(),
            Backend::Manual(manual) => manual.active_tasks() > 0,
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backend = match &self.inner.backend {
            Backend::Threads(_) => "threads",
            Backend::Manual(_) => "manual",
        };

        f.debug_struct(type_name::<Self>())
            .field("clock", &self.inner.clock)
            .field("backend", &backend)
            .field("active_tasks", &self.active_tasks())
            .finish()
    }
}

/// Builder for configuring a [`Scheduler`].
#[derive(Debug)]
pub struct SchedulerBuilder {
    worker_count: NonZero<usize>,
    clock: Arc<dyn Clock>,
}

impl SchedulerBuilder {
    fn new() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the number of worker threads started when the first task is scheduled.
    ///
    /// Default is 2.
    pub fn worker_count(mut self, count: NonZero<usize>) -> Self {
        self.worker_count = count;
        self
    }

    /// Sets the wall clock used for tick alignment and sample timestamps.
    ///
    /// Default is the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the scheduler. No threads are started until a task is scheduled.
    #[must_use]
    pub fn build(self) -> Scheduler {
        Scheduler {
            inner: Arc::new(SchedulerInner {
                clock: self.clock,
                backend: Backend::Threads(ThreadedBackend::new(self.worker_count)),
            }),
        }
    }
}

/// A periodic task registered with a [`Scheduler`].
///
/// Cancelling the last task of a scheduler tears down its worker threads.
/// Dropping the handle cancels the task.
#[must_use = "the task is cancelled as soon as the handle is dropped"]
pub struct ScheduledTask {
    scheduler: Arc<SchedulerInner>,
    id: TaskId,
    cancelled: AtomicBool,
}

impl ScheduledTask {
    /// Cancels the task. An execution that is already in progress runs to completion
    /// but no further executions start.
    ///
    /// Cancelling more than once has no further effect.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        match &self.scheduler.backend {
            Backend::Threads(threads) => threads.cancel(self.id),
            Backend::Manual(manual) => manual.cancel(self.id),
        }

        debug!(task = self.id.0, "cancelled periodic task");
    }

    /// Whether [`cancel()`][Self::cancel] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Milliseconds from `now_millis` until the next multiple of `interval_millis`.
///
/// The result is in `1..=interval_millis`: when `now_millis` is itself a multiple,
/// the first tick is a full interval away.
pub(crate) fn initial_delay_millis(now_millis: i64, interval_millis: i64) -> i64 {
    debug_assert!(interval_millis > 0);

    interval_millis.saturating_sub(now_millis.rem_euclid(interval_millis))
}
