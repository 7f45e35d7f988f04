use std::any::type_name;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::clock::millis_i64;
use crate::{Clock, ManualClock, Scheduler, TaskAction, TaskId};

/// A scheduler whose time only moves when [`advance()`][Self::advance] is called.
///
/// Tasks run synchronously on the thread that advances time, in due order. This makes
/// sampling pipelines fully deterministic, which is what tests and replay tools want.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::time::Duration;
///
/// use tickwatch::ManualScheduler;
///
/// let manual = ManualScheduler::new(0);
/// let ticks = Arc::new(AtomicUsize::new(0));
///
/// let ticks_clone = Arc::clone(&ticks);
/// let _task = manual
///     .scheduler()
///     .schedule_sampling(Duration::from_secs(1), move || {
///         ticks_clone.fetch_add(1, Ordering::Relaxed);
///     });
///
/// manual.advance(Duration::from_millis(3_500));
/// assert_eq!(ticks.load(Ordering::Relaxed), 3);
/// ```
pub struct ManualScheduler {
    scheduler: Scheduler,
    clock: Arc<ManualClock>,
    backend: Arc<ManualBackend>,
}

impl ManualScheduler {
    /// Creates a manual scheduler whose clock starts at `start_millis`.
    #[must_use]
    pub fn new(start_millis: i64) -> Self {
        let clock = Arc::new(ManualClock::new(start_millis));
        let backend = Arc::new(ManualBackend::new(Arc::clone(&clock)));

        let scheduler = Scheduler::from_manual(
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::clone(&backend),
        );

        Self {
            scheduler,
            clock,
            backend,
        }
    }

    /// A scheduler handle to give to samplers. All handles share this manual timeline.
    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    /// The clock driving this scheduler.
    #[must_use]
    pub fn clock(&self) -> &Arc<ManualClock> {
        &self.clock
    }

    /// The current time on the manual timeline.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Moves time forward, running every task that comes due along the way.
    ///
    /// While a task runs, the clock reads exactly that task's due time.
    pub fn advance(&self, by: Duration) {
        let target = self.clock.now_millis().saturating_add(millis_i64(by));
        self.backend.run_until(target);
    }

    /// Moves time forward to an absolute point. Does nothing if `millis` is in the past.
    pub fn advance_to(&self, millis: i64) {
        if millis > self.clock.now_millis() {
            self.backend.run_until(millis);
        }
    }
}

impl fmt::Debug for ManualScheduler {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("now_millis", &self.now_millis())
            .field("active_tasks", &self.backend.active_tasks())
            .finish_non_exhaustive()
    }
}

pub(crate) struct ManualBackend {
    clock: Arc<ManualClock>,
    tasks: Mutex<BTreeMap<TaskId, ManualTask>>,
    next_task_id: AtomicU64,
}

struct ManualTask {
    next_due: i64,
    interval: i64,
    action: TaskAction,
}

impl ManualBackend {
    fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            tasks: Mutex::new(BTreeMap::new()),
            next_task_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn schedule(
        &self,
        delay_millis: i64,
        interval_millis: i64,
        action: TaskAction,
    ) -> TaskId {
        let id = TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed));

        self.tasks.lock().insert(
            id,
            ManualTask {
                next_due: self.clock.now_millis().saturating_add(delay_millis),
                interval: interval_millis,
                action,
            },
        );

        id
    }

    pub(crate) fn cancel(&self, id: TaskId) {
        self.tasks.lock().remove(&id);
    }

    pub(crate) fn active_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    fn run_until(&self, target: i64) {
        while let Some((id, due, action)) = self.next_due_task(target) {
            // Time never runs backwards, even if a task was scheduled "in the past".
            if due > self.clock.now_millis() {
                self.clock.set(due);
            }

            trace!(task = id.0, due, "running manual task");

            // No locks held: the task may schedule or cancel tasks, itself included.
            action();
        }

        if target > self.clock.now_millis() {
            self.clock.set(target);
        }
    }

    /// Takes the earliest task due at or before `target` and moves it to its next tick.
    fn next_due_task(&self, target: i64) -> Option<(TaskId, i64, TaskAction)> {
        let mut tasks = self.tasks.lock();

        let (&id, task) = tasks
            .iter_mut()
            .filter(|(_, task)| task.next_due <= target)
            .min_by_key(|(id, task)| (task.next_due, **id))?;

        let due = task.next_due;
        task.next_due = due.saturating_add(task.interval);

        Some((id, due, Arc::clone(&task.action)))
    }
}
