use std::any::type_name;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::num::NonZero;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use foldhash::{HashMap, HashMapExt};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, trace};

use crate::{TaskAction, TaskId, panic_message};

/// The thread-backed half of a [`Scheduler`][crate::Scheduler].
///
/// Owns at most one live worker pool. The pool is created when the first task is
/// scheduled and shut down when the last task is cancelled.
pub(crate) struct ThreadedBackend {
    worker_count: NonZero<usize>,
    pool: Mutex<Option<Arc<WorkerPool>>>,
    next_task_id: AtomicU64,
    next_generation: AtomicU64,
}

struct WorkerPool {
    generation: u64,
    queue: Mutex<TaskQueue>,
    wake: Condvar,
}

struct TaskQueue {
    due: BinaryHeap<Reverse<(Instant, TaskId)>>,
    tasks: HashMap<TaskId, PeriodicTask>,
    shutdown: bool,
}

struct PeriodicTask {
    interval: Duration,
    action: TaskAction,
}

impl ThreadedBackend {
    pub(crate) fn new(worker_count: NonZero<usize>) -> Self {
        Self {
            worker_count,
            pool: Mutex::new(None),
            next_task_id: AtomicU64::new(0),
            next_generation: AtomicU64::new(0),
        }
    }

    pub(crate) fn schedule(
        &self,
        first_run_in: Duration,
        interval: Duration,
        action: TaskAction,
    ) -> TaskId {
        let id = TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed));

        let mut slot = self.pool.lock();
        let pool = slot.get_or_insert_with(|| self.start_pool());

        {
            let mut queue = pool.queue.lock();
            queue.tasks.insert(id, PeriodicTask { interval, action });
            queue.due.push(Reverse((Instant::now() + first_run_in, id)));
        }

        // The new task may be due sooner than whatever the workers are waiting for.
        pool.wake.notify_all();

        id
    }

    pub(crate) fn cancel(&self, id: TaskId) {
        let mut slot = self.pool.lock();

        let Some(pool) = slot.clone() else {
            return;
        };

        let mut queue = pool.queue.lock();

        if queue.tasks.remove(&id).is_none() {
            return;
        }

        // A task that is running right now has no heap entry; the worker skips requeueing it.
        queue.due.retain(|Reverse((_, queued))| *queued != id);

        if !queue.tasks.is_empty() {
            return;
        }

        // Last task gone. Workers notice the flag and exit on their own; we do not join
        // them because cancellation may be requested from a worker thread.
        queue.shutdown = true;
        drop(queue);
        pool.wake.notify_all();

        *slot = None;

        debug!(generation = pool.generation, "scheduler worker pool shut down");
    }

    pub(crate) fn active_tasks(&self) -> usize {
        self.pool
            .lock()
            .as_ref()
            .map_or(0, |pool| pool.queue.lock().tasks.len())
    }

    pub(crate) fn is_running(&self) -> bool {
        self.pool.lock().is_some()
    }

    fn start_pool(&self) -> Arc<WorkerPool> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let pool = Arc::new(WorkerPool {
            generation,
            queue: Mutex::new(TaskQueue {
                due: BinaryHeap::new(),
                tasks: HashMap::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
        });

        for index in 0..self.worker_count.get() {
            let pool = Arc::clone(&pool);

            thread::Builder::new()
                .name(format!("tickwatch-{generation}-{index}"))
                .spawn(move || worker_loop(&pool))
                .expect("failed to spawn scheduler thread: thread spawning failure is not supported");
        }

        debug!(
            generation,
            workers = self.worker_count.get(),
            "scheduler worker pool started"
        );

        pool
    }
}

impl fmt::Debug for ThreadedBackend {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("worker_count", &self.worker_count)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn worker_loop(pool: &WorkerPool) {
    trace!(generation = pool.generation, "scheduler worker started");

    let mut queue = pool.queue.lock();

    loop {
        if queue.shutdown {
            break;
        }

        let Some(&Reverse((due, id))) = queue.due.peek() else {
            pool.wake.wait(&mut queue);
            continue;
        };

        if due > Instant::now() {
            pool.wake.wait_until(&mut queue, due);
            continue;
        }

        queue.due.pop();

        // Cancellation removes the task and its heap entry together.
        let Some(task) = queue.tasks.get(&id) else {
            continue;
        };

        let action = Arc::clone(&task.action);
        let interval = task.interval;

        MutexGuard::unlocked(&mut queue, || run_task(id, &action));

        // The task may have cancelled itself (or been cancelled) while it ran.
        if queue.tasks.contains_key(&id) {
            // Fixed rate: the next tick is relative to when this one was due, not when it
            // finished, so ticks stay aligned to the wall clock.
            queue.due.push(Reverse((due + interval, id)));
        }
    }

    trace!(generation = pool.generation, "scheduler worker exiting");
}

fn run_task(id: TaskId, action: &TaskAction) {
    trace!(task = id.0, "running periodic task");

    // A panicking task must not take down the worker thread and with it every other task.
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| action())) {
        error!(
            task = id.0,
            message = panic_message(payload.as_ref()),
            "periodic task panicked"
        );
    }
}
