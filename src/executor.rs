// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The execution system: owns the typed queues, worker threads, affinity
//! matrix and delayed-task timer, and routes submissions between them.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;

use crate::error::ScheduleError;
use crate::mask::{QueueMark, ThreadMask};
use crate::queue::{Notifier, TaskQueue};
use crate::time::{Clock, Instant, SystemClock};
use crate::timer::{Promote, TaskId, Timer};

/// A closure representing one task resumption, handed to a [`TaskQueue`].
pub type Closure = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    /// The `ThreadMask` of whatever queue(s) the current OS thread services,
    /// or `ThreadMask::NONE` on a thread the execution system does not own.
    static CURRENT_THREAD_MASK: Cell<ThreadMask> = const { Cell::new(ThreadMask::NONE) };
}

/// Declarative description of one worker thread.
///
/// Immutable once passed to [`ExecutionSystem::new`]. Chainable, in the
/// style of a task builder: construct with [`WorkerConfig::new`], then
/// override defaults with the `with_*` setters.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    name: String,
    mask: ThreadMask,
    idle_spin_budget: u32,
}

impl WorkerConfig {
    /// The default number of consecutive empty polls before a worker sleeps.
    pub const DEFAULT_IDLE_SPIN_BUDGET: u32 = 64;

    /// Constructs a worker config with no queues and the default idle-spin
    /// budget; callers almost always chain [`WorkerConfig::with_mask`].
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mask: ThreadMask::NONE,
            idle_spin_budget: Self::DEFAULT_IDLE_SPIN_BUDGET,
        }
    }

    /// Sets which queues this worker services.
    #[must_use]
    pub fn with_mask(mut self, mask: ThreadMask) -> Self {
        self.mask = mask;
        self
    }

    /// Sets the maximum number of consecutive empty polls before this
    /// worker sleeps on its notifier.
    #[must_use]
    pub fn with_idle_spin_budget(mut self, budget: u32) -> Self {
        self.idle_spin_budget = budget;
        self
    }
}

/// Construction parameters for an [`ExecutionSystem`].
#[derive(Debug, Clone)]
pub struct ExecutionSystemConfig {
    /// Ordered sequence of worker thread descriptions.
    pub worker_configs: Vec<WorkerConfig>,
    /// Queues the calling ("main") thread is permitted to drain via
    /// [`ExecutionSystem::update_from_main`].
    pub main_thread_mask: ThreadMask,
    /// The largest `QueueMark` tag this system will construct a queue for.
    pub max_queue: QueueMark,
}

struct WorkerHandle {
    mask: ThreadMask,
    notifier: Arc<Notifier>,
    join: Option<JoinHandle<()>>,
}

struct QueuePromoter {
    queues: Arc<[Arc<TaskQueue<Closure>>]>,
}

impl Promote for QueuePromoter {
    fn promote(&self, target: QueueMark, closure: Closure) {
        self.queues[target.tag() as usize].push(closure);
    }
}

/// Owns the set of [`TaskQueue`]s indexed by [`QueueMark`], the worker
/// threads, the thread-to-queue affinity matrix, and the delayed-task
/// [`Timer`].
pub struct ExecutionSystem {
    queues: Arc<[Arc<TaskQueue<Closure>>]>,
    workers: Vec<WorkerHandle>,
    main_mask: ThreadMask,
    max_queue: QueueMark,
    shutdown: Arc<AtomicBool>,
    timer: Timer,
    clock: Arc<dyn Clock>,
}

impl ExecutionSystem {
    /// Builds the queues, spawns one thread per worker config plus the
    /// dedicated timer thread, and blocks until every spawned thread has
    /// published its identity.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn a worker or timer thread.
    #[must_use]
    pub fn new(config: ExecutionSystemConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// As [`ExecutionSystem::new`], but with an injectable [`Clock`] for
    /// deterministic tests of timed execution.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn a worker or timer thread.
    #[must_use]
    pub fn with_clock(config: ExecutionSystemConfig, clock: Arc<dyn Clock>) -> Self {
        let queue_count = usize::from(config.max_queue.tag()) + 1;
        let queues: Arc<[Arc<TaskQueue<Closure>>]> =
            (0..queue_count).map(|_| Arc::new(TaskQueue::new())).collect();

        let shutdown = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(config.worker_configs.len() + 2));

        let mut workers = Vec::with_capacity(config.worker_configs.len());
        for worker_config in config.worker_configs {
            let notifier = Arc::new(Notifier::new());
            let mask = worker_config.mask;
            let serviced: Vec<Arc<TaskQueue<Closure>>> = mask
                .iter()
                .filter(|m| usize::from(m.tag()) < queue_count)
                .map(|m| Arc::clone(&queues[m.tag() as usize]))
                .collect();
            for q in &serviced {
                q.subscribe(Arc::clone(&notifier));
            }

            let worker_shutdown = Arc::clone(&shutdown);
            let worker_notifier = Arc::clone(&notifier);
            let worker_barrier = Arc::clone(&barrier);
            let name = worker_config.name.clone();
            let idle_spin_budget = worker_config.idle_spin_budget;
            let join = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    CURRENT_THREAD_MASK.with(|m| m.set(mask));
                    worker_barrier.wait();
                    worker_loop(&serviced, &worker_notifier, idle_spin_budget, &worker_shutdown, &name);
                })
                .expect("failed to spawn worker thread");

            workers.push(WorkerHandle {
                mask,
                notifier,
                join: Some(join),
            });
        }

        let promoter = QueuePromoter {
            queues: Arc::clone(&queues),
        };
        let timer_clock = Arc::clone(&clock);
        let timer = Timer::start(timer_clock, promoter, "timer");
        barrier.wait();

        CURRENT_THREAD_MASK.with(|m| m.set(config.main_thread_mask));

        Self {
            queues,
            workers,
            main_mask: config.main_thread_mask,
            max_queue: config.max_queue,
            shutdown,
            timer,
            clock,
        }
    }

    /// Returns the current monotonic time according to this system's clock.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Enqueues `closure` so that some thread whose mask permits `q`
    /// eventually invokes it.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if `q` exceeds `max_queue`; this is a
    /// programming error the caller must validate in release builds.
    pub fn plan_execution(&self, closure: Closure, q: QueueMark) {
        debug_assert!(
            q.tag() <= self.max_queue.tag(),
            "queue mark {q:?} exceeds max_queue {:?}",
            self.max_queue
        );
        self.queues[q.tag() as usize].push(closure);
    }

    /// Schedules `closure` to be invoked on `q` no earlier than `fire_at`.
    /// If `fire_at` is already in the past, behaves as
    /// [`ExecutionSystem::plan_execution`] and returns [`TaskId::NONE`].
    ///
    /// # Errors
    ///
    /// Propagates [`ScheduleError`] if the delayed-task heap cannot grow to
    /// hold the new entry.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if `q` exceeds `max_queue`; this is a
    /// programming error the caller must validate in release builds.
    pub fn plan_execution_after(
        &self,
        closure: Closure,
        q: QueueMark,
        fire_at: Instant,
    ) -> Result<TaskId, ScheduleError> {
        debug_assert!(q.tag() <= self.max_queue.tag());
        if fire_at <= self.now() {
            self.plan_execution(closure, q);
            return Ok(TaskId::NONE);
        }
        self.timer.schedule(closure, q, fire_at)
    }

    /// Cancels a previously scheduled delayed task. Returns `true` iff it
    /// was still pending.
    pub fn cancel_execution(&self, id: TaskId) -> bool {
        self.timer.cancel(id)
    }

    /// Invokes `closure` inline if the calling thread's mask permits `q`;
    /// otherwise behaves as [`ExecutionSystem::plan_execution`].
    ///
    /// # Panics
    ///
    /// In debug builds, panics if `q` exceeds `max_queue`.
    pub fn execute_or_plan_execution(&self, closure: Closure, q: QueueMark) {
        debug_assert!(q.tag() <= self.max_queue.tag());
        if self.is_current_thread_fits(q) {
            closure();
        } else {
            self.plan_execution(closure, q);
        }
    }

    /// Pure query of the affinity matrix for the calling thread.
    #[must_use]
    pub fn is_current_thread_fits(&self, q: QueueMark) -> bool {
        CURRENT_THREAD_MASK.with(|m| m.get().contains(q))
    }

    /// Drains up to one task from each queue the main thread's mask
    /// permits. Must only be called from the thread that constructed this
    /// `ExecutionSystem`.
    pub fn update_from_main(&self) {
        for mark in self.main_mask.iter() {
            if let Some(closure) = self.queues[mark.tag() as usize].try_pop() {
                tracing::trace!(queue = ?mark, "main thread draining task");
                closure();
            }
        }
    }

    /// The affinity mask of every worker thread, in construction order.
    #[must_use]
    pub fn worker_masks(&self) -> Vec<ThreadMask> {
        self.workers.iter().map(|w| w.mask).collect()
    }
}

impl Drop for ExecutionSystem {
    fn drop(&mut self) {
        tracing::info!("execution system shutting down");
        self.shutdown.store(true, Ordering::Release);
        self.timer.shutdown();
        for worker in &self.workers {
            worker.notifier.wake();
        }
        for worker in &mut self.workers {
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
        }
    }
}

fn worker_loop(
    queues: &[Arc<TaskQueue<Closure>>],
    notifier: &Notifier,
    idle_spin_budget: u32,
    shutdown: &AtomicBool,
    name: &str,
) {
    let span = tracing::info_span!("worker", worker.name = %name);
    let _enter = span.enter();
    tracing::info!("worker thread started");

    let mut idle_polls: u32 = 0;
    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        let mut popped_any = false;
        for queue in queues {
            if let Some(closure) = queue.try_pop() {
                tracing::trace!("resuming a task");
                closure();
                popped_any = true;
            }
        }

        if popped_any {
            idle_polls = 0;
            continue;
        }

        idle_polls += 1;
        if idle_polls > idle_spin_budget {
            tracing::trace!("worker parking");
            // Recheck shutdown and every serviced queue after declaring
            // park intent: a push or the shutdown flag flipping in the
            // window after this worker's last `try_pop` above would
            // otherwise be missed entirely (see `Notifier::park_unless`).
            notifier.park_unless(|| {
                shutdown.load(Ordering::Acquire) || queues.iter().any(|q| !q.is_empty())
            });
            idle_polls = 0;
        }
    }

    tracing::info!("worker thread stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn test_system(worker_mask: ThreadMask, main_mask: ThreadMask) -> ExecutionSystem {
        ExecutionSystem::new(ExecutionSystemConfig {
            worker_configs: vec![WorkerConfig::new("worker-0")
                .with_mask(worker_mask)
                .with_idle_spin_budget(4)],
            main_thread_mask: main_mask,
            max_queue: QueueMark::WORKER,
        })
    }

    #[test]
    fn plan_execution_runs_on_worker() {
        let system = test_system(ThreadMask::only(QueueMark::WORKER), ThreadMask::only(QueueMark::MAIN));
        let done = Arc::new(AtomicBool::new(false));
        let done2 = Arc::clone(&done);
        system.plan_execution(Box::new(move || done2.store(true, Ordering::Release)), QueueMark::WORKER);

        for _ in 0..200 {
            if done.load(Ordering::Acquire) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(done.load(Ordering::Acquire));
    }

    #[test]
    fn update_from_main_drains_main_queue() {
        let system = test_system(ThreadMask::only(QueueMark::WORKER), ThreadMask::only(QueueMark::MAIN));
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = Arc::clone(&counter);
        system.plan_execution(Box::new(move || { counter2.fetch_add(1, Ordering::AcqRel); }), QueueMark::MAIN);

        assert!(system.is_current_thread_fits(QueueMark::MAIN));
        system.update_from_main();
        assert_eq!(counter.load(Ordering::Acquire), 1);
    }

    #[test]
    fn execute_or_plan_execution_runs_inline_when_mask_fits() {
        let system = test_system(ThreadMask::only(QueueMark::WORKER), ThreadMask::only(QueueMark::MAIN));
        let ran_inline = Arc::new(AtomicBool::new(false));
        let ran_inline2 = Arc::clone(&ran_inline);
        system.execute_or_plan_execution(
            Box::new(move || ran_inline2.store(true, Ordering::Release)),
            QueueMark::MAIN,
        );
        assert!(ran_inline.load(Ordering::Acquire));
    }
}
