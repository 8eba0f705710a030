// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The delayed-task timer: a dedicated thread holding a min-heap of
//! [`DelayedTask`]s under a mutex and condition variable, promoting each
//! into its target ready queue no earlier than its fire time.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, TryReserveError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::ScheduleError;
use crate::mask::QueueMark;
use crate::time::{Clock, Instant};

/// Identifier of one delayed task, used for [`cancel`](Timer::cancel).
///
/// `0` sentinels "no task" — it is returned whenever a closure is promoted
/// immediately rather than actually parked in the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// The sentinel value meaning "no delayed task was created".
    pub const NONE: Self = Self(0);

    /// Returns the raw numeric value of this id.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    const fn is_none(self) -> bool {
        self.0 == 0
    }
}

struct IdGenerator(AtomicU64);

impl IdGenerator {
    const fn new() -> Self {
        // Start at 1 so that 0 remains the sentinel.
        Self(AtomicU64::new(1))
    }

    fn next(&self) -> TaskId {
        TaskId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

type Closure = Box<dyn FnOnce() + Send + 'static>;

/// A task closure paired with a fire time, queued in the timer's min-heap.
struct DelayedTask {
    id: TaskId,
    fire_at: Instant,
    target: QueueMark,
    closure: Option<Closure>,
    cancelled: bool,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.id == other.id
    }
}
impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    /// Reversed so that `BinaryHeap` (a max-heap) behaves as a min-heap by
    /// fire time, with earliest at the root.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.fire_at.cmp(&self.fire_at).then_with(|| other.id.0.cmp(&self.id.0))
    }
}

/// What a producer does with a freshly promoted closure: hand it to its
/// target queue and wake a worker. Kept as a trait so the timer thread does
/// not need to know about [`crate::executor::ExecutionSystem`] directly.
pub trait Promote: Send + Sync {
    /// Invoked by the timer thread once per promoted closure, outside the
    /// heap's mutex.
    fn promote(&self, target: QueueMark, closure: Box<dyn FnOnce() + Send + 'static>);
}

struct Heap {
    tasks: BinaryHeap<DelayedTask>,
    shutdown: bool,
}

/// The dedicated timer thread and the heap it owns.
pub struct Timer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    heap: Mutex<Heap>,
    cv: Condvar,
    ids: IdGenerator,
}

impl Timer {
    /// Spawns the timer thread. `promote` is invoked whenever a task's fire
    /// time has arrived; it must not be called while the internal heap
    /// mutex is held (and it never is).
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn the timer thread.
    pub fn start<C, P>(clock: Arc<C>, promote: P, thread_name: &str) -> Self
    where
        C: Clock + ?Sized + 'static,
        P: Promote + 'static,
    {
        let shared = Arc::new(Shared {
            heap: Mutex::new(Heap {
                tasks: BinaryHeap::new(),
                shutdown: false,
            }),
            cv: Condvar::new(),
            ids: IdGenerator::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(thread_name.to_owned())
            .spawn(move || run(&worker_shared, clock.as_ref(), &promote))
            .expect("failed to spawn timer thread");

        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Schedules `closure` to be promoted onto `target` no earlier than
    /// `fire_at`. Returns the sentinel [`TaskId::NONE`] and behaves as an
    /// immediate [`Promote::promote`] call if `fire_at` is already in the
    /// past, matching `plan_execution`'s contract; the caller performs that
    /// immediate dispatch, this method only ever inserts into the heap.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError`] if the heap fails to grow to accommodate
    /// the new entry.
    #[expect(clippy::missing_panics_doc, reason = "heap mutex poisoning only")]
    pub fn schedule(
        &self,
        closure: Closure,
        target: QueueMark,
        fire_at: Instant,
    ) -> Result<TaskId, ScheduleError> {
        let id = self.shared.ids.next();
        let mut heap = self.shared.heap.lock().unwrap();
        heap.tasks
            .try_reserve(1)
            .map_err(ScheduleError::HeapAllocation)?;
        let was_root_fire_at = heap.tasks.peek().map(|t| t.fire_at);
        heap.tasks.push(DelayedTask {
            id,
            fire_at,
            target,
            closure: Some(closure),
            cancelled: false,
        });
        let is_new_root = was_root_fire_at.is_none_or(|prev| fire_at < prev);
        drop(heap);
        if is_new_root {
            self.shared.cv.notify_one();
        }
        Ok(id)
    }

    /// Marks `id` cancelled if it is still pending in the heap. Returns
    /// `true` iff it was found pending; `false` if already promoted, never
    /// existed, or is the sentinel id.
    #[expect(clippy::missing_panics_doc, reason = "heap mutex poisoning only")]
    pub fn cancel(&self, id: TaskId) -> bool {
        if id.is_none() {
            return false;
        }
        let mut heap = self.shared.heap.lock().unwrap();
        let mut found = false;
        let was_root = heap.tasks.peek().map(|t| t.id);
        // `BinaryHeap` has no in-place update; rebuild, marking the matching
        // entry cancelled and extracting its closure so the destructor runs
        // after the lock is released.
        let mut dropped = None;
        let tasks: Vec<DelayedTask> = std::mem::take(&mut heap.tasks).into_vec();
        let mut rebuilt = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            if task.id == id && !task.cancelled {
                task.cancelled = true;
                dropped = task.closure.take();
                found = true;
            }
            rebuilt.push(task);
        }
        heap.tasks = BinaryHeap::from(rebuilt);
        let is_root_mutation = was_root == Some(id);
        drop(heap);
        drop(dropped);
        if found && is_root_mutation {
            self.shared.cv.notify_one();
        }
        found
    }

    /// Requests shutdown: clears the heap and wakes the timer thread, which
    /// then exits. Blocks until the thread has joined.
    #[expect(clippy::missing_panics_doc, reason = "heap mutex poisoning only")]
    pub fn shutdown(&self) {
        {
            let mut heap = self.shared.heap.lock().unwrap();
            heap.shutdown = true;
            heap.tasks.clear();
        }
        self.shared.cv.notify_all();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<C: Clock, P: Promote>(shared: &Shared, clock: &C, promote: &P) {
    tracing::info!("timer thread started");
    loop {
        let mut heap = shared.heap.lock().unwrap();
        loop {
            if heap.shutdown {
                tracing::info!("timer thread shutting down");
                return;
            }
            let Some(root) = heap.tasks.peek() else {
                heap = shared.cv.wait(heap).unwrap();
                continue;
            };
            let now = clock.now();
            if root.fire_at > now {
                let timeout = root.fire_at.duration_since(now);
                let (guard, _timeout_result) = shared.cv.wait_timeout(heap, timeout).unwrap();
                heap = guard;
                continue;
            }
            break;
        }
        if heap.shutdown {
            return;
        }
        let task = heap.tasks.pop().expect("root was peeked above");
        drop(heap);

        if task.cancelled {
            tracing::trace!(task.id = task.id.value(), "dropping cancelled delayed task");
            continue;
        }
        tracing::trace!(task.id = task.id.value(), queue = ?task.target, "promoting delayed task");
        if let Some(closure) = task.closure {
            promote.promote(task.target, closure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::FakeClock;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct RecordingPromoter {
        fired: StdMutex<Vec<QueueMark>>,
    }

    impl Promote for Arc<RecordingPromoter> {
        fn promote(&self, target: QueueMark, closure: Box<dyn FnOnce() + Send + 'static>) {
            closure();
            self.fired.lock().unwrap().push(target);
        }
    }

    #[test]
    fn cancel_before_fire_time_prevents_invocation() {
        let clock = Arc::new(FakeClock::new());
        let promoter = Arc::new(RecordingPromoter {
            fired: StdMutex::new(Vec::new()),
        });
        let invoked = Arc::new(StdMutex::new(false));

        let timer = Timer::start(Arc::clone(&clock), Arc::clone(&promoter), "test-timer");

        let invoked2 = Arc::clone(&invoked);
        let id = timer
            .schedule(
                Box::new(move || *invoked2.lock().unwrap() = true),
                QueueMark::WORKER,
                clock.now() + Duration::from_millis(100),
            )
            .expect("schedule should succeed");

        clock.advance(Duration::from_millis(10));
        assert!(timer.cancel(id));

        clock.advance(Duration::from_millis(200));
        std::thread::sleep(Duration::from_millis(50));

        assert!(!*invoked.lock().unwrap());
        assert!(promoter.fired.lock().unwrap().is_empty());
    }

    #[test]
    fn sentinel_id_cannot_be_cancelled() {
        let clock = Arc::new(FakeClock::new());
        let promoter = Arc::new(RecordingPromoter {
            fired: StdMutex::new(Vec::new()),
        });
        let timer = Timer::start(clock, promoter, "test-timer-2");
        assert!(!timer.cancel(TaskId::NONE));
    }
}
