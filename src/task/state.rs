// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The suspendable task state machine.
//!
//! A task's body is an ordinary `Future`; the six suspension primitives in
//! `task::ops` are small hand-written futures that park the task until some
//! external event fires. Resumption is driven by [`TaskInner::resume`],
//! which the execution system invokes by popping a closure from a queue —
//! the closure is produced by [`TaskWaker`], the one and only waker type
//! every suspension point shares. Because a task is only ever polled by the
//! single thread currently resuming it, the bookkeeping a concurrent
//! implementation would need (atomic remaining-counters, CAS loops over a
//! packed state word) collapses to plain sequential fields guarded by the
//! handful of atomics that really do cross threads: the state tag itself,
//! the cancellation flag, and the current queue mark.

use std::cell::{RefCell, UnsafeCell};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Wake, Waker};

use crate::error::TaskOutcome;
use crate::executor::ExecutionSystem;
use crate::mask::QueueMark;

/// The task's lifecycle: `Created -> (Suspended <-> Running)* ->
/// (Finished | Cancelled)`. Packed into a single `AtomicU8` alongside
/// [`WOKEN_BIT`] and driven by CAS loops (`StateCell::start_poll`/`wake`/
/// `end_poll`), in the style of `async-rt`'s packed task state
/// (`task::state::State::transition`), even though here the lifecycle tag
/// is a plain enum rather than a multi-field bitfield.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RawState {
    Created = 0,
    Running = 1,
    Suspended = 2,
    Finished = 3,
    Cancelled = 4,
}

impl RawState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Suspended,
            3 => Self::Finished,
            4 => Self::Cancelled,
            other => panic!("corrupt task state byte {other}"),
        }
    }

    pub(crate) const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }
}

/// Set alongside the lifecycle tag (in the same byte, same CAS) when a
/// waker fires while the task is `Running`. `async-rt::task::state::State`
/// calls the equivalent bit `WOKEN` and checks it inside the very same
/// transition that clears `POLLING`; the packing is what makes "did a wake
/// race my poll" and "am I exiting Running now" a single atomic question
/// instead of two separate ones that could observe each other's before and
/// after.
const WOKEN_BIT: u8 = 0b1000;
const STATE_MASK: u8 = 0b0111;

pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(RawState::Created as u8))
    }

    pub(crate) fn load(&self, order: Ordering) -> RawState {
        RawState::from_u8(self.0.load(order) & STATE_MASK)
    }

    fn store(&self, state: RawState, order: Ordering) {
        self.0.store(state as u8, order);
    }

    /// Applies `f` to the raw byte in a CAS loop, returning the byte
    /// observed just before the winning write (or before the first no-op
    /// check, when `f` reports no change).
    fn transition_raw(&self, mut f: impl FnMut(u8) -> u8) -> u8 {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = f(current);
            if next == current {
                return current;
            }
            match self.0.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }

    /// Begins a fresh poll: `Created`/`Suspended` -> `Running`, clearing any
    /// stale woken bit (there should be none at this point, but a fresh
    /// poll starts clean regardless). Returns the state observed just
    /// before the attempt; the caller only proceeds to poll the body when
    /// it was `Created` or `Suspended`.
    pub(crate) fn start_poll(&self) -> RawState {
        let prev = self.transition_raw(|raw| match RawState::from_u8(raw & STATE_MASK) {
            RawState::Created | RawState::Suspended => RawState::Running as u8,
            _ => raw,
        });
        RawState::from_u8(prev & STATE_MASK)
    }

    /// Called by the task's waker. If the task is `Suspended`, claims it
    /// (transitions to `Running`) and returns `true`: the caller is now
    /// responsible for enqueuing a resume closure. If the task is currently
    /// `Running` — as when `SwitchQueue::poll` wakes itself mid-poll — this
    /// only records the wake in `WOKEN_BIT` and returns `false`: no
    /// enqueue, because the in-flight `resume()` call will observe the bit
    /// in `end_poll` and reschedule itself. A terminal task's wake is a
    /// no-op.
    pub(crate) fn wake(&self) -> bool {
        let prev = self.transition_raw(|raw| match RawState::from_u8(raw & STATE_MASK) {
            RawState::Suspended => RawState::Running as u8,
            RawState::Running => raw | WOKEN_BIT,
            RawState::Created | RawState::Finished | RawState::Cancelled => raw,
        });
        RawState::from_u8(prev & STATE_MASK) == RawState::Suspended
    }

    /// Called once, by the currently-resuming thread, right after the body
    /// returns `Poll::Pending`. Unconditionally moves to `Suspended`,
    /// clearing any woken bit, and reports whether that bit had been set —
    /// i.e. whether a `wake()` raced in while the body was still being
    /// polled and therefore could not enqueue anything itself. When it
    /// reports `true` the caller must immediately enqueue a fresh resume
    /// closure (whose own `start_poll` will perform the ordinary
    /// `Suspended -> Running` claim); this is what replaces the lost
    /// wakeup with a guaranteed re-enqueue instead of silently settling
    /// into `Suspended` with nothing left to wake it.
    pub(crate) fn end_poll(&self) -> bool {
        let prev = self.0.swap(RawState::Suspended as u8, Ordering::AcqRel);
        prev & WOKEN_BIT != 0
    }
}

/// Downward cancellation: every task and every combinator implements this
/// so a cancelled parent can cascade to its children without knowing their
/// result types.
pub(crate) trait Cancellable: Send + Sync {
    /// Idempotent. Sets the cancellation flag, cascades to children, and —
    /// if currently suspended — arranges for the task to resume and observe
    /// the flag instead of polling its body again.
    fn request_cancel(self: Arc<Self>);
}

/// The ambient, type-erased half of a task's context: the pieces suspension
/// primitives need that do not depend on the task's output type `T`. Bound
/// into a thread-local while a task's body is being polled, so suspension
/// primitives can reach it from inside a running task without threading a
/// context argument through every async fn.
pub(crate) trait TaskContextOps: Send + Sync {
    fn current_queue(&self) -> QueueMark;
    fn set_queue(&self, q: QueueMark);
    fn system(&self) -> &Arc<ExecutionSystem>;
    fn is_cancelled(&self) -> bool;
    /// Cancels the currently-running task from within its own body. Unlike
    /// [`Cancellable::request_cancel`] this never needs to re-enqueue a
    /// resumption: the task is `Running` on the calling stack right now,
    /// and `resume()` observes the flag as soon as the body next yields
    /// `Poll::Pending`.
    fn request_self_cancel(&self);
    fn add_child(&self, child: Arc<dyn Cancellable>);
}

thread_local! {
    pub(crate) static CURRENT_TASK: RefCell<Option<Weak<dyn TaskContextOps>>> = const { RefCell::new(None) };
}

/// Runs `f` with `ctx` bound as the ambient current task, restoring
/// whatever was previously bound (supporting, in principle, a task that
/// somehow polls while another poll is already on the stack — which never
/// happens given `resume()`'s non-reentrancy contract, but costs nothing to
/// keep correct).
fn with_current_task<R>(ctx: Weak<dyn TaskContextOps>, f: impl FnOnce() -> R) -> R {
    let previous = CURRENT_TASK.with(|cell| cell.replace(Some(ctx)));
    let result = f();
    CURRENT_TASK.with(|cell| *cell.borrow_mut() = previous);
    result
}

/// Accesses the currently-resuming task's ambient context, if any.
///
/// # Panics
///
/// Panics if called outside of a task body (i.e. not during a `resume()`
/// call) — every suspension primitive in `task::ops` is only meaningful
/// from within one.
pub(crate) fn current_task() -> Arc<dyn TaskContextOps> {
    CURRENT_TASK.with(|cell| {
        cell.borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .expect("task suspension primitive used outside of a running task body")
    })
}

/// The waker shared by every suspension point. If the task is `Suspended`,
/// waking it claims the task and re-enqueues a closure that calls
/// [`TaskInner::resume`] on the task's *current* queue mark (read at wake
/// time, so `switch_queue` can retarget a pending wake simply by updating
/// the mark before waking). If the task is `Running` — e.g.
/// `SwitchQueue::poll` waking itself from inside its own poll — this only
/// records the wake; `resume()`'s `end_poll` check is what turns that
/// recorded wake into a guaranteed re-enqueue once the poll actually
/// finishes, instead of this call racing the poll to decide who schedules
/// the next resumption.
struct TaskWaker<T> {
    task: Arc<TaskInner<T>>,
}

impl<T: Send + 'static> Wake for TaskWaker<T> {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if !self.task.state.wake() {
            return;
        }
        let task = Arc::clone(&self.task);
        let queue = QueueMark::new(task.queue.load(Ordering::Acquire));
        task.system.plan_execution(Box::new(move || task.resume()), queue);
    }
}

/// A suspendable computation producing `T` or cancellation.
///
/// Always accessed through [`Arc`]; [`crate::task::TaskHandle`] is the
/// user-visible owning wrapper.
pub(crate) struct TaskInner<T> {
    state: StateCell,
    queue: AtomicU8,
    cancelled: std::sync::atomic::AtomicBool,
    result: UnsafeCell<Option<TaskOutcome<T>>>,
    body: Mutex<Option<Pin<Box<dyn Future<Output = T> + Send>>>>,
    children: Mutex<Vec<Arc<dyn Cancellable>>>,
    /// Weak back-reference to whoever started this task, stored purely to
    /// mirror the source data model; cancellation propagation is driven
    /// top-down through `children`, not through this pointer.
    #[allow(dead_code, reason = "retained for structural fidelity with the source data model")]
    parent: Mutex<Option<Weak<dyn Cancellable>>>,
    /// Waker registered by whoever is awaiting this task's completion
    /// (the parent's `await child` point, or a combinator).
    join_waker: Mutex<Option<Waker>>,
    system: Arc<ExecutionSystem>,
    name: &'static str,
}

// SAFETY: `T` is only ever produced, stored and read on a thread that has
// synchronized through the state/cancellation atomics (release on publish,
// acquire on read); the task itself is freely shareable between threads.
unsafe impl<T: Send> Send for TaskInner<T> {}
// SAFETY: see above; concurrent access to a `TaskInner<T>` is the norm
// (one thread resumes it while another may call `request_cancel`).
unsafe impl<T: Send> Sync for TaskInner<T> {}

static_assertions::assert_impl_all!(TaskInner<()>: Send, Sync);

impl<T: Send + 'static> TaskInner<T> {
    pub(crate) fn new(
        body: impl Future<Output = T> + Send + 'static,
        initial_queue: QueueMark,
        system: Arc<ExecutionSystem>,
        name: &'static str,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: StateCell::new(),
            queue: AtomicU8::new(initial_queue.tag()),
            cancelled: std::sync::atomic::AtomicBool::new(false),
            result: UnsafeCell::new(None),
            body: Mutex::new(Some(Box::pin(body))),
            children: Mutex::new(Vec::new()),
            parent: Mutex::new(None),
            join_waker: Mutex::new(None),
            system,
            name,
        })
    }

    /// Binds this task to the execution system and enqueues its initial
    /// resumption on `initial_queue`.
    pub(crate) fn start(self: &Arc<Self>) {
        let queue = QueueMark::new(self.queue.load(Ordering::Relaxed));
        let task = Arc::clone(self);
        self.system.plan_execution(Box::new(move || task.resume()), queue);
    }

    pub(crate) fn current_queue(&self) -> QueueMark {
        QueueMark::new(self.queue.load(Ordering::Acquire))
    }

    pub(crate) fn state(&self) -> RawState {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn set_parent(&self, parent: Weak<dyn Cancellable>) {
        *self.parent.lock().unwrap() = Some(parent);
    }

    /// Only callable on a thread that matches `task.current_queue`. Never
    /// re-entrant: the execution system never invokes `resume` for the same
    /// task concurrently or recursively.
    ///
    /// A stale wakeup can still land here after the task has already reached
    /// a terminal state — e.g. a `sleep` that was still pending in the timer
    /// when the task was cancelled out from under it by `any_of`/a parent
    /// cancel. That is not a programming error, just a race the timer has no
    /// way to avoid without cancelling the sleep itself, so it is a silent
    /// no-op rather than an assertion. The same guard also absorbs the
    /// ordinary case of a closure enqueued twice for the same wake (see
    /// `TaskWaker::wake_by_ref` and `end_poll` below): the second closure to
    /// actually run finds the task already `Running` and does nothing.
    pub(crate) fn resume(self: &Arc<Self>) {
        let prev = self.state.start_poll();
        if !matches!(prev, RawState::Created | RawState::Suspended) {
            tracing::trace!(task = self.name, state = ?prev, "ignoring stale resume of a terminal or already-running task");
            return;
        }

        if self.cancelled.load(Ordering::Acquire) {
            self.finish(TaskOutcome::Cancelled);
            return;
        }

        let waker = Waker::from(Arc::new(TaskWaker { task: Arc::clone(self) }));
        let mut cx = Context::from_waker(&waker);

        let weak_self: Weak<dyn TaskContextOps> = Arc::downgrade(self) as Weak<dyn TaskContextOps>;
        let poll_result = with_current_task(weak_self, || {
            let mut guard = self.body.lock().unwrap();
            let fut = guard.as_mut().expect("resume() called after task finished");
            fut.as_mut().poll(&mut cx)
        });

        match poll_result {
            Poll::Ready(value) => self.finish(TaskOutcome::Value(value)),
            Poll::Pending => {
                if self.cancelled.load(Ordering::Acquire) {
                    self.finish(TaskOutcome::Cancelled);
                } else if self.state.end_poll() {
                    // A wake raced in while the body was still being
                    // polled — e.g. `SwitchQueue::poll` calling
                    // `cx.waker().wake_by_ref()` on itself before this call
                    // reached this point. `TaskWaker::wake_by_ref` saw
                    // `Running` and only recorded the wake instead of
                    // enqueuing; reschedule now so it isn't lost.
                    let queue = self.current_queue();
                    let task = Arc::clone(self);
                    self.system.plan_execution(Box::new(move || task.resume()), queue);
                }
            }
        }
    }

    fn finish(self: &Arc<Self>, outcome: TaskOutcome<T>) {
        let cancelled = outcome.is_cancelled();
        // SAFETY: only the thread that wins the transition to a terminal
        // state writes the result slot, and it does so before the release
        // store below; readers (`TaskHandle::poll`) only read after
        // observing the terminal state with acquire ordering.
        unsafe {
            *self.result.get() = Some(outcome);
        }
        self.state.store(
            if cancelled { RawState::Cancelled } else { RawState::Finished },
            Ordering::Release,
        );
        *self.body.lock().unwrap() = None;
        tracing::debug!(task = self.name, cancelled, "task finished");
        if let Some(waker) = self.join_waker.lock().unwrap().take() {
            waker.wake();
        }
    }

    /// Takes the published result. Only valid to call once the state is
    /// terminal; returns `None` if already taken.
    ///
    /// # Safety
    ///
    /// The caller must have observed a terminal `state()` with acquire
    /// ordering (or stronger) before calling this.
    pub(crate) unsafe fn take_result(&self) -> Option<TaskOutcome<T>> {
        // SAFETY: caller contract above.
        unsafe { (*self.result.get()).take() }
    }

    pub(crate) fn register_join_waker(&self, waker: Waker) {
        *self.join_waker.lock().unwrap() = Some(waker);
    }

}

impl<T: Send + 'static> Cancellable for TaskInner<T> {
    /// Called by a parent (or the scheduler's root registry) holding a
    /// strong reference to this task, possibly from another thread.
    fn request_cancel(self: Arc<Self>) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let children = self.children.lock().unwrap().clone();
        for child in children {
            child.request_cancel();
        }
        if matches!(self.state(), RawState::Suspended) {
            let queue = self.current_queue();
            let task = Arc::clone(&self);
            self.system.plan_execution(Box::new(move || task.resume()), queue);
        }
    }
}

impl<T: Send + 'static> TaskContextOps for TaskInner<T> {
    fn current_queue(&self) -> QueueMark {
        TaskInner::current_queue(self)
    }

    fn set_queue(&self, q: QueueMark) {
        self.queue.store(q.tag(), Ordering::Release);
    }

    fn system(&self) -> &Arc<ExecutionSystem> {
        &self.system
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn request_self_cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let children = self.children.lock().unwrap().clone();
        for child in children {
            child.request_cancel();
        }
    }

    fn add_child(&self, child: Arc<dyn Cancellable>) {
        self.children.lock().unwrap().push(child);
    }
}
