// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Suspendable tasks and the six suspension primitives bodies may use.
//!
//! A task body is an ordinary `async fn`/`async move {}` block; the
//! primitives below (`switch_queue`, `sleep`, `await_callback`,
//! `start_child`, `cancel_self`) are the only ways it may suspend. Each
//! reaches the currently-resuming task through an ambient, thread-bound
//! context rather than an explicit argument.

mod state;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::error::TaskOutcome;
use crate::executor::ExecutionSystem;
use crate::mask::QueueMark;

pub(crate) use state::{current_task, Cancellable, TaskContextOps};
use state::TaskInner;

/// External owning reference to a [`Task`](self). Movable, non-copyable;
/// awaiting a handle yields the task's [`TaskOutcome`].
///
/// Dropping the last handle does not necessarily destroy the task: a
/// suspended task's strong reference lives on in whatever continuation
/// closure is currently queued for it (in a [`crate::queue::TaskQueue`], the
/// delayed-task timer, or a [`ResumeHandle`]), per the ownership-transfer
/// rule in the source data model.
pub struct TaskHandle<T> {
    inner: Arc<TaskInner<T>>,
}

impl<T: Send + 'static> TaskHandle<T> {
    pub(crate) fn new(inner: Arc<TaskInner<T>>) -> Self {
        Self { inner }
    }

    /// Requests cancellation of this task. Idempotent and monotone.
    pub fn request_cancel(&self) {
        Cancellable::request_cancel(Arc::clone(&self.inner) as Arc<dyn Cancellable>);
    }

    pub(crate) fn as_cancellable(&self) -> Arc<dyn Cancellable> {
        Arc::clone(&self.inner) as Arc<dyn Cancellable>
    }
}

impl<T: Send + 'static> Future for TaskHandle<T> {
    type Output = TaskOutcome<T>;

    /// # Panics
    ///
    /// Panics if polled again after already yielding `Poll::Ready` once.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = &self.inner;
        if inner.state().is_terminal() {
            // SAFETY: `state()` just observed a terminal state with acquire
            // ordering, which synchronizes with the release store in
            // `finish`, making the result slot write visible here.
            let outcome = unsafe { inner.take_result() }
                .expect("TaskHandle polled again after yielding Ready");
            return Poll::Ready(outcome);
        }

        inner.register_join_waker(cx.waker().clone());

        if inner.state().is_terminal() {
            // SAFETY: see above.
            if let Some(outcome) = unsafe { inner.take_result() } {
                return Poll::Ready(outcome);
            }
        }
        Poll::Pending
    }
}

/// Constructs and starts a task bound to `system`, with `initial_queue` as
/// its queue affinity at launch. `name` is used only for diagnostics.
pub(crate) fn spawn<T: Send + 'static>(
    system: Arc<ExecutionSystem>,
    body: impl Future<Output = T> + Send + 'static,
    initial_queue: QueueMark,
    name: &'static str,
) -> TaskHandle<T> {
    let inner = TaskInner::new(body, initial_queue, system, name);
    inner.start();
    TaskHandle::new(inner)
}

/// Starts `body` as a child of the currently-running task (suspension
/// primitive 4: *start child task*). Non-suspending: control returns to the
/// caller immediately with a [`TaskHandle`]; the child's first resumption is
/// enqueued like any other task start.
///
/// # Panics
///
/// Panics if called outside of a running task body.
pub fn start_child<T: Send + 'static>(
    body: impl Future<Output = T> + Send + 'static,
    queue: QueueMark,
) -> TaskHandle<T> {
    let ctx = current_task();
    let system = Arc::clone(ctx.system());
    let handle = spawn(system, body, queue, "child");
    ctx.add_child(handle.as_cancellable());
    handle
}

/// Suspension primitive 2: moves the task onto queue `q`. If the calling
/// thread is already servicing `q` this still suspends once and is resumed
/// by the execution system (never run back-to-back inline), matching
/// `start`'s own always-enqueue contract.
///
/// # Panics
///
/// Panics if called outside of a running task body.
pub fn switch_queue(q: QueueMark) -> SwitchQueue {
    SwitchQueue { target: q, done: false }
}

#[doc(hidden)]
pub struct SwitchQueue {
    target: QueueMark,
    done: bool,
}

impl Future for SwitchQueue {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(());
        }
        this.done = true;
        let ctx = current_task();
        ctx.set_queue(this.target);
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Suspension primitive 3: resumes the task on its current queue no
/// earlier than `now + duration`.
///
/// # Panics
///
/// Panics if called outside of a running task body.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        duration,
        armed: false,
    }
}

#[doc(hidden)]
pub struct Sleep {
    duration: Duration,
    armed: bool,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.armed {
            return Poll::Ready(());
        }
        this.armed = true;
        let ctx = current_task();
        let system = Arc::clone(ctx.system());
        let queue = ctx.current_queue();
        let fire_at = system.now() + this.duration;
        let waker = cx.waker().clone();
        // The fired closure only wakes the waker; the waker itself (a
        // `TaskWaker`) is what re-plans the actual resumption onto the
        // task's current queue, so no closure here needs `system` again.
        let _ = system.plan_execution_after(Box::new(move || waker.wake()), queue, fire_at);
        Poll::Pending
    }
}

/// An opaque handle user code calls to resume a task suspended at
/// [`await_callback`]. May be called from any thread, at most meaningfully
/// once — later calls are no-ops.
#[derive(Clone)]
pub struct ResumeHandle {
    waker: Arc<Mutex<Option<Waker>>>,
    fired: Arc<AtomicBool>,
}

impl ResumeHandle {
    /// Resumes the suspended task. Idempotent: only the first call has any
    /// effect.
    #[expect(clippy::missing_panics_doc, reason = "internal mutex poisoning only")]
    pub fn resume(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(waker) = self.waker.lock().unwrap().take() {
            waker.wake();
        }
    }
}

/// Suspension primitive 1: hands an opaque [`ResumeHandle`] to user code,
/// which calls it (from any thread) to resume the task on its current
/// queue. Returns the awaiter and the handle as a pair; the caller is
/// expected to `.await` the former after handing the latter off.
///
/// # Panics
///
/// Panics if called outside of a running task body.
pub fn await_callback() -> (AwaitCallback, ResumeHandle) {
    let waker = Arc::new(Mutex::new(None));
    let fired = Arc::new(AtomicBool::new(false));
    (
        AwaitCallback {
            waker: Arc::clone(&waker),
            fired: Arc::clone(&fired),
            polled_once: false,
        },
        ResumeHandle { waker, fired },
    )
}

#[doc(hidden)]
pub struct AwaitCallback {
    waker: Arc<Mutex<Option<Waker>>>,
    fired: Arc<AtomicBool>,
    polled_once: bool,
}

impl Future for AwaitCallback {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.fired.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        *this.waker.lock().unwrap() = Some(cx.waker().clone());
        this.polled_once = true;
        // Re-check: `resume()` may have fired between the load above and
        // registering the waker.
        if this.fired.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

/// Suspension primitive 6: transitions the running task straight to
/// `Cancelled` without ever resuming again. Cascades to any children
/// already registered via [`start_child`].
///
/// # Panics
///
/// Panics if called outside of a running task body.
pub fn cancel_self() -> CancelSelf {
    CancelSelf { requested: false }
}

#[doc(hidden)]
pub struct CancelSelf {
    requested: bool,
}

impl Future for CancelSelf {
    /// Never actually produced: the task driver intercepts the
    /// cancellation flag before polling the body again.
    type Output = std::convert::Infallible;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.requested {
            this.requested = true;
            current_task().request_self_cancel();
        }
        Poll::Pending
    }
}

/// Minimal blocking executor for a single [`TaskHandle`], used only by
/// tests (here and in `combinator::tests`): parks the calling thread on a
/// condvar woken by the handle's waker.
#[cfg(test)]
pub(crate) fn block_on<T: Send + 'static>(mut handle: TaskHandle<T>) -> TaskOutcome<T> {
    use std::sync::Condvar;

    struct ThreadWaker {
        mutex: Mutex<bool>,
        cv: Condvar,
    }
    impl std::task::Wake for ThreadWaker {
        fn wake(self: Arc<Self>) {
            self.wake_by_ref();
        }
        fn wake_by_ref(self: &Arc<Self>) {
            *self.mutex.lock().unwrap() = true;
            self.cv.notify_one();
        }
    }

    let waker_state = Arc::new(ThreadWaker {
        mutex: Mutex::new(true),
        cv: Condvar::new(),
    });

    loop {
        *waker_state.mutex.lock().unwrap() = false;
        let waker: Waker = Waker::from(Arc::clone(&waker_state));
        let mut cx = Context::from_waker(&waker);
        // SAFETY: `handle` is a local, never moved out from under this
        // pinned reference.
        let pinned = unsafe { Pin::new_unchecked(&mut handle) };
        match pinned.poll(&mut cx) {
            Poll::Ready(outcome) => return outcome,
            Poll::Pending => {
                let guard = waker_state.mutex.lock().unwrap();
                let _ = waker_state.cv.wait_while(guard, |notified| !*notified).unwrap();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionSystemConfig, WorkerConfig};
    use crate::mask::ThreadMask;
    use std::sync::atomic::AtomicUsize;

    fn system_two_queues() -> Arc<ExecutionSystem> {
        Arc::new(ExecutionSystem::new(ExecutionSystemConfig {
            worker_configs: vec![
                WorkerConfig::new("worker-main").with_mask(ThreadMask::only(QueueMark::MAIN)),
                WorkerConfig::new("worker-bg").with_mask(ThreadMask::only(QueueMark::WORKER)),
            ],
            main_thread_mask: ThreadMask::NONE,
            max_queue: QueueMark::WORKER,
        }))
    }

    #[test]
    fn ping_pong_across_queues() {
        let system = system_two_queues();
        let handle = spawn(
            Arc::clone(&system),
            async {
                switch_queue(QueueMark::WORKER).await;
                let value = 21 * 2;
                switch_queue(QueueMark::MAIN).await;
                value
            },
            QueueMark::MAIN,
            "ping-pong",
        );

        let outcome = block_on(handle);
        assert_eq!(outcome, TaskOutcome::Value(42));
    }

    #[test]
    fn await_callback_resumes_task() {
        let system = system_two_queues();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = Arc::clone(&counter);

        let handle = spawn(
            Arc::clone(&system),
            async move {
                let (awaiter, resume) = await_callback();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(20));
                    resume.resume();
                });
                awaiter.await;
                counter2.fetch_add(1, Ordering::AcqRel);
                7
            },
            QueueMark::MAIN,
            "await-callback",
        );

        let outcome = block_on(handle);
        assert_eq!(outcome, TaskOutcome::Value(7));
        assert_eq!(counter.load(Ordering::Acquire), 1);
    }

}
