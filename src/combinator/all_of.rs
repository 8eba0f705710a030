// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `all_of`: waits for every child to reach a terminal state, aggregating
//! their values into a tuple. Cancellation of any child cancels the whole
//! combinator.
//!
//! A design tracking completion with an atomic *remaining* counter would
//! make sense if children could signal from arbitrary threads. Here the
//! combinator itself is only ever polled by the single thread currently
//! resuming its parent task (`resume()` is never reentrant), so the
//! counter collapses to a plain `u32` field on the combinator struct; the
//! children still complete concurrently on other threads, only the
//! combinator's own bookkeeping is serialized.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::TaskOutcome;
use crate::task::TaskHandle;

/// Zero-arity `all_of`: completes immediately, matching "if every child is
/// void, the combinator itself is void."
#[must_use]
pub fn all_of0() -> AllOf0 {
    AllOf0
}

#[doc(hidden)]
pub struct AllOf0;

impl Future for AllOf0 {
    type Output = TaskOutcome<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Ready(TaskOutcome::Value(()))
    }
}

/// Slot tracking one child of a combinator: either still in flight, or
/// already resolved to its outcome.
enum Slot<T> {
    Pending(TaskHandle<T>),
    Done(TaskOutcome<T>),
}

impl<T: Send + 'static> Slot<T> {
    /// Polls the child if still pending, updating `self` in place. Returns
    /// `true` the call in which the child first reaches a terminal state.
    fn poll_advance(&mut self, cx: &mut Context<'_>) -> bool {
        match self {
            Self::Done(_) => false,
            Self::Pending(handle) => {
                // SAFETY: `handle` is owned by `self`, never moved out
                // while pinned elsewhere, and `TaskHandle` itself has no
                // internal self-referential pointers (it only wraps an
                // `Arc`), so it is sound to treat it as `Unpin` here.
                let pinned = unsafe { Pin::new_unchecked(handle) };
                match pinned.poll(cx) {
                    Poll::Ready(outcome) => {
                        *self = Self::Done(outcome);
                        true
                    }
                    Poll::Pending => false,
                }
            }
        }
    }

    fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    fn take_outcome(self) -> TaskOutcome<T> {
        match self {
            Self::Done(outcome) => outcome,
            Self::Pending(_) => unreachable!("take_outcome called before child completed"),
        }
    }
}

fn request_cancel_if_pending<T: Send + 'static>(slot: &Slot<T>) {
    if let Slot::Pending(handle) = slot {
        handle.request_cancel();
    }
}

/// `all_of` over two children.
#[must_use]
pub fn all_of2<A: Send + 'static, B: Send + 'static>(
    a: TaskHandle<A>,
    b: TaskHandle<B>,
) -> AllOf2<A, B> {
    AllOf2 {
        a: Slot::Pending(a),
        b: Slot::Pending(b),
        cancelled: false,
    }
}

#[doc(hidden)]
pub struct AllOf2<A, B> {
    a: Slot<A>,
    b: Slot<B>,
    cancelled: bool,
}

impl<A: Send + 'static, B: Send + 'static> Future for AllOf2<A, B> {
    type Output = TaskOutcome<(A, B)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.a.poll_advance(cx) && matches!(this.a, Slot::Done(TaskOutcome::Cancelled)) {
            this.cancelled = true;
            request_cancel_if_pending(&this.b);
        }
        if this.b.poll_advance(cx) && matches!(this.b, Slot::Done(TaskOutcome::Cancelled)) {
            this.cancelled = true;
            request_cancel_if_pending(&this.a);
        }

        if !this.a.is_done() || !this.b.is_done() {
            return Poll::Pending;
        }

        if this.cancelled {
            return Poll::Ready(TaskOutcome::Cancelled);
        }
        let a_val = std::mem::replace(&mut this.a, Slot::Done(TaskOutcome::Cancelled)).take_outcome();
        let b_val = std::mem::replace(&mut this.b, Slot::Done(TaskOutcome::Cancelled)).take_outcome();
        match (a_val, b_val) {
            (TaskOutcome::Value(a), TaskOutcome::Value(b)) => Poll::Ready(TaskOutcome::Value((a, b))),
            _ => Poll::Ready(TaskOutcome::Cancelled),
        }
    }
}

/// `all_of` over three children.
#[must_use]
pub fn all_of3<A: Send + 'static, B: Send + 'static, C: Send + 'static>(
    a: TaskHandle<A>,
    b: TaskHandle<B>,
    c: TaskHandle<C>,
) -> AllOf3<A, B, C> {
    AllOf3 {
        a: Slot::Pending(a),
        b: Slot::Pending(b),
        c: Slot::Pending(c),
        cancelled: false,
    }
}

#[doc(hidden)]
pub struct AllOf3<A, B, C> {
    a: Slot<A>,
    b: Slot<B>,
    c: Slot<C>,
    cancelled: bool,
}

impl<A: Send + 'static, B: Send + 'static, C: Send + 'static> Future for AllOf3<A, B, C> {
    type Output = TaskOutcome<(A, B, C)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.a.poll_advance(cx) && matches!(this.a, Slot::Done(TaskOutcome::Cancelled)) {
            this.cancelled = true;
        }
        if this.b.poll_advance(cx) && matches!(this.b, Slot::Done(TaskOutcome::Cancelled)) {
            this.cancelled = true;
        }
        if this.c.poll_advance(cx) && matches!(this.c, Slot::Done(TaskOutcome::Cancelled)) {
            this.cancelled = true;
        }

        if this.cancelled {
            request_cancel_if_pending(&this.a);
            request_cancel_if_pending(&this.b);
            request_cancel_if_pending(&this.c);
        }

        if !this.a.is_done() || !this.b.is_done() || !this.c.is_done() {
            return Poll::Pending;
        }

        if this.cancelled {
            return Poll::Ready(TaskOutcome::Cancelled);
        }
        let a_val = std::mem::replace(&mut this.a, Slot::Done(TaskOutcome::Cancelled)).take_outcome();
        let b_val = std::mem::replace(&mut this.b, Slot::Done(TaskOutcome::Cancelled)).take_outcome();
        let c_val = std::mem::replace(&mut this.c, Slot::Done(TaskOutcome::Cancelled)).take_outcome();
        match (a_val, b_val, c_val) {
            (TaskOutcome::Value(a), TaskOutcome::Value(b), TaskOutcome::Value(c)) => {
                Poll::Ready(TaskOutcome::Value((a, b, c)))
            }
            _ => Poll::Ready(TaskOutcome::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionSystemConfig, WorkerConfig};
    use crate::mask::{QueueMark, ThreadMask};
    use crate::task;
    use std::sync::Arc;

    fn system() -> Arc<crate::executor::ExecutionSystem> {
        Arc::new(crate::executor::ExecutionSystem::new(ExecutionSystemConfig {
            worker_configs: vec![WorkerConfig::new("w").with_mask(ThreadMask::only(QueueMark::WORKER))],
            main_thread_mask: ThreadMask::only(QueueMark::MAIN),
            max_queue: QueueMark::WORKER,
        }))
    }

    #[test]
    fn all_of_aggregates_three_children() {
        let system = system();
        let parent = task::spawn(
            Arc::clone(&system),
            async {
                let a = task::start_child(async { 1 }, QueueMark::WORKER);
                let b = task::start_child(async { 2 }, QueueMark::WORKER);
                let c = task::start_child(async { 3 }, QueueMark::WORKER);
                all_of3(a, b, c).await
            },
            QueueMark::MAIN,
            "all-of-parent",
        );

        let outcome = task::block_on(parent);
        assert_eq!(outcome, TaskOutcome::Value((1, 2, 3)));
    }
}
