// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `any_of`: the first child to reach a terminal state wins; every other
//! child is cancelled and the combinator does not resolve until all of
//! them have *also* reached a terminal state, so a loser's side effects
//! are sequenced before the parent resumes.
//!
//! A two-phase design (a winner-index CAS gating a secondary countdown)
//! would make sense if completion callbacks could fire from arbitrary
//! threads. Here the combinator is only ever polled by the
//! thread currently resuming its parent, so "the winner" is just whichever
//! child's slot is observed `Done` first during a `poll` call, recorded in
//! a plain field.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::{Either2, Either3};
use crate::error::TaskOutcome;
use crate::task::TaskHandle;

enum Slot<T> {
    Pending(TaskHandle<T>),
    Done(TaskOutcome<T>),
}

impl<T: Send + 'static> Slot<T> {
    fn poll_advance(&mut self, cx: &mut Context<'_>) -> bool {
        match self {
            Self::Done(_) => false,
            Self::Pending(handle) => {
                // SAFETY: see `combinator::all_of::Slot::poll_advance`.
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

    fn request_cancel_if_pending(&self) {
        if let Self::Pending(handle) = self {
            handle.request_cancel();
        }
    }

    fn take_outcome(self) -> TaskOutcome<T> {
        match self {
            Self::Done(outcome) => outcome,
            Self::Pending(_) => unreachable!("take_outcome called before child completed"),
        }
    }
}

/// `any_of` over two children.
#[must_use]
pub fn any_of2<A: Send + 'static, B: Send + 'static>(
    a: TaskHandle<A>,
    b: TaskHandle<B>,
) -> AnyOf2<A, B> {
    AnyOf2 {
        a: Slot::Pending(a),
        b: Slot::Pending(b),
        winner: None,
    }
}

#[doc(hidden)]
pub struct AnyOf2<A, B> {
    a: Slot<A>,
    b: Slot<B>,
    winner: Option<u8>,
}

impl<A: Send + 'static, B: Send + 'static> Future for AnyOf2<A, B> {
    type Output = TaskOutcome<Either2<A, B>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.a.poll_advance(cx) && this.winner.is_none() {
            this.winner = Some(0);
            this.b.request_cancel_if_pending();
        }
        if this.b.poll_advance(cx) && this.winner.is_none() {
            this.winner = Some(1);
            this.a.request_cancel_if_pending();
        }

        if !this.a.is_done() || !this.b.is_done() {
            return Poll::Pending;
        }

        match this.winner.expect("a child completed, so a winner was recorded") {
            0 => Poll::Ready(
                std::mem::replace(&mut this.a, Slot::Done(TaskOutcome::Cancelled))
                    .take_outcome()
                    .map(Either2::Left),
            ),
            _ => Poll::Ready(
                std::mem::replace(&mut this.b, Slot::Done(TaskOutcome::Cancelled))
                    .take_outcome()
                    .map(Either2::Right),
            ),
        }
    }
}

/// `any_of` over three children.
#[must_use]
pub fn any_of3<A: Send + 'static, B: Send + 'static, C: Send + 'static>(
    a: TaskHandle<A>,
    b: TaskHandle<B>,
    c: TaskHandle<C>,
) -> AnyOf3<A, B, C> {
    AnyOf3 {
        a: Slot::Pending(a),
        b: Slot::Pending(b),
        c: Slot::Pending(c),
        winner: None,
    }
}

#[doc(hidden)]
pub struct AnyOf3<A, B, C> {
    a: Slot<A>,
    b: Slot<B>,
    c: Slot<C>,
    winner: Option<u8>,
}

impl<A: Send + 'static, B: Send + 'static, C: Send + 'static> Future for AnyOf3<A, B, C> {
    type Output = TaskOutcome<Either3<A, B, C>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.a.poll_advance(cx) && this.winner.is_none() {
            this.winner = Some(0);
        }
        if this.b.poll_advance(cx) && this.winner.is_none() {
            this.winner = Some(1);
        }
        if this.c.poll_advance(cx) && this.winner.is_none() {
            this.winner = Some(2);
        }

        if this.winner.is_some() {
            this.a.request_cancel_if_pending();
            this.b.request_cancel_if_pending();
            this.c.request_cancel_if_pending();
        }

        if !this.a.is_done() || !this.b.is_done() || !this.c.is_done() {
            return Poll::Pending;
        }

        match this.winner.expect("a child completed, so a winner was recorded") {
            0 => Poll::Ready(
                std::mem::replace(&mut this.a, Slot::Done(TaskOutcome::Cancelled))
                    .take_outcome()
                    .map(Either3::First),
            ),
            1 => Poll::Ready(
                std::mem::replace(&mut this.b, Slot::Done(TaskOutcome::Cancelled))
                    .take_outcome()
                    .map(Either3::Second),
            ),
            _ => Poll::Ready(
                std::mem::replace(&mut this.c, Slot::Done(TaskOutcome::Cancelled))
                    .take_outcome()
                    .map(Either3::Third),
            ),
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
    use std::time::Duration;

    fn system() -> Arc<crate::executor::ExecutionSystem> {
        Arc::new(crate::executor::ExecutionSystem::new(ExecutionSystemConfig {
            worker_configs: vec![
                WorkerConfig::new("w0").with_mask(ThreadMask::only(QueueMark::WORKER)),
                WorkerConfig::new("w1").with_mask(ThreadMask::only(QueueMark::WORKER)),
            ],
            main_thread_mask: ThreadMask::only(QueueMark::MAIN),
            max_queue: QueueMark::WORKER,
        }))
    }

    #[test]
    fn any_of_resolves_with_the_faster_child() {
        let system = system();
        let parent = task::spawn(
            Arc::clone(&system),
            async {
                let fast = task::start_child(async { "fast" }, QueueMark::WORKER);
                let slow = task::start_child(
                    async {
                        task::sleep(Duration::from_millis(200)).await;
                        "slow"
                    },
                    QueueMark::WORKER,
                );
                any_of2(fast, slow).await
            },
            QueueMark::MAIN,
            "any-of-parent",
        );

        let outcome = task::block_on(parent);
        assert_eq!(outcome, TaskOutcome::Value(Either2::Left("fast")));
    }
}
