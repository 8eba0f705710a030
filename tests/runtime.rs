//! Integration coverage for the runtime's seed end-to-end scenarios,
//! exercised only through the crate's public surface (no `pub(crate)`
//! helpers).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

use async_core::error::TaskOutcome;
use async_core::executor::{ExecutionSystemConfig, WorkerConfig};
use async_core::mask::{QueueMark, ThreadMask};
use async_core::scheduler::Scheduler;
use async_core::task::{self, TaskHandle};
use async_core::combinator::{all_of3, any_of2, Either2};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Installs a default-off, `RUST_LOG`-controlled trace subscriber for the
/// duration of one test, so traces only surface when a test actually fails
/// and the developer re-runs it with `RUST_LOG` set.
fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .set_default()
}

/// Blocks the calling thread on a `TaskHandle`, parking on a condvar woken
/// by the handle's own waker. The crate exposes no public blocking
/// adapter (the runtime is meant to be driven by its own worker threads),
/// so scenario tests park on the handle the same way any other external
/// caller synchronizing with a background task would.
fn block_on<T: Send + 'static>(mut handle: TaskHandle<T>) -> TaskOutcome<T> {
    struct ThreadWaker {
        mutex: Mutex<bool>,
        cv: Condvar,
    }
    impl Wake for ThreadWaker {
        fn wake(self: Arc<Self>) {
            self.wake_by_ref();
        }
        fn wake_by_ref(self: &Arc<Self>) {
            *self.mutex.lock().unwrap() = true;
            self.cv.notify_one();
        }
    }

    let state = Arc::new(ThreadWaker {
        mutex: Mutex::new(true),
        cv: Condvar::new(),
    });

    loop {
        *state.mutex.lock().unwrap() = false;
        let waker: Waker = Waker::from(Arc::clone(&state));
        let mut cx = Context::from_waker(&waker);
        // SAFETY: `handle` is a local never moved out from under this
        // pinned reference, and `TaskHandle` has no internal
        // self-referential pointers (it only wraps an `Arc`).
        let pinned = unsafe { Pin::new_unchecked(&mut handle) };
        match pinned.poll(&mut cx) {
            Poll::Ready(outcome) => return outcome,
            Poll::Pending => {
                let guard = state.mutex.lock().unwrap();
                let _ = state.cv.wait_while(guard, |notified| !*notified).unwrap();
            }
        }
    }
}

fn two_queue_scheduler() -> Scheduler {
    Scheduler::new(ExecutionSystemConfig {
        worker_configs: vec![
            WorkerConfig::new("worker-main").with_mask(ThreadMask::only(QueueMark::MAIN)),
            WorkerConfig::new("worker-a").with_mask(ThreadMask::only(QueueMark::WORKER)),
            WorkerConfig::new("worker-b").with_mask(ThreadMask::only(QueueMark::WORKER)),
        ],
        main_thread_mask: ThreadMask::NONE,
        max_queue: QueueMark::WORKER,
    })
}

/// Scenario 1: ping-pong across queues. Root task on `MAIN` switches to
/// `WORKER`, computes `21 * 2`, switches back to `MAIN`, returns `42`.
#[test]
fn ping_pong_across_queues_yields_42() {
    let _trace = init_tracing();
    let scheduler = two_queue_scheduler();
    let handle = scheduler.start_task(
        async {
            task::switch_queue(QueueMark::WORKER).await;
            let value = 21 * 2;
            task::switch_queue(QueueMark::MAIN).await;
            value
        },
        QueueMark::MAIN,
    );

    assert_eq!(block_on(handle), TaskOutcome::Value(42));
}

/// Scenario 2: `all_of` aggregation. Three children return 10, 20, 30 on
/// `WORKER`; the parent awaits `all_of(c1, c2, c3)` and sums them to 60.
#[test]
fn all_of_aggregation_sums_to_sixty() {
    let _trace = init_tracing();
    let scheduler = two_queue_scheduler();
    let handle = scheduler.start_task(
        async {
            let a = task::start_child(async { 10 }, QueueMark::WORKER);
            let b = task::start_child(async { 20 }, QueueMark::WORKER);
            let c = task::start_child(async { 30 }, QueueMark::WORKER);
            match all_of3(a, b, c).await {
                TaskOutcome::Value((x, y, z)) => x + y + z,
                TaskOutcome::Cancelled => unreachable!("no child cancels in this scenario"),
            }
        },
        QueueMark::MAIN,
    );

    assert_eq!(block_on(handle), TaskOutcome::Value(60));
}

/// Scenario 3: `any_of` wins. One child sleeps 200ms, another returns
/// immediately; the parent observes the fast winner and the slow child is
/// cancelled.
#[test]
fn any_of_resolves_with_fast_winner_and_cancels_the_rest() {
    let _trace = init_tracing();
    let scheduler = two_queue_scheduler();
    let slow_was_cancelled = Arc::new(AtomicBool::new(false));
    let slow_was_cancelled2 = Arc::clone(&slow_was_cancelled);

    let handle = scheduler.start_task(
        async move {
            let fast = task::start_child(async { 7 }, QueueMark::WORKER);
            let slow = task::start_child(
                async move {
                    task::sleep(Duration::from_millis(200)).await;
                    slow_was_cancelled2.store(false, Ordering::Release);
                    99
                },
                QueueMark::WORKER,
            );
            any_of2(fast, slow).await
        },
        QueueMark::MAIN,
    );

    assert_eq!(block_on(handle), TaskOutcome::Value(Either2::Left(7)));
    // The slow child never ran past its sleep: its body-local flag flip
    // never happened, because `any_of` cancelled it before the sleep fired.
    assert!(!slow_was_cancelled.load(Ordering::Acquire));
}

/// Scenario 4: structured cancel. A parent starts two children that both
/// await indefinitely (via `await_callback` whose resume handle is never
/// called); the children's handles are handed out to the test over a
/// channel immediately after creation (cancellation cascade is driven by
/// the parent's internal child registry, populated at `start_child` time,
/// independently of who ends up holding the `TaskHandle`). External code
/// then cancels the parent; every child reaches `Cancelled`, and so does
/// the parent itself.
#[test]
fn cancelling_parent_cancels_all_children() {
    let _trace = init_tracing();
    let scheduler = two_queue_scheduler();
    let (tx, rx) = std::sync::mpsc::channel::<TaskHandle<()>>();

    let handle = scheduler.start_task(
        async move {
            let child_a = task::start_child(
                async {
                    let (awaiter, _resume) = task::await_callback();
                    awaiter.await;
                },
                QueueMark::WORKER,
            );
            let child_b = task::start_child(
                async {
                    let (awaiter, _resume) = task::await_callback();
                    awaiter.await;
                },
                QueueMark::WORKER,
            );
            tx.send(child_a).expect("test is still receiving");
            tx.send(child_b).expect("test is still receiving");

            let (awaiter, _resume) = task::await_callback();
            awaiter.await;
        },
        QueueMark::MAIN,
    );

    let child_a = rx.recv().expect("parent sent child_a");
    let child_b = rx.recv().expect("parent sent child_b");

    // Give the children a moment to reach their `await_callback` suspension
    // before cancelling the parent.
    std::thread::sleep(Duration::from_millis(30));
    handle.request_cancel();

    assert!(block_on(handle).is_cancelled());
    assert!(block_on(child_a).is_cancelled());
    assert!(block_on(child_b).is_cancelled());
}

/// Scenario 5: timer cancel. A delayed task fired at +100ms is cancelled at
/// +10ms; once real time has passed the original fire time, the closure
/// was never invoked and `cancel_execution` reported success.
#[test]
fn cancelling_a_delayed_task_before_fire_time_prevents_invocation() {
    let _trace = init_tracing();
    let scheduler = two_queue_scheduler();
    let system = scheduler.execution_system();
    let invoked = Arc::new(AtomicBool::new(false));
    let invoked2 = Arc::clone(&invoked);

    let fire_at = system.now() + Duration::from_millis(100);
    let id = system
        .plan_execution_after(Box::new(move || invoked2.store(true, Ordering::Release)), QueueMark::WORKER, fire_at)
        .expect("scheduling a delayed task should succeed");

    std::thread::sleep(Duration::from_millis(10));
    assert!(system.cancel_execution(id));

    std::thread::sleep(Duration::from_millis(150));
    assert!(!invoked.load(Ordering::Acquire));
}

/// Scenario 6: freelist growth. Submitting many more closures than one
/// freelist block holds to a single queue delivers every one exactly once;
/// exercised here through `plan_execution` (the queue itself is a private
/// implementation detail) by counting completions.
#[test]
fn many_submissions_to_one_queue_all_complete_exactly_once() {
    let _trace = init_tracing();
    let scheduler = Scheduler::new(ExecutionSystemConfig {
        worker_configs: vec![WorkerConfig::new("w").with_mask(ThreadMask::only(QueueMark::WORKER))],
        main_thread_mask: ThreadMask::NONE,
        max_queue: QueueMark::WORKER,
    });

    const N: usize = 200;
    let seen = Arc::new(Mutex::new(vec![false; N]));
    let mut handles = Vec::with_capacity(N);
    for i in 0..N {
        let seen = Arc::clone(&seen);
        handles.push(scheduler.start_task(
            async move {
                seen.lock().unwrap()[i] = true;
                i
            },
            QueueMark::WORKER,
        ));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(block_on(handle), TaskOutcome::Value(i));
    }
    assert!(seen.lock().unwrap().iter().all(|&b| b));
}
