// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The user-visible entry point: owns one [`ExecutionSystem`], starts root
//! tasks, and cancels every live root on drop.

use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use crate::executor::{ExecutionSystem, ExecutionSystemConfig};
use crate::mask::QueueMark;
use crate::task::{self, Cancellable, TaskHandle};

/// Owns an [`ExecutionSystem`] and the set of root tasks started on it.
///
/// Holds no state beyond the execution system and a weak root-task
/// registry used only for shutdown-time cancellation.
pub struct Scheduler {
    system: Arc<ExecutionSystem>,
    roots: Mutex<Vec<Weak<dyn Cancellable>>>,
}

impl Scheduler {
    /// Builds the execution system described by `config` and starts its
    /// worker and timer threads.
    #[must_use]
    pub fn new(config: ExecutionSystemConfig) -> Self {
        Self {
            system: Arc::new(ExecutionSystem::new(config)),
            roots: Mutex::new(Vec::new()),
        }
    }

    /// Constructs a task from `body`, registers it as a root, enqueues its
    /// initial resumption on `queue`, and returns an owning handle.
    ///
    /// # Panics
    ///
    /// In debug builds, panics (via the execution system) if `queue`
    /// exceeds this scheduler's configured `max_queue`.
    pub fn start_task<T: Send + 'static>(
        &self,
        body: impl Future<Output = T> + Send + 'static,
        queue: QueueMark,
    ) -> TaskHandle<T> {
        let handle = task::spawn(Arc::clone(&self.system), body, queue, "root");
        self.prune_and_register(handle.as_cancellable());
        handle
    }

    /// Starts a task on [`QueueMark::MAIN`].
    pub fn start_task_on_main<T: Send + 'static>(
        &self,
        body: impl Future<Output = T> + Send + 'static,
    ) -> TaskHandle<T> {
        self.start_task(body, QueueMark::MAIN)
    }

    /// Drains up to one task from each queue the main thread's mask
    /// permits. Must only be called from the thread that constructed this
    /// scheduler's execution system.
    pub fn pump_main(&self) {
        self.system.update_from_main();
    }

    /// Direct access to the underlying execution system, e.g. for
    /// `plan_execution_after`-based timeout composition.
    #[must_use]
    pub fn execution_system(&self) -> &Arc<ExecutionSystem> {
        &self.system
    }

    fn prune_and_register(&self, root: Arc<dyn Cancellable>) {
        let mut roots = self.roots.lock().unwrap();
        roots.retain(|w| w.strong_count() > 0);
        roots.push(Arc::downgrade(&root));
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        tracing::info!("scheduler shutting down, cancelling live root tasks");
        let roots = std::mem::take(&mut *self.roots.lock().unwrap());
        for weak in roots {
            if let Some(root) = weak.upgrade() {
                root.request_cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskOutcome;
    use crate::executor::WorkerConfig;
    use crate::mask::ThreadMask;

    fn scheduler() -> Scheduler {
        Scheduler::new(ExecutionSystemConfig {
            worker_configs: vec![WorkerConfig::new("w").with_mask(ThreadMask::only(QueueMark::WORKER))],
            main_thread_mask: ThreadMask::only(QueueMark::MAIN),
            max_queue: QueueMark::WORKER,
        })
    }

    #[test]
    fn start_task_runs_to_completion() {
        let scheduler = scheduler();
        let handle = scheduler.start_task(async { 5 + 5 }, QueueMark::WORKER);
        let outcome = task::block_on(handle);
        assert_eq!(outcome, TaskOutcome::Value(10));
    }

    #[test]
    fn pump_main_drains_main_queue_task() {
        let scheduler = scheduler();
        let handle = scheduler.start_task(async { 1 }, QueueMark::MAIN);
        // The task's first resumption sits in the main queue until pumped.
        scheduler.pump_main();
        let outcome = task::block_on(handle);
        assert_eq!(outcome, TaskOutcome::Value(1));
    }
}
