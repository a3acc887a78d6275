//! Background task accounting and execution.
//!
//! The space submits background sweeps through a [`TaskRunner`] and counts
//! them in a [`TaskMonitor`]. Operations that need a quiescent space call
//! [`TaskMonitor::wait_idle`] first; that is the only place the space blocks
//! on another thread.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};

use crate::sync::{debug_assert_no_locks_held, LockGuard, LockOrder};

/// A unit of background work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Executes background tasks on behalf of the space.
pub trait TaskRunner: Send + Sync {
    /// Run `task` to completion, now or later, on any thread.
    fn run(&self, task: Task);
}

// ============================================================================
// TaskMonitor
// ============================================================================

/// Counter of in-flight background tasks with a completion signal.
#[derive(Debug, Default)]
pub struct TaskMonitor {
    tasks: Mutex<usize>,
    idle: Condvar,
}

impl TaskMonitor {
    /// A monitor with no tasks.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tasks: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    /// Register a task about to be submitted.
    ///
    /// The returned token ends the task when dropped, including on unwind.
    pub fn begin(self: &Arc<Self>) -> TaskToken {
        let _order = LockGuard::new(LockOrder::Tasks);
        *self.tasks.lock() += 1;
        TaskToken {
            monitor: Arc::clone(self),
        }
    }

    fn end(&self) {
        let _order = LockGuard::new(LockOrder::Tasks);
        let mut tasks = self.tasks.lock();
        debug_assert!(*tasks > 0, "task ended twice");
        *tasks -= 1;
        if *tasks == 0 {
            self.idle.notify_all();
        }
    }

    /// Number of in-flight tasks.
    #[must_use]
    pub fn count(&self) -> usize {
        let _order = LockGuard::new(LockOrder::Tasks);
        *self.tasks.lock()
    }

    /// Block until no task is in flight.
    ///
    /// Must be called with no other lock of the space held.
    pub fn wait_idle(&self) {
        debug_assert_no_locks_held("TaskMonitor::wait_idle");
        let _order = LockGuard::new(LockOrder::Tasks);
        let mut tasks = self.tasks.lock();
        while *tasks > 0 {
            self.idle.wait(&mut tasks);
        }
    }
}

/// Registration of one in-flight task; see [`TaskMonitor::begin`].
#[must_use = "dropping the token ends the task"]
pub struct TaskToken {
    monitor: Arc<TaskMonitor>,
}

impl Drop for TaskToken {
    fn drop(&mut self) {
        self.monitor.end();
    }
}

// ============================================================================
// Runners
// ============================================================================

/// Runs every task on the submitting thread.
///
/// Makes background sweeps synchronous, which keeps tests deterministic.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineRunner;

impl TaskRunner for InlineRunner {
    fn run(&self, task: Task) {
        task();
    }
}

/// A fixed set of worker threads fed through a crossbeam channel.
pub struct WorkerPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl WorkerPool {
    /// Spawn `threads` workers (at least one).
    ///
    /// # Errors
    ///
    /// Returns the OS error if a thread cannot be spawned.
    pub fn new(threads: usize) -> io::Result<Self> {
        let (sender, receiver) = channel::unbounded::<Task>();
        let mut workers = Vec::with_capacity(threads.max(1));
        for index in 0..threads.max(1) {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("oldgen-worker-{index}"))
                .spawn(move || {
                    for task in receiver {
                        task();
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Number of worker threads.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.workers.len()
    }
}

impl TaskRunner for WorkerPool {
    fn run(&self, task: Task) {
        let Some(sender) = &self.sender else {
            task();
            return;
        };
        // Every worker is gone (a task panicked); run on the caller instead.
        if let Err(err) = sender.send(task) {
            (err.into_inner())();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender = None;
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // The last reference may be released by a task on a worker.
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_monitor_counts_tokens() {
        let monitor = Arc::new(TaskMonitor::new());
        assert_eq!(monitor.count(), 0);
        let first = monitor.begin();
        let second = monitor.begin();
        assert_eq!(monitor.count(), 2);
        drop(first);
        drop(second);
        assert_eq!(monitor.count(), 0);
        monitor.wait_idle();
    }

    #[test]
    fn test_wait_idle_blocks_until_tasks_finish() {
        let monitor = Arc::new(TaskMonitor::new());
        let pool = WorkerPool::new(2).expect("spawn workers");
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let token = monitor.begin();
            let done = Arc::clone(&done);
            pool.run(Box::new(move || {
                thread::sleep(Duration::from_millis(5));
                done.fetch_add(1, Ordering::SeqCst);
                drop(token);
            }));
        }
        monitor.wait_idle();
        assert_eq!(done.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_token_ends_task_on_panic() {
        let monitor = Arc::new(TaskMonitor::new());
        let token = monitor.begin();
        let result = thread::spawn(move || {
            let _token = token;
            panic!("sweeper failed");
        })
        .join();
        assert!(result.is_err());
        monitor.wait_idle();
        assert_eq!(monitor.count(), 0);
    }

    #[test]
    fn test_inline_runner_runs_immediately() {
        let ran = AtomicUsize::new(0);
        let ran = Arc::new(ran);
        let seen = Arc::clone(&ran);
        InlineRunner.run(Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_drop_drains_queue() {
        let done = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(1).expect("spawn worker");
            assert_eq!(pool.threads(), 1);
            for _ in 0..4 {
                let done = Arc::clone(&done);
                pool.run(Box::new(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }
}
