//! # Task Management System
//!
//! This module provides the fixed-size worker pool that executes the engine's per-frame
//! tasks: animation pose updates, GPU copy and compute submission, shadow and forward
//! render-pass recording, and asset import.
//!
//! ## Architecture Overview
//!
//! - `ThreadPool`: Owns the worker threads and the shared work queue
//! - `task::Task`: A unit of work with inputs and outputs as plain fields
//! - `task::TaskHandle`: The owner's handle, carrying the `Idle/Running/Done` state
//!
//! ## Work Distribution
//!
//! All workers receive from a single multi-producer, multi-consumer channel. A worker
//! that finishes early simply takes the next queued task, so load balancing falls out of
//! the queue itself. Tasks are leaves: they never submit work and wait for it, so a
//! worker can never deadlock on its own queue.
//!
//! ## Synchronous Fallback
//!
//! `submit_or_execute_tasks::<false, _>()` runs every task in order on the calling thread
//! through the same state transitions. Both paths must produce identical outputs; the
//! synchronous one exists to make debugging deterministic.
//!
//! ## Example Usage
//! ```rust
//! use frame_engine::task_management::{task::{wait_all, Task, TaskHandle}, ThreadPool};
//!
//! #[derive(Default)]
//! struct Index { index: usize, output: usize }
//!
//! impl Task for Index {
//!     fn execute(&mut self) { self.output = self.index; }
//!     fn reset(&mut self) { *self = Self::default(); }
//! }
//!
//! let pool = ThreadPool::with_workers(4);
//! let tasks: Vec<TaskHandle<Index>> = (0..4).map(|_| TaskHandle::default()).collect();
//! for (index, task) in tasks.iter().enumerate() {
//!     task.reset();
//!     task.body_mut().index = index;
//! }
//! pool.submit_tasks(&tasks);
//! wait_all(&tasks);
//! assert_eq!(tasks[3].body().output, 3);
//! ```

pub mod task;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use log::{debug, info};
use parking_lot::Mutex;

use crate::fatal;
use task::{Job, Task, TaskHandle};

/// The shared state of an initialized pool.
struct Workers {
    sender: flume::Sender<Arc<dyn Job>>,
    handles: Vec<JoinHandle<()>>,
}

/// A fixed-size pool of worker threads.
///
/// The pool is created uninitialized and sized once by `initialize()`. Submission is
/// asynchronous: `submit_tasks()` returns as soon as the tasks are queued, and the owner
/// joins through `TaskHandle::wait()`. There is no priority and no cancellation; a
/// submitted task always runs to completion.
///
/// # Thread Safety
/// - All methods take `&self`; the pool is shared as `Arc<ThreadPool>` between the
///   main thread and the render thread
/// - The work queue is the only structure mutated concurrently by several producers
///   and several consumers
pub struct ThreadPool {
    workers: Mutex<Option<Workers>>,
    worker_count: Mutex<usize>,
    tasks_submitted: AtomicU64,
    tasks_inline: AtomicU64,
}

impl ThreadPool {
    /// Creates an uninitialized pool. Call `initialize()` before submitting.
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(None),
            worker_count: Mutex::new(0),
            tasks_submitted: AtomicU64::new(0),
            tasks_inline: AtomicU64::new(0),
        }
    }

    /// Creates a pool with exactly `worker_count` workers (at least one).
    pub fn with_workers(worker_count: usize) -> Self {
        let pool = Self::new();
        pool.spawn_workers(worker_count.max(1));
        pool
    }

    /// Worker count for a machine with `hardware_concurrency` hardware threads when
    /// `reserved_dedicated_threads` are kept for dedicated threads (render thread, GPU
    /// queues). One more thread is always reserved for the caller.
    pub fn worker_count_for(hardware_concurrency: usize, reserved_dedicated_threads: usize) -> usize {
        hardware_concurrency
            .saturating_sub(reserved_dedicated_threads)
            .saturating_sub(1)
            .max(1)
    }

    /// Sizes the pool from the available hardware concurrency and spawns the workers.
    ///
    /// Idempotent: a second call logs and returns without changing the pool.
    pub fn initialize(&self, reserved_dedicated_threads: usize) {
        if self.is_initialized() {
            debug!("Thread pool already initialized; ignoring second initialize()");
            return;
        }

        let hardware_concurrency = thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        info!("Available parallelism: {}", hardware_concurrency);

        self.spawn_workers(Self::worker_count_for(
            hardware_concurrency,
            reserved_dedicated_threads,
        ));
    }

    fn spawn_workers(&self, worker_count: usize) {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            return;
        }

        let (sender, receiver) = flume::unbounded::<Arc<dyn Job>>();
        let mut handles = Vec::with_capacity(worker_count);

        for worker_index in 0..worker_count {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("frame-engine-worker-{}", worker_index))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job.run();
                    }
                })
                .unwrap_or_else(|err| fatal!("failed to spawn pool worker {}: {}", worker_index, err));
            handles.push(handle);
        }

        info!("Thread pool started with {} workers", worker_count);
        *self.worker_count.lock() = worker_count;
        *workers = Some(Workers { sender, handles });
    }

    /// `true` once workers have been spawned and until `shutdown()`.
    pub fn is_initialized(&self) -> bool {
        self.workers.lock().is_some()
    }

    /// Number of worker threads (0 before initialization).
    pub fn worker_count(&self) -> usize {
        *self.worker_count.lock()
    }

    /// Total tasks handed to workers since creation.
    pub fn tasks_submitted(&self) -> u64 {
        self.tasks_submitted.load(Ordering::Relaxed)
    }

    /// Total tasks executed on a submitting thread through the synchronous path.
    pub fn tasks_executed_inline(&self) -> u64 {
        self.tasks_inline.load(Ordering::Relaxed)
    }

    /// Queues a single task. See `submit_tasks()`.
    pub fn submit_task<T: Task>(&self, task: &TaskHandle<T>) {
        self.submit_tasks(std::slice::from_ref(task));
    }

    /// Moves every task to `Running` and queues it. Returns immediately.
    ///
    /// An empty batch is a no-op. Submitting a task that is already running, or
    /// submitting to a pool that was never initialized, is fatal.
    pub fn submit_tasks<T: Task>(&self, tasks: &[TaskHandle<T>]) {
        if tasks.is_empty() {
            return;
        }

        let workers = self.workers.lock();
        let Some(workers) = workers.as_ref() else {
            fatal!(
                "submit_tasks() called on an uninitialized thread pool ({} tasks)",
                tasks.len()
            );
        };

        for task in tasks {
            let job = task.start();
            if workers.sender.send(job).is_err() {
                fatal!("thread pool queue disconnected while submitting '{}'", task.label());
            }
        }
        self.tasks_submitted
            .fetch_add(tasks.len() as u64, Ordering::Relaxed);
    }

    /// Submits the batch when `ASYNC` is `true`, otherwise executes every task in order
    /// on the calling thread. Observable outputs are identical either way.
    pub fn submit_or_execute_tasks<const ASYNC: bool, T: Task>(&self, tasks: &[TaskHandle<T>]) {
        if ASYNC {
            self.submit_tasks(tasks);
        } else {
            for task in tasks {
                task.execute_inline();
            }
            self.tasks_inline
                .fetch_add(tasks.len() as u64, Ordering::Relaxed);
        }
    }

    /// Runtime form of `submit_or_execute_tasks()`.
    pub fn submit_or_execute<T: Task>(&self, tasks: &[TaskHandle<T>], asynchronous: bool) {
        if asynchronous {
            self.submit_or_execute_tasks::<true, T>(tasks);
        } else {
            self.submit_or_execute_tasks::<false, T>(tasks);
        }
    }

    /// Runtime form of `submit_or_execute_tasks()` for a single task.
    pub fn submit_or_execute_task<T: Task>(&self, task: &TaskHandle<T>, asynchronous: bool) {
        self.submit_or_execute(std::slice::from_ref(task), asynchronous);
    }

    /// Lets the workers drain the queue, then joins them.
    ///
    /// Blocks until every worker has exited. Calling it twice is harmless.
    pub fn shutdown(&self) {
        let Some(Workers { sender, handles }) = self.workers.lock().take() else {
            return;
        };

        drop(sender);
        for handle in handles {
            if handle.join().is_err() {
                log::error!("A pool worker exited by panicking");
            }
        }
        *self.worker_count.lock() = 0;
        info!("Thread pool shut down");
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("worker_count", &self.worker_count())
            .field("tasks_submitted", &self.tasks_submitted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use task::wait_all;

    #[derive(Default)]
    struct Sum {
        values: Vec<u64>,
        total: u64,
    }

    impl Task for Sum {
        fn execute(&mut self) {
            self.total = self.values.iter().sum();
        }

        fn reset(&mut self) {
            self.values.clear();
            self.total = 0;
        }
    }

    #[test]
    fn worker_count_reserves_main_and_dedicated_threads() {
        assert_eq!(ThreadPool::worker_count_for(8, 1), 6);
        assert_eq!(ThreadPool::worker_count_for(8, 0), 7);
        assert_eq!(ThreadPool::worker_count_for(2, 1), 1);
        assert_eq!(ThreadPool::worker_count_for(1, 4), 1);
        assert_eq!(ThreadPool::worker_count_for(0, 0), 1);
    }

    #[test]
    fn initialize_is_idempotent() {
        let pool = ThreadPool::new();
        assert!(!pool.is_initialized());
        pool.initialize(1);
        let first = pool.worker_count();
        assert!(first >= 1);
        pool.initialize(0);
        assert_eq!(pool.worker_count(), first);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let pool = ThreadPool::new();
        let tasks: Vec<TaskHandle<Sum>> = Vec::new();
        pool.submit_tasks(&tasks);
        assert_eq!(pool.tasks_submitted(), 0);
    }

    #[test]
    #[should_panic(expected = "uninitialized thread pool")]
    fn submitting_to_uninitialized_pool_is_fatal() {
        let pool = ThreadPool::new();
        let task = TaskHandle::new(Sum::default());
        pool.submit_task(&task);
    }

    #[test]
    fn tasks_are_reused_across_many_cycles() {
        let pool = ThreadPool::with_workers(3);
        let tasks: Vec<TaskHandle<Sum>> = (0..6).map(|_| TaskHandle::default()).collect();

        for cycle in 0..20u64 {
            for (index, task) in tasks.iter().enumerate() {
                task.reset();
                task.body_mut().values.extend([cycle, index as u64]);
            }
            pool.submit_tasks(&tasks);
            wait_all(&tasks);
            for (index, task) in tasks.iter().enumerate() {
                assert_eq!(task.body().total, cycle + index as u64);
            }
        }
        assert_eq!(pool.tasks_submitted(), 120);
    }

    #[test]
    fn shutdown_drains_queued_work() {
        let pool = ThreadPool::with_workers(1);
        let tasks: Vec<TaskHandle<Sum>> = (0..32).map(|_| TaskHandle::default()).collect();
        for task in &tasks {
            task.body_mut().values.push(1);
        }
        pool.submit_tasks(&tasks);
        pool.shutdown();
        assert!(tasks.iter().all(|task| task.is_done()));
        assert!(!pool.is_initialized());
    }
}
