//! # Task System Core Types
//!
//! This module defines the fundamental building blocks of the task system: a task is a
//! resettable, three-state unit of work that is owned by a longer-lived component (a
//! frame slot, a world subsystem) and lent to the thread pool for the duration of
//! `execute()`.
//!
//! ## Core Components
//! - `Task`: The work itself plus its input and output fields
//! - `TaskHandle`: The owner's handle, carrying the atomic `TaskState`
//! - `TaskState`: `Idle -> Running -> Done`, and back to `Idle` through `reset()`
//!
//! ## Task Lifecycle
//! 1. The owner constructs a `TaskHandle` once and keeps it for many frames
//! 2. `reset()` clears every task-specific field (only legal from `Idle` or `Done`)
//! 3. The owner writes inputs through `body_mut()`
//! 4. `ThreadPool::submit_tasks()` moves the task to `Running` and queues it
//! 5. A worker calls `Task::execute()` and marks the task `Done`
//! 6. The owner calls `wait()` and reads outputs through `body()`
//!
//! ## Failure Reporting
//! Tasks have no error channel. A task that can fail reports it through its own
//! output fields, which the owner checks after `wait()`. A panic inside `execute()`
//! is a fatal error: the worker records it and `wait()` re-raises it on the owner's
//! thread.

use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::fatal;

/// Number of spin iterations `wait()` performs before parking the thread.
const SPIN_ITERATIONS: u32 = 256;

/// The three states a task moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
    /// Constructed or reset; inputs may be written.
    Idle = 0,
    /// Submitted; a worker (or the submitting thread) owns the body.
    Running = 1,
    /// `execute()` returned; outputs may be read.
    Done = 2,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Idle,
            1 => TaskState::Running,
            _ => TaskState::Done,
        }
    }
}

/// A unit of work that can be executed by the thread pool.
///
/// Implementors hold their inputs and outputs as plain fields. The same instance is
/// reused every frame, so `reset()` must return every field to its empty value: a
/// stale input from the previous frame is a correctness bug.
///
/// # Implementation Guidelines
/// - `execute()` must not block on tasks it was not explicitly ordered after
/// - `execute()` must report failures through output fields, never by panicking
/// - Must be `Send + 'static` because the body travels to a worker thread
pub trait Task: Send + 'static {
    /// Performs the work. Runs on a pool worker, or on the submitting thread when
    /// the synchronous path is selected.
    fn execute(&mut self);

    /// Clears all task-specific inputs and outputs.
    fn reset(&mut self);

    /// A short name used in logs and fatal diagnostics.
    fn label(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// The pool's view of a submitted task: something it can run exactly once.
pub(crate) trait Job: Send + Sync {
    /// Executes the task body and marks the task done.
    fn run(&self);
}

struct TaskShared<T: Task> {
    label: String,
    state: AtomicU8,
    body: Mutex<T>,
    failure: Mutex<Option<String>>,
    completion_lock: Mutex<()>,
    completion: Condvar,
}

impl<T: Task> TaskShared<T> {
    fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_running(&self) {
        let previous = self.state.swap(TaskState::Running as u8, Ordering::AcqRel);
        if previous == TaskState::Running as u8 {
            fatal!("task '{}' submitted while already running", self.label);
        }
    }

    fn set_done(&self) {
        let previous = self.state.swap(TaskState::Done as u8, Ordering::AcqRel);
        if previous != TaskState::Running as u8 {
            fatal!(
                "task '{}' completed from state {:?} instead of Running",
                self.label,
                TaskState::from_u8(previous)
            );
        }
        let _guard = self.completion_lock.lock();
        self.completion.notify_all();
    }
}

impl<T: Task> Job for TaskShared<T> {
    fn run(&self) {
        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut body = self.body.lock();
            body.execute();
        }));

        if let Err(payload) = result {
            let message = panic_message(payload.as_ref());
            log::error!("Task '{}' panicked: {}", self.label, message);
            *self.failure.lock() = Some(message);
        }

        self.set_done();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("<non-string panic payload>")
    }
}

/// Exclusive owner handle of a task.
///
/// The handle is deliberately not `Clone`: a task has exactly one owner. The thread
/// pool only borrows the shared state while the task is `Running`.
///
/// # Examples
///
/// ```
/// use frame_engine::task_management::{task::{Task, TaskHandle}, ThreadPool};
///
/// #[derive(Default)]
/// struct Square { input: u64, output: u64 }
///
/// impl Task for Square {
///     fn execute(&mut self) { self.output = self.input * self.input; }
///     fn reset(&mut self) { *self = Self::default(); }
/// }
///
/// let pool = ThreadPool::with_workers(2);
/// let task = TaskHandle::new(Square::default());
///
/// task.reset();
/// task.body_mut().input = 7;
/// pool.submit_task(&task);
/// task.wait();
/// assert_eq!(task.body().output, 49);
/// ```
pub struct TaskHandle<T: Task> {
    shared: Arc<TaskShared<T>>,
}

impl<T: Task> TaskHandle<T> {
    /// Wraps a task body. The task starts `Idle`.
    pub fn new(task: T) -> Self {
        let label = task.label().to_string();
        Self {
            shared: Arc::new(TaskShared {
                label,
                state: AtomicU8::new(TaskState::Idle as u8),
                body: Mutex::new(task),
                failure: Mutex::new(None),
                completion_lock: Mutex::new(()),
                completion: Condvar::new(),
            }),
        }
    }

    /// The task's label.
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.shared.state()
    }

    /// `true` when the task has never been submitted since the last reset.
    pub fn is_idle(&self) -> bool {
        self.state() == TaskState::Idle
    }

    /// `true` while a worker owns the task.
    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    /// `true` once `execute()` has returned.
    pub fn is_done(&self) -> bool {
        self.state() == TaskState::Done
    }

    /// Returns the task to `Idle` and clears all task-specific fields.
    ///
    /// Fatal if the task is `Running`.
    pub fn reset(&self) {
        if self.is_running() {
            fatal!("reset() called on task '{}' while it is running", self.shared.label);
        }
        self.shared.body.lock().reset();
        *self.shared.failure.lock() = None;
        self.shared
            .state
            .store(TaskState::Idle as u8, Ordering::Release);
    }

    /// Mutable access to the task body, used to assign inputs before submission.
    ///
    /// Fatal if the task is `Running`.
    pub fn body_mut(&self) -> MutexGuard<'_, T> {
        if self.is_running() {
            fatal!("inputs of task '{}' written while it is running", self.shared.label);
        }
        self.shared.body.lock()
    }

    /// Access to the task body, used to read outputs after `wait()`.
    ///
    /// Fatal if the task is `Running`.
    pub fn body(&self) -> MutexGuard<'_, T> {
        if self.is_running() {
            fatal!("outputs of task '{}' read while it is running", self.shared.label);
        }
        self.shared.body.lock()
    }

    /// Blocks until the task is `Done`. Returns immediately if it already is.
    ///
    /// Waiting on a task that was never submitted would block forever, so it is
    /// reported as a fatal error instead. There is no timeout.
    pub fn wait(&self) {
        match self.state() {
            TaskState::Idle => fatal!(
                "wait() called on task '{}' which was never submitted",
                self.shared.label
            ),
            TaskState::Done => {}
            TaskState::Running => self.block_until_done(),
        }

        if let Some(message) = self.shared.failure.lock().take() {
            fatal!("task '{}' failed on a worker: {}", self.shared.label, message);
        }
    }

    fn block_until_done(&self) {
        for _ in 0..SPIN_ITERATIONS {
            if self.is_done() {
                return;
            }
            std::hint::spin_loop();
        }

        let mut guard = self.shared.completion_lock.lock();
        while !self.is_done() {
            self.shared.completion.wait(&mut guard);
        }
    }

    /// Moves the task to `Running` and returns the pool's view of it.
    pub(crate) fn start(&self) -> Arc<dyn Job> {
        self.shared.set_running();
        self.shared.clone()
    }

    /// Runs the task on the calling thread, passing through the same state
    /// transitions a pool worker would.
    pub(crate) fn execute_inline(&self) {
        self.start().run();
    }
}

impl<T: Task + Default> Default for TaskHandle<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Task> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("label", &self.shared.label)
            .field("state", &self.state())
            .finish()
    }
}

/// Waits for every task in the batch.
///
/// This is the explicit join point between a batch and the stage that consumes
/// its outputs.
pub fn wait_all<T: Task>(tasks: &[TaskHandle<T>]) {
    for task in tasks {
        task.wait();
    }
}
