//! Task and thread pool behaviour observed through the public API.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use frame_engine::task_management::{
    task::{wait_all, Task, TaskHandle, TaskState},
    ThreadPool,
};

/// Writes its input index to its output.
#[derive(Default)]
struct IndexTask {
    index: usize,
    output: Option<usize>,
}

impl Task for IndexTask {
    fn execute(&mut self) {
        self.output = Some(self.index);
    }

    fn reset(&mut self) {
        self.index = 0;
        self.output = None;
    }
}

/// Sums a range; heavy enough to keep several workers busy at once.
#[derive(Default)]
struct SumTask {
    start: u64,
    end: u64,
    sum: u64,
    runs: Option<Arc<AtomicUsize>>,
}

impl Task for SumTask {
    fn execute(&mut self) {
        self.sum = (self.start..self.end).map(|value| value * value % 7919).sum();
        if let Some(runs) = &self.runs {
            runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
        self.sum = 0;
        self.runs = None;
    }
}

fn index_tasks(count: usize) -> Vec<TaskHandle<IndexTask>> {
    let tasks: Vec<_> = (0..count).map(|_| TaskHandle::new(IndexTask::default())).collect();
    for (index, task) in tasks.iter().enumerate() {
        task.reset();
        task.body_mut().index = index;
    }
    tasks
}

#[test]
fn four_tasks_produce_their_indices() {
    let pool = ThreadPool::with_workers(4);
    let tasks = index_tasks(4);

    pool.submit_tasks(&tasks);
    wait_all(&tasks);

    let outputs: BTreeSet<usize> = tasks.iter().filter_map(|task| task.body().output).collect();
    assert_eq!(outputs, BTreeSet::from([0, 1, 2, 3]));
    assert!(tasks.iter().all(TaskHandle::is_done));
}

#[test]
fn synchronous_and_asynchronous_paths_agree() {
    let pool = ThreadPool::with_workers(3);

    let run = |asynchronous: bool| -> Vec<u64> {
        let tasks: Vec<_> = (0..16).map(|_| TaskHandle::new(SumTask::default())).collect();
        for (index, task) in tasks.iter().enumerate() {
            task.reset();
            let mut body = task.body_mut();
            body.start = index as u64 * 10_000;
            body.end = (index as u64 + 1) * 10_000;
        }
        pool.submit_or_execute(&tasks, asynchronous);
        wait_all(&tasks);
        tasks.iter().map(|task| task.body().sum).collect()
    };

    assert_eq!(run(true), run(false));
    assert_eq!(pool.tasks_executed_inline(), 16);
    assert_eq!(pool.tasks_submitted(), 16);
}

#[test]
fn tasks_are_reusable_across_frames() {
    let pool = ThreadPool::with_workers(2);
    let runs = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..8).map(|_| TaskHandle::new(SumTask::default())).collect();

    for frame in 0..10u64 {
        for task in &tasks {
            task.reset();
            assert_eq!(task.state(), TaskState::Idle);
            let mut body = task.body_mut();
            assert_eq!(body.sum, 0, "reset must clear the previous frame's output");
            body.start = frame;
            body.end = frame + 100;
            body.runs = Some(runs.clone());
        }
        pool.submit_tasks(&tasks);
        wait_all(&tasks);
    }

    assert_eq!(runs.load(Ordering::SeqCst), 80);
}

#[test]
fn waiting_twice_returns_immediately() {
    let pool = ThreadPool::with_workers(1);
    let tasks = index_tasks(1);
    pool.submit_task(&tasks[0]);
    tasks[0].wait();
    tasks[0].wait();
    assert_eq!(tasks[0].body().output, Some(0));
}

#[test]
fn empty_batches_are_no_ops() {
    let pool = ThreadPool::with_workers(1);
    let tasks: Vec<TaskHandle<IndexTask>> = Vec::new();
    pool.submit_tasks(&tasks);
    wait_all(&tasks);
    assert_eq!(pool.tasks_submitted(), 0);
}

#[test]
#[should_panic(expected = "never submitted")]
fn waiting_on_an_idle_task_is_fatal() {
    let task = TaskHandle::new(IndexTask::default());
    task.wait();
}

#[test]
#[should_panic(expected = "uninitialized thread pool")]
fn submitting_to_an_uninitialized_pool_is_fatal() {
    let pool = ThreadPool::new();
    let tasks = index_tasks(1);
    pool.submit_tasks(&tasks);
}

#[test]
fn initialize_is_idempotent() {
    let pool = ThreadPool::new();
    pool.initialize(1);
    let workers = pool.worker_count();
    assert!(workers >= 1);
    pool.initialize(0);
    assert_eq!(pool.worker_count(), workers);
    assert_eq!(ThreadPool::worker_count_for(8, 2), 5);
    assert_eq!(ThreadPool::worker_count_for(2, 4), 1);
    pool.shutdown();
    assert!(!pool.is_initialized());
}
