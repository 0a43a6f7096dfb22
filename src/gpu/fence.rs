//! # Fences and the Ticket Interface
//!
//! A [`Fence`] is a shared counter with a monotonically increasing *completed* value.
//! Queues advance it when the work submitted before a `signal` retires; CPU threads
//! block on it through [`Fence::wait`].
//!
//! The fence also tracks a *pending* value: the highest value a queue has scheduled a
//! signal for. Backends that feed a single hardware queue from several logical queues
//! use it to order submissions (work after a GPU-side wait may be submitted once the
//! matching signal has been scheduled, because the hardware queue retires in order).
//!
//! [`FenceGate`] wraps a device and a fence into tickets: submit a list, get a
//! [`Ticket`], and later ask whether it has completed or block on it.

use std::{
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use super::{CommandList, GpuDevice, QueueKind};

static NEXT_FENCE_ID: AtomicU32 = AtomicU32::new(1);

struct FenceInner {
    id: u32,
    label: String,
    completed: AtomicU64,
    pending: AtomicU64,
    lock: Mutex<()>,
    changed: Condvar,
}

/// A GPU/CPU synchronization counter.
///
/// Cloning a `Fence` produces another handle to the same counter.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    /// Creates a fence with completed value 0.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                id: NEXT_FENCE_ID.fetch_add(1, Ordering::Relaxed),
                label: label.into(),
                completed: AtomicU64::new(0),
                pending: AtomicU64::new(0),
                lock: Mutex::new(()),
                changed: Condvar::new(),
            }),
        }
    }

    /// Process-unique id of the fence.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Debug label.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Highest value the GPU has retired.
    pub fn completed_value(&self) -> u64 {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Highest value a queue has scheduled a signal for.
    pub fn pending_value(&self) -> u64 {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// `true` once the completed value reached `value`.
    pub fn is_complete(&self, value: u64) -> bool {
        self.completed_value() >= value
    }

    /// Records that a signal to `value` has been placed on a queue.
    pub fn schedule(&self, value: u64) {
        let _guard = self.inner.lock.lock();
        self.inner.pending.fetch_max(value, Ordering::AcqRel);
        self.inner.changed.notify_all();
    }

    /// Advances the completed value to `value` and wakes every waiter.
    ///
    /// Signalling a value lower than the current one leaves the fence unchanged.
    pub fn signal(&self, value: u64) {
        let _guard = self.inner.lock.lock();
        self.inner.pending.fetch_max(value, Ordering::AcqRel);
        self.inner.completed.fetch_max(value, Ordering::AcqRel);
        self.inner.changed.notify_all();
    }

    /// Blocks the calling thread until the completed value reaches `value`.
    pub fn wait(&self, value: u64) {
        if self.is_complete(value) {
            return;
        }
        let mut guard = self.inner.lock.lock();
        while !self.is_complete(value) {
            self.inner.changed.wait(&mut guard);
        }
    }

    /// Waits at most `timeout` for the completed value to reach `value`.
    pub fn wait_timeout(&self, value: u64, timeout: Duration) -> bool {
        if self.is_complete(value) {
            return true;
        }
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        while !self.is_complete(value) {
            if self.inner.changed.wait_until(&mut guard, deadline).timed_out() {
                return self.is_complete(value);
            }
        }
        true
    }

    /// Blocks until a signal to at least `value` has been scheduled on some queue.
    pub fn wait_scheduled(&self, value: u64) {
        if self.pending_value() >= value {
            return;
        }
        let mut guard = self.inner.lock.lock();
        while self.pending_value() < value {
            self.inner.changed.wait(&mut guard);
        }
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("completed", &self.completed_value())
            .field("pending", &self.pending_value())
            .finish()
    }
}

/// A fence value that marks the completion of one submission.
#[derive(Debug, Clone)]
pub struct Ticket {
    fence: Fence,
    value: u64,
}

impl Ticket {
    /// The fence the ticket refers to.
    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    /// The fence value that completes the ticket.
    pub fn value(&self) -> u64 {
        self.value
    }
}

/// Ticket-based submission on top of a device and one fence.
///
/// Values are handed out in strictly increasing order. Reserving tickets up front with
/// [`FenceGate::reserve`] lets several threads submit out of order while the fence
/// values still follow the intended GPU ordering.
pub struct FenceGate {
    device: Arc<dyn GpuDevice>,
    fence: Fence,
    next_value: AtomicU64,
}

impl FenceGate {
    /// Creates a gate with a fresh fence.
    pub fn new(device: Arc<dyn GpuDevice>, label: impl Into<String>) -> Self {
        Self {
            device,
            fence: Fence::new(label),
            next_value: AtomicU64::new(0),
        }
    }

    /// The gate's fence.
    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    /// The device the gate submits to.
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    /// Value of the most recently reserved ticket.
    pub fn last_value(&self) -> u64 {
        self.next_value.load(Ordering::Acquire)
    }

    /// Allocates the next fence value without submitting anything.
    pub fn reserve(&self) -> Ticket {
        let value = self.next_value.fetch_add(1, Ordering::AcqRel) + 1;
        Ticket {
            fence: self.fence.clone(),
            value,
        }
    }

    /// Executes `list` on `queue` and signals a freshly reserved ticket.
    pub fn submit(&self, queue: QueueKind, list: CommandList) -> Ticket {
        let ticket = self.reserve();
        self.submit_signaling(queue, list, &ticket);
        ticket
    }

    /// Executes `list` on `queue` and signals `ticket` after it.
    pub fn submit_signaling(&self, queue: QueueKind, list: CommandList, ticket: &Ticket) {
        self.device.execute(queue, list);
        self.device.signal(queue, &ticket.fence, ticket.value);
    }

    /// Signals `ticket` on `queue` once all work already on the queue retired.
    pub fn signal(&self, queue: QueueKind, ticket: &Ticket) {
        self.device.signal(queue, &ticket.fence, ticket.value);
    }

    /// Makes later work on `queue` wait for `ticket` on the GPU timeline.
    pub fn gpu_wait(&self, queue: QueueKind, ticket: &Ticket) {
        self.device.wait(queue, &ticket.fence, ticket.value);
    }

    /// `true` once the GPU retired `ticket`.
    pub fn is_complete(&self, ticket: &Ticket) -> bool {
        ticket.fence.is_complete(ticket.value)
    }

    /// Blocks the calling thread until the GPU retired `ticket`.
    pub fn wait(&self, ticket: &Ticket) {
        ticket.fence.wait(ticket.value);
    }
}

impl std::fmt::Debug for FenceGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FenceGate")
            .field("backend", &self.device.backend_name())
            .field("fence", &self.fence)
            .field("last_value", &self.last_value())
            .finish()
    }
}
