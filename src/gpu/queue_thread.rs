//! One OS thread per logical queue.
//!
//! Each queue consumes a FIFO of operations in submission order. Because a `Wait`
//! blocks only its own queue thread, the three queues run concurrently exactly like
//! hardware queues, and the calling CPU thread never blocks on a GPU-side wait.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use log::error;

use super::{CommandList, Fence, QueueKind};

/// An operation placed on a queue.
pub(crate) enum QueueOp {
    Execute(CommandList),
    Signal(Fence, u64),
    Wait(Fence, u64),
}

/// How a backend carries out queue operations. Called on the queue's own thread.
pub(crate) trait QueueBackend: Send + Sync + 'static {
    fn execute(&self, queue: QueueKind, list: CommandList);
    fn signal(&self, queue: QueueKind, fence: &Fence, value: u64);
    fn wait(&self, queue: QueueKind, fence: &Fence, value: u64);
}

pub(crate) struct QueueThreads {
    senders: Vec<flume::Sender<QueueOp>>,
    handles: Vec<JoinHandle<()>>,
}

impl QueueThreads {
    /// Spawns one thread per queue kind, all driving `backend`.
    pub(crate) fn spawn<B: QueueBackend>(backend: Arc<B>, name_prefix: &str) -> Self {
        let mut senders = Vec::with_capacity(QueueKind::ALL.len());
        let mut handles = Vec::with_capacity(QueueKind::ALL.len());

        for queue in QueueKind::ALL {
            let (sender, receiver) = flume::unbounded::<QueueOp>();
            let backend = backend.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}-queue", name_prefix, queue.label()))
                .spawn(move || {
                    while let Ok(op) = receiver.recv() {
                        match op {
                            QueueOp::Execute(list) => backend.execute(queue, list),
                            QueueOp::Signal(fence, value) => backend.signal(queue, &fence, value),
                            QueueOp::Wait(fence, value) => backend.wait(queue, &fence, value),
                        }
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => crate::fatal!("failed to spawn {} queue thread: {}", queue.label(), err),
            }
            senders.push(sender);
        }

        Self { senders, handles }
    }

    /// Places `op` at the back of `queue`.
    pub(crate) fn push(&self, queue: QueueKind, op: QueueOp) {
        let sent = self
            .senders
            .get(queue.index())
            .is_some_and(|sender| sender.send(op).is_ok());
        if !sent {
            error!("{} queue thread is gone; dropping operation", queue.label());
        }
    }

    /// Lets every queue drain its FIFO, then joins the threads.
    pub(crate) fn shutdown(&mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("A GPU queue thread exited by panicking");
            }
        }
    }
}

impl Drop for QueueThreads {
    fn drop(&mut self) {
        self.shutdown();
    }
}
