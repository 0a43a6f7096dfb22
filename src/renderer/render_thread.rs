//! # Render Thread
//!
//! A dedicated thread that submits whole frames to the GPU while the main thread
//! builds the next one. The two sides meet through a pair of semaphores per frame slot:
//!
//! - `awake`: posted by the main thread once the slot's job is in the mailbox
//! - `done`: posted by the render thread once the job ran; starts signalled
//!
//! ## Handshake
//! Main thread, per frame: `wait_frame(slot)` (take `done`) → build → `kick(slot, job)`
//! (post `awake`). Render thread, for each slot in ring order: take `awake`, run the
//! job, post `done`.
//!
//! Slots are visited strictly in ring order on both sides, so a frame can never
//! overtake the one before it. `wait_frame` is also where the main thread learns how
//! the slot's previous submission went.
//!
//! An empty mailbox on wake-up tells the thread to exit.

use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::{check, core::Semaphore, errors::Result, fatal};

/// A frame's GPU submission, run on the render thread.
pub type FrameJob = Box<dyn FnOnce() -> Result<()> + Send>;

enum JobOutcome {
    Finished(Result<()>),
    Panicked(String),
}

struct Mailbox {
    awake: Semaphore,
    done: Semaphore,
    job: Mutex<Option<FrameJob>>,
    outcome: Mutex<Option<JobOutcome>>,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            awake: Semaphore::new(0),
            done: Semaphore::new(1),
            job: Mutex::new(None),
            outcome: Mutex::new(None),
        }
    }
}

/// The render thread and its per-slot mailboxes.
pub struct RenderThread {
    mailboxes: Arc<Vec<Mailbox>>,
    next_slot: usize,
    kicked: u64,
    handle: Option<JoinHandle<()>>,
}

impl RenderThread {
    /// Starts the thread with one mailbox per frame slot.
    ///
    /// # Errors
    /// Returns `EngineError::Io` if the OS refuses to create the thread.
    pub fn spawn(slot_count: usize) -> Result<Self> {
        check!(slot_count > 0, "render thread needs at least one frame slot");

        let mailboxes = Arc::new((0..slot_count).map(|_| Mailbox::new()).collect::<Vec<_>>());
        let thread_mailboxes = mailboxes.clone();
        let handle = thread::Builder::new()
            .name(String::from("render"))
            .spawn(move || render_loop(&thread_mailboxes))?;

        info!("Render thread started ({} slots)", slot_count);
        Ok(Self {
            mailboxes,
            next_slot: 0,
            kicked: 0,
            handle: Some(handle),
        })
    }

    /// The slot the next `wait_frame`/`kick` pair must use.
    pub fn next_slot(&self) -> usize {
        self.next_slot
    }

    /// Number of frames handed to the thread so far.
    pub fn frames_kicked(&self) -> u64 {
        self.kicked
    }

    /// Blocks until the render thread is done with `slot`, then returns the result of
    /// the slot's previous job (`Ok` if it never had one).
    ///
    /// Fatal if `slot` is not the next slot in ring order, or if the previous job
    /// panicked.
    pub fn wait_frame(&self, slot: usize) -> Result<()> {
        check!(
            slot == self.next_slot,
            "render thread handshake out of order: waited on slot {} but slot {} is next",
            slot,
            self.next_slot
        );

        let mailbox = &self.mailboxes[slot];
        mailbox.done.acquire();
        match mailbox.outcome.lock().take() {
            Some(JobOutcome::Finished(result)) => result,
            Some(JobOutcome::Panicked(message)) => {
                fatal!("render thread job for slot {} panicked: {}", slot, message)
            }
            None => Ok(()),
        }
    }

    /// Hands `job` to the render thread for `slot` and moves on to the next slot.
    ///
    /// Must follow `wait_frame(slot)`.
    pub fn kick(&mut self, slot: usize, job: FrameJob) {
        check!(
            slot == self.next_slot,
            "render thread handshake out of order: kicked slot {} but slot {} is next",
            slot,
            self.next_slot
        );
        check!(self.handle.is_some(), "kick() after the render thread was shut down");

        let mailbox = &self.mailboxes[slot];
        *mailbox.job.lock() = Some(job);
        mailbox.awake.release();

        self.next_slot = (slot + 1) % self.mailboxes.len();
        self.kicked += 1;
    }

    /// Waits for every kicked job to finish. Returns the first error among them.
    ///
    /// Leaves every slot ready for its next `wait_frame`.
    pub fn flush(&self) -> Result<()> {
        let mut first_error = None;
        for offset in 0..self.mailboxes.len() {
            let slot = (self.next_slot + offset) % self.mailboxes.len();
            let mailbox = &self.mailboxes[slot];
            mailbox.done.acquire();
            let outcome = mailbox.outcome.lock().take();
            mailbox.done.release();

            match outcome {
                Some(JobOutcome::Finished(Err(err))) => {
                    first_error.get_or_insert(err);
                }
                Some(JobOutcome::Panicked(message)) => {
                    fatal!("render thread job for slot {} panicked: {}", slot, message)
                }
                Some(JobOutcome::Finished(Ok(()))) | None => {}
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Lets the thread finish the jobs it has, then joins it. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        // The thread wakes on the next slot with an empty mailbox and exits.
        let mailbox = &self.mailboxes[self.next_slot];
        mailbox.job.lock().take();
        mailbox.awake.release();

        if handle.join().is_err() {
            error!("Render thread exited by panicking");
        }
        info!("Render thread stopped after {} frames", self.kicked);
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RenderThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderThread")
            .field("slots", &self.mailboxes.len())
            .field("next_slot", &self.next_slot)
            .field("kicked", &self.kicked)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

fn render_loop(mailboxes: &[Mailbox]) {
    let mut slot = 0;
    loop {
        let mailbox = &mailboxes[slot];
        mailbox.awake.acquire();
        let Some(job) = mailbox.job.lock().take() else {
            debug!("Render thread woke on slot {} without a job; exiting", slot);
            break;
        };

        let outcome = match catch_unwind(AssertUnwindSafe(job)) {
            Ok(result) => {
                if let Err(err) = &result {
                    error!("Frame submission for slot {} failed: {}", slot, err);
                }
                JobOutcome::Finished(result)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Frame submission for slot {} panicked: {}", slot, message);
                JobOutcome::Panicked(message)
            }
        };
        *mailbox.outcome.lock() = Some(outcome);
        mailbox.done.release();

        slot = (slot + 1) % mailboxes.len();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EngineError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn jobs_run_in_ring_order() {
        let mut thread = RenderThread::spawn(3).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for frame in 0..7usize {
            let slot = frame % 3;
            thread.wait_frame(slot).unwrap();
            let order = order.clone();
            thread.kick(
                slot,
                Box::new(move || {
                    order.lock().push(frame);
                    Ok(())
                }),
            );
        }
        thread.flush().unwrap();

        assert_eq!(*order.lock(), (0..7).collect::<Vec<_>>());
        assert_eq!(thread.next_slot(), 1);
        assert_eq!(thread.frames_kicked(), 7);
    }

    #[test]
    fn errors_surface_at_the_next_wait_on_the_slot() {
        let mut thread = RenderThread::spawn(2).unwrap();
        thread.wait_frame(0).unwrap();
        thread.kick(0, Box::new(|| Err(EngineError::DeviceLost)));
        thread.wait_frame(1).unwrap();
        thread.kick(1, Box::new(|| Ok(())));

        assert!(matches!(thread.wait_frame(0), Err(EngineError::DeviceLost)));
    }

    #[test]
    fn flush_reports_errors_and_keeps_slots_usable() {
        let mut thread = RenderThread::spawn(2).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        thread.wait_frame(0).unwrap();
        thread.kick(0, Box::new(|| Err(EngineError::Config(String::from("bad")))));
        assert!(matches!(thread.flush(), Err(EngineError::Config(_))));

        let counter = runs.clone();
        thread.wait_frame(1).unwrap();
        thread.kick(
            1,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        thread.flush().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "handshake out of order")]
    fn skipping_a_slot_is_fatal() {
        let thread = RenderThread::spawn(3).unwrap();
        let _ = thread.wait_frame(1);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut thread = RenderThread::spawn(3).unwrap();
        thread.wait_frame(0).unwrap();
        thread.kick(0, Box::new(|| Ok(())));
        thread.shutdown();
        thread.shutdown();
    }
}
