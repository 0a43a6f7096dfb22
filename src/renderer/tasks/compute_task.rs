//! Task that submits a frame's skinning dispatches.
//!
//! Before anything reaches the compute queue the task places a GPU-side wait on the
//! cycle's copy ticket: skinning reads the bone table the copy queue uploads, so it
//! may not start until that copy has retired on the GPU, whatever the CPU order of
//! the two submissions.

use std::sync::Arc;

use log::error;

use crate::{
    gpu::{CommandList, FenceGate, QueueKind, SkinningDispatch, Ticket},
    task_management::task::Task,
};

/// Submits the compute queue work of one frame.
#[derive(Debug)]
pub struct ComputeTask {
    label: String,
    /// Input: the slot's fence gate.
    pub gate: Option<Arc<FenceGate>>,
    /// Input: the copy ticket the compute queue waits for.
    pub wait_for: Option<Ticket>,
    /// Input: ticket signalled after the dispatches.
    pub signal: Option<Ticket>,
    /// Input: frame counter, used in the command list label.
    pub frame_counter: u64,
    /// Input: dispatches to record.
    pub dispatches: Vec<SkinningDispatch>,
    /// Output: number of dispatches submitted.
    pub dispatched: usize,
    /// Output: vertices those dispatches skin.
    pub vertices: u64,
    /// Output: `true` once the list and its signal were queued.
    pub submitted: bool,
}

impl ComputeTask {
    pub fn new(slot: usize) -> Self {
        Self {
            label: format!("compute_{}", slot),
            gate: None,
            wait_for: None,
            signal: None,
            frame_counter: 0,
            dispatches: Vec::new(),
            dispatched: 0,
            vertices: 0,
            submitted: false,
        }
    }
}

impl Task for ComputeTask {
    fn execute(&mut self) {
        let (Some(gate), Some(wait_for), Some(signal)) = (self.gate.clone(), self.wait_for.clone(), self.signal.clone())
        else {
            error!("Compute task '{}' executed without a gate or tickets", self.label);
            return;
        };

        gate.gpu_wait(QueueKind::Compute, &wait_for);

        let mut list = CommandList::new(format!("skinning {}", self.frame_counter));
        for dispatch in &self.dispatches {
            list.dispatch_skinning(*dispatch);
            self.vertices += dispatch.vertex_count as u64;
        }
        self.dispatched = self.dispatches.len();

        gate.submit_signaling(QueueKind::Compute, list, &signal);
        self.submitted = true;
    }

    fn reset(&mut self) {
        self.gate = None;
        self.wait_for = None;
        self.signal = None;
        self.frame_counter = 0;
        self.dispatches.clear();
        self.dispatched = 0;
        self.vertices = 0;
        self.submitted = false;
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::software::SoftwareGpu;

    #[test]
    fn compute_signal_waits_for_the_copy_ticket() {
        let device = Arc::new(SoftwareGpu::new());
        let gate = Arc::new(FenceGate::new(device, "compute test"));
        let copy = gate.reserve();
        let compute = gate.reserve();

        let mut task = ComputeTask::new(0);
        task.gate = Some(gate.clone());
        task.wait_for = Some(copy.clone());
        task.signal = Some(compute.clone());
        task.execute();
        assert!(task.submitted);

        // Nothing signalled the copy ticket yet, so the compute queue is parked on it.
        assert!(!gate
            .fence()
            .wait_timeout(compute.value(), std::time::Duration::from_millis(50)));

        gate.fence().signal(copy.value());
        gate.wait(&compute);
        assert!(gate.is_complete(&compute));
    }
}
