//! Task that uploads a frame's CPU-staged data to device memory.
//!
//! The main thread packs every table of the frame into `staging` and lists the copies
//! out of upload memory. On a worker, the task maps the slot's upload buffer, writes
//! the staged bytes, records the copies and submits them to the copy queue, signalling
//! the cycle's copy ticket behind them.
//!
//! The ticket is signalled even when the upload write fails, so the compute queue and
//! the frame never wait on a value that cannot arrive. The failure is reported in
//! `error` and the copies out of the upload buffer are dropped. Copies out of other
//! buffers (mesh staging) are still recorded.

use std::sync::Arc;

use log::error;

use crate::{
    gpu::{BufferId, CommandList, FenceGate, GpuError, QueueKind, Ticket},
    task_management::task::Task,
};

/// One buffer-to-buffer copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    pub src: BufferId,
    pub src_offset: u64,
    pub dst: BufferId,
    pub dst_offset: u64,
    pub size: u64,
}

/// Submits the copy queue work of one frame.
#[derive(Debug)]
pub struct CopyTask {
    label: String,
    /// Input: the slot's fence gate.
    pub gate: Option<Arc<FenceGate>>,
    /// Input: ticket signalled after the copies.
    pub signal: Option<Ticket>,
    /// Input: frame counter, used in the command list label.
    pub frame_counter: u64,
    /// Input: upload buffer `staging` is written to.
    pub upload: Option<BufferId>,
    /// Input: packed table data. Cleared on reset with its allocation kept.
    pub staging: Vec<u8>,
    /// Input: copies to record.
    pub regions: Vec<CopyRegion>,
    /// Output: bytes copied on the GPU.
    pub bytes_copied: u64,
    /// Output: number of copy commands submitted.
    pub copies: usize,
    /// Output: `true` once the list and its signal were queued.
    pub submitted: bool,
    /// Output: upload failure, if any.
    pub error: Option<GpuError>,
}

impl CopyTask {
    pub fn new(slot: usize) -> Self {
        Self {
            label: format!("copy_{}", slot),
            gate: None,
            signal: None,
            frame_counter: 0,
            upload: None,
            staging: Vec::new(),
            regions: Vec::new(),
            bytes_copied: 0,
            copies: 0,
            submitted: false,
            error: None,
        }
    }
}

impl Task for CopyTask {
    fn execute(&mut self) {
        let (Some(gate), Some(ticket)) = (self.gate.clone(), self.signal.clone()) else {
            error!("Copy task '{}' executed without a gate or ticket", self.label);
            return;
        };

        if let Some(upload) = self.upload {
            if !self.staging.is_empty() {
                if let Err(err) = gate.device().write_buffer(upload, 0, &self.staging) {
                    error!("Frame {}: upload write failed: {}", self.frame_counter, err);
                    self.error = Some(err);
                }
            }
        }

        let skipped = self.error.as_ref().and(self.upload);
        let mut list = CommandList::new(format!("copy {}", self.frame_counter));
        for region in self.regions.iter().filter(|region| Some(region.src) != skipped) {
            list.copy_buffer(region.src, region.src_offset, region.dst, region.dst_offset, region.size);
            self.bytes_copied += region.size;
        }
        self.copies = list.len();

        gate.submit_signaling(QueueKind::Copy, list, &ticket);
        self.submitted = true;
    }

    fn reset(&mut self) {
        self.gate = None;
        self.signal = None;
        self.frame_counter = 0;
        self.upload = None;
        self.staging.clear();
        self.regions.clear();
        self.bytes_copied = 0;
        self.copies = 0;
        self.submitted = false;
        self.error = None;
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{software::SoftwareGpu, BufferDesc, BufferKind, GpuDevice};

    #[test]
    fn staged_bytes_reach_the_destination_and_signal_the_ticket() {
        let device = Arc::new(SoftwareGpu::new());
        let gate = Arc::new(FenceGate::new(device.clone(), "copy test"));
        let upload = device
            .create_buffer(&BufferDesc::new("upload", 256, BufferKind::Upload))
            .unwrap();
        let storage = device
            .create_buffer(&BufferDesc::new("storage", 256, BufferKind::Storage))
            .unwrap();

        let mut task = CopyTask::new(0);
        let ticket = gate.reserve();
        task.gate = Some(gate.clone());
        task.signal = Some(ticket.clone());
        task.upload = Some(upload);
        task.staging.extend_from_slice(&[7u8; 16]);
        task.regions.push(CopyRegion {
            src: upload,
            src_offset: 0,
            dst: storage,
            dst_offset: 32,
            size: 16,
        });
        task.execute();

        gate.wait(&ticket);
        assert!(task.submitted);
        assert_eq!(task.bytes_copied, 16);
        assert_eq!(device.read_buffer(storage, 32, 16).unwrap(), vec![7u8; 16]);
    }

    #[test]
    fn failed_upload_still_signals() {
        let device = Arc::new(SoftwareGpu::new());
        let gate = Arc::new(FenceGate::new(device.clone(), "copy test"));

        let mut task = CopyTask::new(0);
        let ticket = gate.reserve();
        task.gate = Some(gate.clone());
        task.signal = Some(ticket.clone());
        task.upload = Some(BufferId(999));
        task.staging.push(1);
        task.execute();

        gate.wait(&ticket);
        assert!(matches!(task.error, Some(GpuError::UnknownBuffer(_))));
        assert_eq!(task.copies, 0);
    }

    #[test]
    fn failed_upload_keeps_mesh_copies() {
        let device = Arc::new(SoftwareGpu::new());
        let gate = Arc::new(FenceGate::new(device.clone(), "copy test"));
        let buffer = |label: &str, kind| device.create_buffer(&BufferDesc::new(label, 64, kind)).unwrap();
        let upload = buffer("upload", BufferKind::Upload);
        let mesh_staging = buffer("mesh staging", BufferKind::Upload);
        let vertices = buffer("mesh vertices", BufferKind::Vertex);
        let views = buffer("views", BufferKind::Storage);
        device.write_buffer(mesh_staging, 0, &[3u8; 8]).unwrap();

        let mut task = CopyTask::new(0);
        let ticket = gate.reserve();
        task.gate = Some(gate.clone());
        task.signal = Some(ticket.clone());
        task.upload = Some(upload);
        task.staging.extend_from_slice(&[5u8; 8]);
        task.regions.push(CopyRegion {
            src: mesh_staging,
            src_offset: 0,
            dst: vertices,
            dst_offset: 0,
            size: 8,
        });
        task.regions.push(CopyRegion {
            src: upload,
            src_offset: 0,
            dst: views,
            dst_offset: 0,
            size: 8,
        });

        device.fail_buffer_write("upload");
        task.execute();
        gate.wait(&ticket);

        assert_eq!(task.error, Some(GpuError::MapFailed(upload)));
        assert_eq!(task.copies, 1);
        assert_eq!(device.read_buffer(vertices, 0, 8).unwrap(), vec![3u8; 8]);
        assert_eq!(device.read_buffer(views, 0, 8).unwrap(), vec![0u8; 8]);
    }
}
