//! # Software GPU Backend
//!
//! A CPU implementation of [`GpuDevice`] with the queue semantics of real hardware:
//!
//! * Each queue is its own thread consuming operations in submission order
//! * `wait` blocks only the queue thread it was placed on
//! * `signal` advances the fence once everything before it on that queue retired
//!
//! Buffer copies and skinning dispatches are executed for real on simulated device
//! memory, so results can be read back and compared bit for bit. Render passes are
//! validated and counted per target rather than rasterized.
//!
//! ## Test Hooks
//! - [`SoftwareGpu::pause`] / [`SoftwareGpu::resume`] hold a queue back, simulating a GPU
//!   that runs several frames behind the CPU
//! - [`SoftwareGpu::fail_next_present`] makes the next present report a lost device
//! - [`SoftwareGpu::fail_buffer_creation`] and [`SoftwareGpu::fail_buffer_write`] make
//!   the next allocation or write of a buffer with a matching label fail once
//! - A shared [`Timeline`] records every execute, wait and signal

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use cgmath::{InnerSpace, Matrix4, Vector4, Zero};
use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};

use super::{
    command_list::{DrawIndexed, GpuCommand, PassDesc, SkinningDispatch},
    layout::{GpuMatrix, GpuSkinInfluence, GpuVertex},
    queue_thread::{QueueBackend, QueueOp, QueueThreads},
    timeline::{Timeline, TimelineEventKind},
    BufferDesc, BufferId, BufferKind, CommandList, Fence, GpuDevice, GpuError, PipelineId, QueueKind,
    RenderStateKey, TextureDesc, TextureId, TextureKind, SWAP_CHAIN_LENGTH,
};

/// Construction options of a [`SoftwareGpu`].
#[derive(Debug, Clone)]
pub struct SoftwareGpuOptions {
    /// Width of the swap-chain images.
    pub width: u32,
    /// Height of the swap-chain images.
    pub height: u32,
    /// Event sink shared with the renderer.
    pub timeline: Option<Arc<Timeline>>,
    /// Time each command list takes to "execute".
    pub execution_delay: Option<Duration>,
}

impl Default for SoftwareGpuOptions {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            timeline: None,
            execution_delay: None,
        }
    }
}

/// Per-render-target counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetStats {
    /// Passes that rendered into the target.
    pub passes: u64,
    /// Draws recorded into the target.
    pub draws: u64,
    /// Triangles recorded into the target.
    pub triangles: u64,
    /// Blits that wrote the target.
    pub blits: u64,
    /// Label of the most recent pass.
    pub last_pass: String,
}

/// Device-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoftwareGpuStats {
    /// Command lists executed, indexed by `QueueKind::index()`.
    pub lists_executed: [u64; 3],
    /// Buffer copies executed.
    pub copies: u64,
    /// Bytes moved by copies.
    pub bytes_copied: u64,
    /// Skinning dispatches executed.
    pub dispatches: u64,
    /// Vertices written by skinning dispatches.
    pub vertices_skinned: u64,
    /// Render passes executed.
    pub passes: u64,
    /// Draws executed.
    pub draws: u64,
    /// Successful presents.
    pub presents: u64,
    /// Commands rejected during execution.
    pub command_errors: u64,
}

struct SoftwareBuffer {
    label: String,
    kind: BufferKind,
    data: Vec<u8>,
    times_written: u64,
}

struct SwapChain {
    images: [TextureId; SWAP_CHAIN_LENGTH],
    index: u32,
    presented: u64,
    fail_next_present: bool,
}

/// One-shot failures armed by the test hooks, matched by buffer label prefix.
#[derive(Default)]
struct Faults {
    create_buffer: Option<String>,
    write_buffer: Option<String>,
}

struct SoftwareState {
    next_id: AtomicU32,
    buffers: Mutex<HashMap<BufferId, SoftwareBuffer>>,
    textures: Mutex<HashMap<TextureId, TextureDesc>>,
    targets: Mutex<HashMap<TextureId, TargetStats>>,
    pipelines: Mutex<HashMap<PipelineId, RenderStateKey>>,
    stats: Mutex<SoftwareGpuStats>,
    paused: Mutex<[bool; 3]>,
    resumed: Condvar,
    timeline: Option<Arc<Timeline>>,
    execution_delay: Option<Duration>,
    swap_chain: Mutex<SwapChain>,
    faults: Mutex<Faults>,
}

/// Disarms and reports a fault armed for `label`.
fn take_fault(fault: &mut Option<String>, label: &str) -> bool {
    match fault {
        Some(prefix) if label.starts_with(prefix.as_str()) => {
            *fault = None;
            true
        }
        _ => false,
    }
}

/// The CPU-executed GPU.
pub struct SoftwareGpu {
    state: Arc<SoftwareState>,
    queues: QueueThreads,
}

impl SoftwareGpu {
    /// Creates a device with default options.
    pub fn new() -> Self {
        Self::with_options(SoftwareGpuOptions::default())
    }

    /// Creates a device recording into `timeline`.
    pub fn with_timeline(timeline: Arc<Timeline>) -> Self {
        Self::with_options(SoftwareGpuOptions {
            timeline: Some(timeline),
            ..Default::default()
        })
    }

    /// Creates a device with explicit options.
    pub fn with_options(options: SoftwareGpuOptions) -> Self {
        let next_id = AtomicU32::new(1);
        let mut textures = HashMap::new();
        let images = std::array::from_fn(|index| {
            let id = TextureId(next_id.fetch_add(1, Ordering::Relaxed));
            textures.insert(
                id,
                TextureDesc::new(
                    format!("swap chain image {}", index),
                    options.width,
                    options.height,
                    TextureKind::RenderTarget,
                ),
            );
            id
        });

        let state = Arc::new(SoftwareState {
            next_id,
            buffers: Mutex::new(HashMap::new()),
            textures: Mutex::new(textures),
            targets: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
            stats: Mutex::new(SoftwareGpuStats::default()),
            paused: Mutex::new([false; 3]),
            resumed: Condvar::new(),
            timeline: options.timeline,
            execution_delay: options.execution_delay,
            swap_chain: Mutex::new(SwapChain {
                images,
                index: 0,
                presented: 0,
                fail_next_present: false,
            }),
            faults: Mutex::new(Faults::default()),
        });

        info!(
            "Software GPU created ({}x{} swap chain)",
            options.width, options.height
        );
        let queues = QueueThreads::spawn(state.clone(), "software-gpu");
        Self { state, queues }
    }

    /// Holds back everything placed on `queue` from now on until `resume()`.
    ///
    /// An operation that already started is not interrupted.
    pub fn pause(&self, queue: QueueKind) {
        self.state.paused.lock()[queue.index()] = true;
    }

    /// Lets `queue` continue.
    pub fn resume(&self, queue: QueueKind) {
        let mut paused = self.state.paused.lock();
        paused[queue.index()] = false;
        self.state.resumed.notify_all();
    }

    /// Makes the next `present()` fail with [`GpuError::DeviceLost`].
    pub fn fail_next_present(&self) {
        self.state.swap_chain.lock().fail_next_present = true;
    }

    /// Makes the next `create_buffer()` whose label starts with `label_prefix` fail with
    /// [`GpuError::OutOfMemory`].
    pub fn fail_buffer_creation(&self, label_prefix: impl Into<String>) {
        self.state.faults.lock().create_buffer = Some(label_prefix.into());
    }

    /// Makes the next `write_buffer()` into a buffer whose label starts with
    /// `label_prefix` fail with [`GpuError::MapFailed`].
    pub fn fail_buffer_write(&self, label_prefix: impl Into<String>) {
        self.state.faults.lock().write_buffer = Some(label_prefix.into());
    }

    /// Blocks until every queue has retired all work submitted so far.
    pub fn wait_idle(&self) {
        let fences: Vec<Fence> = QueueKind::ALL
            .iter()
            .map(|queue| {
                let fence = Fence::new(format!("{} idle", queue.label()));
                self.queues.push(*queue, QueueOp::Signal(fence.clone(), 1));
                fence
            })
            .collect();
        for fence in &fences {
            fence.wait(1);
        }
    }

    /// Snapshot of the device counters.
    pub fn stats(&self) -> SoftwareGpuStats {
        self.state.stats.lock().clone()
    }

    /// Counters of one render target.
    pub fn target_stats(&self, texture: TextureId) -> TargetStats {
        self.state
            .targets
            .lock()
            .get(&texture)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of pipeline states currently alive.
    pub fn live_pipeline_count(&self) -> usize {
        self.state.pipelines.lock().len()
    }

    /// Number of live buffers.
    pub fn buffer_count(&self) -> usize {
        self.state.buffers.lock().len()
    }

    /// Sum of all buffer sizes in bytes.
    pub fn total_allocated_memory(&self) -> u64 {
        self.state
            .buffers
            .lock()
            .values()
            .map(|buffer| buffer.data.len() as u64)
            .sum()
    }

    /// Number of CPU writes into `buffer`.
    pub fn times_written(&self, buffer: BufferId) -> u64 {
        self.state
            .buffers
            .lock()
            .get(&buffer)
            .map_or(0, |buffer| buffer.times_written)
    }

    /// The swap-chain textures.
    pub fn swap_chain_images(&self) -> [TextureId; SWAP_CHAIN_LENGTH] {
        self.state.swap_chain.lock().images
    }

    /// Number of successful presents.
    pub fn presented_frames(&self) -> u64 {
        self.state.swap_chain.lock().presented
    }
}

impl Default for SoftwareGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SoftwareGpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareGpu")
            .field("buffers", &self.buffer_count())
            .field("stats", &self.stats())
            .finish()
    }
}

impl GpuDevice for SoftwareGpu {
    fn backend_name(&self) -> &'static str {
        "software"
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId, GpuError> {
        if take_fault(&mut self.state.faults.lock().create_buffer, &desc.label) {
            error!("Injected allocation failure for '{}'", desc.label);
            return Err(GpuError::OutOfMemory(desc.label.clone()));
        }
        let id = BufferId(self.state.allocate_id());
        self.state.buffers.lock().insert(
            id,
            SoftwareBuffer {
                label: desc.label.clone(),
                kind: desc.kind,
                data: vec![0; desc.size as usize],
                times_written: 0,
            },
        );
        debug!("Created {:?} buffer '{}' ({} bytes)", desc.kind, desc.label, desc.size);
        Ok(id)
    }

    fn resize_buffer(&self, buffer: BufferId, size: u64) -> Result<(), GpuError> {
        let mut buffers = self.state.buffers.lock();
        let entry = buffers.get_mut(&buffer).ok_or(GpuError::UnknownBuffer(buffer))?;
        debug!(
            "Resizing {:?} buffer '{}' from {} to {} bytes",
            entry.kind,
            entry.label,
            entry.data.len(),
            size
        );
        entry.data = vec![0; size as usize];
        Ok(())
    }

    fn buffer_size(&self, buffer: BufferId) -> Result<u64, GpuError> {
        self.state
            .buffers
            .lock()
            .get(&buffer)
            .map(|entry| entry.data.len() as u64)
            .ok_or(GpuError::UnknownBuffer(buffer))
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<(), GpuError> {
        let mut buffers = self.state.buffers.lock();
        let entry = buffers.get_mut(&buffer).ok_or(GpuError::UnknownBuffer(buffer))?;
        if take_fault(&mut self.state.faults.lock().write_buffer, &entry.label) {
            error!("Injected map failure for '{}'", entry.label);
            return Err(GpuError::MapFailed(buffer));
        }
        let range = checked_range(buffer, entry.data.len(), offset, data.len() as u64)?;
        entry.data[range].copy_from_slice(data);
        entry.times_written += 1;
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, offset: u64, len: u64) -> Result<Vec<u8>, GpuError> {
        let buffers = self.state.buffers.lock();
        let entry = buffers.get(&buffer).ok_or(GpuError::UnknownBuffer(buffer))?;
        let range = checked_range(buffer, entry.data.len(), offset, len)?;
        Ok(entry.data[range].to_vec())
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId, GpuError> {
        let id = TextureId(self.state.allocate_id());
        self.state.textures.lock().insert(id, desc.clone());
        debug!(
            "Created {:?} texture '{}' ({}x{})",
            desc.kind, desc.label, desc.width, desc.height
        );
        Ok(id)
    }

    fn create_pipeline(&self, key: &RenderStateKey) -> Result<PipelineId, GpuError> {
        let id = PipelineId(self.state.allocate_id());
        self.state.pipelines.lock().insert(id, *key);
        Ok(id)
    }

    fn release_pipeline(&self, pipeline: PipelineId) {
        self.state.pipelines.lock().remove(&pipeline);
    }

    fn execute(&self, queue: QueueKind, list: CommandList) {
        self.queues.push(queue, QueueOp::Execute(list));
    }

    fn signal(&self, queue: QueueKind, fence: &Fence, value: u64) {
        fence.schedule(value);
        self.queues.push(queue, QueueOp::Signal(fence.clone(), value));
    }

    fn wait(&self, queue: QueueKind, fence: &Fence, value: u64) {
        self.queues.push(queue, QueueOp::Wait(fence.clone(), value));
    }

    fn present(&self, vsync: bool) -> Result<u32, GpuError> {
        let mut chain = self.state.swap_chain.lock();
        if chain.fail_next_present {
            chain.fail_next_present = false;
            return Err(GpuError::DeviceLost);
        }

        chain.presented += 1;
        chain.index = (chain.index + 1) % SWAP_CHAIN_LENGTH as u32;
        self.state.stats.lock().presents += 1;
        if let Some(timeline) = &self.state.timeline {
            timeline.record(
                TimelineEventKind::Presented,
                Some(QueueKind::Direct),
                if vsync { "present (vsync)" } else { "present" },
                chain.presented,
            );
        }
        Ok(chain.index)
    }

    fn back_buffer_index(&self) -> u32 {
        self.state.swap_chain.lock().index
    }

    fn back_buffer(&self) -> TextureId {
        let chain = self.state.swap_chain.lock();
        chain.images[chain.index as usize]
    }
}

impl SoftwareState {
    fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Blocks the queue thread while the queue is paused.
    fn gate(&self, queue: QueueKind) {
        let mut paused = self.paused.lock();
        while paused[queue.index()] {
            self.resumed.wait(&mut paused);
        }
    }

    fn record(&self, kind: TimelineEventKind, queue: QueueKind, label: &str, value: u64) {
        if let Some(timeline) = &self.timeline {
            timeline.record(kind, Some(queue), label, value);
        }
    }

    fn run_command(&self, command: &GpuCommand, current_target: &mut Option<TextureId>) -> Result<(), GpuError> {
        match command {
            GpuCommand::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => self.copy_buffer(*src, *src_offset, *dst, *dst_offset, *size),
            GpuCommand::Dispatch(dispatch) => self.dispatch_skinning(dispatch),
            GpuCommand::BeginPass(pass) => {
                let target = self.begin_pass(pass)?;
                *current_target = Some(target);
                Ok(())
            }
            GpuCommand::SetPipeline(pipeline) => {
                if self.pipelines.lock().contains_key(pipeline) {
                    Ok(())
                } else {
                    Err(GpuError::UnknownPipeline(*pipeline))
                }
            }
            GpuCommand::DrawIndexed(draw) => {
                let target = current_target.ok_or(GpuError::DrawOutsidePass)?;
                self.draw(target, draw)
            }
            GpuCommand::EndPass => {
                *current_target = None;
                Ok(())
            }
            GpuCommand::Blit { src, dst } => {
                let textures = self.textures.lock();
                if !textures.contains_key(src) {
                    return Err(GpuError::UnknownTexture(*src));
                }
                if !textures.contains_key(dst) {
                    return Err(GpuError::UnknownTexture(*dst));
                }
                drop(textures);
                self.targets.lock().entry(*dst).or_default().blits += 1;
                Ok(())
            }
        }
    }

    fn copy_buffer(&self, src: BufferId, src_offset: u64, dst: BufferId, dst_offset: u64, size: u64) -> Result<(), GpuError> {
        let mut buffers = self.buffers.lock();
        let source = buffers.get(&src).ok_or(GpuError::UnknownBuffer(src))?;
        let source_range = checked_range(src, source.data.len(), src_offset, size)?;
        let bytes = source.data[source_range].to_vec();

        let destination = buffers.get_mut(&dst).ok_or(GpuError::UnknownBuffer(dst))?;
        let destination_range = checked_range(dst, destination.data.len(), dst_offset, size)?;
        destination.data[destination_range].copy_from_slice(&bytes);
        drop(buffers);

        let mut stats = self.stats.lock();
        stats.copies += 1;
        stats.bytes_copied += size;
        Ok(())
    }

    fn dispatch_skinning(&self, dispatch: &SkinningDispatch) -> Result<(), GpuError> {
        let vertex_count = dispatch.vertex_count as usize;
        let vertex_size = std::mem::size_of::<GpuVertex>();
        let influence_size = std::mem::size_of::<GpuSkinInfluence>();
        let matrix_size = std::mem::size_of::<GpuMatrix>();

        let mut buffers = self.buffers.lock();
        let skinned = {
            let memory = &*buffers;
            let vertices = buffer_bytes(memory, dispatch.source_vertices, 0, vertex_count * vertex_size)?;
            let influences = buffer_bytes(memory, dispatch.influences, 0, vertex_count * influence_size)?;
            let bone_bytes = buffer_bytes(
                memory,
                dispatch.bone_matrices,
                dispatch.bone_offset as usize * matrix_size,
                dispatch.bone_count as usize * matrix_size,
            )?;
            let bones: Vec<GpuMatrix> = bone_bytes
                .chunks_exact(matrix_size)
                .map(bytemuck::pod_read_unaligned::<GpuMatrix>)
                .collect();

            vertices
                .chunks_exact(vertex_size)
                .zip(influences.chunks_exact(influence_size))
                .map(|(vertex, influence)| {
                    skin_vertex(
                        &bytemuck::pod_read_unaligned(vertex),
                        &bytemuck::pod_read_unaligned(influence),
                        &bones,
                    )
                })
                .collect::<Vec<GpuVertex>>()
        };

        let output = buffers
            .get_mut(&dispatch.output)
            .ok_or(GpuError::UnknownBuffer(dispatch.output))?;
        let bytes: &[u8] = bytemuck::cast_slice(&skinned);
        let range = checked_range(dispatch.output, output.data.len(), 0, bytes.len() as u64)?;
        output.data[range].copy_from_slice(bytes);
        drop(buffers);

        let mut stats = self.stats.lock();
        stats.dispatches += 1;
        stats.vertices_skinned += dispatch.vertex_count as u64;
        Ok(())
    }

    fn begin_pass(&self, pass: &PassDesc) -> Result<TextureId, GpuError> {
        {
            let textures = self.textures.lock();
            for texture in pass.color.iter().chain([&pass.depth]).chain(pass.shadow_maps.iter()) {
                if !textures.contains_key(texture) {
                    return Err(GpuError::UnknownTexture(*texture));
                }
            }
        }
        {
            let buffers = self.buffers.lock();
            for buffer in [pass.views, pass.transforms, pass.materials, pass.lights] {
                if !buffers.contains_key(&buffer) {
                    return Err(GpuError::UnknownBuffer(buffer));
                }
            }
        }

        let target = pass.color.unwrap_or(pass.depth);
        let mut targets = self.targets.lock();
        let stats = targets.entry(target).or_default();
        stats.passes += 1;
        stats.last_pass.clone_from(&pass.label);
        drop(targets);
        self.stats.lock().passes += 1;
        Ok(target)
    }

    fn draw(&self, target: TextureId, draw: &DrawIndexed) -> Result<(), GpuError> {
        {
            let buffers = self.buffers.lock();
            for buffer in [draw.vertex_buffer, draw.index_buffer] {
                if !buffers.contains_key(&buffer) {
                    return Err(GpuError::UnknownBuffer(buffer));
                }
            }
        }

        let mut targets = self.targets.lock();
        let stats = targets.entry(target).or_default();
        stats.draws += 1;
        stats.triangles += (draw.index_count / 3) as u64;
        drop(targets);
        self.stats.lock().draws += 1;
        Ok(())
    }
}

impl QueueBackend for SoftwareState {
    fn execute(&self, queue: QueueKind, list: CommandList) {
        self.gate(queue);
        if let Some(delay) = self.execution_delay {
            std::thread::sleep(delay);
        }

        let mut current_target = None;
        for command in list.commands() {
            if let Err(err) = self.run_command(command, &mut current_target) {
                error!(
                    "{} queue: command in '{}' failed: {}",
                    queue.label(),
                    list.label(),
                    err
                );
                self.stats.lock().command_errors += 1;
            }
        }

        self.stats.lock().lists_executed[queue.index()] += 1;
        self.record(TimelineEventKind::Executed, queue, list.label(), 0);
    }

    fn signal(&self, queue: QueueKind, fence: &Fence, value: u64) {
        self.gate(queue);
        self.record(TimelineEventKind::Signaled, queue, fence.label(), value);
        fence.signal(value);
    }

    fn wait(&self, queue: QueueKind, fence: &Fence, value: u64) {
        self.gate(queue);
        fence.wait(value);
        self.record(TimelineEventKind::WaitSatisfied, queue, fence.label(), value);
    }
}

/// Byte range of an access, or the out-of-bounds error.
fn checked_range(buffer: BufferId, size: usize, offset: u64, len: u64) -> Result<std::ops::Range<usize>, GpuError> {
    let end = offset.checked_add(len);
    match end {
        Some(end) if end <= size as u64 => Ok(offset as usize..end as usize),
        _ => Err(GpuError::OutOfBounds {
            buffer,
            offset,
            len,
            size: size as u64,
        }),
    }
}

fn buffer_bytes(
    buffers: &HashMap<BufferId, SoftwareBuffer>,
    buffer: BufferId,
    offset: usize,
    len: usize,
) -> Result<&[u8], GpuError> {
    let entry = buffers.get(&buffer).ok_or(GpuError::UnknownBuffer(buffer))?;
    let range = checked_range(buffer, entry.data.len(), offset as u64, len as u64)?;
    Ok(&entry.data[range])
}

/// Linear blend skinning of one vertex.
///
/// Joint indices address `bones`; influences with zero weight or an out-of-range joint
/// are ignored. A vertex without any effective influence keeps its bind pose.
pub fn skin_vertex(vertex: &GpuVertex, influence: &GpuSkinInfluence, bones: &[GpuMatrix]) -> GpuVertex {
    let position = Vector4::new(vertex.position[0], vertex.position[1], vertex.position[2], 1.0);
    let normal = Vector4::new(vertex.normal[0], vertex.normal[1], vertex.normal[2], 0.0);

    let mut skinned_position = Vector4::<f32>::zero();
    let mut skinned_normal = Vector4::<f32>::zero();
    let mut total_weight = 0.0;

    for (joint, weight) in influence.joints.iter().zip(influence.weights) {
        if weight == 0.0 {
            continue;
        }
        let Some(bone) = bones.get(*joint as usize) else {
            continue;
        };
        let matrix = Matrix4::from(*bone);
        skinned_position += (matrix * position) * weight;
        skinned_normal += (matrix * normal) * weight;
        total_weight += weight;
    }

    if total_weight == 0.0 {
        return *vertex;
    }

    let normal = skinned_normal.truncate();
    let normal = if normal.magnitude2() > 0.0 { normal.normalize() } else { normal };
    GpuVertex {
        position: [skinned_position.x, skinned_position.y, skinned_position.z],
        normal: normal.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{SquareMatrix, Vector3};

    fn matrix(m: Matrix4<f32>) -> GpuMatrix {
        m.into()
    }

    #[test]
    fn copies_execute_in_queue_order() {
        let gpu = SoftwareGpu::new();
        let upload = gpu
            .create_buffer(&BufferDesc::new("upload", 16, BufferKind::Upload))
            .unwrap();
        let device_local = gpu
            .create_buffer(&BufferDesc::new("storage", 16, BufferKind::Storage))
            .unwrap();
        gpu.write_buffer(upload, 0, &[7; 16]).unwrap();

        let mut list = CommandList::new("copy");
        list.copy_buffer(upload, 0, device_local, 0, 16);
        let fence = Fence::new("copy fence");
        gpu.execute(QueueKind::Copy, list);
        gpu.signal(QueueKind::Copy, &fence, 1);
        fence.wait(1);

        assert_eq!(gpu.read_buffer(device_local, 0, 16).unwrap(), vec![7; 16]);
        assert_eq!(gpu.stats().bytes_copied, 16);
    }

    #[test]
    fn out_of_bounds_write_is_rejected() {
        let gpu = SoftwareGpu::new();
        let buffer = gpu
            .create_buffer(&BufferDesc::new("small", 4, BufferKind::Upload))
            .unwrap();
        let err = gpu.write_buffer(buffer, 2, &[0; 4]).unwrap_err();
        assert!(matches!(err, GpuError::OutOfBounds { size: 4, .. }));
        assert_eq!(
            gpu.write_buffer(BufferId(9999), 0, &[0]),
            Err(GpuError::UnknownBuffer(BufferId(9999)))
        );
    }

    #[test]
    fn injected_faults_fire_once_on_matching_labels() {
        let gpu = SoftwareGpu::new();
        gpu.fail_buffer_creation("views");
        assert!(gpu.create_buffer(&BufferDesc::new("lights", 16, BufferKind::Storage)).is_ok());
        assert_eq!(
            gpu.create_buffer(&BufferDesc::new("views (slot 0)", 16, BufferKind::Storage)),
            Err(GpuError::OutOfMemory(String::from("views (slot 0)")))
        );
        assert!(gpu.create_buffer(&BufferDesc::new("views (slot 0)", 16, BufferKind::Storage)).is_ok());

        let upload = gpu
            .create_buffer(&BufferDesc::new("upload (slot 0)", 16, BufferKind::Upload))
            .unwrap();
        gpu.fail_buffer_write("upload");
        assert_eq!(gpu.write_buffer(upload, 0, &[1; 4]), Err(GpuError::MapFailed(upload)));
        assert_eq!(gpu.write_buffer(upload, 0, &[1; 4]), Ok(()));
    }

    #[test]
    fn paused_queue_holds_back_its_signal() {
        let gpu = SoftwareGpu::new();
        let fence = Fence::new("paused");
        gpu.pause(QueueKind::Direct);
        gpu.signal(QueueKind::Direct, &fence, 1);

        assert!(!fence.wait_timeout(1, Duration::from_millis(20)));
        assert_eq!(fence.pending_value(), 1);
        gpu.resume(QueueKind::Direct);
        assert!(fence.wait_timeout(1, Duration::from_secs(5)));
    }

    #[test]
    fn gpu_wait_orders_work_across_queues() {
        let timeline = Arc::new(Timeline::new());
        let gpu = SoftwareGpu::with_timeline(timeline.clone());
        let fence = Fence::new("chain");

        gpu.pause(QueueKind::Copy);
        gpu.wait(QueueKind::Compute, &fence, 1);
        gpu.execute(QueueKind::Compute, CommandList::new("dependent"));
        gpu.signal(QueueKind::Compute, &fence, 2);
        gpu.execute(QueueKind::Copy, CommandList::new("producer"));
        gpu.signal(QueueKind::Copy, &fence, 1);
        gpu.resume(QueueKind::Copy);
        fence.wait(2);

        let producer = timeline.first(TimelineEventKind::Executed, "producer").unwrap();
        let dependent = timeline.first(TimelineEventKind::Executed, "dependent").unwrap();
        assert!(producer < dependent);
    }

    #[test]
    fn present_cycles_back_buffers_and_can_lose_the_device() {
        let gpu = SoftwareGpu::new();
        assert_eq!(gpu.back_buffer_index(), 0);
        assert_eq!(gpu.present(true), Ok(1));
        assert_eq!(gpu.present(false), Ok(2));
        assert_eq!(gpu.present(false), Ok(0));
        assert_eq!(gpu.back_buffer(), gpu.swap_chain_images()[0]);

        gpu.fail_next_present();
        assert_eq!(gpu.present(false), Err(GpuError::DeviceLost));
        assert_eq!(gpu.presented_frames(), 3);
    }

    #[test]
    fn skinning_blends_bone_transforms() {
        let vertex = GpuVertex::new([1.0, 0.0, 0.0], [0.0, 1.0, 0.0]);
        let bones = [
            matrix(Matrix4::identity()),
            matrix(Matrix4::from_translation(Vector3::new(0.0, 2.0, 0.0))),
        ];
        let influence = GpuSkinInfluence {
            joints: [0, 1, 0, 0],
            weights: [0.5, 0.5, 0.0, 0.0],
        };

        let skinned = skin_vertex(&vertex, &influence, &bones);
        assert_eq!(skinned.position, [1.0, 1.0, 0.0]);
        assert_eq!(skinned.normal, [0.0, 1.0, 0.0]);

        let unweighted = skin_vertex(&vertex, &GpuSkinInfluence::default(), &bones);
        assert_eq!(unweighted, vertex);
    }

    #[test]
    fn skinning_dispatch_writes_output_buffer() {
        let gpu = SoftwareGpu::new();
        let vertices = [GpuVertex::new([0.0, 0.0, 0.0], [0.0, 0.0, 1.0]); 2];
        let influences = [GpuSkinInfluence {
            joints: [0, 0, 0, 0],
            weights: [1.0, 0.0, 0.0, 0.0],
        }; 2];
        let bones = [
            matrix(Matrix4::identity()),
            matrix(Matrix4::from_translation(Vector3::new(3.0, 0.0, 0.0))),
        ];

        let create = |label: &str, bytes: &[u8], kind| {
            let id = gpu
                .create_buffer(&BufferDesc::new(label, bytes.len() as u64, kind))
                .unwrap();
            gpu.write_buffer(id, 0, bytes).unwrap();
            id
        };
        let source = create("source", bytemuck::cast_slice(&vertices), BufferKind::Vertex);
        let weights = create("weights", bytemuck::cast_slice(&influences), BufferKind::Storage);
        let matrices = create("bones", bytemuck::cast_slice(&bones), BufferKind::Storage);
        let output = gpu
            .create_buffer(&BufferDesc::new("output", 48, BufferKind::ComputeVertexOutput))
            .unwrap();

        let mut list = CommandList::new("skinning");
        list.dispatch_skinning(SkinningDispatch {
            source_vertices: source,
            influences: weights,
            bone_matrices: matrices,
            bone_offset: 1,
            bone_count: 1,
            output,
            vertex_count: 2,
        });
        gpu.execute(QueueKind::Compute, list);
        gpu.wait_idle();

        let bytes = gpu.read_buffer(output, 0, 48).unwrap();
        let skinned: Vec<GpuVertex> = bytes
            .chunks_exact(24)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        assert_eq!(skinned[1].position, [3.0, 0.0, 0.0]);
        assert_eq!(gpu.stats().vertices_skinned, 2);
    }
}
