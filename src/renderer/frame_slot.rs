//! # Frame Slot Ring
//!
//! The renderer keeps [`FRAME_COUNT`] frame slots and cycles through them, so the CPU
//! can build frame N+1 (and N+2) while the GPU still executes frame N. Each slot owns
//! everything a frame writes: resource tables, draw lists, upload and table buffers,
//! render targets and the frame's task instances.
//!
//! ## Slot States
//! `Drained → Building → Submitted → (GPU executing) → Drained`
//!
//! - **Drained**: the slot's fence reached the value of its last submission
//! - **Building**: the main thread is refilling tables and draw lists
//! - **Submitted**: the slot's work was queued on the GPU, which now owns its data
//!
//! `Submitted → Drained` is never observed eagerly. The next [`FrameSlot::begin_render`]
//! for the slot blocks on the fence, and that wait is the engine's only throttle: a GPU
//! more than [`FRAME_COUNT`] frames behind stalls the main thread there.
//!
//! ## Fence Values
//! Every cycle reserves three consecutive values on the slot's fence: copy done,
//! skinning done, frame done. The last one becomes the slot's `fence_value`.

use std::{collections::HashMap, sync::Arc, time::Duration};

use log::debug;
use parking_lot::Mutex;

use crate::{
    gpu::{
        layout::{byte_size, GpuSkinInfluence, GpuVertex},
        BufferDesc, BufferId, BufferKind, FenceGate, GpuDevice, GpuError, PassKind, Ticket,
    },
    scene::assets::{MeshData, MeshHandle},
    task_management::task::TaskHandle,
};

use super::{
    draw_list::{ShadowDraws, ViewportDraws},
    resource_table::{FrameResourceTable, ResourceTag, TableLimits},
    tasks::{ComputeTask, CopyRegion, CopyTask, RenderPassTask},
    viewport::SlotTargets,
};

/// Number of frames in flight.
pub const FRAME_COUNT: usize = 3;

/// Smallest GPU buffer a slot allocates.
pub const MIN_BUFFER_SIZE: u64 = 256;

/// Size a growable buffer is allocated with to hold `required` bytes.
pub fn grown_size(required: u64) -> u64 {
    required.max(MIN_BUFFER_SIZE).next_power_of_two()
}

/// Lifecycle of a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Drained,
    Building,
    Submitted,
}

/// The fence values of one cycle through a slot.
#[derive(Debug, Clone)]
pub struct CycleTickets {
    /// Signalled on the copy queue after the uploads.
    pub copy: Ticket,
    /// Signalled on the compute queue after skinning.
    pub compute: Ticket,
    /// Signalled on the direct queue after the last pass of the frame.
    pub frame: Ticket,
}

/// A GPU buffer that grows by powers of two and never shrinks.
#[derive(Debug)]
pub struct GrowableBuffer {
    label: String,
    kind: BufferKind,
    buffer: Option<BufferId>,
    size: u64,
}

impl GrowableBuffer {
    pub fn new(label: impl Into<String>, kind: BufferKind) -> Self {
        Self {
            label: label.into(),
            kind,
            buffer: None,
            size: 0,
        }
    }

    /// Makes the buffer hold at least `required` bytes, creating it on first use.
    ///
    /// Growing does not preserve contents; every table is re-uploaded each frame.
    pub fn ensure(&mut self, device: &dyn GpuDevice, required: u64) -> Result<BufferId, GpuError> {
        match self.buffer {
            Some(buffer) if required <= self.size => Ok(buffer),
            Some(buffer) => {
                let size = grown_size(required);
                device.resize_buffer(buffer, size)?;
                debug!("Grew '{}' from {} to {} bytes", self.label, self.size, size);
                self.size = size;
                Ok(buffer)
            }
            None => {
                let size = grown_size(required);
                let buffer = device.create_buffer(&BufferDesc::new(self.label.clone(), size, self.kind))?;
                self.buffer = Some(buffer);
                self.size = size;
                Ok(buffer)
            }
        }
    }

    pub fn buffer(&self) -> Option<BufferId> {
        self.buffer
    }

    /// Allocated size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// The per-frame table buffers of a slot.
#[derive(Debug)]
pub struct FrameBuffers {
    /// CPU-writable staging memory every table is packed into.
    pub upload: GrowableBuffer,
    pub views: GrowableBuffer,
    pub transforms: GrowableBuffer,
    pub materials: GrowableBuffer,
    pub lights: GrowableBuffer,
    pub bones: GrowableBuffer,
}

impl FrameBuffers {
    fn new(slot: usize) -> Self {
        Self {
            upload: GrowableBuffer::new(format!("upload (slot {})", slot), BufferKind::Upload),
            views: GrowableBuffer::new(format!("views (slot {})", slot), BufferKind::Storage),
            transforms: GrowableBuffer::new(format!("transforms (slot {})", slot), BufferKind::Storage),
            materials: GrowableBuffer::new(format!("materials (slot {})", slot), BufferKind::Storage),
            lights: GrowableBuffer::new(format!("lights (slot {})", slot), BufferKind::Storage),
            bones: GrowableBuffer::new(format!("bones (slot {})", slot), BufferKind::Storage),
        }
    }
}

/// Device-local copies of a mesh, uploaded once per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshBuffers {
    pub vertices: BufferId,
    pub indices: BufferId,
    /// Present for skinned meshes.
    pub influences: Option<BufferId>,
    pub vertex_count: u32,
    pub index_count: u32,
}

/// One of the [`FRAME_COUNT`] frames in flight.
#[derive(Debug)]
pub struct FrameSlot {
    index: usize,
    state: SlotState,
    gate: Arc<FenceGate>,
    fence_value: u64,
    cycles: u64,
    tickets: Option<CycleTickets>,

    pub(crate) table: FrameResourceTable,
    pub(crate) viewports: Vec<ViewportDraws>,
    pub(crate) shadows: Vec<ShadowDraws>,
    pub(crate) buffers: FrameBuffers,
    pub(crate) targets: SlotTargets,
    meshes: HashMap<MeshHandle, MeshBuffers>,
    /// Copies of staged meshes not yet handed to a copy task. Survive failed builds.
    pub(crate) pending_mesh_copies: Vec<CopyRegion>,
    skinned_outputs: HashMap<ResourceTag, GrowableBuffer>,

    pub(crate) copy_task: TaskHandle<CopyTask>,
    pub(crate) compute_task: TaskHandle<ComputeTask>,
    pub(crate) shadow_tasks: Vec<TaskHandle<RenderPassTask>>,
    pub(crate) forward_tasks: Vec<TaskHandle<RenderPassTask>>,
}

impl FrameSlot {
    /// Creates a drained slot. GPU buffers are allocated lazily by the first frame.
    pub fn new(index: usize, device: Arc<dyn GpuDevice>, limits: TableLimits) -> Self {
        Self {
            index,
            state: SlotState::Drained,
            gate: Arc::new(FenceGate::new(device, format!("frame slot {}", index))),
            fence_value: 0,
            cycles: 0,
            tickets: None,
            table: FrameResourceTable::new(limits),
            viewports: Vec::new(),
            shadows: Vec::new(),
            buffers: FrameBuffers::new(index),
            targets: SlotTargets::default(),
            meshes: HashMap::new(),
            pending_mesh_copies: Vec::new(),
            skinned_outputs: HashMap::new(),
            copy_task: TaskHandle::new(CopyTask::new(index)),
            compute_task: TaskHandle::new(ComputeTask::new(index)),
            shadow_tasks: Vec::new(),
            forward_tasks: Vec::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    /// The slot's fence gate.
    pub fn gate(&self) -> &Arc<FenceGate> {
        &self.gate
    }

    /// Fence value the slot's last submission signals when it retires.
    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    /// Number of times the slot has entered `Building`.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Tickets reserved for the current cycle.
    pub fn tickets(&self) -> Option<&CycleTickets> {
        self.tickets.as_ref()
    }

    /// `true` when the GPU retired everything the slot submitted.
    pub fn is_drained(&self) -> bool {
        self.state != SlotState::Building && self.gate.fence().is_complete(self.fence_value)
    }

    /// Waits for the slot's previous cycle to retire on the GPU, then starts a new
    /// cycle with empty tables and draw lists.
    pub fn begin_render(&mut self) {
        self.gate.fence().wait(self.fence_value);
        self.enter_building();
    }

    /// [`begin_render`](Self::begin_render) that gives up after `timeout`. Returns
    /// `false`, leaving the slot untouched, if the previous cycle has not retired.
    pub fn begin_render_timeout(&mut self, timeout: Duration) -> bool {
        if !self.gate.fence().wait_timeout(self.fence_value, timeout) {
            return false;
        }
        self.enter_building();
        true
    }

    fn enter_building(&mut self) {
        if self.state == SlotState::Building {
            debug!("Slot {}: previous build was abandoned", self.index);
        }
        self.state = SlotState::Building;
        self.cycles += 1;
        self.tickets = None;
        self.table.clear();
        self.viewports.clear();
        self.shadows.clear();
    }

    /// Reserves the cycle's copy, compute and frame fence values, in that order.
    ///
    /// Called once everything fallible about the frame has succeeded: from here on the
    /// frame value must be signalled or the slot can never be reused.
    pub fn reserve_cycle(&mut self) -> CycleTickets {
        let tickets = CycleTickets {
            copy: self.gate.reserve(),
            compute: self.gate.reserve(),
            frame: self.gate.reserve(),
        };
        self.fence_value = tickets.frame.value();
        self.tickets = Some(tickets.clone());
        tickets
    }

    /// Hands the slot to the GPU.
    pub fn mark_submitted(&mut self) {
        self.state = SlotState::Submitted;
    }

    /// The mesh's device buffers, creating and staging them on first use.
    ///
    /// New meshes queue their staging copies in `pending_mesh_copies` until a build
    /// succeeds and hands them to the copy task, so a build that fails after staging
    /// still uploads them next cycle.
    pub(crate) fn mesh_buffers(
        &mut self,
        device: &dyn GpuDevice,
        handle: MeshHandle,
        mesh: &MeshData,
    ) -> Result<MeshBuffers, GpuError> {
        if let Some(buffers) = self.meshes.get(&handle) {
            return Ok(*buffers);
        }

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&mesh.vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(&mesh.indices);
        let influence_bytes: &[u8] = bytemuck::cast_slice(&mesh.influences);

        let mut staged = Vec::with_capacity(vertex_bytes.len() + index_bytes.len() + influence_bytes.len());
        staged.extend_from_slice(vertex_bytes);
        staged.extend_from_slice(index_bytes);
        staged.extend_from_slice(influence_bytes);

        let label = format!("mesh '{}' (slot {})", mesh.name, self.index);
        let staging = device.create_buffer(&BufferDesc::new(
            format!("{} staging", label),
            grown_size(staged.len() as u64),
            BufferKind::Upload,
        ))?;
        device.write_buffer(staging, 0, &staged)?;

        let vertices = device.create_buffer(&BufferDesc::new(
            format!("{} vertices", label),
            grown_size(byte_size::<GpuVertex>(mesh.vertices.len())),
            BufferKind::Vertex,
        ))?;
        let indices = device.create_buffer(&BufferDesc::new(
            format!("{} indices", label),
            grown_size(byte_size::<u32>(mesh.indices.len())),
            BufferKind::Index,
        ))?;
        let influences = if mesh.is_skinned() {
            Some(device.create_buffer(&BufferDesc::new(
                format!("{} influences", label),
                grown_size(byte_size::<GpuSkinInfluence>(mesh.influences.len())),
                BufferKind::Storage,
            ))?)
        } else {
            None
        };

        let vertex_size = vertex_bytes.len() as u64;
        let index_size = index_bytes.len() as u64;
        let copies = &mut self.pending_mesh_copies;
        copies.push(CopyRegion {
            src: staging,
            src_offset: 0,
            dst: vertices,
            dst_offset: 0,
            size: vertex_size,
        });
        copies.push(CopyRegion {
            src: staging,
            src_offset: vertex_size,
            dst: indices,
            dst_offset: 0,
            size: index_size,
        });
        if let Some(influences) = influences {
            copies.push(CopyRegion {
                src: staging,
                src_offset: vertex_size + index_size,
                dst: influences,
                dst_offset: 0,
                size: influence_bytes.len() as u64,
            });
        }

        let buffers = MeshBuffers {
            vertices,
            indices,
            influences,
            vertex_count: mesh.vertices.len() as u32,
            index_count: mesh.indices.len() as u32,
        };
        debug!("Slot {}: staged mesh '{}' ({} bytes)", self.index, mesh.name, staged.len());
        self.meshes.insert(handle, buffers);
        Ok(buffers)
    }

    /// Copies of staged meshes still waiting for a copy task.
    pub fn pending_mesh_copy_count(&self) -> usize {
        self.pending_mesh_copies.len()
    }

    /// A mesh already staged this cycle or an earlier one.
    pub(crate) fn cached_mesh(&self, handle: MeshHandle) -> Option<MeshBuffers> {
        self.meshes.get(&handle).copied()
    }

    /// The skinning output buffer of a skinned instance, grown to `vertex_count`.
    pub(crate) fn skinned_output(
        &mut self,
        device: &dyn GpuDevice,
        tag: ResourceTag,
        vertex_count: u32,
    ) -> Result<BufferId, GpuError> {
        let index = self.index;
        self.skinned_outputs
            .entry(tag)
            .or_insert_with(|| {
                GrowableBuffer::new(
                    format!("skinned {:#x} (slot {})", tag.0, index),
                    BufferKind::ComputeVertexOutput,
                )
            })
            .ensure(device, byte_size::<GpuVertex>(vertex_count as usize))
    }

    /// The skinning output buffer of an instance, if one was created.
    pub(crate) fn cached_skinned_output(&self, tag: ResourceTag) -> Option<BufferId> {
        self.skinned_outputs.get(&tag).and_then(GrowableBuffer::buffer)
    }

    /// Makes at least `count` render-pass tasks of `kind` available.
    pub(crate) fn ensure_pass_tasks(&mut self, kind: PassKind, count: usize) {
        let index = self.index;
        let tasks = match kind {
            PassKind::Shadow => &mut self.shadow_tasks,
            PassKind::Forward => &mut self.forward_tasks,
        };
        while tasks.len() < count {
            let task = RenderPassTask::new(kind, index, tasks.len());
            tasks.push(TaskHandle::new(task));
        }
    }

    /// Number of meshes staged in this slot.
    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }
}

/// The ring of frame slots.
#[derive(Debug)]
pub struct FrameSlotRing {
    slots: Vec<Arc<Mutex<FrameSlot>>>,
}

impl FrameSlotRing {
    /// Creates [`FRAME_COUNT`] drained slots.
    pub fn new(device: Arc<dyn GpuDevice>, limits: TableLimits) -> Self {
        Self {
            slots: (0..FRAME_COUNT)
                .map(|index| Arc::new(Mutex::new(FrameSlot::new(index, device.clone(), limits))))
                .collect(),
        }
    }

    /// Slot index a frame counter maps to.
    pub fn index_for(frame_counter: u64) -> usize {
        (frame_counter % FRAME_COUNT as u64) as usize
    }

    /// Slot by index.
    pub fn slot(&self, index: usize) -> &Arc<Mutex<FrameSlot>> {
        &self.slots[index % FRAME_COUNT]
    }

    /// Slot a frame counter maps to.
    pub fn for_frame(&self, frame_counter: u64) -> &Arc<Mutex<FrameSlot>> {
        self.slot(Self::index_for(frame_counter))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Blocks until every slot's last submission retired.
    pub fn drain(&self) {
        for slot in &self.slots {
            let slot = slot.lock();
            slot.gate.fence().wait(slot.fence_value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::software::SoftwareGpu;

    #[test]
    fn growable_buffers_grow_by_powers_of_two_only() {
        let device = SoftwareGpu::new();
        let mut buffer = GrowableBuffer::new("test", BufferKind::Storage);

        let id = buffer.ensure(&device, 10).unwrap();
        assert_eq!(buffer.size(), MIN_BUFFER_SIZE);

        assert_eq!(buffer.ensure(&device, 300).unwrap(), id);
        assert_eq!(buffer.size(), 512);
        assert_eq!(device.buffer_size(id).unwrap(), 512);

        buffer.ensure(&device, 20).unwrap();
        assert_eq!(buffer.size(), 512);
    }

    #[test]
    fn cycle_reserves_three_increasing_values() {
        let slot_device: Arc<dyn GpuDevice> = Arc::new(SoftwareGpu::new());
        let mut slot = FrameSlot::new(0, slot_device, TableLimits::default());

        slot.begin_render();
        assert_eq!(slot.state(), SlotState::Building);
        let first = slot.reserve_cycle();
        assert_eq!(
            (first.copy.value(), first.compute.value(), first.frame.value()),
            (1, 2, 3)
        );
        assert_eq!(slot.fence_value(), 3);
        slot.mark_submitted();
        assert!(!slot.is_drained());

        slot.gate().fence().signal(3);
        assert!(slot.is_drained());
        assert!(slot.begin_render_timeout(Duration::from_millis(10)));
        assert_eq!(slot.reserve_cycle().frame.value(), 6);
        assert_eq!(slot.cycles(), 2);
    }

    #[test]
    fn meshes_are_staged_once_per_slot() {
        let device = SoftwareGpu::new();
        let mut slot = FrameSlot::new(1, Arc::new(SoftwareGpu::new()), TableLimits::default());
        let mesh = MeshData::new(
            "triangle",
            vec![
                GpuVertex::new([0.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
                GpuVertex::new([1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
                GpuVertex::new([0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
            ],
            vec![0, 1, 2],
        );

        let first = slot.mesh_buffers(&device, MeshHandle(0), &mesh).unwrap();
        assert_eq!(slot.pending_mesh_copy_count(), 2);
        assert!(first.influences.is_none());

        let again = slot.mesh_buffers(&device, MeshHandle(0), &mesh).unwrap();
        assert_eq!(first, again);
        let copies = std::mem::take(&mut slot.pending_mesh_copies);
        assert_eq!(copies.len(), 2);
        assert_eq!(copies[1].src_offset, 72);
        assert_eq!(slot.mesh_count(), 1);
        assert_eq!(slot.pending_mesh_copy_count(), 0);
    }

    #[test]
    fn ring_maps_counters_to_slots() {
        assert_eq!(FrameSlotRing::index_for(0), 0);
        assert_eq!(FrameSlotRing::index_for(4), 1);
        assert_eq!(FrameSlotRing::index_for(5), 2);
    }
}
