//! # GPU Service Boundary
//!
//! The scheduling core never talks to a graphics API directly. It sees the GPU as a
//! service with synchronous-looking calls that internally enqueue work:
//!
//! * an **allocator** for buffers, textures and pipeline states,
//! * three **queues** (`Copy`, `Compute`, `Direct`) that execute recorded
//!   [`CommandList`]s in submission order,
//! * **fences** with a monotonically increasing completion value. Queues `signal` a
//!   fence value when all previously submitted work on that queue has retired, and
//!   `wait` for a value before starting anything submitted after the wait.
//!
//! ## Backends
//!
//! * [`software::SoftwareGpu`] runs each queue on its own thread and executes copies and
//!   skinning dispatches on the CPU. It is bit-exact, supports pausing queues to
//!   simulate a GPU that runs behind, and can record a [`timeline::Timeline`].
//! * [`wgpu_backend::WgpuGpu`] drives a headless wgpu device.
//!
//! ## Queue Semantics
//!
//! A `wait(queue, fence, value)` affects only work submitted to `queue` *after* the
//! wait; the calling CPU thread never blocks. CPU-side blocking goes through
//! [`Fence::wait`].

pub mod command_list;
pub mod fence;
pub mod layout;
pub mod pipeline_cache;
mod queue_thread;
pub mod software;
pub mod timeline;
pub mod wgpu_backend;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use command_list::{CommandList, DrawIndexed, GpuCommand, PassDesc, SkinningDispatch};
pub use fence::{Fence, FenceGate, Ticket};
pub use pipeline_cache::{BlendMode, CullMode, PassKind, PipelineStateCache, RenderStateKey};

/// Number of images in the presentation swap chain.
pub const SWAP_CHAIN_LENGTH: usize = 3;

/// The three hardware queues work is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueKind {
    /// Transfers from upload memory to device-local memory.
    Copy,
    /// Compute dispatches (skinning).
    Compute,
    /// Render passes and presentation.
    Direct,
}

impl QueueKind {
    /// Every queue, in index order.
    pub const ALL: [QueueKind; 3] = [QueueKind::Copy, QueueKind::Compute, QueueKind::Direct];

    /// Stable array index of the queue.
    pub fn index(self) -> usize {
        match self {
            QueueKind::Copy => 0,
            QueueKind::Compute => 1,
            QueueKind::Direct => 2,
        }
    }

    /// Lower-case name used in labels and logs.
    pub fn label(self) -> &'static str {
        match self {
            QueueKind::Copy => "copy",
            QueueKind::Compute => "compute",
            QueueKind::Direct => "direct",
        }
    }
}

/// Handle to a GPU buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

/// Handle to a GPU texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

/// Handle to a compiled pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(pub u32);

/// What a buffer is used for. Determines memory placement and allowed bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferKind {
    /// CPU-writable upload memory; the source of copy commands.
    Upload,
    /// Device-local vertex data, also readable by compute shaders.
    Vertex,
    /// Device-local 32-bit index data.
    Index,
    /// Device-local structured tables read by shaders.
    Storage,
    /// Written by compute dispatches and later bound as vertex input.
    ComputeVertexOutput,
}

/// Buffer creation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    /// Debug label.
    pub label: String,
    /// Size in bytes.
    pub size: u64,
    /// Usage class.
    pub kind: BufferKind,
}

impl BufferDesc {
    /// Convenience constructor.
    pub fn new(label: impl Into<String>, size: u64, kind: BufferKind) -> Self {
        Self {
            label: label.into(),
            size,
            kind,
        }
    }
}

/// What a texture is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureKind {
    /// Color render target (RGBA8).
    RenderTarget,
    /// Depth-stencil attachment of a forward pass.
    DepthStencil,
    /// Depth-only target rendered by a shadow pass and sampled by forward passes.
    ShadowMap,
}

/// Texture creation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    /// Debug label.
    pub label: String,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Usage class.
    pub kind: TextureKind,
}

impl TextureDesc {
    /// Convenience constructor.
    pub fn new(label: impl Into<String>, width: u32, height: u32, kind: TextureKind) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            kind,
        }
    }
}

/// Errors reported by GPU service calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// The buffer handle does not name a live buffer.
    #[error("unknown buffer {0:?}")]
    UnknownBuffer(BufferId),

    /// The texture handle does not name a live texture.
    #[error("unknown texture {0:?}")]
    UnknownTexture(TextureId),

    /// The pipeline handle does not name a live pipeline state.
    #[error("unknown pipeline {0:?}")]
    UnknownPipeline(PipelineId),

    /// A draw was recorded outside a render pass.
    #[error("draw recorded outside a render pass")]
    DrawOutsidePass,

    /// A write or read would cross the end of the buffer.
    #[error("access of {len} bytes at offset {offset} exceeds buffer {buffer:?} of {size} bytes")]
    OutOfBounds {
        /// Target buffer.
        buffer: BufferId,
        /// Byte offset of the access.
        offset: u64,
        /// Length of the access.
        len: u64,
        /// Buffer size.
        size: u64,
    },

    /// No suitable adapter was found.
    #[error("failed to request GPU adapter: {0}")]
    AdapterUnavailable(String),

    /// The device could not be created.
    #[error("failed to create GPU device: {0}")]
    DeviceRequest(String),

    /// Device memory for a buffer could not be allocated.
    #[error("out of device memory allocating '{0}'")]
    OutOfMemory(String),

    /// Upload memory could not be mapped for writing.
    #[error("failed to map buffer {0:?}")]
    MapFailed(BufferId),

    /// The device was removed or reset.
    #[error("GPU device lost")]
    DeviceLost,
}

/// The GPU resource allocator and queue submission service.
///
/// All methods take `&self` and may be called from any thread: copy and compute tasks
/// submit from pool workers while the render graph builder allocates from the main
/// thread.
pub trait GpuDevice: Send + Sync {
    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// Allocates a buffer. Contents start zeroed.
    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId, GpuError>;

    /// Replaces the buffer's storage with one of `size` bytes. Contents are not
    /// preserved; callers re-upload after growing.
    fn resize_buffer(&self, buffer: BufferId, size: u64) -> Result<(), GpuError>;

    /// Current size of the buffer in bytes.
    fn buffer_size(&self, buffer: BufferId) -> Result<u64, GpuError>;

    /// Maps `buffer`, copies `data` at `offset` and unmaps it. Only legal on memory the
    /// GPU is not currently reading, which the frame-slot discipline guarantees.
    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<(), GpuError>;

    /// Reads back buffer contents. Blocks until prior queue work touching the buffer has
    /// retired where the backend requires it.
    fn read_buffer(&self, buffer: BufferId, offset: u64, len: u64) -> Result<Vec<u8>, GpuError>;

    /// Allocates a texture.
    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId, GpuError>;

    /// Compiles (or looks up) the pipeline state for a render state.
    fn create_pipeline(&self, key: &RenderStateKey) -> Result<PipelineId, GpuError>;

    /// Releases a pipeline state evicted from the pipeline cache.
    fn release_pipeline(&self, pipeline: PipelineId);

    /// Queues a command list on `queue`.
    fn execute(&self, queue: QueueKind, list: CommandList);

    /// Queues a signal of `fence` to `value` once all prior work on `queue` retired.
    fn signal(&self, queue: QueueKind, fence: &Fence, value: u64);

    /// Makes work submitted to `queue` after this call wait for `fence >= value`.
    fn wait(&self, queue: QueueKind, fence: &Fence, value: u64);

    /// Presents the current back buffer and returns the new back buffer index.
    fn present(&self, vsync: bool) -> Result<u32, GpuError>;

    /// Index of the swap-chain image that will be presented next.
    fn back_buffer_index(&self) -> u32;

    /// Texture of the swap-chain image that will be presented next.
    fn back_buffer(&self) -> TextureId;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_indices_are_dense() {
        for (expected, queue) in QueueKind::ALL.iter().enumerate() {
            assert_eq!(queue.index(), expected);
        }
        assert_eq!(QueueKind::Direct.label(), "direct");
    }
}
