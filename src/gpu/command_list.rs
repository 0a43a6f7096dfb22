//! Recorded GPU work.
//!
//! A [`CommandList`] is built on a CPU thread (usually a pool worker running a copy,
//! compute or render-pass task) and handed to a queue with `GpuDevice::execute`. The
//! commands reference resources by id only, so a list is plain data and can be moved
//! between threads freely.

use super::{BufferId, PassKind, PipelineId, TextureId};

/// One skinning dispatch: transforms `vertex_count` source vertices by their weighted
/// bone matrices into `output`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkinningDispatch {
    /// Bind-pose vertices (`GpuVertex`).
    pub source_vertices: BufferId,
    /// Per-vertex joint indices and weights (`GpuSkinInfluence`).
    pub influences: BufferId,
    /// Skinning matrices of every skinned mesh this frame (`[[f32; 4]; 4]`).
    pub bone_matrices: BufferId,
    /// Index of this mesh's first matrix in `bone_matrices`.
    pub bone_offset: u32,
    /// Number of matrices that belong to this mesh.
    pub bone_count: u32,
    /// Destination for the skinned vertices (`GpuVertex`).
    pub output: BufferId,
    /// Number of vertices to transform.
    pub vertex_count: u32,
}

/// Render pass parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PassDesc {
    /// Debug label.
    pub label: String,
    /// Shadow (depth only) or forward (lit color).
    pub kind: PassKind,
    /// Color target; `None` for shadow passes.
    pub color: Option<TextureId>,
    /// Depth target.
    pub depth: TextureId,
    /// Clear color of the color target.
    pub clear_color: [f32; 4],
    /// View table of this frame.
    pub views: BufferId,
    /// Index of the pass's view in `views`.
    pub view_index: u32,
    /// Transform table of this frame.
    pub transforms: BufferId,
    /// Material table of this frame.
    pub materials: BufferId,
    /// Light table of this frame.
    pub lights: BufferId,
    /// Index of the first light of the pass's world in `lights`.
    pub first_light: u32,
    /// Number of lights of the pass's world.
    pub light_count: u32,
    /// Shadow maps sampled by a forward pass.
    pub shadow_maps: Vec<TextureId>,
}

/// One indexed draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawIndexed {
    /// Vertex buffer (`GpuVertex`).
    pub vertex_buffer: BufferId,
    /// Index buffer (`u32`).
    pub index_buffer: BufferId,
    /// Number of indices.
    pub index_count: u32,
    /// Transform table index.
    pub transform_index: u32,
    /// Material table index.
    pub material_index: u32,
}

/// A single recorded command.
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCommand {
    /// Copies `size` bytes between buffers.
    CopyBuffer {
        /// Source buffer.
        src: BufferId,
        /// Source offset.
        src_offset: u64,
        /// Destination buffer.
        dst: BufferId,
        /// Destination offset.
        dst_offset: u64,
        /// Number of bytes.
        size: u64,
    },
    /// Runs the skinning compute shader.
    Dispatch(SkinningDispatch),
    /// Begins a render pass, clearing its targets.
    BeginPass(PassDesc),
    /// Binds a pipeline state.
    SetPipeline(PipelineId),
    /// Issues an indexed draw.
    DrawIndexed(DrawIndexed),
    /// Ends the current render pass.
    EndPass,
    /// Copies one texture into another of the same size.
    Blit {
        /// Source texture.
        src: TextureId,
        /// Destination texture.
        dst: TextureId,
    },
}

/// A labelled sequence of [`GpuCommand`]s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandList {
    label: String,
    commands: Vec<GpuCommand>,
}

impl CommandList {
    /// Creates an empty list.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            commands: Vec::new(),
        }
    }

    /// Debug label; also used as the timeline label when the list executes.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The recorded commands.
    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    /// Number of recorded commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Records a buffer-to-buffer copy. Zero-sized copies are dropped.
    pub fn copy_buffer(&mut self, src: BufferId, src_offset: u64, dst: BufferId, dst_offset: u64, size: u64) {
        if size == 0 {
            return;
        }
        self.commands.push(GpuCommand::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
    }

    /// Records a skinning dispatch.
    pub fn dispatch_skinning(&mut self, dispatch: SkinningDispatch) {
        self.commands.push(GpuCommand::Dispatch(dispatch));
    }

    /// Begins a render pass.
    pub fn begin_pass(&mut self, pass: PassDesc) {
        self.commands.push(GpuCommand::BeginPass(pass));
    }

    /// Binds a pipeline.
    pub fn set_pipeline(&mut self, pipeline: PipelineId) {
        self.commands.push(GpuCommand::SetPipeline(pipeline));
    }

    /// Records an indexed draw.
    pub fn draw_indexed(&mut self, draw: DrawIndexed) {
        self.commands.push(GpuCommand::DrawIndexed(draw));
    }

    /// Ends the current render pass.
    pub fn end_pass(&mut self) {
        self.commands.push(GpuCommand::EndPass);
    }

    /// Records a texture copy.
    pub fn blit(&mut self, src: TextureId, dst: TextureId) {
        self.commands.push(GpuCommand::Blit { src, dst });
    }

    /// Number of `DrawIndexed` commands.
    pub fn draw_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|command| matches!(command, GpuCommand::DrawIndexed(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_copies_are_not_recorded() {
        let mut list = CommandList::new("copy");
        list.copy_buffer(BufferId(1), 0, BufferId(2), 0, 0);
        assert!(list.is_empty());
        list.copy_buffer(BufferId(1), 0, BufferId(2), 16, 64);
        assert_eq!(list.len(), 1);
        assert_eq!(list.label(), "copy");
    }
}
