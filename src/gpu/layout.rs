//! GPU-visible data layouts.
//!
//! These structs are written verbatim into upload buffers and read by shaders, so they
//! are `#[repr(C)]`, `Pod`, and padded to 16-byte boundaries where WGSL storage layout
//! requires it.

use std::mem::size_of;

/// A mesh vertex.
///
/// # Memory Layout
/// - Position: [f32; 3] (12 bytes)
/// - Normal: [f32; 3] (12 bytes)
///
/// Total size: 24 bytes
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuVertex {
    /// Object-space position.
    pub position: [f32; 3],
    /// Object-space normal.
    pub normal: [f32; 3],
}

impl GpuVertex {
    /// Creates a vertex.
    pub fn new(position: [f32; 3], normal: [f32; 3]) -> Self {
        Self { position, normal }
    }

    /// Returns the vertex buffer layout description for the render pipelines.
    ///
    /// # Shader Attributes
    /// - `location = 0`: position (vec3<f32>)
    /// - `location = 1`: normal (vec3<f32>)
    pub fn desc<'a>() -> wgpu::VertexBufferLayout<'a> {
        wgpu::VertexBufferLayout {
            array_stride: size_of::<GpuVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x3,
                },
                wgpu::VertexAttribute {
                    offset: size_of::<[f32; 3]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x3,
                },
            ],
        }
    }
}

/// Up to four joint influences of one vertex. Weights should sum to one; a vertex
/// whose weights sum to zero keeps its bind pose.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuSkinInfluence {
    /// Joint indices relative to the mesh's first bone matrix.
    pub joints: [u32; 4],
    /// Blend weights.
    pub weights: [f32; 4],
}

/// A 4x4 column-major matrix as stored in transform and bone tables.
pub type GpuMatrix = [[f32; 4]; 4];

/// Material parameters as seen by the forward shader.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuMaterial {
    /// Linear RGBA base color.
    pub base_color: [f32; 4],
    /// `x` roughness, `y` metallic, `z` emissive strength, `w` unused.
    pub params: [f32; 4],
}

/// A camera or light view.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuView {
    /// Combined projection * view matrix.
    pub view_projection: GpuMatrix,
    /// World-space eye position, `w = 1`.
    pub position: [f32; 4],
}

/// A light as seen by the forward shader.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuLight {
    /// World-space position in `xyz`, range in `w`.
    pub position_range: [f32; 4],
    /// World-space direction in `xyz`, cosine of the spot cone in `w`.
    pub direction_cone: [f32; 4],
    /// Linear RGB color in `xyz`, intensity in `w`.
    pub color_intensity: [f32; 4],
    /// `0` directional, `1` point, `2` spot.
    pub kind: u32,
    /// Index of the first shadow view in the view table, or `u32::MAX`.
    pub first_shadow_view: u32,
    /// Number of shadow views (0, 1 or 6).
    pub shadow_view_count: u32,
    /// Padding to 16 bytes.
    pub _padding: u32,
}

/// Byte size of `count` elements of `T`.
pub fn byte_size<T>(count: usize) -> u64 {
    (count * size_of::<T>()) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_match_shader_expectations() {
        assert_eq!(size_of::<GpuVertex>(), 24);
        assert_eq!(size_of::<GpuSkinInfluence>(), 32);
        assert_eq!(size_of::<GpuMaterial>(), 32);
        assert_eq!(size_of::<GpuView>(), 80);
        assert_eq!(size_of::<GpuLight>(), 64);
        assert_eq!(byte_size::<GpuMatrix>(3), 192);
    }
}
