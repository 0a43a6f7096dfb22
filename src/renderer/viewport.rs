//! # Views and Render Targets
//!
//! Camera and light view construction, frustum culling, and the render targets each
//! frame slot owns: a color and depth target per viewport and a pool of shadow maps.
//! Targets belong to a slot, so a slot's passes never write a texture the GPU may
//! still be reading for another slot.

use std::collections::HashMap;

use cgmath::{
    perspective, Deg, InnerSpace, Matrix, Matrix4, Point3, Quaternion, Rotation, SquareMatrix, Vector3, Vector4,
};

use crate::{
    gpu::{layout::GpuView, GpuDevice, GpuError, TextureDesc, TextureId, TextureKind},
    scene::{
        transform::BoundingSphere,
        world::{CameraComponent, LightKind, ViewportDesc, ViewportId},
    },
};

/// Edge length of every shadow map in pixels.
pub const SHADOW_MAP_SIZE: u32 = 1024;

/// Transformation matrix to convert from OpenGL's clip space to wgpu's.
///
/// cgmath builds projections for a `[-1, 1]` depth range; wgpu expects `[0, 1]`.
#[rustfmt::skip]
pub const OPENGL_TO_WGPU_MATRIX: Matrix4<f32> = Matrix4::new(
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 0.5, 0.0,
    0.0, 0.0, 0.5, 1.0,
);

/// Cube face directions of a point light shadow, in face order.
const CUBE_FACES: [[f32; 3]; 6] = [
    [1.0, 0.0, 0.0],
    [-1.0, 0.0, 0.0],
    [0.0, 1.0, 0.0],
    [0.0, -1.0, 0.0],
    [0.0, 0.0, 1.0],
    [0.0, 0.0, -1.0],
];

/// A view ready for the view table, plus its frustum for culling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewData {
    pub view_projection: Matrix4<f32>,
    pub position: Point3<f32>,
}

impl ViewData {
    /// Shader layout of the view.
    pub fn to_gpu(&self) -> GpuView {
        GpuView {
            view_projection: self.view_projection.into(),
            position: [self.position.x, self.position.y, self.position.z, 1.0],
        }
    }

    /// The view's frustum.
    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(&self.view_projection)
    }
}

/// View matrix looking from `eye` along `direction`.
fn look_to(eye: Point3<f32>, direction: Vector3<f32>) -> Matrix4<f32> {
    let up = if direction.y.abs() > 0.99 {
        Vector3::unit_z()
    } else {
        Vector3::unit_y()
    };
    Matrix4::look_to_rh(eye, direction, up)
}

/// Forward (-Z) axis of a rotation.
pub fn forward_axis(rotation: Quaternion<f32>) -> Vector3<f32> {
    rotation.rotate_vector(-Vector3::unit_z()).normalize()
}

/// The view of a camera whose entity has the world matrix `world`.
pub fn camera_view(world: &Matrix4<f32>, camera: &CameraComponent, aspect_ratio: f32) -> ViewData {
    let view = world.invert().unwrap_or_else(Matrix4::identity);
    let projection = OPENGL_TO_WGPU_MATRIX * perspective(camera.fov_y, aspect_ratio, camera.near, camera.far);
    ViewData {
        view_projection: projection * view,
        position: Point3::new(world.w.x, world.w.y, world.w.z),
    }
}

/// The shadow views of a light at `position` pointing along `direction`: six cube
/// faces for point lights, one view otherwise.
pub fn shadow_views(kind: LightKind, position: Point3<f32>, direction: Vector3<f32>, range: f32) -> Vec<ViewData> {
    let range = range.max(0.5);
    match kind {
        LightKind::Directional => {
            let eye = Point3::new(0.0, 0.0, 0.0) - direction * range * 1.5;
            let projection = OPENGL_TO_WGPU_MATRIX * cgmath::ortho(-range, range, -range, range, 0.1, range * 3.0);
            vec![ViewData {
                view_projection: projection * look_to(eye, direction),
                position: eye,
            }]
        }
        LightKind::Spot { cone_degrees } => {
            let projection = OPENGL_TO_WGPU_MATRIX * perspective(Deg(cone_degrees.clamp(1.0, 170.0)), 1.0, 0.1, range);
            vec![ViewData {
                view_projection: projection * look_to(position, direction),
                position,
            }]
        }
        LightKind::Point => {
            let projection = OPENGL_TO_WGPU_MATRIX * perspective(Deg(90.0), 1.0, 0.1, range);
            CUBE_FACES
                .iter()
                .map(|face| ViewData {
                    view_projection: projection * look_to(position, Vector3::from(*face)),
                    position,
                })
                .collect()
        }
    }
}

/// Six clip planes extracted from a view-projection matrix (`[0, 1]` depth).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    planes: [Vector4<f32>; 6],
}

impl Frustum {
    /// Extracts the planes. Each plane is normalized so `dot(plane.xyz, p) + plane.w`
    /// is a signed distance.
    pub fn from_view_projection(matrix: &Matrix4<f32>) -> Self {
        let rows = [matrix.row(0), matrix.row(1), matrix.row(2), matrix.row(3)];
        let planes = [
            rows[3] + rows[0],
            rows[3] - rows[0],
            rows[3] + rows[1],
            rows[3] - rows[1],
            rows[2],
            rows[3] - rows[2],
        ]
        .map(|plane| {
            let length = plane.truncate().magnitude();
            if length > f32::EPSILON {
                plane / length
            } else {
                plane
            }
        });
        Self { planes }
    }

    /// `false` only when the sphere is entirely outside one plane.
    pub fn intersects_sphere(&self, sphere: &BoundingSphere) -> bool {
        let center = Vector3::new(sphere.center.x, sphere.center.y, sphere.center.z);
        self.planes
            .iter()
            .all(|plane| plane.truncate().dot(center) + plane.w >= -sphere.radius)
    }
}

/// Color and depth target of one viewport in one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportTarget {
    pub color: TextureId,
    pub depth: TextureId,
    pub width: u32,
    pub height: u32,
}

/// Render targets owned by one frame slot.
#[derive(Debug, Default)]
pub struct SlotTargets {
    viewports: HashMap<ViewportId, ViewportTarget>,
    shadow_maps: Vec<TextureId>,
}

impl SlotTargets {
    /// The viewport's targets, created on first use and recreated when the viewport
    /// changes size.
    pub fn viewport_target(
        &mut self,
        device: &dyn GpuDevice,
        slot: usize,
        viewport: &ViewportDesc,
    ) -> Result<ViewportTarget, GpuError> {
        if let Some(target) = self.viewports.get(&viewport.id) {
            if target.width == viewport.width && target.height == viewport.height {
                return Ok(*target);
            }
        }

        let (width, height) = (viewport.width.max(1), viewport.height.max(1));
        let target = ViewportTarget {
            color: device.create_texture(&TextureDesc::new(
                format!("viewport {} color (slot {})", viewport.id.0, slot),
                width,
                height,
                TextureKind::RenderTarget,
            ))?,
            depth: device.create_texture(&TextureDesc::new(
                format!("viewport {} depth (slot {})", viewport.id.0, slot),
                width,
                height,
                TextureKind::DepthStencil,
            ))?,
            width: viewport.width,
            height: viewport.height,
        };
        log::debug!("Created {}x{} targets for viewport {:?} in slot {}", width, height, viewport.id, slot);
        self.viewports.insert(viewport.id, target);
        Ok(target)
    }

    /// Shadow map number `index`, allocating the pool up to it.
    pub fn shadow_map(&mut self, device: &dyn GpuDevice, slot: usize, index: usize) -> Result<TextureId, GpuError> {
        while self.shadow_maps.len() <= index {
            let texture = device.create_texture(&TextureDesc::new(
                format!("shadow map {} (slot {})", self.shadow_maps.len(), slot),
                SHADOW_MAP_SIZE,
                SHADOW_MAP_SIZE,
                TextureKind::ShadowMap,
            ))?;
            self.shadow_maps.push(texture);
        }
        Ok(self.shadow_maps[index])
    }

    /// Number of shadow maps allocated so far.
    pub fn shadow_map_count(&self) -> usize {
        self.shadow_maps.len()
    }
}
