//! # Asset Store
//!
//! Meshes, skeletons, animation clips and materials, addressed by typed handles.
//!
//! Meshes, skeletons and clips are immutable once added and shared as `Arc`s, so
//! tasks on pool workers can hold them for the duration of a tick without copying.
//! Materials are different: gameplay and import code may change their parameters while
//! the renderer reads them, so each material lives behind an `MtResource` (a
//! reader-writer lock). This is the one place the renderer takes a lock on scene data.

use std::sync::Arc;

use cgmath::{Matrix4, Point3, Quaternion, SquareMatrix, Vector3};
use serde::{Deserialize, Serialize};

use crate::{
    core::MtResource,
    gpu::{
        layout::{GpuMaterial, GpuSkinInfluence, GpuVertex},
        BlendMode, CullMode,
    },
};

use super::transform::{BoundingSphere, Transform};

/// Handle of a mesh in an [`AssetStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshHandle(pub u32);

/// Handle of a skeleton in an [`AssetStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SkeletonHandle(pub u32);

/// Handle of an animation clip in an [`AssetStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClipHandle(pub u32);

/// Handle of a material in an [`AssetStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialHandle(pub u32);

/// Indexed triangle mesh, optionally with skinning influences.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshData {
    /// Debug name.
    pub name: String,
    /// Bind-pose vertices.
    pub vertices: Vec<GpuVertex>,
    /// Triangle list indices.
    pub indices: Vec<u32>,
    /// One entry per vertex for skinned meshes, empty otherwise.
    pub influences: Vec<GpuSkinInfluence>,
    /// Object-space bounds of the bind pose.
    pub bounds: BoundingSphere,
}

impl MeshData {
    /// Creates a static mesh and computes its bounds.
    pub fn new(name: impl Into<String>, vertices: Vec<GpuVertex>, indices: Vec<u32>) -> Self {
        let bounds = BoundingSphere::from_points(
            vertices
                .iter()
                .map(|vertex| Point3::new(vertex.position[0], vertex.position[1], vertex.position[2])),
        );
        Self {
            name: name.into(),
            vertices,
            indices,
            influences: Vec::new(),
            bounds,
        }
    }

    /// Attaches skinning influences, making the mesh skinned.
    pub fn with_influences(mut self, influences: Vec<GpuSkinInfluence>) -> Self {
        self.influences = influences;
        self
    }

    /// `true` when the mesh carries one influence per vertex.
    pub fn is_skinned(&self) -> bool {
        !self.influences.is_empty() && self.influences.len() == self.vertices.len()
    }

    /// Number of triangles.
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// One joint of a skeleton.
#[derive(Debug, Clone, PartialEq)]
pub struct Joint {
    /// Debug name.
    pub name: String,
    /// Parent joint index; parents always precede their children.
    pub parent: Option<usize>,
    /// Local transform in the bind pose.
    pub local_bind: Transform,
    /// Inverse of the joint's global bind-pose matrix.
    pub inverse_bind: Matrix4<f32>,
}

/// A joint hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct Skeleton {
    /// Debug name.
    pub name: String,
    /// Joints, parents first.
    pub joints: Vec<Joint>,
}

impl Skeleton {
    /// Builds a skeleton from `(name, parent, local bind transform)` triples and derives
    /// every inverse bind matrix.
    ///
    /// # Errors
    /// Returns a description of the first joint whose parent does not precede it.
    pub fn from_bind_pose(
        name: impl Into<String>,
        joints: Vec<(String, Option<usize>, Transform)>,
    ) -> Result<Self, String> {
        let mut globals: Vec<Matrix4<f32>> = Vec::with_capacity(joints.len());
        let mut built = Vec::with_capacity(joints.len());

        for (index, (joint_name, parent, local_bind)) in joints.into_iter().enumerate() {
            let global = match parent {
                Some(parent) if parent < index => globals[parent] * local_bind.to_matrix(),
                Some(parent) => {
                    return Err(format!(
                        "joint {} ('{}') has parent {} which does not precede it",
                        index, joint_name, parent
                    ))
                }
                None => local_bind.to_matrix(),
            };
            let inverse_bind = global.invert().unwrap_or_else(Matrix4::identity);
            globals.push(global);
            built.push(Joint {
                name: joint_name,
                parent,
                local_bind,
                inverse_bind,
            });
        }

        Ok(Self {
            name: name.into(),
            joints: built,
        })
    }

    /// Number of joints.
    pub fn joint_count(&self) -> usize {
        self.joints.len()
    }
}

/// Keyframes of one joint. Each channel is sorted by time; an empty channel keeps the
/// bind pose value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JointTrack {
    /// Target joint index.
    pub joint: usize,
    /// `(time, translation)` keys.
    pub translations: Vec<(f32, Vector3<f32>)>,
    /// `(time, rotation)` keys.
    pub rotations: Vec<(f32, Quaternion<f32>)>,
    /// `(time, scale)` keys.
    pub scales: Vec<(f32, Vector3<f32>)>,
}

/// A skeletal animation.
#[derive(Debug, Clone, PartialEq)]
pub struct AnimationClip {
    /// Debug name.
    pub name: String,
    /// Length in seconds.
    pub duration: f32,
    /// Per-joint tracks.
    pub tracks: Vec<JointTrack>,
}

/// Surface description of a draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Material {
    /// Debug name.
    pub name: String,
    /// Linear RGBA base color.
    pub base_color: [f32; 4],
    /// Perceptual roughness.
    pub roughness: f32,
    /// Metalness.
    pub metallic: f32,
    /// Emissive strength.
    pub emissive: f32,
    /// Blending.
    pub blend: BlendMode,
    /// Face culling.
    pub cull: CullMode,
    /// Whether draws with this material are rendered into shadow maps.
    pub casts_shadows: bool,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: String::from("default"),
            base_color: [0.8, 0.8, 0.8, 1.0],
            roughness: 0.5,
            metallic: 0.0,
            emissive: 0.0,
            blend: BlendMode::Opaque,
            cull: CullMode::Back,
            casts_shadows: true,
        }
    }
}

impl Material {
    /// Shader-visible parameters.
    pub fn to_gpu(&self) -> GpuMaterial {
        GpuMaterial {
            base_color: self.base_color,
            params: [self.roughness, self.metallic, self.emissive, 0.0],
        }
    }

    /// `true` when draws go into the transparent list.
    pub fn is_transparent(&self) -> bool {
        self.blend.is_transparent()
    }
}

/// Storage of every loaded asset.
#[derive(Debug, Default)]
pub struct AssetStore {
    meshes: Vec<Arc<MeshData>>,
    skeletons: Vec<Arc<Skeleton>>,
    clips: Vec<Arc<AnimationClip>>,
    materials: Vec<MtResource<Material>>,
}

impl AssetStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mesh.
    pub fn add_mesh(&mut self, mesh: MeshData) -> MeshHandle {
        self.meshes.push(Arc::new(mesh));
        MeshHandle(self.meshes.len() as u32 - 1)
    }

    /// Looks up a mesh.
    pub fn mesh(&self, handle: MeshHandle) -> Option<&Arc<MeshData>> {
        self.meshes.get(handle.0 as usize)
    }

    /// Adds a skeleton.
    pub fn add_skeleton(&mut self, skeleton: Skeleton) -> SkeletonHandle {
        self.skeletons.push(Arc::new(skeleton));
        SkeletonHandle(self.skeletons.len() as u32 - 1)
    }

    /// Looks up a skeleton.
    pub fn skeleton(&self, handle: SkeletonHandle) -> Option<&Arc<Skeleton>> {
        self.skeletons.get(handle.0 as usize)
    }

    /// Adds an animation clip.
    pub fn add_clip(&mut self, clip: AnimationClip) -> ClipHandle {
        self.clips.push(Arc::new(clip));
        ClipHandle(self.clips.len() as u32 - 1)
    }

    /// Looks up an animation clip.
    pub fn clip(&self, handle: ClipHandle) -> Option<&Arc<AnimationClip>> {
        self.clips.get(handle.0 as usize)
    }

    /// Adds a material.
    pub fn add_material(&mut self, material: Material) -> MaterialHandle {
        self.materials.push(MtResource::new(material));
        MaterialHandle(self.materials.len() as u32 - 1)
    }

    /// Looks up a material. The returned resource may be locked for reading or writing.
    pub fn material(&self, handle: MaterialHandle) -> Option<&MtResource<Material>> {
        self.materials.get(handle.0 as usize)
    }

    /// Number of meshes.
    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    /// Number of materials.
    pub fn material_count(&self) -> usize {
        self.materials.len()
    }

    /// Number of skeletons.
    pub fn skeleton_count(&self) -> usize {
        self.skeletons.len()
    }

    /// Number of clips.
    pub fn clip_count(&self) -> usize {
        self.clips.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_bind_undoes_the_bind_pose() {
        let skeleton = Skeleton::from_bind_pose(
            "chain",
            vec![
                (String::from("root"), None, Transform::from_translation(Vector3::new(0.0, 1.0, 0.0))),
                (String::from("tip"), Some(0), Transform::from_translation(Vector3::new(0.0, 2.0, 0.0))),
            ],
        )
        .unwrap();

        let tip = &skeleton.joints[1];
        let global = Matrix4::from_translation(Vector3::new(0.0, 3.0, 0.0));
        assert_eq!(global * tip.inverse_bind, Matrix4::identity());
    }

    #[test]
    fn parent_after_child_is_rejected() {
        let err = Skeleton::from_bind_pose(
            "broken",
            vec![(String::from("a"), Some(1), Transform::identity())],
        )
        .unwrap_err();
        assert!(err.contains("does not precede"));
    }

    #[test]
    fn materials_are_shared_behind_a_lock() {
        let mut store = AssetStore::new();
        let handle = store.add_material(Material::default());
        let shared = store.material(handle).unwrap().clone();

        shared.get_mut().base_color = [1.0, 0.0, 0.0, 1.0];
        assert_eq!(store.material(handle).unwrap().get().base_color[0], 1.0);
        assert!(store.material(MaterialHandle(5)).is_none());
    }
}
