//! # Frame Resource Table
//!
//! The per-slot tables the render graph builder fills during capture and the copy task
//! uploads: views, lights, transforms, materials, meshes, skinned meshes (with their
//! bone matrices) and per-world light ranges.
//!
//! ## Registration
//! Every `add_*` call is idempotent per tag within one frame: registering the same
//! logical resource twice returns the id it got the first time. Views and lights are
//! few, so their tags are found by a linear scan over a small list of `(tag, id)`
//! pairs; the larger tables use hashed lookup with the same contract.
//!
//! ## Limits
//! The tables have fixed capacities from [`TableLimits`]. Running out is a programmer
//! error and goes through the fatal path; there is no degraded mode.
//!
//! `clear()` empties everything and keeps the allocations for the next frame.

use std::collections::HashMap;

use cgmath::Matrix4;
use serde::{Deserialize, Serialize};

use crate::{
    check,
    gpu::{
        layout::{GpuLight, GpuMaterial, GpuMatrix, GpuView},
        BlendMode, CullMode,
    },
    scene::{
        assets::{Material, MaterialHandle, MeshHandle},
        world::{EntityId, ViewportId, WorldId},
    },
};

/// Caller-chosen identity of a registered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceTag(pub u64);

impl ResourceTag {
    const KIND_ENTITY: u64 = 1;
    const KIND_VIEWPORT: u64 = 2;
    const KIND_SHADOW_VIEW: u64 = 3;
    const KIND_WORLD: u64 = 4;

    fn pack(kind: u64, face: u64, world: u32, low: u32) -> Self {
        Self(kind << 60 | (face & 0xF) << 56 | (world as u64 & 0xFF_FFFF) << 32 | low as u64)
    }

    /// Tag of an entity's transform, light or skinned mesh.
    pub fn entity(world: WorldId, entity: EntityId) -> Self {
        Self::pack(Self::KIND_ENTITY, 0, world.0, entity.0)
    }

    /// Tag of a camera viewport's view.
    pub fn viewport(viewport: ViewportId) -> Self {
        Self::pack(Self::KIND_VIEWPORT, 0, 0, viewport.0)
    }

    /// Tag of one shadow view of a light (`face` is the cube face, 0 otherwise).
    pub fn shadow_view(world: WorldId, light: EntityId, face: u8) -> Self {
        Self::pack(Self::KIND_SHADOW_VIEW, face as u64, world.0, light.0)
    }

    /// Tag of a world's light range.
    pub fn world(world: WorldId) -> Self {
        Self::pack(Self::KIND_WORLD, 0, world.0, 0)
    }
}

/// Fixed capacities of a frame's tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableLimits {
    /// Camera and shadow views.
    pub max_views: usize,
    /// Lights across all worlds.
    pub max_lights: usize,
    /// Entity transforms.
    pub max_transforms: usize,
    /// Distinct materials.
    pub max_materials: usize,
    /// Shadow passes per frame; further shadow views are not rendered.
    pub max_shadow_passes: usize,
}

impl Default for TableLimits {
    fn default() -> Self {
        Self {
            max_views: 64,
            max_lights: 32,
            max_transforms: 16_384,
            max_materials: 1_024,
            max_shadow_passes: 32,
        }
    }
}

macro_rules! table_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            /// Position in the table.
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

table_id!(
    /// Index into the view table.
    ViewId
);
table_id!(
    /// Index into the light table.
    LightId
);
table_id!(
    /// Index into the transform table.
    TransformId
);
table_id!(
    /// Index into the material table.
    MaterialId
);
table_id!(
    /// Index into the mesh table.
    MeshId
);
table_id!(
    /// Index into the skinned mesh table.
    SkinnedId
);
table_id!(
    /// Index into the world table.
    WorldSlot
);

/// Render state of a registered material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialState {
    pub blend: BlendMode,
    pub cull: CullMode,
    pub casts_shadows: bool,
}

/// A skinned mesh instance and its slice of the bone matrix table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkinnedEntry {
    /// Owning entity.
    pub tag: ResourceTag,
    /// Bind-pose mesh.
    pub mesh: MeshHandle,
    /// First matrix in the bone table.
    pub bone_offset: u32,
    /// Number of matrices.
    pub bone_count: u32,
}

/// The range of lights that belongs to one world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldData {
    pub world: WorldId,
    pub first_light: u32,
    pub light_count: u32,
}

/// Per-frame resource tables of one frame slot.
#[derive(Debug, Default)]
pub struct FrameResourceTable {
    limits: TableLimits,

    views: Vec<GpuView>,
    view_tags: Vec<(ResourceTag, ViewId)>,

    lights: Vec<GpuLight>,
    light_tags: Vec<(ResourceTag, LightId)>,

    transforms: Vec<GpuMatrix>,
    transform_lookup: HashMap<ResourceTag, TransformId>,

    materials: Vec<GpuMaterial>,
    material_states: Vec<MaterialState>,
    material_lookup: HashMap<MaterialHandle, MaterialId>,

    meshes: Vec<MeshHandle>,
    mesh_lookup: HashMap<MeshHandle, MeshId>,

    skinned: Vec<SkinnedEntry>,
    skinned_lookup: HashMap<ResourceTag, SkinnedId>,
    bone_matrices: Vec<GpuMatrix>,

    worlds: Vec<WorldData>,
    world_tags: Vec<(ResourceTag, WorldSlot)>,
}

impl FrameResourceTable {
    /// Creates empty tables with the given capacities.
    pub fn new(limits: TableLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn limits(&self) -> &TableLimits {
        &self.limits
    }

    /// Registers a view. Fatal when the view table is full.
    pub fn add_view(&mut self, tag: ResourceTag, view: GpuView) -> ViewId {
        if let Some((_, id)) = self.view_tags.iter().find(|(existing, _)| *existing == tag) {
            return *id;
        }
        check!(
            self.views.len() < self.limits.max_views,
            "view table overflow: more than {} views in one frame",
            self.limits.max_views
        );

        let id = ViewId(self.views.len() as u32);
        self.views.push(view);
        self.view_tags.push((tag, id));
        id
    }

    /// Registers a light. Fatal when the light table is full.
    pub fn add_light(&mut self, tag: ResourceTag, light: GpuLight) -> LightId {
        if let Some((_, id)) = self.light_tags.iter().find(|(existing, _)| *existing == tag) {
            return *id;
        }
        check!(
            self.lights.len() < self.limits.max_lights,
            "light table overflow: more than {} lights in one frame",
            self.limits.max_lights
        );

        let id = LightId(self.lights.len() as u32);
        self.lights.push(light);
        self.light_tags.push((tag, id));
        id
    }

    /// Mutable access to a registered light, used to attach its shadow views.
    pub fn light_mut(&mut self, id: LightId) -> Option<&mut GpuLight> {
        self.lights.get_mut(id.index())
    }

    /// Registers a world transform. Fatal when the transform table is full.
    pub fn add_transform(&mut self, tag: ResourceTag, transform: Matrix4<f32>) -> TransformId {
        if let Some(id) = self.transform_lookup.get(&tag) {
            return *id;
        }
        check!(
            self.transforms.len() < self.limits.max_transforms,
            "transform table overflow: more than {} transforms in one frame",
            self.limits.max_transforms
        );

        let id = TransformId(self.transforms.len() as u32);
        self.transforms.push(transform.into());
        self.transform_lookup.insert(tag, id);
        id
    }

    /// Registers a material, snapshotting its parameters. Fatal when the material
    /// table is full.
    pub fn add_material(&mut self, handle: MaterialHandle, material: &Material) -> MaterialId {
        if let Some(id) = self.material_lookup.get(&handle) {
            return *id;
        }
        check!(
            self.materials.len() < self.limits.max_materials,
            "material table overflow: more than {} materials in one frame",
            self.limits.max_materials
        );

        let id = MaterialId(self.materials.len() as u32);
        self.materials.push(material.to_gpu());
        self.material_states.push(MaterialState {
            blend: material.blend,
            cull: material.cull,
            casts_shadows: material.casts_shadows,
        });
        self.material_lookup.insert(handle, id);
        id
    }

    /// Registers a static mesh.
    pub fn add_mesh(&mut self, handle: MeshHandle) -> MeshId {
        if let Some(id) = self.mesh_lookup.get(&handle) {
            return *id;
        }
        let id = MeshId(self.meshes.len() as u32);
        self.meshes.push(handle);
        self.mesh_lookup.insert(handle, id);
        id
    }

    /// Registers a skinned mesh instance and appends its bone matrices.
    pub fn add_skinned_mesh(&mut self, tag: ResourceTag, mesh: MeshHandle, bones: &[Matrix4<f32>]) -> SkinnedId {
        if let Some(id) = self.skinned_lookup.get(&tag) {
            return *id;
        }

        let id = SkinnedId(self.skinned.len() as u32);
        self.skinned.push(SkinnedEntry {
            tag,
            mesh,
            bone_offset: self.bone_matrices.len() as u32,
            bone_count: bones.len() as u32,
        });
        self.bone_matrices
            .extend(bones.iter().map(|bone| -> GpuMatrix { (*bone).into() }));
        self.skinned_lookup.insert(tag, id);
        id
    }

    /// Registers a world's light range.
    pub fn add_world(&mut self, tag: ResourceTag, data: WorldData) -> WorldSlot {
        if let Some((_, id)) = self.world_tags.iter().find(|(existing, _)| *existing == tag) {
            return *id;
        }
        let id = WorldSlot(self.worlds.len() as u32);
        self.worlds.push(data);
        self.world_tags.push((tag, id));
        id
    }

    pub fn views(&self) -> &[GpuView] {
        &self.views
    }

    pub fn lights(&self) -> &[GpuLight] {
        &self.lights
    }

    pub fn transforms(&self) -> &[GpuMatrix] {
        &self.transforms
    }

    pub fn materials(&self) -> &[GpuMaterial] {
        &self.materials
    }

    /// Render state of a registered material.
    pub fn material_state(&self, id: MaterialId) -> Option<MaterialState> {
        self.material_states.get(id.index()).copied()
    }

    pub fn meshes(&self) -> &[MeshHandle] {
        &self.meshes
    }

    pub fn skinned(&self) -> &[SkinnedEntry] {
        &self.skinned
    }

    pub fn bone_matrices(&self) -> &[GpuMatrix] {
        &self.bone_matrices
    }

    pub fn worlds(&self) -> &[WorldData] {
        &self.worlds
    }

    /// Number of distinct views.
    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    pub fn light_count(&self) -> usize {
        self.lights.len()
    }

    /// Empties every table, keeping allocations.
    pub fn clear(&mut self) {
        self.views.clear();
        self.view_tags.clear();
        self.lights.clear();
        self.light_tags.clear();
        self.transforms.clear();
        self.transform_lookup.clear();
        self.materials.clear();
        self.material_states.clear();
        self.material_lookup.clear();
        self.meshes.clear();
        self.mesh_lookup.clear();
        self.skinned.clear();
        self.skinned_lookup.clear();
        self.bone_matrices.clear();
        self.worlds.clear();
        self.world_tags.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{SquareMatrix, Vector3};

    fn tag(entity: u32) -> ResourceTag {
        ResourceTag::entity(WorldId(1), EntityId(entity))
    }

    #[test]
    fn registration_is_idempotent_per_tag() {
        let mut table = FrameResourceTable::new(TableLimits::default());

        let a = table.add_transform(tag(1), Matrix4::identity());
        let b = table.add_transform(tag(2), Matrix4::from_translation(Vector3::new(1.0, 0.0, 0.0)));
        assert_eq!(table.add_transform(tag(1), Matrix4::identity()), a);
        assert_ne!(a, b);
        assert_eq!(table.transforms().len(), 2);

        let view = table.add_view(ResourceTag::viewport(ViewportId(3)), GpuView::default());
        assert_eq!(table.add_view(ResourceTag::viewport(ViewportId(3)), GpuView::default()), view);
        assert_ne!(table.add_view(ResourceTag::viewport(ViewportId(4)), GpuView::default()), view);

        let light = table.add_light(tag(7), GpuLight::default());
        assert_eq!(table.add_light(tag(7), GpuLight::default()), light);
        assert_eq!(table.light_count(), 1);
    }

    #[test]
    fn tags_do_not_collide_across_kinds() {
        let world = WorldId(2);
        let entity = EntityId(5);
        let tags = [
            ResourceTag::entity(world, entity),
            ResourceTag::shadow_view(world, entity, 0),
            ResourceTag::shadow_view(world, entity, 1),
            ResourceTag::viewport(ViewportId(5)),
            ResourceTag::world(world),
        ];
        for (index, tag) in tags.iter().enumerate() {
            assert!(tags[index + 1..].iter().all(|other| other != tag));
        }
    }

    #[test]
    fn skinned_meshes_get_disjoint_bone_ranges() {
        let mut table = FrameResourceTable::new(TableLimits::default());
        let bones = [Matrix4::identity(); 3];
        let first = table.add_skinned_mesh(tag(1), MeshHandle(0), &bones);
        let second = table.add_skinned_mesh(tag(2), MeshHandle(0), &bones[..2]);

        assert_eq!(table.skinned()[first.index()].bone_offset, 0);
        assert_eq!(table.skinned()[second.index()].bone_offset, 3);
        assert_eq!(table.bone_matrices().len(), 5);
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut table = FrameResourceTable::new(TableLimits::default());
        for entity in 0..100 {
            table.add_transform(tag(entity), Matrix4::identity());
        }
        let capacity = table.transforms.capacity();

        table.clear();
        assert!(table.transforms().is_empty());
        assert_eq!(table.transforms.capacity(), capacity);
        assert_eq!(table.add_transform(tag(50), Matrix4::identity()), TransformId(0));
    }

    #[test]
    #[should_panic(expected = "light table overflow")]
    fn exceeding_a_limit_is_fatal() {
        let mut table = FrameResourceTable::new(TableLimits {
            max_lights: 2,
            ..TableLimits::default()
        });
        for entity in 0..3 {
            table.add_light(tag(entity), GpuLight::default());
        }
    }
}
