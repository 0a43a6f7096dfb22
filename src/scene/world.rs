//! # World
//!
//! The scene data source the render graph builder walks every frame: entities with
//! optional mesh, light, camera and animation components, plus the viewports that
//! render them.
//!
//! A world is mutated by the main thread only. The renderer iterates it from the main
//! thread during pre-render, and animation tasks never see the world itself, only the
//! per-entity `AnimationState` resources they were assigned.

use std::sync::atomic::{AtomicU32, Ordering};

use cgmath::{Deg, Matrix4};

use crate::core::MtResource;

use super::{
    assets::{ClipHandle, MaterialHandle, MeshHandle, SkeletonHandle},
    transform::Transform,
};

static NEXT_WORLD_ID: AtomicU32 = AtomicU32::new(1);
static NEXT_VIEWPORT_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique world identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorldId(pub u32);

/// Index of an entity inside its world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u32);

/// Process-unique viewport identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewportId(pub u32);

/// A drawable mesh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshComponent {
    /// Mesh asset.
    pub mesh: MeshHandle,
    /// Material asset.
    pub material: MaterialHandle,
    /// Hidden meshes are skipped during capture.
    pub visible: bool,
    /// Whether the mesh is drawn into shadow maps.
    pub casts_shadows: bool,
}

impl MeshComponent {
    /// A visible, shadow-casting mesh.
    pub fn new(mesh: MeshHandle, material: MaterialHandle) -> Self {
        Self {
            mesh,
            material,
            visible: true,
            casts_shadows: true,
        }
    }
}

/// Light shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LightKind {
    /// Infinitely distant light shining along the entity's -Z axis.
    Directional,
    /// Omnidirectional light; shadows use six cube faces.
    Point,
    /// Cone light shining along the entity's -Z axis.
    Spot {
        /// Full cone angle in degrees.
        cone_degrees: f32,
    },
}

impl LightKind {
    /// Shader-side light type.
    pub fn shader_kind(self) -> u32 {
        match self {
            LightKind::Directional => 0,
            LightKind::Point => 1,
            LightKind::Spot { .. } => 2,
        }
    }

    /// Number of shadow views the light needs.
    pub fn shadow_view_count(self) -> usize {
        match self {
            LightKind::Point => 6,
            LightKind::Directional | LightKind::Spot { .. } => 1,
        }
    }
}

/// A light source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightComponent {
    /// Shape.
    pub kind: LightKind,
    /// Linear RGB color.
    pub color: [f32; 3],
    /// Intensity multiplier.
    pub intensity: f32,
    /// Falloff range for point and spot lights; directional lights use it as the
    /// half-extent of their shadow projection.
    pub range: f32,
    /// Whether the light renders shadow passes.
    pub casts_shadows: bool,
}

impl LightComponent {
    /// A white light of the given kind.
    pub fn new(kind: LightKind) -> Self {
        Self {
            kind,
            color: [1.0, 1.0, 1.0],
            intensity: 1.0,
            range: 20.0,
            casts_shadows: true,
        }
    }
}

/// A perspective camera looking along the entity's -Z axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraComponent {
    /// Vertical field of view.
    pub fov_y: Deg<f32>,
    /// Near plane distance.
    pub near: f32,
    /// Far plane distance.
    pub far: f32,
}

impl Default for CameraComponent {
    fn default() -> Self {
        Self {
            fov_y: Deg(60.0),
            near: 0.1,
            far: 200.0,
        }
    }
}

/// The pose an animation task writes and the renderer reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnimationState {
    /// Playback position in seconds.
    pub time: f32,
    /// One matrix per joint: global pose times inverse bind.
    pub skinning_matrices: Vec<Matrix4<f32>>,
    /// Number of successful updates.
    pub updates: u64,
}

/// A skeletal animation player.
#[derive(Debug, Clone)]
pub struct AnimationComponent {
    /// Skeleton asset. Entities without one are skipped with a warning.
    pub skeleton: Option<SkeletonHandle>,
    /// Clip asset. Entities without one are skipped with a warning.
    pub clip: Option<ClipHandle>,
    /// Per-entity speed multiplier.
    pub play_rate: f32,
    /// Wrap around at the end of the clip instead of holding the last pose.
    pub looping: bool,
    /// Pose output, shared with the animation task the entity is assigned to.
    pub state: MtResource<AnimationState>,
}

impl AnimationComponent {
    /// A looping player at normal speed.
    pub fn new(skeleton: Option<SkeletonHandle>, clip: Option<ClipHandle>) -> Self {
        Self {
            skeleton,
            clip,
            play_rate: 1.0,
            looping: true,
            state: MtResource::new(AnimationState::default()),
        }
    }
}

/// An entity with its components.
#[derive(Debug, Clone)]
pub struct Entity {
    /// Debug name.
    pub name: String,
    /// Transform relative to the parent, or to the world when there is none.
    pub transform: Transform,
    /// Parent entity.
    pub parent: Option<EntityId>,
    /// Drawable mesh.
    pub mesh: Option<MeshComponent>,
    /// Light source.
    pub light: Option<LightComponent>,
    /// Camera.
    pub camera: Option<CameraComponent>,
    /// Animation player.
    pub animation: Option<AnimationComponent>,
}

impl Entity {
    /// An entity with only a transform.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transform: Transform::identity(),
            parent: None,
            mesh: None,
            light: None,
            camera: None,
            animation: None,
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_parent(mut self, parent: EntityId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_mesh(mut self, mesh: MeshComponent) -> Self {
        self.mesh = Some(mesh);
        self
    }

    pub fn with_light(mut self, light: LightComponent) -> Self {
        self.light = Some(light);
        self
    }

    pub fn with_camera(mut self, camera: CameraComponent) -> Self {
        self.camera = Some(camera);
        self
    }

    pub fn with_animation(mut self, animation: AnimationComponent) -> Self {
        self.animation = Some(animation);
        self
    }
}

/// A render target fed by one camera.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewportDesc {
    /// Process-unique id; also the viewport's resource table tag.
    pub id: ViewportId,
    /// Camera entity.
    pub camera: EntityId,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Clear color of the forward pass.
    pub clear_color: [f32; 4],
    /// Whether draws outside the camera frustum are culled.
    pub frustum_culling: bool,
}

impl ViewportDesc {
    /// A viewport with a fresh id.
    pub fn new(camera: EntityId, width: u32, height: u32) -> Self {
        Self {
            id: ViewportId(NEXT_VIEWPORT_ID.fetch_add(1, Ordering::Relaxed)),
            camera,
            width,
            height,
            clear_color: [0.05, 0.05, 0.08, 1.0],
            frustum_culling: true,
        }
    }

    /// Width over height.
    pub fn aspect_ratio(&self) -> f32 {
        self.width.max(1) as f32 / self.height.max(1) as f32
    }
}

/// A collection of entities and viewports.
#[derive(Debug)]
pub struct World {
    id: WorldId,
    name: String,
    entities: Vec<Option<Entity>>,
    viewports: Vec<ViewportDesc>,
}

impl World {
    /// Creates an empty world with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: WorldId(NEXT_WORLD_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            entities: Vec::new(),
            viewports: Vec::new(),
        }
    }

    pub fn id(&self) -> WorldId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds an entity and returns its id.
    pub fn spawn(&mut self, entity: Entity) -> EntityId {
        self.entities.push(Some(entity));
        EntityId(self.entities.len() as u32 - 1)
    }

    /// Removes an entity. Ids are not reused.
    pub fn despawn(&mut self, id: EntityId) -> Option<Entity> {
        self.entities.get_mut(id.0 as usize).and_then(Option::take)
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.entities.iter().filter(|entity| entity.is_some()).count()
    }

    /// Every live entity in id order.
    pub fn entities(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.entities
            .iter()
            .enumerate()
            .filter_map(|(index, entity)| entity.as_ref().map(|entity| (EntityId(index as u32), entity)))
    }

    /// Entities with a mesh component.
    pub fn meshes(&self) -> impl Iterator<Item = (EntityId, &Entity, &MeshComponent)> {
        self.entities()
            .filter_map(|(id, entity)| entity.mesh.as_ref().map(|mesh| (id, entity, mesh)))
    }

    /// Entities with a light component.
    pub fn lights(&self) -> impl Iterator<Item = (EntityId, &Entity, &LightComponent)> {
        self.entities()
            .filter_map(|(id, entity)| entity.light.as_ref().map(|light| (id, entity, light)))
    }

    /// Entities with an animation component.
    pub fn animations(&self) -> impl Iterator<Item = (EntityId, &Entity, &AnimationComponent)> {
        self.entities().filter_map(|(id, entity)| {
            entity.animation.as_ref().map(|animation| (id, entity, animation))
        })
    }

    /// Registers a viewport. The camera entity must carry a camera component when the
    /// frame is rendered, otherwise the viewport is skipped with a warning.
    pub fn add_viewport(&mut self, viewport: ViewportDesc) -> ViewportId {
        let id = viewport.id;
        self.viewports.push(viewport);
        id
    }

    pub fn viewports(&self) -> &[ViewportDesc] {
        &self.viewports
    }

    pub fn viewport_mut(&mut self, id: ViewportId) -> Option<&mut ViewportDesc> {
        self.viewports.iter_mut().find(|viewport| viewport.id == id)
    }

    /// The entity's transform composed with all of its ancestors.
    ///
    /// Returns `None` for dead entities. A dangling parent ends the chain, and a chain
    /// longer than the entity count (a cycle) is cut there.
    pub fn world_transform(&self, id: EntityId) -> Option<Matrix4<f32>> {
        let mut entity = self.entity(id)?;
        let mut matrix = entity.transform.to_matrix();
        let mut depth = 0usize;

        while let Some(parent) = entity.parent.and_then(|parent| self.entity(parent)) {
            depth += 1;
            if depth > self.entities.len() {
                log::warn!("Parent cycle detected at entity '{}'", entity.name);
                break;
            }
            matrix = parent.transform.to_matrix() * matrix;
            entity = parent;
        }

        Some(matrix)
    }

    /// World-space position of the entity's origin.
    pub fn world_position(&self, id: EntityId) -> Option<cgmath::Point3<f32>> {
        let matrix = self.world_transform(id)?;
        Some(cgmath::Point3::new(matrix.w.x, matrix.w.y, matrix.w.z))
    }

    /// Removes every entity and viewport.
    pub fn clear(&mut self) {
        self.entities.clear();
        self.viewports.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::Vector3;

    #[test]
    fn world_transform_composes_parents() {
        let mut world = World::new("test");
        let parent = world.spawn(
            Entity::new("parent").with_transform(Transform::from_translation(Vector3::new(1.0, 0.0, 0.0))),
        );
        let child = world.spawn(
            Entity::new("child")
                .with_transform(Transform::from_translation(Vector3::new(0.0, 2.0, 0.0)))
                .with_parent(parent),
        );

        let position = world.world_position(child).unwrap();
        assert_eq!(position, cgmath::Point3::new(1.0, 2.0, 0.0));
    }

    #[test]
    fn despawned_entities_disappear_from_iteration() {
        let mut world = World::new("test");
        let a = world.spawn(Entity::new("a"));
        let b = world.spawn(Entity::new("b"));
        world.despawn(a);

        let ids: Vec<EntityId> = world.entities().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![b]);
        assert!(world.world_transform(a).is_none());
    }

    #[test]
    fn parent_cycles_are_cut() {
        let mut world = World::new("test");
        let a = world.spawn(Entity::new("a").with_parent(EntityId(1)));
        world.spawn(Entity::new("b").with_parent(EntityId(0)));
        assert!(world.world_transform(a).is_some());
    }

    #[test]
    fn worlds_and_viewports_get_unique_ids() {
        let first = World::new("first");
        let second = World::new("second");
        assert_ne!(first.id(), second.id());

        let camera = EntityId(0);
        assert_ne!(ViewportDesc::new(camera, 8, 8).id, ViewportDesc::new(camera, 8, 8).id);
    }
}
