//! # Scene
//!
//! The data the renderer consumes and the world subsystem that updates it.
//!
//! - `transform`: decomposed transforms and bounding spheres
//! - `assets`: meshes, skeletons, clips and materials behind typed handles
//! - `import`: the asset import task and its JSON model format
//! - `world`: entities, components and viewports
//! - `animation`: the round-robin animation task array
//! - `demo`: a procedural scene for the binary and tests

pub mod animation;
pub mod assets;
pub mod demo;
pub mod import;
pub mod transform;
pub mod world;

pub use animation::{AnimationSubsystem, AnimationTask, ANIMATION_TASK_COUNT};
pub use assets::{AssetStore, Material, MaterialHandle, MeshData, MeshHandle};
pub use import::{AssetImportTask, ImportResult, ImportSource};
pub use transform::{BoundingSphere, Transform};
pub use world::{
    AnimationComponent, AnimationState, CameraComponent, Entity, EntityId, LightComponent, LightKind,
    MeshComponent, ViewportDesc, ViewportId, World, WorldId,
};
