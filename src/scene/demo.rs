//! Procedural demo scene used by the binary and the end-to-end tests.
//!
//! The scene is a ground plane with randomly placed cubes (every fifth one alpha
//! blended), a few imported pyramids, a row of skinned "tentacles" waving on a shared
//! clip, one light of each kind and a single camera viewport. Placement is driven by a
//! seeded `fastrand` generator so the same configuration always builds the same scene.

use cgmath::{Deg, InnerSpace, Quaternion, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

use crate::{
    errors::Result,
    gpu::{
        layout::{GpuSkinInfluence, GpuVertex},
        BlendMode,
    },
    task_management::{task::TaskHandle, ThreadPool},
};

use super::{
    assets::{AnimationClip, AssetStore, ClipHandle, JointTrack, Material, MaterialHandle, MeshData, SkeletonHandle, Skeleton},
    import::{AssetImportTask, ImportSource},
    transform::Transform,
    world::{
        AnimationComponent, CameraComponent, Entity, EntityId, LightComponent, LightKind, MeshComponent, ViewportDesc,
        ViewportId, World,
    },
};

const PYRAMID_MODEL: &str = include_str!("../../assets/models/pyramid.json");

/// Segments (and joints) of a tentacle.
pub const TENTACLE_SEGMENTS: usize = 4;
const TENTACLE_SEGMENT_HEIGHT: f32 = 0.75;

/// What the demo scene contains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoSceneConfig {
    /// Randomly placed static cubes.
    pub cubes: usize,
    /// Imported pyramids.
    pub pyramids: usize,
    /// Skinned, animated tentacles.
    pub tentacles: usize,
    /// Seed of the placement generator.
    pub seed: u64,
}

impl Default for DemoSceneConfig {
    fn default() -> Self {
        Self {
            cubes: 24,
            pyramids: 3,
            tentacles: 6,
            seed: 7,
        }
    }
}

/// Entities of interest in a built demo scene.
#[derive(Debug, Clone, PartialEq)]
pub struct DemoScene {
    /// The camera entity.
    pub camera: EntityId,
    /// The viewport rendered by the camera.
    pub viewport: ViewportId,
    /// Animated entities in spawn order.
    pub animated: Vec<EntityId>,
}

/// Populates `world` and `assets` with the demo scene.
///
/// The pyramid model is imported through an [`AssetImportTask`] on `pool`.
///
/// # Errors
/// Returns an error if the embedded pyramid model fails to import.
pub fn build(
    pool: &ThreadPool,
    world: &mut World,
    assets: &mut AssetStore,
    config: &DemoSceneConfig,
    width: u32,
    height: u32,
) -> Result<DemoScene> {
    let import = TaskHandle::new(AssetImportTask::new(ImportSource::Json(PYRAMID_MODEL.to_string())));
    pool.submit_or_execute_task(&import, pool.is_initialized());

    let mut rng = fastrand::Rng::with_seed(config.seed);

    let cube = assets.add_mesh(cube_mesh("cube", 0.5));
    let ground = assets.add_mesh(ground_mesh("ground", 30.0));
    let ground_material = assets.add_material(Material {
        name: String::from("ground"),
        base_color: [0.35, 0.4, 0.35, 1.0],
        roughness: 0.9,
        casts_shadows: false,
        ..Material::default()
    });
    world.spawn(Entity::new("ground").with_mesh(MeshComponent {
        casts_shadows: false,
        ..MeshComponent::new(ground, ground_material)
    }));

    for index in 0..config.cubes {
        let transparent = index % 5 == 4;
        let material = assets.add_material(Material {
            name: format!("cube_{}", index),
            base_color: [rng.f32(), rng.f32(), rng.f32(), if transparent { 0.5 } else { 1.0 }],
            roughness: rng.f32(),
            blend: if transparent { BlendMode::AlphaBlend } else { BlendMode::Opaque },
            casts_shadows: !transparent,
            ..Material::default()
        });
        let transform = Transform::from_translation(Vector3::new(
            rng.f32() * 20.0 - 10.0,
            0.5,
            rng.f32() * 20.0 - 10.0,
        ))
        .with_rotation(Quaternion::from_angle_y(Deg(rng.f32() * 360.0)));
        world.spawn(
            Entity::new(format!("cube_{}", index))
                .with_transform(transform)
                .with_mesh(MeshComponent::new(cube, material)),
        );
    }

    import.wait();
    let model = assets.import(std::mem::take(&mut import.body_mut().result))?;
    let pyramid_material = model
        .material
        .unwrap_or_else(|| assets.add_material(Material::default()));
    for index in 0..config.pyramids {
        let transform = Transform::from_translation(Vector3::new(-8.0 + index as f32 * 4.0, 0.0, -12.0))
            .with_uniform_scale(2.0);
        world.spawn(
            Entity::new(format!("pyramid_{}", index))
                .with_transform(transform)
                .with_mesh(MeshComponent::new(model.mesh, pyramid_material)),
        );
    }

    let (skeleton, clip, tentacle_material) = add_tentacle_assets(assets);
    let tentacle = assets.add_mesh(tentacle_mesh("tentacle", TENTACLE_SEGMENTS, TENTACLE_SEGMENT_HEIGHT));
    let mut animated = Vec::with_capacity(config.tentacles);
    for index in 0..config.tentacles {
        let mut animation = AnimationComponent::new(Some(skeleton), Some(clip));
        animation.play_rate = 0.75 + rng.f32() * 0.5;
        animation.state.get_mut().time = rng.f32() * 2.0;

        let transform = Transform::from_translation(Vector3::new(-6.0 + index as f32 * 2.5, 0.0, 4.0));
        animated.push(
            world.spawn(
                Entity::new(format!("tentacle_{}", index))
                    .with_transform(transform)
                    .with_mesh(MeshComponent::new(tentacle, tentacle_material))
                    .with_animation(animation),
            ),
        );
    }

    world.spawn(
        Entity::new("sun")
            .with_transform(Transform::identity().with_rotation(Quaternion::from_angle_x(Deg(-60.0))))
            .with_light(LightComponent {
                intensity: 2.0,
                color: [1.0, 0.95, 0.85],
                ..LightComponent::new(LightKind::Directional)
            }),
    );
    world.spawn(
        Entity::new("lamp")
            .with_transform(Transform::from_translation(Vector3::new(3.0, 4.0, 2.0)))
            .with_light(LightComponent {
                color: [1.0, 0.6, 0.3],
                range: 12.0,
                ..LightComponent::new(LightKind::Point)
            }),
    );
    world.spawn(
        Entity::new("spot")
            .with_transform(
                Transform::from_translation(Vector3::new(-4.0, 6.0, 6.0))
                    .with_rotation(Quaternion::from_angle_x(Deg(-70.0))),
            )
            .with_light(LightComponent {
                color: [0.4, 0.6, 1.0],
                range: 15.0,
                ..LightComponent::new(LightKind::Spot { cone_degrees: 45.0 })
            }),
    );

    let camera = world.spawn(
        Entity::new("camera")
            .with_transform(
                Transform::from_translation(Vector3::new(0.0, 8.0, 18.0))
                    .with_rotation(Quaternion::from_angle_x(Deg(-20.0))),
            )
            .with_camera(CameraComponent::default()),
    );
    let viewport = world.add_viewport(ViewportDesc::new(camera, width, height));

    log::info!(
        "Demo scene '{}' built: {} entities, {} meshes, {} materials",
        world.name(),
        world.entity_count(),
        assets.mesh_count(),
        assets.material_count()
    );

    Ok(DemoScene {
        camera,
        viewport,
        animated,
    })
}

fn add_tentacle_assets(assets: &mut AssetStore) -> (SkeletonHandle, ClipHandle, MaterialHandle) {
    let skeleton = tentacle_skeleton(TENTACLE_SEGMENTS, TENTACLE_SEGMENT_HEIGHT);
    let clip = wiggle_clip(TENTACLE_SEGMENTS, 2.0);
    let material = Material {
        name: String::from("tentacle"),
        base_color: [0.7, 0.2, 0.5, 1.0],
        roughness: 0.3,
        cull: crate::gpu::CullMode::None,
        ..Material::default()
    };
    (assets.add_skeleton(skeleton), assets.add_clip(clip), assets.add_material(material))
}

/// An axis-aligned cube with per-face normals.
pub fn cube_mesh(name: &str, half_extent: f32) -> MeshData {
    let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]),
        ([-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
        ([0.0, 1.0, 0.0], [0.0, 0.0, -1.0], [1.0, 0.0, 0.0]),
        ([0.0, -1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]),
        ([0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]),
        ([0.0, 0.0, -1.0], [0.0, 1.0, 0.0], [-1.0, 0.0, 0.0]),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, up, right) in faces {
        let (normal_v, up_v, right_v) = (Vector3::from(normal), Vector3::from(up), Vector3::from(right));
        let base = vertices.len() as u32;
        for (u, v) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let position = (normal_v + right_v * u + up_v * v) * half_extent;
            vertices.push(GpuVertex::new(position.into(), normal));
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    MeshData::new(name, vertices, indices)
}

/// A square in the XZ plane facing +Y.
pub fn ground_mesh(name: &str, half_extent: f32) -> MeshData {
    let normal = [0.0, 1.0, 0.0];
    let vertices = [(-1.0, 1.0), (1.0, 1.0), (1.0, -1.0), (-1.0, -1.0)]
        .into_iter()
        .map(|(x, z)| GpuVertex::new([x * half_extent, 0.0, z * half_extent], normal))
        .collect();
    MeshData::new(name, vertices, vec![0, 1, 2, 0, 2, 3])
}

/// A square column of `segments` segments along +Y, skinned to a joint chain.
///
/// Each ring of four vertices is bound to the joint at its height; rings between two
/// segments blend both joints equally.
pub fn tentacle_mesh(name: &str, segments: usize, segment_height: f32) -> MeshData {
    let corners = [(0.25, 0.25), (0.25, -0.25), (-0.25, -0.25), (-0.25, 0.25)];
    let mut vertices = Vec::with_capacity((segments + 1) * 4);
    let mut influences = Vec::with_capacity((segments + 1) * 4);

    for ring in 0..=segments {
        let influence = if ring == 0 {
            GpuSkinInfluence {
                joints: [0, 0, 0, 0],
                weights: [1.0, 0.0, 0.0, 0.0],
            }
        } else if ring == segments {
            GpuSkinInfluence {
                joints: [(segments - 1) as u32, 0, 0, 0],
                weights: [1.0, 0.0, 0.0, 0.0],
            }
        } else {
            GpuSkinInfluence {
                joints: [ring as u32 - 1, ring as u32, 0, 0],
                weights: [0.5, 0.5, 0.0, 0.0],
            }
        };

        for (x, z) in corners {
            let normal = Vector3::new(x, 0.0, z).normalize();
            vertices.push(GpuVertex::new([x, ring as f32 * segment_height, z], normal.into()));
            influences.push(influence);
        }
    }

    let mut indices = Vec::with_capacity(segments * 24);
    for segment in 0..segments as u32 {
        let bottom = segment * 4;
        let top = bottom + 4;
        for side in 0..4 {
            let next = (side + 1) % 4;
            indices.extend_from_slice(&[
                bottom + side,
                top + side,
                top + next,
                bottom + side,
                top + next,
                bottom + next,
            ]);
        }
    }

    MeshData::new(name, vertices, indices).with_influences(influences)
}

/// A chain of `segments` joints spaced `segment_height` apart along +Y.
pub fn tentacle_skeleton(segments: usize, segment_height: f32) -> Skeleton {
    let joints = (0..segments)
        .map(|index| {
            let offset = if index == 0 { 0.0 } else { segment_height };
            (
                format!("segment_{}", index),
                index.checked_sub(1),
                Transform::from_translation(Vector3::new(0.0, offset, 0.0)),
            )
        })
        .collect();

    match Skeleton::from_bind_pose("tentacle", joints) {
        Ok(skeleton) => skeleton,
        Err(err) => crate::fatal!("tentacle skeleton is malformed: {}", err),
    }
}

/// A looping sway: every joint rotates about Z on a sine, phase-shifted along the chain.
pub fn wiggle_clip(joints: usize, duration: f32) -> AnimationClip {
    const KEYS: usize = 8;
    let tracks = (0..joints)
        .map(|joint| {
            let rotations = (0..=KEYS)
                .map(|key| {
                    let time = duration * key as f32 / KEYS as f32;
                    let phase = std::f32::consts::TAU * (key as f32 / KEYS as f32) + joint as f32 * 0.6;
                    (time, Quaternion::from_angle_z(Deg(phase.sin() * 18.0)))
                })
                .collect();
            JointTrack {
                joint,
                rotations,
                ..JointTrack::default()
            }
        })
        .collect();

    AnimationClip {
        name: String::from("wiggle"),
        duration,
        tracks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn procedural_meshes_are_well_formed() {
        let cube = cube_mesh("cube", 0.5);
        assert_eq!(cube.triangle_count(), 12);
        assert!((cube.bounds.radius - 0.75f32.sqrt()).abs() < 1e-5);

        let tentacle = tentacle_mesh("tentacle", TENTACLE_SEGMENTS, TENTACLE_SEGMENT_HEIGHT);
        assert!(tentacle.is_skinned());
        assert!(tentacle
            .influences
            .iter()
            .all(|influence| influence.joints.iter().all(|&joint| (joint as usize) < TENTACLE_SEGMENTS)));
        assert!(tentacle.indices.iter().all(|&index| (index as usize) < tentacle.vertices.len()));
    }

    #[test]
    fn demo_scene_is_deterministic_per_seed() {
        let pool = ThreadPool::with_workers(2);
        let config = DemoSceneConfig {
            cubes: 5,
            pyramids: 1,
            tentacles: 2,
            seed: 42,
        };

        let build_positions = || {
            let mut world = World::new("demo");
            let mut assets = AssetStore::new();
            let scene = build(&pool, &mut world, &mut assets, &config, 320, 240).unwrap();
            assert_eq!(scene.animated.len(), 2);
            assert!(world.entity(scene.camera).unwrap().camera.is_some());
            world
                .meshes()
                .map(|(_, entity, _)| entity.transform.translation)
                .collect::<Vec<_>>()
        };

        assert_eq!(build_positions(), build_positions());
    }
}
