//! # Render Graph Builder
//!
//! The main-thread half of a frame, run on a slot in `Building` state:
//!
//! 1. **Capture**: walk every world and viewport, register lights, transforms,
//!    materials, views and skinned poses in the slot's resource table, and fill the
//!    draw lists (visibility flag and optional frustum culling applied here).
//! 2. **Resource update**: grow the slot's GPU buffers to this frame's table sizes,
//!    stage new meshes, pack the tables for the copy task and build the skinning
//!    dispatches for the compute task.
//! 3. **Pass recording inputs**: hand every shadow view and viewport to a render-pass
//!    task with its draws resolved to GPU buffers.
//!
//! Shadow views are captured before viewports so each forward pass knows the shadow
//! maps its world's lights render into.

use std::sync::Arc;

use cgmath::{InnerSpace, Point3, Vector3, Vector4};
use log::warn;

use crate::{
    gpu::{
        layout::{byte_size, GpuLight, GpuMaterial, GpuMatrix, GpuView},
        BufferId, CullMode, DrawIndexed, GpuDevice, GpuError, PassDesc, PassKind, PipelineStateCache,
        RenderStateKey, SkinningDispatch,
    },
    scene::{
        assets::AssetStore,
        transform::BoundingSphere,
        world::{EntityId, LightKind, World},
    },
};

use super::{
    draw_list::{DrawItem, DrawLists, ShadowDraws, ViewportDraws},
    frame_slot::{CycleTickets, FrameSlot},
    resource_table::{LightId, ResourceTag, WorldData},
    tasks::{CopyRegion, PassDraw},
    viewport::{camera_view, shadow_views},
};

/// Alignment of each table inside the upload buffer.
const TABLE_ALIGNMENT: usize = 256;

/// Switches that change what capture keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Global frustum culling switch; viewports can also opt out individually.
    pub frustum_culling: bool,
}

/// What capture produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub views: usize,
    pub lights: usize,
    /// Draws across every forward and shadow pass.
    pub draws: usize,
    pub skinned: usize,
    pub shadow_passes: usize,
    pub forward_passes: usize,
    /// Forward draws rejected by frustum culling.
    pub culled: usize,
    /// Shadow views dropped by the shadow pass limit.
    pub dropped_shadow_views: usize,
}

/// GPU buffers of the frame's tables, valid after [`update_resources`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableBuffers {
    pub views: BufferId,
    pub transforms: BufferId,
    pub materials: BufferId,
    pub lights: BufferId,
    pub bones: BufferId,
}

/// What resource update staged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    /// Bytes the copy queue moves this frame, including newly staged meshes.
    pub bytes: u64,
    pub dispatches: usize,
}

/// A visible mesh instance before it is filed into a view's lists.
struct Renderable {
    item: DrawItem,
    sphere: BoundingSphere,
    cull: CullMode,
    casts_shadows: bool,
}

/// A light whose shadow views are captured after the world's meshes.
struct ShadowLight {
    light: LightId,
    entity: EntityId,
    kind: LightKind,
    position: Point3<f32>,
    direction: Vector3<f32>,
    range: f32,
}

/// Fills the slot's resource table and draw lists from `worlds`.
///
/// # Errors
/// Fails when a render target or shadow map cannot be created.
pub fn capture(
    slot: &mut FrameSlot,
    device: &dyn GpuDevice,
    worlds: &[&World],
    assets: &AssetStore,
    options: &CaptureOptions,
) -> Result<CaptureStats, GpuError> {
    let slot_index = slot.index();
    let mut stats = CaptureStats::default();

    for world in worlds {
        let world_id = world.id();

        let first_light = slot.table.light_count() as u32;
        let mut shadow_lights = Vec::new();
        for (entity, _, light) in world.lights() {
            let Some(matrix) = world.world_transform(entity) else {
                continue;
            };
            let position = Point3::new(matrix.w.x, matrix.w.y, matrix.w.z);
            let direction = (matrix * -Vector4::unit_z()).truncate().normalize();
            let cone = match light.kind {
                LightKind::Spot { cone_degrees } => (cone_degrees * 0.5).to_radians().cos(),
                LightKind::Directional | LightKind::Point => 0.0,
            };

            let id = slot.table.add_light(
                ResourceTag::entity(world_id, entity),
                GpuLight {
                    position_range: [position.x, position.y, position.z, light.range],
                    direction_cone: [direction.x, direction.y, direction.z, cone],
                    color_intensity: [light.color[0], light.color[1], light.color[2], light.intensity],
                    kind: light.kind.shader_kind(),
                    first_shadow_view: u32::MAX,
                    shadow_view_count: 0,
                    _padding: 0,
                },
            );
            if light.casts_shadows {
                shadow_lights.push(ShadowLight {
                    light: id,
                    entity,
                    kind: light.kind,
                    position,
                    direction,
                    range: light.range,
                });
            }
        }
        let light_count = slot.table.light_count() as u32 - first_light;
        slot.table.add_world(
            ResourceTag::world(world_id),
            WorldData {
                world: world_id,
                first_light,
                light_count,
            },
        );

        let mut renderables = Vec::new();
        for (entity, data, mesh) in world.meshes() {
            if !mesh.visible {
                continue;
            }
            let Some(mesh_data) = assets.mesh(mesh.mesh) else {
                warn!("Entity '{}' references missing mesh {:?}", data.name, mesh.mesh);
                continue;
            };
            let Some(material) = assets.material(mesh.material) else {
                warn!("Entity '{}' references missing material {:?}", data.name, mesh.material);
                continue;
            };
            let Some(matrix) = world.world_transform(entity) else {
                continue;
            };

            let tag = ResourceTag::entity(world_id, entity);
            let (material_id, blend, cull, material_shadows) = {
                let material = material.get();
                (
                    slot.table.add_material(mesh.material, &material),
                    material.blend,
                    material.cull,
                    material.casts_shadows,
                )
            };
            let transform = slot.table.add_transform(tag, matrix);
            slot.table.add_mesh(mesh.mesh);

            let skinned = match &data.animation {
                Some(animation) if mesh_data.is_skinned() => {
                    let state = animation.state.get();
                    (!state.skinning_matrices.is_empty())
                        .then(|| slot.table.add_skinned_mesh(tag, mesh.mesh, &state.skinning_matrices))
                }
                _ => None,
            };

            renderables.push(Renderable {
                item: DrawItem {
                    mesh: mesh.mesh,
                    transform,
                    material: material_id,
                    skinned,
                    key: RenderStateKey::forward(blend, cull, skinned.is_some()),
                    depth: 0.0,
                    index_count: mesh_data.indices.len() as u32,
                },
                sphere: mesh_data.bounds.transformed_by(&matrix),
                cull,
                casts_shadows: mesh.casts_shadows && material_shadows,
            });
        }

        let mut shadow_maps = Vec::new();
        for shadow in shadow_lights {
            let views = shadow_views(shadow.kind, shadow.position, shadow.direction, shadow.range);
            for (face, view) in views.into_iter().enumerate() {
                if slot.shadows.len() >= slot.table.limits().max_shadow_passes {
                    stats.dropped_shadow_views += 1;
                    continue;
                }

                let view_id = slot
                    .table
                    .add_view(ResourceTag::shadow_view(world_id, shadow.entity, face as u8), view.to_gpu());
                if let Some(light) = slot.table.light_mut(shadow.light) {
                    if light.shadow_view_count == 0 {
                        light.first_shadow_view = view_id.0;
                    }
                    light.shadow_view_count += 1;
                }

                let map = slot.targets.shadow_map(device, slot_index, slot.shadows.len())?;
                let frustum = view.frustum();
                let casters = renderables
                    .iter()
                    .filter(|renderable| renderable.casts_shadows)
                    .filter(|renderable| !options.frustum_culling || frustum.intersects_sphere(&renderable.sphere))
                    .map(|renderable| DrawItem {
                        key: RenderStateKey::shadow(renderable.cull, renderable.item.skinned.is_some()),
                        depth: (renderable.sphere.center - view.position).magnitude2(),
                        ..renderable.item
                    })
                    .collect();

                slot.shadows.push(ShadowDraws {
                    world: world_id,
                    view: view_id,
                    map,
                    casters,
                });
                shadow_maps.push(map);
            }
        }

        for viewport in world.viewports() {
            let Some(camera) = world.entity(viewport.camera).and_then(|entity| entity.camera) else {
                warn!(
                    "Viewport {:?} of world '{}' has no camera component on {:?}",
                    viewport.id,
                    world.name(),
                    viewport.camera
                );
                continue;
            };
            let Some(matrix) = world.world_transform(viewport.camera) else {
                continue;
            };

            let view = camera_view(&matrix, &camera, viewport.aspect_ratio());
            let view_id = slot.table.add_view(ResourceTag::viewport(viewport.id), view.to_gpu());
            let frustum = view.frustum();
            let culling = options.frustum_culling && viewport.frustum_culling;

            let mut lists = DrawLists::default();
            for renderable in &renderables {
                if culling && !frustum.intersects_sphere(&renderable.sphere) {
                    stats.culled += 1;
                    continue;
                }
                lists.push(DrawItem {
                    depth: (renderable.sphere.center - view.position).magnitude2(),
                    ..renderable.item
                });
            }
            lists.sort_transparent();

            let target = slot.targets.viewport_target(device, slot_index, viewport)?;
            slot.viewports.push(ViewportDraws {
                viewport: viewport.id,
                world: world_id,
                view: view_id,
                target,
                clear_color: viewport.clear_color,
                first_light,
                light_count,
                shadow_maps: shadow_maps.clone(),
                lists,
            });
        }
    }

    stats.views = slot.table.view_count();
    stats.lights = slot.table.light_count();
    stats.skinned = slot.table.skinned().len();
    stats.shadow_passes = slot.shadows.len();
    stats.forward_passes = slot.viewports.len();
    stats.draws = slot.viewports.iter().map(|viewport| viewport.lists.len()).sum::<usize>()
        + slot.shadows.iter().map(|shadow| shadow.casters.len()).sum::<usize>();

    if stats.dropped_shadow_views > 0 {
        warn!(
            "Slot {}: {} shadow views over the limit of {}",
            slot_index,
            stats.dropped_shadow_views,
            slot.table.limits().max_shadow_passes
        );
    }
    Ok(stats)
}

fn aligned(len: usize) -> usize {
    len.div_ceil(TABLE_ALIGNMENT) * TABLE_ALIGNMENT
}

/// Grows the slot's buffers to this frame's tables and fills the copy and compute
/// task inputs. Both tasks are reset here.
///
/// # Errors
/// Fails when a buffer cannot be created, grown or written.
pub fn update_resources(
    slot: &mut FrameSlot,
    device: &dyn GpuDevice,
    assets: &AssetStore,
) -> Result<(TableBuffers, UploadStats), GpuError> {
    let meshes = slot.table.meshes().to_vec();
    for handle in meshes {
        if let Some(mesh) = assets.mesh(handle) {
            slot.mesh_buffers(device, handle, mesh)?;
        }
    }

    let tables = TableBuffers {
        views: slot
            .buffers
            .views
            .ensure(device, byte_size::<GpuView>(slot.table.views().len()))?,
        transforms: slot
            .buffers
            .transforms
            .ensure(device, byte_size::<GpuMatrix>(slot.table.transforms().len()))?,
        materials: slot
            .buffers
            .materials
            .ensure(device, byte_size::<GpuMaterial>(slot.table.materials().len()))?,
        lights: slot
            .buffers
            .lights
            .ensure(device, byte_size::<GpuLight>(slot.table.lights().len()))?,
        bones: slot
            .buffers
            .bones
            .ensure(device, byte_size::<GpuMatrix>(slot.table.bone_matrices().len()))?,
    };

    let skinned = slot.table.skinned().to_vec();
    let mut dispatches = Vec::with_capacity(skinned.len());
    for entry in skinned {
        let Some(mesh) = slot.cached_mesh(entry.mesh) else {
            continue;
        };
        let Some(influences) = mesh.influences else {
            continue;
        };
        let output = slot.skinned_output(device, entry.tag, mesh.vertex_count)?;
        dispatches.push(SkinningDispatch {
            source_vertices: mesh.vertices,
            influences,
            bone_matrices: tables.bones,
            bone_offset: entry.bone_offset,
            bone_count: entry.bone_count,
            output,
            vertex_count: mesh.vertex_count,
        });
    }

    let packed: [(&[u8], BufferId); 5] = [
        (bytemuck::cast_slice(slot.table.views()), tables.views),
        (bytemuck::cast_slice(slot.table.transforms()), tables.transforms),
        (bytemuck::cast_slice(slot.table.materials()), tables.materials),
        (bytemuck::cast_slice(slot.table.lights()), tables.lights),
        (bytemuck::cast_slice(slot.table.bone_matrices()), tables.bones),
    ];
    let upload_size: usize = packed.iter().map(|(bytes, _)| aligned(bytes.len())).sum();
    let upload = slot.buffers.upload.ensure(device, upload_size as u64)?;

    // Nothing below can fail: the queued mesh copies now belong to this frame.
    let mesh_copies = std::mem::take(&mut slot.pending_mesh_copies);

    slot.copy_task.reset();
    let mut copy = slot.copy_task.body_mut();
    copy.upload = Some(upload);
    copy.regions.extend(mesh_copies);
    for (bytes, dst) in packed {
        let offset = copy.staging.len();
        copy.staging.extend_from_slice(bytes);
        let padded = aligned(copy.staging.len());
        copy.staging.resize(padded, 0);
        copy.regions.push(CopyRegion {
            src: upload,
            src_offset: offset as u64,
            dst,
            dst_offset: 0,
            size: bytes.len() as u64,
        });
    }
    let bytes: u64 = copy.regions.iter().map(|region| region.size).sum();
    drop(copy);

    slot.compute_task.reset();
    let dispatch_count = dispatches.len();
    slot.compute_task.body_mut().dispatches = dispatches;

    Ok((
        tables,
        UploadStats {
            bytes,
            dispatches: dispatch_count,
        },
    ))
}

/// Resolves a draw item to the slot's GPU buffers. `None` when its mesh or skinning
/// output was never staged.
fn pass_draw(slot: &FrameSlot, item: &DrawItem) -> Option<PassDraw> {
    let mesh = slot.cached_mesh(item.mesh)?;
    let vertex_buffer = match item.skinned {
        Some(skinned) => {
            let entry = slot.table.skinned().get(skinned.index())?;
            slot.cached_skinned_output(entry.tag)?
        }
        None => mesh.vertices,
    };
    Some(PassDraw {
        key: item.key,
        draw: DrawIndexed {
            vertex_buffer,
            index_buffer: mesh.indices,
            index_count: item.index_count,
            transform_index: item.transform.0,
            material_index: item.material.0,
        },
    })
}

/// Resets one render-pass task per shadow view and viewport and assigns its inputs.
pub fn record_passes(
    slot: &mut FrameSlot,
    tables: &TableBuffers,
    pipelines: &Arc<PipelineStateCache>,
    frame_counter: u64,
) {
    slot.ensure_pass_tasks(PassKind::Shadow, slot.shadows.len());
    slot.ensure_pass_tasks(PassKind::Forward, slot.viewports.len());
    let slot: &FrameSlot = slot;

    for (shadow, task) in slot.shadows.iter().zip(&slot.shadow_tasks) {
        task.reset();
        let mut body = task.body_mut();
        body.pipelines = Some(pipelines.clone());
        body.pass = Some(PassDesc {
            label: format!("shadow {} view {}", frame_counter, shadow.view.0),
            kind: PassKind::Shadow,
            color: None,
            depth: shadow.map,
            clear_color: [0.0; 4],
            views: tables.views,
            view_index: shadow.view.0,
            transforms: tables.transforms,
            materials: tables.materials,
            lights: tables.lights,
            first_light: 0,
            light_count: 0,
            shadow_maps: Vec::new(),
        });
        body.draws
            .extend(shadow.casters.iter().filter_map(|item| pass_draw(slot, item)));
    }

    for (viewport, task) in slot.viewports.iter().zip(&slot.forward_tasks) {
        task.reset();
        let mut body = task.body_mut();
        body.pipelines = Some(pipelines.clone());
        body.pass = Some(PassDesc {
            label: format!("forward {} viewport {}", frame_counter, viewport.viewport.0),
            kind: PassKind::Forward,
            color: Some(viewport.target.color),
            depth: viewport.target.depth,
            clear_color: viewport.clear_color,
            views: tables.views,
            view_index: viewport.view.0,
            transforms: tables.transforms,
            materials: tables.materials,
            lights: tables.lights,
            first_light: viewport.first_light,
            light_count: viewport.light_count,
            shadow_maps: viewport.shadow_maps.clone(),
        });
        body.draws
            .extend(viewport.lists.iter().filter_map(|item| pass_draw(slot, item)));
    }
}

/// Hands the cycle's tickets to the copy and compute tasks.
pub fn assign_tickets(slot: &FrameSlot, tickets: &CycleTickets, frame_counter: u64) {
    let mut copy = slot.copy_task.body_mut();
    copy.gate = Some(slot.gate().clone());
    copy.signal = Some(tickets.copy.clone());
    copy.frame_counter = frame_counter;
    drop(copy);

    let mut compute = slot.compute_task.body_mut();
    compute.gate = Some(slot.gate().clone());
    compute.wait_for = Some(tickets.copy.clone());
    compute.signal = Some(tickets.compute.clone());
    compute.frame_counter = frame_counter;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gpu::{pipeline_cache::DEFAULT_PIPELINE_CACHE_CAPACITY, software::SoftwareGpu},
        renderer::{frame_slot::FrameSlot, resource_table::TableLimits},
        scene::{
            assets::Material,
            demo::{cube_mesh, tentacle_mesh, tentacle_skeleton},
            transform::Transform,
            world::{AnimationComponent, CameraComponent, Entity, LightComponent, MeshComponent, ViewportDesc},
        },
    };
    use cgmath::{Matrix4, SquareMatrix};

    const OPTIONS: CaptureOptions = CaptureOptions { frustum_culling: true };

    struct Scene {
        world: World,
        assets: AssetStore,
    }

    /// Camera at the origin looking down -Z, one cube in front of it, one behind it,
    /// one hidden cube and a directional light.
    fn scene() -> Scene {
        let mut world = World::new("capture test");
        let mut assets = AssetStore::new();
        let cube = assets.add_mesh(cube_mesh("cube", 0.5));
        let material = assets.add_material(Material::default());

        for (name, z) in [("front", -5.0), ("behind", 10.0)] {
            world.spawn(
                Entity::new(name)
                    .with_transform(Transform::from_translation(Vector3::new(0.0, 0.0, z)))
                    .with_mesh(MeshComponent::new(cube, material)),
            );
        }
        world.spawn(
            Entity::new("hidden")
                .with_transform(Transform::from_translation(Vector3::new(1.0, 0.0, -5.0)))
                .with_mesh(MeshComponent {
                    visible: false,
                    ..MeshComponent::new(cube, material)
                }),
        );
        world.spawn(Entity::new("sun").with_light(LightComponent::new(LightKind::Directional)));

        let camera = world.spawn(Entity::new("camera").with_camera(CameraComponent::default()));
        world.add_viewport(ViewportDesc::new(camera, 64, 64));
        Scene { world, assets }
    }

    fn slot(device: &Arc<SoftwareGpu>, limits: TableLimits) -> FrameSlot {
        let mut slot = FrameSlot::new(0, device.clone(), limits);
        slot.begin_render();
        slot
    }

    #[test]
    fn capture_culls_hidden_and_offscreen_meshes() {
        let device = Arc::new(SoftwareGpu::new());
        let scene = scene();
        let mut slot = slot(&device, TableLimits::default());

        let stats = capture(&mut slot, device.as_ref(), &[&scene.world], &scene.assets, &OPTIONS).unwrap();

        assert_eq!(stats.forward_passes, 1);
        assert_eq!(stats.shadow_passes, 1);
        assert_eq!(stats.lights, 1);
        assert_eq!(stats.views, 2);
        assert_eq!(stats.culled, 1);
        assert_eq!(slot.viewports[0].lists.len(), 1);
        assert_eq!(slot.viewports[0].shadow_maps, vec![slot.shadows[0].map]);

        // Both visible cubes sit inside the sun's shadow volume; the hidden one is never captured.
        assert_eq!(slot.shadows[0].casters.len(), 2);
        assert_eq!(slot.table.transforms().len(), 2);

        let light = slot.table.lights()[0];
        assert_eq!(light.first_shadow_view, slot.shadows[0].view.0);
        assert_eq!(light.shadow_view_count, 1);
    }

    #[test]
    fn culling_can_be_switched_off() {
        let device = Arc::new(SoftwareGpu::new());
        let scene = scene();
        let mut slot = slot(&device, TableLimits::default());

        let options = CaptureOptions { frustum_culling: false };
        let stats = capture(&mut slot, device.as_ref(), &[&scene.world], &scene.assets, &options).unwrap();
        assert_eq!(stats.culled, 0);
        assert_eq!(slot.viewports[0].lists.len(), 2);
    }

    #[test]
    fn shadow_views_over_the_limit_are_dropped() {
        let device = Arc::new(SoftwareGpu::new());
        let mut scene = scene();
        scene
            .world
            .spawn(Entity::new("lamp").with_light(LightComponent::new(LightKind::Point)));
        let mut slot = slot(
            &device,
            TableLimits {
                max_shadow_passes: 3,
                ..TableLimits::default()
            },
        );

        let stats = capture(&mut slot, device.as_ref(), &[&scene.world], &scene.assets, &OPTIONS).unwrap();
        assert_eq!(stats.shadow_passes, 3);
        assert_eq!(stats.dropped_shadow_views, 4);
        assert_eq!(slot.table.lights()[1].shadow_view_count, 2);
    }

    #[test]
    fn resources_and_passes_follow_the_capture() {
        let device = Arc::new(SoftwareGpu::new());
        let mut scene = scene();
        let skeleton = scene.assets.add_skeleton(tentacle_skeleton(4, 0.5));
        let tentacle = scene.assets.add_mesh(tentacle_mesh("tentacle", 4, 0.5));
        let material = scene.assets.add_material(Material::default());
        let animation = AnimationComponent::new(Some(skeleton), None);
        animation.state.get_mut().skinning_matrices = vec![Matrix4::identity(); 4];
        scene.world.spawn(
            Entity::new("tentacle")
                .with_transform(Transform::from_translation(Vector3::new(0.0, -1.0, -6.0)))
                .with_mesh(MeshComponent::new(tentacle, material))
                .with_animation(animation),
        );

        let mut slot = slot(&device, TableLimits::default());
        let stats = capture(&mut slot, device.as_ref(), &[&scene.world], &scene.assets, &OPTIONS).unwrap();
        assert_eq!(stats.skinned, 1);

        let (tables, upload) = update_resources(&mut slot, device.as_ref(), &scene.assets).unwrap();
        assert_eq!(upload.dispatches, 1);
        assert!(upload.bytes > 0);
        assert_eq!(slot.mesh_count(), 2);
        assert_eq!(slot.compute_task.body().dispatches[0].bone_count, 4);
        assert_eq!(slot.compute_task.body().dispatches[0].bone_matrices, tables.bones);

        let pipelines = Arc::new(PipelineStateCache::new(device.clone(), DEFAULT_PIPELINE_CACHE_CAPACITY));
        record_passes(&mut slot, &tables, &pipelines, 7);
        assert_eq!(slot.forward_tasks.len(), 1);
        assert_eq!(slot.shadow_tasks.len(), 1);

        let forward = slot.forward_tasks[0].body();
        let pass = forward.pass.as_ref().unwrap();
        assert!(pass.label.starts_with("forward 7"));
        assert_eq!(pass.light_count, 1);
        assert_eq!(forward.draws.len(), 2);

        let skinned_output = slot.cached_skinned_output(slot.table.skinned()[0].tag).unwrap();
        assert!(forward.draws.iter().any(|draw| draw.key.skinned && draw.draw.vertex_buffer == skinned_output));
    }

    #[test]
    fn mesh_copies_survive_a_failed_build() {
        let device = Arc::new(SoftwareGpu::new());
        let scene = scene();
        let mut slot = slot(&device, TableLimits::default());

        device.fail_buffer_creation("views");
        capture(&mut slot, device.as_ref(), &[&scene.world], &scene.assets, &OPTIONS).unwrap();
        assert!(matches!(
            update_resources(&mut slot, device.as_ref(), &scene.assets),
            Err(GpuError::OutOfMemory(_))
        ));
        assert_eq!(slot.mesh_count(), 1);
        assert_eq!(slot.pending_mesh_copy_count(), 2);

        slot.begin_render();
        capture(&mut slot, device.as_ref(), &[&scene.world], &scene.assets, &OPTIONS).unwrap();
        update_resources(&mut slot, device.as_ref(), &scene.assets).unwrap();
        assert_eq!(slot.pending_mesh_copy_count(), 0);

        let cube = slot.cached_mesh(slot.table.meshes()[0]).unwrap();
        let copy = slot.copy_task.body();
        for dst in [cube.vertices, cube.indices] {
            assert!(copy.regions.iter().any(|region| region.dst == dst));
        }
    }

    #[test]
    fn tickets_chain_compute_behind_copy() {
        let device = Arc::new(SoftwareGpu::new());
        let mut slot = slot(&device, TableLimits::default());
        let tickets = slot.reserve_cycle();
        assign_tickets(&slot, &tickets, 3);

        assert_eq!(slot.copy_task.body().signal.as_ref().unwrap().value(), tickets.copy.value());
        let compute = slot.compute_task.body();
        assert_eq!(compute.wait_for.as_ref().unwrap().value(), tickets.copy.value());
        assert_eq!(compute.signal.as_ref().unwrap().value(), tickets.compute.value());
        assert_eq!(compute.frame_counter, 3);
    }
}
