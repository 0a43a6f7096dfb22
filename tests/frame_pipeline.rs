//! Frame slot reuse, stage ordering and present failures, driven through the public
//! renderer and engine API on the software GPU.

use std::{sync::Arc, time::Duration};

use cgmath::Vector3;
use frame_engine::{
    config::EngineConfig,
    engine::Engine,
    errors::EngineError,
    gpu::{
        layout::{GpuLight, GpuView},
        software::SoftwareGpu,
        timeline::{Timeline, TimelineEventKind},
        GpuError, QueueKind,
    },
    renderer::{
        frame_slot::{SlotState, FRAME_COUNT},
        resource_table::{FrameResourceTable, ResourceTag, TableLimits},
        Renderer, RendererConfig,
    },
    scene::{
        assets::{AssetStore, Material},
        demo::{cube_mesh, DemoSceneConfig},
        transform::Transform,
        world::{CameraComponent, Entity, EntityId, LightComponent, LightKind, MeshComponent, ViewportDesc, World, WorldId},
    },
    task_management::ThreadPool,
};

fn small_world(assets: &mut AssetStore) -> World {
    let mut world = World::new("pipeline");
    let cube = assets.add_mesh(cube_mesh("cube", 0.5));
    let material = assets.add_material(Material::default());
    for index in 0..3 {
        world.spawn(
            Entity::new(format!("cube_{}", index))
                .with_transform(Transform::from_translation(Vector3::new(index as f32 - 1.0, 0.0, -5.0)))
                .with_mesh(MeshComponent::new(cube, material)),
        );
    }
    world.spawn(Entity::new("sun").with_light(LightComponent::new(LightKind::Directional)));
    let camera = world.spawn(Entity::new("camera").with_camera(CameraComponent::default()));
    world.add_viewport(ViewportDesc::new(camera, 32, 32));
    world
}

fn engine_config(async_tasks: bool, render_thread: bool) -> EngineConfig {
    EngineConfig {
        vsync: false,
        async_tasks,
        render_thread,
        width: 64,
        height: 48,
        scene: DemoSceneConfig {
            cubes: 4,
            pyramids: 1,
            tentacles: 2,
            seed: 3,
        },
        ..EngineConfig::default()
    }
}

#[test]
fn slot_reuse_waits_for_the_gpu() {
    let device = Arc::new(SoftwareGpu::new());
    let pool = Arc::new(ThreadPool::with_workers(2));
    let mut assets = AssetStore::new();
    let world = small_world(&mut assets);
    let config = RendererConfig {
        vsync: false,
        render_thread: false,
        ..RendererConfig::default()
    };
    let mut renderer = Renderer::new(device.clone(), config).unwrap();

    // The direct queue signals the frame value, so nothing retires while it is paused.
    device.pause(QueueKind::Direct);
    for frame in 0..FRAME_COUNT as u64 {
        renderer.render_frame(&pool, frame, 0.016, &[&world], &assets).unwrap();
    }

    {
        let mut slot = renderer.ring().slot(0).lock();
        assert_eq!(slot.state(), SlotState::Submitted);
        assert!(!slot.is_drained());
        assert!(!slot.begin_render_timeout(Duration::from_millis(50)));
        assert_eq!(slot.state(), SlotState::Submitted);
    }

    device.resume(QueueKind::Direct);
    let report = renderer
        .render_frame(&pool, FRAME_COUNT as u64, 0.016, &[&world], &assets)
        .unwrap();
    assert_eq!(report.slot, 0);
    assert_eq!(report.fence_value, 6);

    renderer.flush().unwrap();
    for index in 0..FRAME_COUNT {
        assert!(renderer.ring().slot(index).lock().is_drained());
    }
    assert_eq!(device.presented_frames(), 4);
}

#[test]
fn registration_is_idempotent_per_tag() {
    let mut table = FrameResourceTable::new(TableLimits::default());
    let world = WorldId(1);

    let camera = ResourceTag::entity(world, EntityId(4));
    let first = table.add_view(camera, GpuView::default());
    assert_eq!(table.add_view(camera, GpuView::default()), first);
    let other = table.add_view(ResourceTag::entity(world, EntityId(5)), GpuView::default());
    assert_ne!(other, first);
    assert_eq!(table.view_count(), 2);

    let lamp = ResourceTag::entity(world, EntityId(9));
    let light = table.add_light(lamp, GpuLight::default());
    assert_eq!(table.add_light(lamp, GpuLight::default()), light);
    assert_eq!(table.light_count(), 1);

    let transform = table.add_transform(lamp, cgmath::Matrix4::from_scale(2.0));
    assert_eq!(table.add_transform(lamp, cgmath::Matrix4::from_scale(3.0)), transform);
    assert_eq!(table.transforms().len(), 1);

    // A new frame starts from empty tables; ids are handed out from zero again.
    table.clear();
    assert_eq!(table.view_count(), 0);
    assert_eq!(table.add_view(ResourceTag::entity(world, EntityId(5)), GpuView::default()), first);
}

#[test]
fn stages_run_in_graph_order() {
    let timeline = Arc::new(Timeline::new());
    let device = Arc::new(SoftwareGpu::with_timeline(timeline.clone()));
    let mut engine = Engine::new(engine_config(true, false), device.clone()).unwrap();
    engine.set_timeline(timeline.clone());
    engine.load_demo_scene().unwrap();

    engine.tick(1.0 / 60.0).unwrap();
    engine.flush().unwrap();

    let cpu: Vec<u64> = [
        "capture",
        "resource_update",
        "copy_submit",
        "compute_submit",
        "shadow_submit",
        "forward_submit",
        "present",
    ]
    .iter()
    .map(|stage| timeline.first(TimelineEventKind::Cpu, stage).unwrap())
    .collect();
    assert!(cpu.windows(2).all(|pair| pair[0] < pair[1]), "cpu stages out of order: {:?}", cpu);

    let executed = |prefix: &str| timeline.first(TimelineEventKind::Executed, prefix).unwrap();
    let last_executed = |prefix: &str| timeline.last(TimelineEventKind::Executed, prefix).unwrap();
    assert!(executed("copy") < executed("skinning"));
    assert!(executed("skinning") < executed("shadow"));
    assert!(last_executed("shadow") < executed("forward"));
    assert!(last_executed("forward") < executed("present"));

    let presented = timeline.first(TimelineEventKind::Presented, "present").unwrap();
    assert!(cpu[6] < presented);

    // Slot 0 reserves copy 1, skinning 2 and frame 3; every wait follows its signal.
    let fence_event = |kind: TimelineEventKind, value: u64| {
        timeline
            .matching(kind, "frame slot 0")
            .into_iter()
            .find(|event| event.value == value)
            .unwrap_or_else(|| panic!("no {:?} event for value {}", kind, value))
    };
    let copy_done = fence_event(TimelineEventKind::Signaled, 1);
    let compute_waited = fence_event(TimelineEventKind::WaitSatisfied, 1);
    let compute_done = fence_event(TimelineEventKind::Signaled, 2);
    let direct_waited = fence_event(TimelineEventKind::WaitSatisfied, 2);
    let frame_done = fence_event(TimelineEventKind::Signaled, 3);
    assert_eq!(copy_done.queue, Some(QueueKind::Copy));
    assert_eq!(compute_waited.queue, Some(QueueKind::Compute));
    assert_eq!(compute_done.queue, Some(QueueKind::Compute));
    assert_eq!(direct_waited.queue, Some(QueueKind::Direct));
    assert_eq!(frame_done.queue, Some(QueueKind::Direct));
    assert!(copy_done.sequence < compute_waited.sequence);
    assert!(compute_waited.sequence < compute_done.sequence);
    assert!(compute_done.sequence < direct_waited.sequence);
    assert!(direct_waited.sequence < frame_done.sequence);
    assert!(executed("skinning") < compute_done.sequence);
    assert!(last_executed("forward") < frame_done.sequence);
}

#[test]
fn every_frame_signals_its_own_fence_value() {
    let device = Arc::new(SoftwareGpu::new());
    let mut engine = Engine::new(engine_config(true, true), device.clone()).unwrap();
    engine.load_demo_scene().unwrap();

    let mut values = Vec::new();
    for _ in 0..7 {
        let report = engine.tick(1.0 / 60.0).unwrap();
        values.push((report.slot, report.fence_value));
    }
    engine.flush().unwrap();

    // Three fence values per cycle, cycles counted per slot.
    assert_eq!(values, vec![(0, 3), (1, 3), (2, 3), (0, 6), (1, 6), (2, 6), (0, 9)]);
    assert_eq!(device.presented_frames(), 7);
    engine.shutdown().unwrap();
}

#[test]
fn lost_device_reaches_the_caller_inline() {
    let device = Arc::new(SoftwareGpu::new());
    let mut engine = Engine::new(engine_config(false, false), device.clone()).unwrap();
    engine.load_demo_scene().unwrap();

    engine.tick(1.0 / 60.0).unwrap();
    device.fail_next_present();
    assert!(matches!(engine.tick(1.0 / 60.0), Err(EngineError::DeviceLost)));

    // The failed frame still retired, so later frames and the flush go through.
    engine.tick(1.0 / 60.0).unwrap();
    engine.flush().unwrap();
    assert_eq!(engine.frame_counter(), 3);
    assert_eq!(device.presented_frames(), 2);
}

#[test]
fn failed_upload_skips_present_and_reaches_the_caller() {
    let device = Arc::new(SoftwareGpu::new());
    let mut engine = Engine::new(engine_config(true, false), device.clone()).unwrap();
    engine.load_demo_scene().unwrap();

    engine.tick(1.0 / 60.0).unwrap();
    device.fail_buffer_write("upload");
    assert!(matches!(
        engine.tick(1.0 / 60.0),
        Err(EngineError::Gpu(GpuError::MapFailed(_)))
    ));

    // The failed frame signalled its fences but was never presented.
    engine.tick(1.0 / 60.0).unwrap();
    engine.flush().unwrap();
    assert_eq!(engine.frame_counter(), 3);
    assert_eq!(device.presented_frames(), 2);
}

#[test]
fn failed_upload_surfaces_from_the_render_thread() {
    let device = Arc::new(SoftwareGpu::new());
    let mut engine = Engine::new(engine_config(true, true), device.clone()).unwrap();
    engine.load_demo_scene().unwrap();

    device.fail_buffer_write("upload");
    engine.tick(1.0 / 60.0).unwrap();
    assert!(matches!(engine.flush(), Err(EngineError::Gpu(GpuError::MapFailed(_)))));

    engine.tick(1.0 / 60.0).unwrap();
    engine.flush().unwrap();
    assert_eq!(device.presented_frames(), 1);
    engine.shutdown().unwrap();
}

#[test]
fn lost_device_surfaces_when_the_render_thread_slot_comes_around() {
    let device = Arc::new(SoftwareGpu::new());
    let mut engine = Engine::new(engine_config(true, true), device.clone()).unwrap();
    engine.load_demo_scene().unwrap();

    device.fail_next_present();
    for _ in 0..FRAME_COUNT {
        engine.tick(1.0 / 60.0).unwrap();
    }
    assert!(matches!(engine.tick(1.0 / 60.0), Err(EngineError::DeviceLost)));

    engine.tick(1.0 / 60.0).unwrap();
    engine.flush().unwrap();
    assert_eq!(device.presented_frames(), 3);
    engine.shutdown().unwrap();
}
