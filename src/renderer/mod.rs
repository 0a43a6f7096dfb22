//! # Renderer
//!
//! Turns the worlds of one simulation frame into GPU work, pipelined over the
//! [`FrameSlotRing`] so the CPU builds frame N+1 while the GPU executes frame N.
//!
//! ## Frame Stages
//! On the main thread, inside the frame's slot:
//!
//! 1. `begin_render`: wait for the slot's previous cycle to retire
//! 2. `capture`: fill resource tables and draw lists from the worlds
//! 3. `resource_update`: grow buffers, stage meshes, pack the copy task
//! 4. record pass inputs and reserve the cycle's fence values
//!
//! Then, inline or on the render thread ([`FrameSubmission::run`]):
//!
//! 5. submit the copy task (signals copy done on the copy queue)
//! 6. submit the compute task (waits for copy done, signals skinning done)
//! 7. submit shadow and forward pass tasks as two batches
//! 8. direct queue waits for skinning done, then executes every shadow pass, then
//!    every forward pass, then the present blit, and signals frame done
//! 9. present
//!
//! Every CPU stage is reported to the optional [`Timeline`].
//!
//! ## Errors
//! Build failures (a buffer or target that cannot be created) abort the frame before
//! any fence value is reserved, so the slot stays reusable. A lost device at present
//! is logged and returned as `EngineError::DeviceLost`; in render-thread mode it
//! surfaces at the next frame that reuses the slot, or at [`Renderer::flush`].
//! A copy or pass task that fails after the fence values are reserved still lets the
//! frame signal its fences, but the frame is not presented and the first failure is
//! returned as `EngineError::Gpu` the same way.

pub mod draw_list;
pub mod frame_slot;
pub mod graph_builder;
pub mod render_thread;
pub mod resource_table;
pub mod tasks;
pub mod viewport;

use std::{sync::Arc, time::Duration};

use log::{debug, error, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use web_time::Instant;

use crate::{
    errors::{EngineError, Result},
    fatal,
    gpu::{
        pipeline_cache::DEFAULT_PIPELINE_CACHE_CAPACITY, timeline::Timeline, CommandList, GpuDevice, GpuError,
        PipelineStateCache, QueueKind,
    },
    scene::{assets::AssetStore, world::World},
    task_management::{
        task::{wait_all, TaskHandle},
        ThreadPool,
    },
};

use frame_slot::{CycleTickets, FrameSlot, FrameSlotRing, FRAME_COUNT};
use graph_builder::{CaptureOptions, CaptureStats, UploadStats};
use render_thread::RenderThread;
use resource_table::TableLimits;
use tasks::RenderPassTask;

/// Renderer switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Present with vertical sync.
    pub vsync: bool,
    /// Run frame tasks on the thread pool instead of inline.
    pub async_tasks: bool,
    /// Submit frames from a dedicated render thread.
    pub render_thread: bool,
    /// Cull draws outside each view's frustum.
    pub frustum_culling: bool,
    /// Capacities of every slot's resource tables.
    pub limits: TableLimits,
    /// Pipeline states kept alive by the pipeline cache.
    pub pipeline_cache_capacity: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            async_tasks: true,
            render_thread: true,
            frustum_culling: true,
            limits: TableLimits::default(),
            pipeline_cache_capacity: DEFAULT_PIPELINE_CACHE_CAPACITY,
        }
    }
}

/// What one `render_frame` call did.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub frame_counter: u64,
    /// Slot the frame was built in.
    pub slot: usize,
    pub delta_time: f32,
    pub views: usize,
    pub lights: usize,
    pub draws: usize,
    pub skinned_dispatches: usize,
    pub shadow_passes: usize,
    pub forward_passes: usize,
    /// Draws rejected by frustum culling.
    pub culled: usize,
    pub bytes_uploaded: u64,
    /// Fence value that retires the frame.
    pub fence_value: u64,
    /// Time spent waiting for the slot to drain.
    pub wait_time: Duration,
    /// Main-thread time of the call, including the wait.
    pub cpu_time: Duration,
    /// Back buffer after present; `None` when the render thread presents.
    pub back_buffer_index: Option<u32>,
}

/// What submitting one frame did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitReport {
    pub bytes_copied: u64,
    pub dispatches: usize,
    pub pipeline_switches: usize,
    pub back_buffer_index: u32,
}

/// The GPU half of a frame, runnable on any thread.
///
/// Holds the slot by `Arc` and locks it for the duration of the submission.
pub struct FrameSubmission {
    pool: Arc<ThreadPool>,
    device: Arc<dyn GpuDevice>,
    slot: Arc<Mutex<FrameSlot>>,
    timeline: Option<Arc<Timeline>>,
    frame_counter: u64,
    vsync: bool,
    asynchronous: bool,
    shadow_passes: usize,
    forward_passes: usize,
}

impl FrameSubmission {
    fn stage(&self, stage: &str) {
        if let Some(timeline) = &self.timeline {
            timeline.cpu(stage, self.frame_counter);
        }
    }

    /// Submits the slot's tasks and passes in stage order and presents.
    ///
    /// # Errors
    /// `EngineError::DeviceLost` when present reports a lost device, `EngineError::Gpu`
    /// for any other present failure or when the copy task or a pass task failed, in
    /// which case the frame is not presented. The frame's fence value is signalled
    /// either way.
    pub fn run(self) -> Result<SubmitReport> {
        let mut slot = self.slot.lock();
        let Some(tickets) = slot.tickets().cloned() else {
            fatal!("frame {} submitted without reserved fence values", self.frame_counter);
        };
        let gate = slot.gate().clone();
        let shadow_tasks = &slot.shadow_tasks[..self.shadow_passes];
        let forward_tasks = &slot.forward_tasks[..self.forward_passes];

        self.stage("copy_submit");
        self.pool
            .submit_or_execute_task(&slot.copy_task, self.asynchronous);

        self.stage("compute_submit");
        self.pool
            .submit_or_execute_task(&slot.compute_task, self.asynchronous);

        self.pool.submit_or_execute(shadow_tasks, self.asynchronous);
        self.pool.submit_or_execute(forward_tasks, self.asynchronous);

        gate.gpu_wait(QueueKind::Direct, &tickets.compute);

        let mut report = SubmitReport::default();
        let mut failure = None;
        self.stage("shadow_submit");
        wait_all(shadow_tasks);
        report.pipeline_switches += self.execute_passes(shadow_tasks, &mut failure);

        self.stage("forward_submit");
        wait_all(forward_tasks);
        report.pipeline_switches += self.execute_passes(forward_tasks, &mut failure);

        self.stage("present");
        let mut present = CommandList::new(format!("present {}", self.frame_counter));
        if let Some(viewport) = slot.viewports.first() {
            present.blit(viewport.target.color, self.device.back_buffer());
        }
        gate.submit_signaling(QueueKind::Direct, present, &tickets.frame);

        slot.copy_task.wait();
        slot.compute_task.wait();
        {
            let mut copy = slot.copy_task.body_mut();
            report.bytes_copied = copy.bytes_copied;
            if let Some(err) = copy.error.take() {
                failure = Some(err);
            }
        }
        report.dispatches = slot.compute_task.body().dispatched;
        slot.mark_submitted();
        drop(slot);

        if let Some(err) = failure {
            error!("Frame {} not presented: {}", self.frame_counter, err);
            return Err(err.into());
        }
        report.back_buffer_index = present_frame(self.device.as_ref(), self.vsync, self.frame_counter)?;
        Ok(report)
    }

    /// Executes the recorded lists; the first task error lands in `failure`.
    fn execute_passes(&self, passes: &[TaskHandle<RenderPassTask>], failure: &mut Option<GpuError>) -> usize {
        let mut switches = 0;
        for task in passes {
            let mut body = task.body_mut();
            switches += body.pipeline_switches;
            if let Some(err) = body.error.take() {
                failure.get_or_insert(err);
            }
            if let Some(list) = body.list.take() {
                self.device.execute(QueueKind::Direct, list);
            }
        }
        switches
    }
}

fn present_frame(device: &dyn GpuDevice, vsync: bool, frame_counter: u64) -> Result<u32> {
    match device.present(vsync) {
        Ok(index) => Ok(index),
        Err(GpuError::DeviceLost) => {
            error!("GPU device lost while presenting frame {}", frame_counter);
            Err(EngineError::DeviceLost)
        }
        Err(err) => {
            error!("Present of frame {} failed: {}", frame_counter, err);
            Err(err.into())
        }
    }
}

/// Owner of the frame slot ring, the pipeline cache and the render thread.
pub struct Renderer {
    device: Arc<dyn GpuDevice>,
    config: RendererConfig,
    ring: FrameSlotRing,
    pipelines: Arc<PipelineStateCache>,
    render_thread: Option<RenderThread>,
    timeline: Option<Arc<Timeline>>,
    frames: u64,
}

impl Renderer {
    /// Creates the slot ring and, if configured, starts the render thread.
    ///
    /// # Errors
    /// Returns `EngineError::Io` if the render thread cannot be spawned.
    pub fn new(device: Arc<dyn GpuDevice>, config: RendererConfig) -> Result<Self> {
        let render_thread = if config.render_thread {
            Some(RenderThread::spawn(FRAME_COUNT)?)
        } else {
            None
        };
        info!(
            "Renderer on '{}': {} frame slots, render thread {}, {} tasks",
            device.backend_name(),
            FRAME_COUNT,
            if render_thread.is_some() { "on" } else { "off" },
            if config.async_tasks { "async" } else { "inline" }
        );

        Ok(Self {
            ring: FrameSlotRing::new(device.clone(), config.limits),
            pipelines: Arc::new(PipelineStateCache::new(device.clone(), config.pipeline_cache_capacity)),
            device,
            config,
            render_thread,
            timeline: None,
            frames: 0,
        })
    }

    /// Reports CPU stages to `timeline`.
    pub fn with_timeline(mut self, timeline: Arc<Timeline>) -> Self {
        self.set_timeline(Some(timeline));
        self
    }

    pub fn set_timeline(&mut self, timeline: Option<Arc<Timeline>>) {
        self.timeline = timeline;
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn ring(&self) -> &FrameSlotRing {
        &self.ring
    }

    pub fn pipelines(&self) -> &Arc<PipelineStateCache> {
        &self.pipelines
    }

    /// Frames handed to the GPU so far.
    pub fn frames_rendered(&self) -> u64 {
        self.frames
    }

    /// `true` when frames are submitted from the render thread.
    pub fn has_render_thread(&self) -> bool {
        self.render_thread.is_some()
    }

    fn stage(&self, stage: &str, frame_counter: u64) {
        if let Some(timeline) = &self.timeline {
            timeline.cpu(stage, frame_counter);
        }
    }

    /// Builds frame `frame_counter` from `worlds` and submits it.
    ///
    /// Frame counters must be consecutive: each maps to slot `frame_counter % 3`, and
    /// the render thread visits slots in ring order. Animation tasks writing the
    /// poses must have been joined before the call.
    ///
    /// # Errors
    /// - `EngineError::Gpu` when building the frame fails; nothing was submitted
    /// - `EngineError::DeviceLost` or `EngineError::Gpu` from present (inline mode) or
    ///   from the previous submission in this slot (render-thread mode)
    pub fn render_frame(
        &mut self,
        pool: &Arc<ThreadPool>,
        frame_counter: u64,
        delta_time: f32,
        worlds: &[&World],
        assets: &AssetStore,
    ) -> Result<FrameReport> {
        let cpu_start = Instant::now();
        let slot_index = FrameSlotRing::index_for(frame_counter);

        if let Some(thread) = &mut self.render_thread {
            if let Err(err) = thread.wait_frame(slot_index) {
                thread.kick(slot_index, Box::new(|| Ok(())));
                return Err(err);
            }
        }

        let slot_handle = self.ring.slot(slot_index).clone();
        let mut slot = slot_handle.lock();

        let wait_start = Instant::now();
        slot.begin_render();
        let wait_time = wait_start.elapsed();

        let built = self.build_frame(&mut slot, frame_counter, worlds, assets);
        let (capture, upload, tickets) = match built {
            Ok(built) => built,
            Err(err) => {
                error!("Building frame {} failed: {}", frame_counter, err);
                drop(slot);
                if let Some(thread) = &mut self.render_thread {
                    thread.kick(slot_index, Box::new(|| Ok(())));
                }
                return Err(err.into());
            }
        };
        drop(slot);

        let submission = FrameSubmission {
            pool: pool.clone(),
            device: self.device.clone(),
            slot: slot_handle,
            timeline: self.timeline.clone(),
            frame_counter,
            vsync: self.config.vsync,
            asynchronous: self.config.async_tasks,
            shadow_passes: capture.shadow_passes,
            forward_passes: capture.forward_passes,
        };

        let back_buffer_index = match &mut self.render_thread {
            Some(thread) => {
                thread.kick(slot_index, Box::new(move || submission.run().map(|_| ())));
                None
            }
            None => Some(submission.run()?.back_buffer_index),
        };
        self.frames += 1;

        let report = FrameReport {
            frame_counter,
            slot: slot_index,
            delta_time,
            views: capture.views,
            lights: capture.lights,
            draws: capture.draws,
            skinned_dispatches: upload.dispatches,
            shadow_passes: capture.shadow_passes,
            forward_passes: capture.forward_passes,
            culled: capture.culled,
            bytes_uploaded: upload.bytes,
            fence_value: tickets.frame.value(),
            wait_time,
            cpu_time: cpu_start.elapsed(),
            back_buffer_index,
        };
        debug!(
            "Frame {} (slot {}): {} draws, {} culled, {} shadow passes, {} bytes uploaded",
            frame_counter, slot_index, report.draws, report.culled, report.shadow_passes, report.bytes_uploaded
        );
        Ok(report)
    }

    fn build_frame(
        &self,
        slot: &mut FrameSlot,
        frame_counter: u64,
        worlds: &[&World],
        assets: &AssetStore,
    ) -> std::result::Result<(CaptureStats, UploadStats, CycleTickets), GpuError> {
        let options = CaptureOptions {
            frustum_culling: self.config.frustum_culling,
        };

        self.stage("capture", frame_counter);
        let capture = graph_builder::capture(slot, self.device.as_ref(), worlds, assets, &options)?;

        self.stage("resource_update", frame_counter);
        let (tables, upload) = graph_builder::update_resources(slot, self.device.as_ref(), assets)?;
        graph_builder::record_passes(slot, &tables, &self.pipelines, frame_counter);

        let tickets = slot.reserve_cycle();
        graph_builder::assign_tickets(slot, &tickets, frame_counter);
        Ok((capture, upload, tickets))
    }

    /// Waits until every submitted frame retired on the GPU.
    ///
    /// # Errors
    /// The first error among the render thread's outstanding submissions.
    pub fn flush(&mut self) -> Result<()> {
        let result = match &self.render_thread {
            Some(thread) => thread.flush(),
            None => Ok(()),
        };
        self.ring.drain();
        result
    }

    /// Flushes and stops the render thread. Idempotent.
    ///
    /// # Errors
    /// See [`flush`](Self::flush).
    pub fn shutdown(&mut self) -> Result<()> {
        let result = self.flush();
        if let Some(mut thread) = self.render_thread.take() {
            thread.shutdown();
        }
        result
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!("Renderer shut down with a pending error: {}", err);
        }
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("backend", &self.device.backend_name())
            .field("config", &self.config)
            .field("frames", &self.frames)
            .field("render_thread", &self.render_thread)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gpu::software::SoftwareGpu,
        scene::{
            assets::Material,
            demo::cube_mesh,
            transform::Transform,
            world::{CameraComponent, Entity, LightComponent, LightKind, MeshComponent, ViewportDesc},
        },
    };
    use cgmath::Vector3;

    fn world(assets: &mut AssetStore) -> World {
        let mut world = World::new("renderer test");
        let cube = assets.add_mesh(cube_mesh("cube", 0.5));
        let material = assets.add_material(Material::default());
        world.spawn(
            Entity::new("cube")
                .with_transform(Transform::from_translation(Vector3::new(0.0, 0.0, -4.0)))
                .with_mesh(MeshComponent::new(cube, material)),
        );
        world.spawn(Entity::new("lamp").with_light(LightComponent::new(LightKind::Point)));
        let camera = world.spawn(Entity::new("camera").with_camera(CameraComponent::default()));
        world.add_viewport(ViewportDesc::new(camera, 32, 32));
        world
    }

    fn config(render_thread: bool) -> RendererConfig {
        RendererConfig {
            vsync: false,
            render_thread,
            ..RendererConfig::default()
        }
    }

    #[test]
    fn inline_frames_present_and_report() {
        let device = Arc::new(SoftwareGpu::new());
        let pool = Arc::new(ThreadPool::with_workers(2));
        let mut assets = AssetStore::new();
        let world = world(&mut assets);
        let mut renderer = Renderer::new(device.clone(), config(false)).unwrap();

        for frame in 0..4 {
            let report = renderer.render_frame(&pool, frame, 0.016, &[&world], &assets).unwrap();
            assert_eq!(report.slot, frame as usize % FRAME_COUNT);
            assert_eq!(report.shadow_passes, 6);
            assert_eq!(report.forward_passes, 1);
            assert!(report.back_buffer_index.is_some());
        }
        renderer.flush().unwrap();

        assert_eq!(device.presented_frames(), 4);
        assert_eq!(renderer.frames_rendered(), 4);
        assert!(renderer.ring().slot(0).lock().is_drained());
        // Slot 0 ran two cycles of three fence values each.
        assert_eq!(renderer.ring().slot(0).lock().fence_value(), 6);
    }

    #[test]
    fn render_thread_frames_drain_on_flush() {
        let device = Arc::new(SoftwareGpu::new());
        let pool = Arc::new(ThreadPool::with_workers(2));
        let mut assets = AssetStore::new();
        let world = world(&mut assets);
        let mut renderer = Renderer::new(device.clone(), config(true)).unwrap();
        assert!(renderer.has_render_thread());

        for frame in 0..5 {
            let report = renderer.render_frame(&pool, frame, 0.016, &[&world], &assets).unwrap();
            assert!(report.back_buffer_index.is_none());
        }
        renderer.flush().unwrap();
        assert_eq!(device.presented_frames(), 5);
        renderer.shutdown().unwrap();
    }

    #[test]
    fn lost_device_is_returned_to_the_caller() {
        let device = Arc::new(SoftwareGpu::new());
        let pool = Arc::new(ThreadPool::with_workers(1));
        let mut assets = AssetStore::new();
        let world = world(&mut assets);
        let mut renderer = Renderer::new(device.clone(), config(false)).unwrap();

        device.fail_next_present();
        let result = renderer.render_frame(&pool, 0, 0.016, &[&world], &assets);
        assert!(matches!(result, Err(EngineError::DeviceLost)));

        // The frame's fence value was still signalled, so the ring drains.
        renderer.flush().unwrap();
    }
}
