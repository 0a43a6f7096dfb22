//! # Engine
//!
//! The top-level object of an application: one [`ThreadPool`], one [`Renderer`], the
//! asset store and any number of worlds, each with its own animation subsystem.
//!
//! A tick is one simulation frame:
//!
//! 1. every world's animation subsystem deals its entities to the task array
//! 2. all animation batches are joined (the renderer reads the poses they write)
//! 3. the renderer builds and submits the frame
//!
//! ```no_run
//! use frame_engine::{config::EngineConfig, engine::Engine};
//!
//! let mut engine = Engine::from_config(EngineConfig::default()).unwrap();
//! engine.load_demo_scene().unwrap();
//! for _ in 0..10 {
//!     engine.tick(1.0 / 60.0).unwrap();
//! }
//! engine.shutdown().unwrap();
//! ```

use std::sync::Arc;

use log::{error, info};

use crate::{
    config::{Backend, EngineConfig},
    errors::Result,
    gpu::{
        software::SoftwareGpu,
        timeline::Timeline,
        wgpu_backend::{WgpuGpu, WgpuGpuOptions},
        GpuDevice,
    },
    renderer::{FrameReport, Renderer},
    scene::{
        animation::AnimationSubsystem,
        assets::AssetStore,
        demo::{self, DemoScene},
        world::World,
    },
    task_management::ThreadPool,
};

/// Index of a world owned by the engine.
pub type WorldIndex = usize;

pub struct Engine {
    config: EngineConfig,
    renderer: Renderer,
    pool: Arc<ThreadPool>,
    worlds: Vec<World>,
    animation: Vec<AnimationSubsystem>,
    assets: AssetStore,
    frame_counter: u64,
}

impl Engine {
    /// Creates an engine on `device`. Pool workers are only spawned for async tasks.
    ///
    /// # Errors
    /// `EngineError::Config` for invalid settings, `EngineError::Io` if the render
    /// thread cannot be started.
    pub fn new(config: EngineConfig, device: Arc<dyn GpuDevice>) -> Result<Self> {
        let pool = Arc::new(ThreadPool::new());
        if config.async_tasks {
            pool.initialize(config.dedicated_threads());
        }
        Self::with_pool(config, device, pool)
    }

    /// Creates an engine sharing an existing pool.
    ///
    /// # Errors
    /// See [`new`](Self::new).
    pub fn with_pool(config: EngineConfig, device: Arc<dyn GpuDevice>, pool: Arc<ThreadPool>) -> Result<Self> {
        config.validate()?;
        let renderer = Renderer::new(device, config.renderer_config())?;
        info!(
            "Engine ready: {} pool workers, {} animation tasks per world",
            pool.worker_count(),
            config.animation_tasks
        );
        Ok(Self {
            config,
            renderer,
            pool,
            worlds: Vec::new(),
            animation: Vec::new(),
            assets: AssetStore::new(),
            frame_counter: 0,
        })
    }

    /// Creates the configured backend, then the engine on it.
    ///
    /// # Errors
    /// `EngineError::Gpu` if the wgpu device cannot be created, plus those of
    /// [`new`](Self::new).
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let device: Arc<dyn GpuDevice> = match config.backend {
            Backend::Software => Arc::new(SoftwareGpu::new()),
            Backend::Wgpu => Arc::new(WgpuGpu::new(WgpuGpuOptions {
                width: config.width,
                height: config.height,
            })?),
        };
        Self::new(config, device)
    }

    /// Reports the renderer's CPU stages to `timeline`.
    pub fn set_timeline(&mut self, timeline: Arc<Timeline>) {
        self.renderer.set_timeline(Some(timeline));
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    /// Counter of the next frame.
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn assets(&self) -> &AssetStore {
        &self.assets
    }

    pub fn assets_mut(&mut self) -> &mut AssetStore {
        &mut self.assets
    }

    /// Adds a world with its own animation subsystem.
    pub fn add_world(&mut self, world: World) -> WorldIndex {
        self.worlds.push(world);
        self.animation
            .push(AnimationSubsystem::new(self.config.animation_tasks));
        self.worlds.len() - 1
    }

    pub fn world(&self, index: WorldIndex) -> Option<&World> {
        self.worlds.get(index)
    }

    /// Mutable access to a world. Joins its animation batch first.
    pub fn world_mut(&mut self, index: WorldIndex) -> Option<&mut World> {
        if let Some(animation) = self.animation.get(index) {
            animation.wait_all();
        }
        self.worlds.get_mut(index)
    }

    pub fn world_count(&self) -> usize {
        self.worlds.len()
    }

    /// The animation subsystem of a world.
    pub fn animation(&self, index: WorldIndex) -> Option<&AnimationSubsystem> {
        self.animation.get(index)
    }

    /// Builds the demo scene into a new world.
    ///
    /// # Errors
    /// `EngineError::Import` if the embedded model fails to import.
    pub fn load_demo_scene(&mut self) -> Result<(WorldIndex, DemoScene)> {
        let mut world = World::new("demo");
        let scene = demo::build(
            &self.pool,
            &mut world,
            &mut self.assets,
            &self.config.scene,
            self.config.width,
            self.config.height,
        )?;
        Ok((self.add_world(world), scene))
    }

    /// Runs one simulation frame: animation, then rendering.
    ///
    /// The frame counter advances even when rendering fails, so the next tick uses
    /// the next frame slot.
    ///
    /// # Errors
    /// Whatever [`Renderer::render_frame`] returns.
    pub fn tick(&mut self, delta_time: f32) -> Result<FrameReport> {
        for (world, animation) in self.worlds.iter().zip(&mut self.animation) {
            animation.tick(&self.pool, world, &self.assets, delta_time, self.config.async_tasks);
        }
        for animation in &self.animation {
            animation.wait_all();
        }

        let frame_counter = self.frame_counter;
        self.frame_counter += 1;

        let worlds: Vec<&World> = self.worlds.iter().collect();
        self.renderer
            .render_frame(&self.pool, frame_counter, delta_time, &worlds, &self.assets)
    }

    /// Waits for every submitted frame to retire.
    ///
    /// # Errors
    /// See [`Renderer::flush`].
    pub fn flush(&mut self) -> Result<()> {
        self.renderer.flush()
    }

    /// Joins outstanding work, stops the render thread and the pool. Idempotent.
    ///
    /// # Errors
    /// The first error among the frames still in flight.
    pub fn shutdown(&mut self) -> Result<()> {
        for animation in &self.animation {
            animation.wait_all();
        }
        let result = self.renderer.shutdown();
        self.pool.shutdown();
        result
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!("Engine shut down with a pending error: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::demo::DemoSceneConfig;

    fn config(async_tasks: bool, render_thread: bool) -> EngineConfig {
        EngineConfig {
            vsync: false,
            async_tasks,
            render_thread,
            scene: DemoSceneConfig {
                cubes: 6,
                pyramids: 1,
                tentacles: 3,
                seed: 11,
            },
            width: 64,
            height: 48,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn demo_scene_renders_in_every_mode() {
        for (async_tasks, render_thread) in [(false, false), (true, false), (true, true)] {
            let device = Arc::new(SoftwareGpu::new());
            let mut engine = Engine::new(config(async_tasks, render_thread), device.clone()).unwrap();
            let (index, scene) = engine.load_demo_scene().unwrap();
            assert_eq!(scene.animated.len(), 3);

            for _ in 0..5 {
                let report = engine.tick(1.0 / 60.0).unwrap();
                assert_eq!(report.skinned_dispatches, 3);
                assert_eq!(report.forward_passes, 1);
            }
            engine.flush().unwrap();

            assert_eq!(engine.frame_counter(), 5);
            assert_eq!(device.presented_frames(), 5);
            assert_eq!(engine.animation(index).unwrap().ticks(), 5);
            engine.shutdown().unwrap();
        }
    }

    #[test]
    fn worlds_get_their_own_animation_subsystem() {
        let mut engine = Engine::new(config(false, false), Arc::new(SoftwareGpu::new())).unwrap();
        let first = engine.add_world(World::new("a"));
        let second = engine.add_world(World::new("b"));
        assert_ne!(first, second);
        assert_eq!(engine.world_count(), 2);
        assert_eq!(
            engine.animation(second).unwrap().task_count(),
            engine.config().animation_tasks
        );
        assert!(engine.world_mut(first).is_some());
    }
}
