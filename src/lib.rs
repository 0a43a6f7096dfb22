#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rustdoc::invalid_rust_codeblocks)]

//! # Frame Engine
//!
//! A frame-parallel task scheduling core for a real-time renderer: a fixed-size worker
//! pool running short-lived tasks, a triple-buffered frame slot ring gated by GPU
//! fences, and a render graph whose stages submit to separate copy, compute and direct
//! queues in a fixed order.
//!
//! ## Key Modules
//!
//! * `task_management` - Tasks, their `Idle/Running/Done` state and the thread pool
//! * `gpu` - The GPU service boundary: fences, command lists, queues, backends
//! * `renderer` - Frame slots, resource tables, render graph stages, render thread
//! * `scene` - Worlds, assets and the round-robin animation subsystem
//! * `engine` - The application object tying the above together
//! * `config` - JSON configuration file and command-line flags
//! * `errors` - Error types and the fatal path
//!
//! ## Frame Pipeline
//!
//! Each simulation frame fans animation out over the pool, joins it, then builds the
//! frame in slot `frame % 3` while the GPU may still be executing the two frames
//! before it. GPU work of a frame is ordered copy → compute (skinning) → shadow →
//! forward → present, chained through one fence per slot.
//!
//! ## Usage
//!
//! ```no_run
//! fn main() -> std::process::ExitCode {
//!     frame_engine::run()
//! }
//! ```

use std::{process::ExitCode, time::Duration};

use log::{error, info};
use web_time::Instant;

pub mod config;
pub mod core;
pub mod engine;
pub mod errors;
pub mod gpu;
pub mod renderer;
pub mod scene;
pub mod task_management;

use config::{CommandLine, EngineConfig};
use engine::Engine;
use errors::{EngineError, Result, EXIT_CODE_DEVICE_LOST};

/// Runs the demo scene with settings from the command line.
///
/// Returns the process exit code: success, [`EXIT_CODE_DEVICE_LOST`] when the GPU
/// device was lost, failure for any other error.
pub fn run() -> ExitCode {
    let mut log_builder = env_logger::Builder::new();
    log_builder
        .target(env_logger::Target::Stdout)
        .parse_env("RUST_LOG")
        .init();
    errors::install_fatal_hook();
    info!("Logger initialized");

    let result = CommandLine::parse(std::env::args())
        .and_then(|command_line| EngineConfig::from_command_line(&command_line))
        .and_then(run_engine);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(EngineError::DeviceLost) => {
            error!("Exiting: GPU device lost");
            ExitCode::from(EXIT_CODE_DEVICE_LOST)
        }
        Err(err) => {
            error!("Exiting: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run_engine(config: EngineConfig) -> Result<()> {
    info!("Configuration: {:?}", config);
    let mut engine = Engine::from_config(config)?;
    engine.load_demo_scene()?;

    let result = frame_loop(&mut engine);
    let shutdown = engine.shutdown();
    result.and(shutdown)
}

/// Per-second frame statistics.
#[derive(Debug, Default)]
struct FrameStats {
    frames: u32,
    draws: usize,
    culled: usize,
    cpu_time: Duration,
    wait_time: Duration,
}

impl FrameStats {
    fn log(&self, elapsed: Duration) {
        let frames = self.frames.max(1);
        info!(
            "{:.1} fps | cpu {:.2} ms | slot wait {:.2} ms | {} draws, {} culled per frame",
            self.frames as f32 / elapsed.as_secs_f32(),
            self.cpu_time.as_secs_f32() * 1000.0 / frames as f32,
            self.wait_time.as_secs_f32() * 1000.0 / frames as f32,
            self.draws / frames as usize,
            self.culled / frames as usize,
        );
    }
}

fn frame_loop(engine: &mut Engine) -> Result<()> {
    let limit = engine.config().frame_count;
    let start = Instant::now();
    let mut last_frame = start;
    let mut window_start = start;
    let mut stats = FrameStats::default();

    while limit.is_none_or(|limit| engine.frame_counter() < limit) {
        let now = Instant::now();
        let delta_time = now.duration_since(last_frame).as_secs_f32();
        last_frame = now;

        let report = engine.tick(delta_time)?;
        stats.frames += 1;
        stats.draws += report.draws;
        stats.culled += report.culled;
        stats.cpu_time += report.cpu_time;
        stats.wait_time += report.wait_time;

        let elapsed = window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            stats.log(elapsed);
            stats = FrameStats::default();
            window_start = Instant::now();
        }
    }

    engine.flush()?;
    info!(
        "Rendered {} frames in {:.2}s",
        engine.frame_counter(),
        start.elapsed().as_secs_f32()
    );
    Ok(())
}
