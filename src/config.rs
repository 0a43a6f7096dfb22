//! # Engine Configuration
//!
//! Settings come from two places, applied in order:
//!
//! 1. an optional JSON file (`-config PATH`), every field defaulted
//! 2. command-line flags, which override the file
//!
//! ## Flags
//! | Flag | Effect |
//! |---|---|
//! | `-novsync` | present without vertical sync |
//! | `-singlethreaded` | run every task inline on the submitting thread |
//! | `-norenderthread` | submit frames from the main thread |
//! | `-frames N` | stop after `N` frames |
//! | `-config PATH` | read settings from a JSON file |
//! | `-wgpu` | use the wgpu backend instead of the software GPU |
//!
//! Unknown flags are logged and ignored.

use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    errors::{EngineError, Result},
    renderer::{resource_table::TableLimits, RendererConfig},
    scene::{animation::ANIMATION_TASK_COUNT, demo::DemoSceneConfig},
};

/// GPU backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// CPU-executed GPU with one thread per queue.
    #[default]
    Software,
    /// Headless wgpu device.
    Wgpu,
}

/// Everything the engine can be configured with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub vsync: bool,
    /// Run tasks on the pool; `false` runs them inline.
    pub async_tasks: bool,
    pub render_thread: bool,
    /// Hardware threads kept free of pool workers for dedicated threads.
    pub reserved_threads: usize,
    /// Animation tasks per world.
    pub animation_tasks: usize,
    pub frustum_culling: bool,
    /// Frames the binary renders before exiting; `None` runs until interrupted.
    pub frame_count: Option<u64>,
    pub backend: Backend,
    /// Swap-chain size of the wgpu backend.
    pub width: u32,
    pub height: u32,
    pub limits: TableLimits,
    pub scene: DemoSceneConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            async_tasks: true,
            render_thread: true,
            reserved_threads: 1,
            animation_tasks: ANIMATION_TASK_COUNT,
            frustum_culling: true,
            frame_count: None,
            backend: Backend::Software,
            width: 1280,
            height: 720,
            limits: TableLimits::default(),
            scene: DemoSceneConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reads a configuration file.
    ///
    /// # Errors
    /// `EngineError::Io` if the file cannot be read, `EngineError::Json` if it does not
    /// parse, `EngineError::Config` if the values are unusable.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Rejects values the engine cannot run with.
    ///
    /// # Errors
    /// `EngineError::Config` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.animation_tasks == 0 {
            return Err(EngineError::Config(String::from("animation_tasks must be at least 1")));
        }
        if self.width == 0 || self.height == 0 {
            return Err(EngineError::Config(format!(
                "resolution {}x{} has a zero dimension",
                self.width, self.height
            )));
        }
        if self.limits.max_views == 0 || self.limits.max_lights == 0 {
            return Err(EngineError::Config(String::from("table limits must be non-zero")));
        }
        Ok(())
    }

    /// The renderer's share of the configuration.
    pub fn renderer_config(&self) -> RendererConfig {
        RendererConfig {
            vsync: self.vsync,
            async_tasks: self.async_tasks,
            render_thread: self.render_thread,
            frustum_culling: self.frustum_culling,
            limits: self.limits,
            ..RendererConfig::default()
        }
    }

    /// Dedicated threads the pool leaves room for: the configured reserve plus the
    /// render thread when it runs.
    pub fn dedicated_threads(&self) -> usize {
        self.reserved_threads + usize::from(self.render_thread)
    }

    /// Applies command-line overrides.
    pub fn apply(&mut self, command_line: &CommandLine) {
        if command_line.no_vsync {
            self.vsync = false;
        }
        if command_line.single_threaded {
            self.async_tasks = false;
        }
        if command_line.no_render_thread {
            self.render_thread = false;
        }
        if let Some(frames) = command_line.frames {
            self.frame_count = Some(frames);
        }
        if command_line.wgpu {
            self.backend = Backend::Wgpu;
        }
    }

    /// File configuration (if any) with the command line applied on top.
    ///
    /// # Errors
    /// See [`load`](Self::load).
    pub fn from_command_line(command_line: &CommandLine) -> Result<Self> {
        let mut config = match &command_line.config_path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply(command_line);
        config.validate()?;
        Ok(config)
    }
}

/// Parsed command-line flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLine {
    pub no_vsync: bool,
    pub single_threaded: bool,
    pub no_render_thread: bool,
    pub frames: Option<u64>,
    pub config_path: Option<PathBuf>,
    pub wgpu: bool,
}

impl CommandLine {
    /// Parses flags, skipping the program name if present.
    ///
    /// # Errors
    /// `EngineError::Config` when a flag is missing its value or the value is invalid.
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut command_line = Self::default();
        let mut args = args.into_iter().map(Into::into).peekable();
        if args.peek().is_some_and(|first| !first.starts_with('-')) {
            args.next();
        }

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-novsync" => command_line.no_vsync = true,
                "-singlethreaded" => command_line.single_threaded = true,
                "-norenderthread" => command_line.no_render_thread = true,
                "-wgpu" => command_line.wgpu = true,
                "-frames" => {
                    let value = args
                        .next()
                        .ok_or_else(|| EngineError::Config(String::from("-frames needs a value")))?;
                    let frames = value
                        .parse()
                        .map_err(|_| EngineError::Config(format!("-frames expects a number, got '{}'", value)))?;
                    command_line.frames = Some(frames);
                }
                "-config" => {
                    let value = args
                        .next()
                        .ok_or_else(|| EngineError::Config(String::from("-config needs a path")))?;
                    command_line.config_path = Some(PathBuf::from(value));
                }
                unknown => warn!("Ignoring unknown command-line flag '{}'", unknown),
            }
        }
        Ok(command_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let command_line = CommandLine::parse([
            "frame-engine",
            "-novsync",
            "-singlethreaded",
            "-frames",
            "120",
            "-bogus",
            "-norenderthread",
        ])
        .unwrap();
        assert_eq!(command_line.frames, Some(120));

        let mut config = EngineConfig::default();
        config.apply(&command_line);
        assert!(!config.vsync);
        assert!(!config.async_tasks);
        assert!(!config.render_thread);
        assert_eq!(config.frame_count, Some(120));
        assert_eq!(config.backend, Backend::Software);
        assert_eq!(config.dedicated_threads(), 1);
    }

    #[test]
    fn missing_or_bad_values_are_rejected() {
        assert!(matches!(CommandLine::parse(["-frames"]), Err(EngineError::Config(_))));
        assert!(matches!(
            CommandLine::parse(["-frames", "many"]),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(CommandLine::parse(["-config"]), Err(EngineError::Config(_))));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "vsync": false, "backend": "wgpu", "limits": { "max_lights": 8 } }"#).unwrap();
        assert!(!config.vsync);
        assert_eq!(config.backend, Backend::Wgpu);
        assert_eq!(config.limits.max_lights, 8);
        assert_eq!(config.limits.max_views, TableLimits::default().max_views);
        assert_eq!(config.animation_tasks, ANIMATION_TASK_COUNT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_is_loaded_before_flags() {
        let path = std::env::temp_dir().join(format!("frame-engine-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "vsync": true, "frame_count": 10, "animation_tasks": 2 }"#).unwrap();

        let command_line = CommandLine::parse(["-config", path.to_str().unwrap(), "-frames", "3"]).unwrap();
        let config = EngineConfig::from_command_line(&command_line).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(config.vsync);
        assert_eq!(config.animation_tasks, 2);
        assert_eq!(config.frame_count, Some(3));
    }

    #[test]
    fn zero_animation_tasks_is_invalid() {
        let config = EngineConfig {
            animation_tasks: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }
}
