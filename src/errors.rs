//! # Error Types
//!
//! The engine distinguishes three kinds of failure:
//!
//! * **Programmer errors** (invalid task state transitions, exceeding a fixed-capacity
//!   frame table, submitting to an uninitialized pool). These go through [`fatal!`],
//!   which logs and panics. The binary installs [`install_fatal_hook`] so that such a
//!   panic terminates the process with [`EXIT_CODE_FATAL`] or [`EXIT_CODE_WORKER_FATAL`].
//! * **Recoverable per-entity errors** (an animated entity without a skeleton). These are
//!   logged with `log::warn!` at the point of failure and never reach this module.
//! * **Environmental errors** (GPU device lost, bad configuration file). These are
//!   returned as [`EngineError`] so the caller can decide what to do. The binary exits
//!   with [`EXIT_CODE_DEVICE_LOST`] on a lost device.

use std::sync::Once;

use thiserror::Error;

use crate::gpu::GpuError;

/// Exit code used when a fatal error is raised on the main thread.
pub const EXIT_CODE_FATAL: i32 = 111;

/// Exit code used when a fatal error is raised on any other thread (pool workers,
/// the render thread, GPU queue threads).
pub const EXIT_CODE_WORKER_FATAL: i32 = 333;

/// Exit code of the binary when presentation reports a lost device.
pub const EXIT_CODE_DEVICE_LOST: u8 = 2;

/// The main error type returned by fallible engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A GPU service call failed.
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    /// Presentation reported that the device was removed or reset.
    #[error("GPU device lost during presentation")]
    DeviceLost,

    /// The configuration was rejected.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A configuration or model description could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An asset could not be imported.
    #[error("Import failed: {0}")]
    Import(String),
}

/// Alias for `Result<T, EngineError>`.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Reports a fatal programmer error.
///
/// Logs the message at error level and panics with it. Without the fatal hook the
/// panic unwinds normally (tests rely on this with `#[should_panic]`); with the hook
/// installed the process exits immediately.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        log::error!("FATAL: {}", message);
        panic!("{}", message);
    }};
}

/// Checks a condition and raises [`fatal!`] when it does not hold.
#[macro_export]
macro_rules! check {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::fatal!($($arg)*);
        }
    };
}

static FATAL_HOOK: Once = Once::new();

/// Installs a panic hook that turns every panic into process termination.
///
/// The hook logs the panic location and message, then exits with
/// [`EXIT_CODE_FATAL`] when raised on the thread named `main`, or
/// [`EXIT_CODE_WORKER_FATAL`] otherwise. Installing twice is a no-op.
pub fn install_fatal_hook() {
    FATAL_HOOK.call_once(|| {
        std::panic::set_hook(Box::new(|info| {
            let thread = std::thread::current();
            let thread_name = thread.name().unwrap_or("<unnamed>");
            let location = info
                .location()
                .map(|location| format!("{}:{}", location.file(), location.line()))
                .unwrap_or_else(|| String::from("unknown location"));
            let message = if let Some(message) = info.payload().downcast_ref::<&str>() {
                (*message).to_string()
            } else if let Some(message) = info.payload().downcast_ref::<String>() {
                message.clone()
            } else {
                String::from("<non-string panic payload>")
            };

            log::error!(
                "Fatal error on thread '{}' at {}: {}",
                thread_name,
                location,
                message
            );

            let code = if thread_name == "main" {
                EXIT_CODE_FATAL
            } else {
                EXIT_CODE_WORKER_FATAL
            };
            std::process::exit(code);
        }));
    });
}
