//! # Frame Engine Entry Point
//!
//! Runs the demo scene through the library's `run()` function.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release -- -novsync -frames 600
//! ```

fn main() -> std::process::ExitCode {
    frame_engine::run()
}
