//! Frame tasks of the render graph.
//!
//! Every frame slot owns one instance of each task type (and a growable array of
//! render-pass tasks), reset and refilled each cycle through the slot.
//!
//! # Available Tasks
//! - `CopyTask`: writes the staged tables into upload memory and submits the copy queue
//! - `ComputeTask`: waits for the copy on the GPU and submits the skinning dispatches
//! - `RenderPassTask`: records one shadow or forward pass into a command list

pub mod compute_task;
pub mod copy_task;
pub mod render_pass_task;

pub use compute_task::ComputeTask;
pub use copy_task::{CopyRegion, CopyTask};
pub use render_pass_task::{PassDraw, RenderPassTask};
