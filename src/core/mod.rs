//! # Core Module
//!
//! Fundamental concurrency primitives shared by the rest of the engine.
//!
//! ## Key Components
//! - `MtResource`: Thread-safe reference-counted resource with read-write locking
//! - `Semaphore`: Counting semaphore used by the render-thread handshake
//!
//! ## Usage
//! ```rust
//! use frame_engine::core::{MtResource, Semaphore};
//!
//! let counter = MtResource::new(0);
//! *counter.get_mut() += 1;
//! assert_eq!(*counter.get(), 1);
//!
//! let ready = Semaphore::new(0);
//! ready.release();
//! ready.acquire();
//! ```

pub mod mt_resource;
pub mod semaphore;

pub use mt_resource::MtResource;
pub use semaphore::Semaphore;
