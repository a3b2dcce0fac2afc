//! Vulkan abstraction layer for the frame-presentation engine.
//!
//! Built on the `ash` crate, this crate covers:
//! - Instance and device bootstrap
//! - Swapchain creation and presentation
//! - Synchronization primitives (fences, semaphores)
//! - Buffers with gpu-allocator managed memory, plus a synchronous
//!   staging uploader for bulk data
//! - A growable descriptor-set arena
//! - Pipeline assembly with an on-disk pipeline cache

mod error;

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod instance;
pub mod physical_device;
pub mod pipeline;
pub mod pipeline_cache;
pub mod shader;
pub mod staging;
pub mod swapchain;
pub mod sync;
pub mod vertex;

pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
