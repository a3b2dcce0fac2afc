//! Platform layer for the presentation engine:
//! - Window management via winit
//! - Vulkan surface creation and ownership

mod window;

pub use window::{Surface, Window};

// Re-export winit types that users might need
pub use winit::event::WindowEvent;
pub use winit::event_loop::EventLoop;
