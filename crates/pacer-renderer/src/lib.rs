//! Frame orchestration for the presentation engine:
//! - [`FramePacer`]: the acquire/record/submit/present cycle with
//!   frames-in-flight pacing
//! - [`RenderSurface`]: everything whose identity depends on the
//!   presentation surface, with one coherent recreate protocol
//! - [`Renderer`]: top-level wiring of both onto a window

pub mod depth_buffer;
pub mod frame_pacer;
pub mod render_surface;
pub mod renderer;
pub mod ubo;

pub use frame_pacer::FramePacer;
pub use render_surface::{FramebufferSource, RenderSurface};
pub use renderer::Renderer;
pub use ubo::FrameUniform;

/// Number of frames that may be in flight simultaneously.
///
/// Bounds host-side resource use (command re-recording, per-frame uniform
/// memory) independent of how many images the surface reports.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;
