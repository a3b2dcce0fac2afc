//! Surface-dependent resource ownership and recreation.
//!
//! [`RenderSurface`] owns every object whose count, format, or extent
//! depends on the presentation surface: the swapchain (images and views),
//! the depth buffer, and the per-image render-finished semaphores. All of
//! it is derived fresh on every (re)creation; nothing is patched in place.
//!
//! `recreate()` is the single entry point for surface invalidation. It
//! blocks until the window reports a non-zero framebuffer size (minimize),
//! establishes device idle, and then rebuilds in fixed order: swapchain,
//! depth buffer, per-image semaphores. Dependents outside this struct
//! (command buffers, image-owner tracking, a pipeline baked against the
//! old format) rebuild from the values it returns.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::{debug, info};

use pacer_rhi::RhiResult;
use pacer_rhi::device::Device;
use pacer_rhi::instance::Instance;
use pacer_rhi::swapchain::Swapchain;
use pacer_rhi::sync::Semaphore;

use crate::depth_buffer::{DEFAULT_DEPTH_FORMAT, DepthBuffer};

/// Poll interval while waiting out a zero-size (minimized) window.
const ZERO_SIZE_POLL: Duration = Duration::from_millis(16);

/// Source of the window's current framebuffer size in pixels.
///
/// The recreation wait loop polls this until it reports a non-zero size,
/// so a zero extent never reaches swapchain creation.
pub trait FramebufferSource {
    fn framebuffer_size(&self) -> (u32, u32);
}

impl FramebufferSource for winit::window::Window {
    fn framebuffer_size(&self) -> (u32, u32) {
        let size = self.inner_size();
        (size.width, size.height)
    }
}

impl FramebufferSource for pacer_platform::Window {
    fn framebuffer_size(&self) -> (u32, u32) {
        let size = self.inner().inner_size();
        (size.width, size.height)
    }
}

/// Blocks until `source` reports a non-zero framebuffer size.
fn wait_for_nonzero_extent(source: &dyn FramebufferSource) -> (u32, u32) {
    let (mut width, mut height) = source.framebuffer_size();
    if width == 0 || height == 0 {
        debug!("Framebuffer is 0x0 (minimized), waiting");
    }
    while width == 0 || height == 0 {
        std::thread::sleep(ZERO_SIZE_POLL);
        (width, height) = source.framebuffer_size();
    }
    (width, height)
}

/// What a recreation produced, for dependents to rebuild against.
#[derive(Clone, Copy, Debug)]
pub struct RecreateReport {
    /// New presentable-image count.
    pub image_count: usize,
    /// True when the chosen surface format differs from the previous one,
    /// invalidating pipelines baked against it.
    pub format_changed: bool,
}

/// Owner of the swapchain, depth buffer, and per-image sync primitives.
///
/// Fields are declared in reverse creation order so drop glue tears down
/// the per-image semaphores and the depth buffer before the swapchain.
pub struct RenderSurface {
    device: Arc<Device>,
    /// One render-finished semaphore per presentable image; presentation
    /// waits on the semaphore of the image being presented.
    render_finished: Vec<Semaphore>,
    depth_buffer: DepthBuffer,
    swapchain: Swapchain,
}

impl RenderSurface {
    /// Creates the swapchain, a depth buffer matching its extent, and the
    /// per-image semaphores.
    pub fn new(
        instance: &Instance,
        device: Arc<Device>,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
    ) -> RhiResult<Self> {
        let swapchain = Swapchain::new(instance, device.clone(), surface, width, height)?;
        let extent = swapchain.extent();
        let depth_buffer =
            DepthBuffer::new(device.clone(), extent.width, extent.height, DEFAULT_DEPTH_FORMAT)?;
        let render_finished = Self::create_image_semaphores(&device, swapchain.image_count())?;

        info!(
            "Render surface ready: {}x{}, {} images",
            extent.width,
            extent.height,
            swapchain.image_count()
        );

        Ok(Self {
            device,
            swapchain,
            depth_buffer,
            render_finished,
        })
    }

    /// Tears down and rebuilds everything surface-dependent.
    ///
    /// Blocks while the window reports a zero-size framebuffer, waits for
    /// device idle (nothing in flight may reference the old objects), then
    /// rebuilds the swapchain, the depth buffer, and the per-image
    /// semaphores in that order.
    pub fn recreate(
        &mut self,
        instance: &Instance,
        surface: vk::SurfaceKHR,
        source: &dyn FramebufferSource,
    ) -> RhiResult<RecreateReport> {
        let (width, height) = wait_for_nonzero_extent(source);

        self.device.wait_idle()?;

        let old_format = self.swapchain.format();
        info!("Recreating render surface for {}x{}", width, height);

        // Old per-image semaphores go first; their count is about to change.
        self.render_finished.clear();

        self.swapchain.recreate(instance, surface, width, height)?;

        let extent = self.swapchain.extent();
        self.depth_buffer =
            DepthBuffer::new(self.device.clone(), extent.width, extent.height, DEFAULT_DEPTH_FORMAT)?;

        self.render_finished =
            Self::create_image_semaphores(&self.device, self.swapchain.image_count())?;

        Ok(RecreateReport {
            image_count: self.swapchain.image_count(),
            format_changed: self.swapchain.format() != old_format,
        })
    }

    fn create_image_semaphores(device: &Arc<Device>, count: usize) -> RhiResult<Vec<Semaphore>> {
        (0..count)
            .map(|_| Semaphore::new(device.clone()))
            .collect()
    }

    /// Returns the swapchain.
    #[inline]
    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    /// Returns the depth buffer.
    #[inline]
    pub fn depth_buffer(&self) -> &DepthBuffer {
        &self.depth_buffer
    }

    /// Returns the surface color format.
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.swapchain.format()
    }

    /// Returns the current extent.
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    /// Returns the presentable-image count.
    #[inline]
    pub fn image_count(&self) -> usize {
        self.swapchain.image_count()
    }

    /// Render-finished semaphore for the image at `image_index`.
    ///
    /// # Panics
    ///
    /// Panics if `image_index` is out of bounds.
    #[inline]
    pub fn render_finished(&self, image_index: usize) -> vk::Semaphore {
        self.render_finished[image_index].handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Framebuffer source that reports 0x0 for a fixed number of polls.
    struct MinimizedThenRestored {
        zero_polls_left: Cell<u32>,
        restored: (u32, u32),
    }

    impl FramebufferSource for MinimizedThenRestored {
        fn framebuffer_size(&self) -> (u32, u32) {
            let left = self.zero_polls_left.get();
            if left > 0 {
                self.zero_polls_left.set(left - 1);
                (0, 0)
            } else {
                self.restored
            }
        }
    }

    #[test]
    fn test_wait_loop_blocks_through_zero_size_then_succeeds() {
        let source = MinimizedThenRestored {
            zero_polls_left: Cell::new(3),
            restored: (800, 600),
        };
        assert_eq!(wait_for_nonzero_extent(&source), (800, 600));
        // Every zero-size poll was consumed before the size was accepted.
        assert_eq!(source.zero_polls_left.get(), 0);
    }

    #[test]
    fn test_wait_loop_passes_nonzero_size_through() {
        let source = MinimizedThenRestored {
            zero_polls_left: Cell::new(0),
            restored: (1280, 720),
        };
        assert_eq!(wait_for_nonzero_extent(&source), (1280, 720));
    }
}
