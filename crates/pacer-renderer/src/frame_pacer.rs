//! Frame pacing: the acquire → record → submit → present cycle.
//!
//! [`FramePacer`] serializes CPU-side frame submission while letting up to
//! [`MAX_FRAMES_IN_FLIGHT`](crate::MAX_FRAMES_IN_FLIGHT) frames of GPU
//! work overlap. Each frame slot owns the fence gating its reuse, the
//! semaphore signaled when its acquired image is ready, and a
//! persistently-mapped uniform buffer for that frame's data.
//!
//! Command buffers are indexed by presentable image and re-recorded every
//! frame. Because the surface can report more images than there are frame
//! slots, each image's last submitting slot is tracked: before an image is
//! recorded into again, the tracked slot's fence is waited on so an image
//! still owned by an in-flight frame is never overwritten.
//!
//! Per frame, the driving loop calls, in order: [`wait_slot`], [`acquire`]
//! (aborting to a surface rebuild on staleness), [`wait_image_owner`],
//! [`begin_record`] + recording + `end`, [`submit`], [`present`], and
//! [`advance`]. Advance runs unconditionally, even for abandoned frames.
//!
//! [`wait_slot`]: FramePacer::wait_slot
//! [`acquire`]: FramePacer::acquire
//! [`wait_image_owner`]: FramePacer::wait_image_owner
//! [`begin_record`]: FramePacer::begin_record
//! [`submit`]: FramePacer::submit
//! [`present`]: FramePacer::present
//! [`advance`]: FramePacer::advance

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use pacer_rhi::RhiResult;
use pacer_rhi::buffer::{Buffer, BufferUsage};
use pacer_rhi::command::{CommandBuffer, CommandPool};
use pacer_rhi::descriptor::{
    DescriptorArena, DescriptorSetLayout, buffer_info, update_descriptor_sets,
};
use pacer_rhi::device::Device;
use pacer_rhi::swapchain::Swapchain;
use pacer_rhi::sync::{Fence, Semaphore};

use crate::MAX_FRAMES_IN_FLIGHT;

/// Result of asking the surface for the next presentable image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    /// An image is available for recording.
    Ready {
        image_index: u32,
        /// The image is usable now, but the surface should be rebuilt soon.
        suboptimal: bool,
    },
    /// The surface no longer matches the window; nothing was acquired and
    /// the frame must be abandoned after a rebuild.
    Stale,
}

/// Tracks which frame slot last submitted work targeting each presentable
/// image. A slot index here is a non-owning back-reference; the fences
/// themselves live in the slots.
#[derive(Debug)]
struct ImageOwners {
    owners: Vec<Option<usize>>,
}

impl ImageOwners {
    fn new(image_count: usize) -> Self {
        Self {
            owners: vec![None; image_count],
        }
    }

    /// Slot that last targeted `image`, if any.
    fn owner(&self, image: usize) -> Option<usize> {
        self.owners[image]
    }

    /// Records `slot` as the latest writer of `image`.
    fn set_owner(&mut self, image: usize, slot: usize) {
        self.owners[image] = Some(slot);
    }

    /// Forgets all ownership and resizes to a new image count.
    fn reset(&mut self, image_count: usize) {
        self.owners.clear();
        self.owners.resize(image_count, None);
    }
}

/// Next slot index, wrapping at the slot count.
fn next_slot(current: usize, slot_count: usize) -> usize {
    (current + 1) % slot_count
}

/// Per-slot CPU-side resources.
///
/// The slot's fence is the sole gate for reusing any of them.
pub struct FrameSlot {
    /// Signaled when this slot's last submission finishes on the GPU.
    in_flight: Fence,
    /// Signaled when the image acquired for this slot is ready for writing.
    image_available: Semaphore,
    /// Persistently-mapped uniform buffer, rewritten every frame.
    uniform: Buffer,
    /// Descriptor set binding the uniform buffer, from the shared arena.
    descriptor_set: vk::DescriptorSet,
}

impl FrameSlot {
    fn new(
        device: Arc<Device>,
        uniform_size: vk::DeviceSize,
        arena: &mut DescriptorArena,
        layout: &DescriptorSetLayout,
    ) -> RhiResult<Self> {
        // Signaled at creation so the first wait passes immediately.
        let in_flight = Fence::new(device.clone(), true)?;
        let image_available = Semaphore::new(device.clone())?;
        let uniform = Buffer::new(device.clone(), BufferUsage::Uniform, uniform_size)?;

        let descriptor_set = arena.allocate(layout.handle())?;
        let infos = [buffer_info(uniform.handle(), 0, uniform_size)];
        let writes = [vk::WriteDescriptorSet::default()
            .dst_set(descriptor_set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&infos)];
        update_descriptor_sets(&device, &writes);

        Ok(Self {
            in_flight,
            image_available,
            uniform,
            descriptor_set,
        })
    }

    /// Returns the descriptor set carrying this slot's uniform buffer.
    #[inline]
    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }
}

/// The frame-loop concurrency core.
///
/// Single-submitter: nothing here is safe to call from two threads at once.
pub struct FramePacer {
    device: Arc<Device>,
    slots: Vec<FrameSlot>,
    command_pool: CommandPool,
    /// One command buffer per presentable image, re-recorded every frame.
    command_buffers: Vec<CommandBuffer>,
    owners: ImageOwners,
    current_frame: usize,
    image_index: u32,
}

impl FramePacer {
    /// Creates the frame slots and one command buffer per presentable
    /// image. Each slot's uniform buffer is `uniform_size` bytes and gets
    /// a descriptor set from `arena` against `layout`.
    pub fn new(
        device: Arc<Device>,
        image_count: usize,
        uniform_size: vk::DeviceSize,
        arena: &mut DescriptorArena,
        layout: &DescriptorSetLayout,
    ) -> RhiResult<Self> {
        let mut slots = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            slots.push(FrameSlot::new(
                device.clone(),
                uniform_size,
                arena,
                layout,
            )?);
        }

        let graphics_family = device.queue_families().graphics_family.unwrap();
        let command_pool = CommandPool::new(device.clone(), graphics_family)?;
        let command_buffers = Self::allocate_command_buffers(&device, &command_pool, image_count)?;

        debug!(
            "Frame pacer created: {} slots, {} per-image command buffers",
            MAX_FRAMES_IN_FLIGHT, image_count
        );

        Ok(Self {
            device,
            slots,
            command_pool,
            command_buffers,
            owners: ImageOwners::new(image_count),
            current_frame: 0,
            image_index: 0,
        })
    }

    fn allocate_command_buffers(
        device: &Arc<Device>,
        pool: &CommandPool,
        count: usize,
    ) -> RhiResult<Vec<CommandBuffer>> {
        (0..count)
            .map(|_| CommandBuffer::new(device.clone(), pool))
            .collect()
    }

    /// Returns the current frame slot.
    #[inline]
    pub fn current_slot(&self) -> &FrameSlot {
        &self.slots[self.current_frame]
    }

    /// Returns the current slot index.
    #[inline]
    pub fn current_frame_index(&self) -> usize {
        self.current_frame
    }

    /// Returns the image index from the last successful acquire.
    #[inline]
    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    /// Blocks until the current slot's previous submission completes, so
    /// its uniform memory and fence are free to reuse.
    pub fn wait_slot(&self) -> RhiResult<()> {
        self.slots[self.current_frame].in_flight.wait(u64::MAX)?;
        Ok(())
    }

    /// Requests the next presentable image, signaling the slot's
    /// image-available semaphore when it is ready for writing.
    pub fn acquire(&mut self, swapchain: &Swapchain) -> RhiResult<Acquire> {
        let slot = &self.slots[self.current_frame];

        match swapchain.acquire_next_image(slot.image_available.handle()) {
            Ok((image_index, suboptimal)) => {
                self.image_index = image_index;
                Ok(Acquire::Ready {
                    image_index,
                    suboptimal,
                })
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("Surface stale during acquire");
                Ok(Acquire::Stale)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Blocks until the acquired image's previous owner finishes.
    ///
    /// With more images than slots, the image handed back by acquire can
    /// still be referenced by a different slot's in-flight submission;
    /// waiting on that slot's fence keeps the image from being overwritten
    /// while the presentation engine may still read it.
    pub fn wait_image_owner(&self) -> RhiResult<()> {
        if let Some(owner) = self.owners.owner(self.image_index as usize) {
            self.slots[owner].in_flight.wait(u64::MAX)?;
        }
        Ok(())
    }

    /// Writes `data` into the current slot's uniform buffer and flushes it.
    pub fn write_uniform(&self, data: &[u8]) -> RhiResult<()> {
        let uniform = &self.slots[self.current_frame].uniform;
        uniform.write_data(0, data)?;
        uniform.flush(0, data.len() as vk::DeviceSize)
    }

    /// Resets and begins the acquired image's command buffer for
    /// re-recording. Valid only after [`wait_image_owner`](Self::wait_image_owner).
    pub fn begin_record(&self) -> RhiResult<&CommandBuffer> {
        let cmd = &self.command_buffers[self.image_index as usize];
        cmd.reset()?;
        cmd.begin()?;
        Ok(cmd)
    }

    /// Submits the recorded command buffer to the graphics queue.
    ///
    /// Waits on the slot's image-available semaphore at the color-output
    /// stage, signals `render_finished` for presentation and the slot
    /// fence for CPU-side reuse, and records this slot as the acquired
    /// image's owner.
    pub fn submit(&mut self, render_finished: vk::Semaphore) -> RhiResult<()> {
        let slot = &self.slots[self.current_frame];

        // Reset only once a submission is certain, so an abandoned frame
        // leaves the fence signaled.
        slot.in_flight.reset()?;

        let wait_semaphores = [slot.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [render_finished];
        let command_buffers = [self.command_buffers[self.image_index as usize].handle()];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .submit_graphics(&[submit_info], slot.in_flight.handle())?;
        }

        self.owners
            .set_owner(self.image_index as usize, self.current_frame);

        Ok(())
    }

    /// Presents the acquired image, waiting on `render_finished`.
    ///
    /// Returns true when the surface should be rebuilt (stale or
    /// suboptimal); the rebuild belongs at the top of the next frame,
    /// since it requires an idle device.
    pub fn present(
        &self,
        swapchain: &Swapchain,
        render_finished: vk::Semaphore,
    ) -> RhiResult<bool> {
        match swapchain.present(self.device.present_queue(), self.image_index, render_finished) {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                debug!("Surface stale during present");
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Advances to the next frame slot. Called once per frame,
    /// unconditionally, abandoned frames included.
    pub fn advance(&mut self) {
        self.current_frame = next_slot(self.current_frame, self.slots.len());
    }

    /// Rebuilds the per-image state after a surface recreation: command
    /// buffers are reallocated for the new image count and all image
    /// ownership is forgotten (the device was idle, nothing is owned).
    pub fn rebuild_for_surface(&mut self, image_count: usize) -> RhiResult<()> {
        self.command_buffers.clear();
        self.command_pool.reset(true)?;
        self.command_buffers =
            Self::allocate_command_buffers(&self.device, &self.command_pool, image_count)?;
        self.owners.reset(image_count);

        debug!("Frame pacer rebuilt for {} images", image_count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_frames_in_flight_is_small() {
        assert!(MAX_FRAMES_IN_FLIGHT >= 1);
        assert!(MAX_FRAMES_IN_FLIGHT <= 4);
    }

    #[test]
    fn test_slot_advance_cycles_through_all_slots() {
        let mut slot = 0;
        let mut seen = vec![0usize; MAX_FRAMES_IN_FLIGHT];
        for _ in 0..(MAX_FRAMES_IN_FLIGHT * 3) {
            seen[slot] += 1;
            slot = next_slot(slot, MAX_FRAMES_IN_FLIGHT);
        }
        // Over N*F frames each slot is reused exactly N times.
        assert!(seen.iter().all(|&count| count == 3));
        assert_eq!(slot, 0);
    }

    #[test]
    fn test_image_owners_round_trip() {
        let mut owners = ImageOwners::new(3);
        assert_eq!(owners.owner(0), None);

        owners.set_owner(0, 1);
        owners.set_owner(2, 0);
        assert_eq!(owners.owner(0), Some(1));
        assert_eq!(owners.owner(1), None);
        assert_eq!(owners.owner(2), Some(0));

        // The latest writer wins.
        owners.set_owner(0, 0);
        assert_eq!(owners.owner(0), Some(0));
    }

    #[test]
    fn test_image_owners_reset_forgets_everything() {
        let mut owners = ImageOwners::new(3);
        owners.set_owner(0, 0);
        owners.set_owner(1, 1);

        owners.reset(4);
        for image in 0..4 {
            assert_eq!(owners.owner(image), None);
        }
    }

    #[test]
    fn test_acquire_outcomes_compare() {
        assert_eq!(
            Acquire::Ready {
                image_index: 1,
                suboptimal: false
            },
            Acquire::Ready {
                image_index: 1,
                suboptimal: false
            }
        );
        assert_ne!(
            Acquire::Stale,
            Acquire::Ready {
                image_index: 0,
                suboptimal: true
            }
        );
    }
}
