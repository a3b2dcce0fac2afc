//! Synchronous staging uploads to device-local buffers.
//!
//! [`StagingUploader`] owns one growable host-visible staging buffer and a
//! dedicated fence. An upload copies the source bytes into the mapped
//! staging region, flushes them, records a one-shot buffer-to-buffer copy,
//! submits it signaling the fence, and blocks until the fence signals. The
//! dedicated fence avoids stalling unrelated work on the same queue the way
//! a blanket queue-wait would.
//!
//! This primitive is intentionally blocking and is meant for bulk one-time
//! uploads (mesh data). Per-frame data goes through persistently-mapped
//! uniform buffers instead.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pacer_rhi::buffer::{Buffer, BufferUsage};
//! use pacer_rhi::device::Device;
//! use pacer_rhi::staging::StagingUploader;
//!
//! # fn example(device: Arc<Device>) -> Result<(), pacer_rhi::RhiError> {
//! let mut uploader = StagingUploader::new(device.clone())?;
//! let vertices: [f32; 6] = [0.0, 0.5, -0.5, -0.5, 0.5, -0.5];
//! let bytes: &[u8] = bytemuck::cast_slice(&vertices);
//!
//! let vertex_buffer = Buffer::new(device, BufferUsage::Vertex, bytes.len() as u64)?;
//! uploader.upload(bytes, &vertex_buffer, 0)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::buffer::{Buffer, BufferUsage};
use crate::command::{CommandBuffer, CommandPool};
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::sync::Fence;

/// Smallest staging allocation. Uploads below this still get a buffer of
/// this size so early small uploads do not cause a reallocation chain.
pub const MIN_STAGING_CAPACITY: vk::DeviceSize = 1 << 20;

/// Capacity after a growth step: at least double the current capacity, at
/// least the required size, never below the floor. Capacity never shrinks.
fn grown_capacity(current: vk::DeviceSize, required: vk::DeviceSize) -> vk::DeviceSize {
    required
        .max(current.saturating_mul(2))
        .max(MIN_STAGING_CAPACITY)
}

/// Reusable synchronous uploader with a grow-only staging buffer.
pub struct StagingUploader {
    device: Arc<Device>,
    command_pool: CommandPool,
    fence: Fence,
    staging: Option<Buffer>,
}

impl StagingUploader {
    /// Creates an uploader. The staging buffer itself is allocated lazily
    /// on first use.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let graphics_family = device.queue_families().graphics_family.unwrap();
        let command_pool = CommandPool::new_transient(device.clone(), graphics_family)?;
        let fence = Fence::new(device.clone(), false)?;

        Ok(Self {
            device,
            command_pool,
            fence,
            staging: None,
        })
    }

    /// Current staging capacity in bytes (0 before the first upload).
    pub fn capacity(&self) -> vk::DeviceSize {
        self.staging.as_ref().map_or(0, |b| b.size())
    }

    /// Copies `data` into `dst` at `dst_offset`, blocking until the copy
    /// has completed on the GPU.
    ///
    /// # Errors
    ///
    /// Returns an error if the write would exceed `dst`, or if any Vulkan
    /// operation along the way fails.
    pub fn upload(
        &mut self,
        data: &[u8],
        dst: &Buffer,
        dst_offset: vk::DeviceSize,
    ) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let size = data.len() as vk::DeviceSize;
        if dst_offset + size > dst.size() {
            return Err(RhiError::Buffer(format!(
                "upload exceeds destination: offset {} + data {} > buffer {}",
                dst_offset,
                size,
                dst.size()
            )));
        }

        self.ensure_capacity(size)?;
        let staging = self.staging.as_ref().unwrap();

        staging.write_data(0, data)?;
        staging.flush(0, size)?;

        let cmd = CommandBuffer::new(self.device.clone(), &self.command_pool)?;
        cmd.begin()?;
        cmd.copy_buffer(
            staging.handle(),
            dst.handle(),
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset,
                size,
            }],
        );
        cmd.end()?;

        let command_buffers = [cmd.handle()];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);

        unsafe {
            self.device
                .submit_graphics(&[submit_info], self.fence.handle())?;
        }

        self.fence.wait(u64::MAX)?;
        self.fence.reset()?;
        self.command_pool.free_command_buffer(cmd.handle());

        debug!("Uploaded {} bytes to {} buffer", size, dst.usage().name());
        Ok(())
    }

    /// Ensures the staging buffer holds at least `required` bytes,
    /// reallocating (never shrinking) when it does not.
    fn ensure_capacity(&mut self, required: vk::DeviceSize) -> RhiResult<()> {
        if self.staging.as_ref().is_some_and(|b| b.size() >= required) {
            return Ok(());
        }

        let new_capacity = grown_capacity(self.capacity(), required);
        debug!(
            "Growing staging buffer: {} -> {} bytes",
            self.capacity(),
            new_capacity
        );

        // The previous upload completed before returning, so the old buffer
        // is free to drop here.
        self.staging = Some(Buffer::new(
            self.device.clone(),
            BufferUsage::Staging,
            new_capacity,
        )?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grown_capacity_floor() {
        assert_eq!(grown_capacity(0, 16), MIN_STAGING_CAPACITY);
        assert_eq!(grown_capacity(0, MIN_STAGING_CAPACITY), MIN_STAGING_CAPACITY);
    }

    #[test]
    fn test_grown_capacity_doubles() {
        let cap = 4 * MIN_STAGING_CAPACITY;
        assert_eq!(grown_capacity(cap, cap + 1), 2 * cap);
    }

    #[test]
    fn test_grown_capacity_jumps_to_required() {
        let cap = MIN_STAGING_CAPACITY;
        let required = 10 * MIN_STAGING_CAPACITY;
        assert_eq!(grown_capacity(cap, required), required);
    }

    #[test]
    fn test_grown_capacity_never_shrinks() {
        // 1 MiB upload then 3 MiB upload: capacity stays >= both requests.
        let after_first = grown_capacity(0, 1 << 20);
        assert!(after_first >= 1 << 20);
        let after_second = grown_capacity(after_first, 3 << 20);
        assert!(after_second >= 3 << 20);
        assert!(after_second >= after_first);
    }

    #[test]
    fn test_grown_capacity_is_monotonic_over_sequences() {
        let mut capacity = 0;
        for required in [64, 1 << 20, 512, 5 << 20, 2 << 20, 6 << 20] {
            let next = if required > capacity {
                grown_capacity(capacity, required)
            } else {
                capacity
            };
            assert!(next >= capacity);
            assert!(next >= required);
            capacity = next;
        }
    }
}
