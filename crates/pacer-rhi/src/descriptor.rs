//! Descriptor set layouts, pools, and the growable arena.
//!
//! [`DescriptorArena`] is the allocation front end: it keeps an append-only
//! list of pools and allocates from the most recent one. When that pool is
//! exhausted it appends a fresh generously-sized pool and retries the
//! allocation exactly once; a second failure indicates a configuration
//! problem and is surfaced as fatal. Pools are never destroyed
//! individually, only reset en masse.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use pacer_rhi::descriptor::{DescriptorArena, DescriptorSetLayout, uniform_buffer_binding};
//! use pacer_rhi::device::Device;
//!
//! # fn example(device: Arc<Device>) -> Result<(), pacer_rhi::RhiError> {
//! let binding = uniform_buffer_binding(0, vk::ShaderStageFlags::VERTEX);
//! let layout = DescriptorSetLayout::new(device.clone(), &[binding])?;
//!
//! let mut arena = DescriptorArena::new(device);
//! let set = arena.allocate(layout.handle())?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Descriptor set layout wrapper.
///
/// Immutable after creation; shareable via `Arc`.
pub struct DescriptorSetLayout {
    device: Arc<Device>,
    layout: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    /// Creates a layout from the given bindings.
    pub fn new(
        device: Arc<Device>,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> RhiResult<Self> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);

        let layout = unsafe {
            device
                .handle()
                .create_descriptor_set_layout(&create_info, None)?
        };

        debug!(
            "Created descriptor set layout with {} binding(s)",
            bindings.len()
        );

        Ok(Self { device, layout })
    }

    /// Returns the Vulkan descriptor set layout handle.
    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// A single descriptor pool.
///
/// Sets allocated from a pool are reclaimed only by [`reset`](Self::reset);
/// there is no per-set free.
pub struct DescriptorPool {
    device: Arc<Device>,
    pool: vk::DescriptorPool,
    max_sets: u32,
}

impl DescriptorPool {
    /// Creates a pool with capacity for `max_sets` sets drawn from
    /// `pool_sizes`.
    pub fn new(
        device: Arc<Device>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);

        let pool = unsafe { device.handle().create_descriptor_pool(&create_info, None)? };

        debug!("Created descriptor pool: max_sets={}", max_sets);

        Ok(Self {
            device,
            pool,
            max_sets,
        })
    }

    /// Allocates one descriptor set per layout in `layouts`.
    ///
    /// Exhaustion surfaces as `ERROR_OUT_OF_POOL_MEMORY` (or
    /// `ERROR_FRAGMENTED_POOL`) inside [`RhiError::Vulkan`].
    pub fn allocate(
        &self,
        layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        let sets = unsafe { self.device.handle().allocate_descriptor_sets(&alloc_info)? };
        Ok(sets)
    }

    /// Returns every allocated set to the pool at once.
    ///
    /// No set from this pool may still be referenced by pending GPU work.
    pub fn reset(&self) -> RhiResult<()> {
        unsafe {
            self.device
                .handle()
                .reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty())?;
        }
        Ok(())
    }

    /// Returns the Vulkan descriptor pool handle.
    #[inline]
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Returns the set capacity of this pool.
    #[inline]
    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_pool(self.pool, None);
        }
    }
}

/// Set capacity of each arena pool.
const ARENA_SETS_PER_POOL: u32 = 128;

/// Descriptor counts each arena pool carries, spread generously across the
/// categories the engine binds.
fn arena_pool_sizes() -> [vk::DescriptorPoolSize; 4] {
    [
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(256),
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(128),
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(256),
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::STORAGE_IMAGE)
            .descriptor_count(64),
    ]
}

/// Growable collection of descriptor pools.
///
/// Allocation never fails permanently under normal operation: pool
/// exhaustion triggers growth instead.
pub struct DescriptorArena {
    device: Arc<Device>,
    pools: Vec<DescriptorPool>,
}

impl DescriptorArena {
    /// Creates an empty arena. The first pool is appended on first use.
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            pools: Vec::new(),
        }
    }

    /// Allocates a descriptor set for `layout`.
    ///
    /// Targets the most recently created pool. On exhaustion, appends a new
    /// pool and retries once; a failure after growth is returned as-is
    /// (an unsupported layout, not a capacity problem).
    pub fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> RhiResult<vk::DescriptorSet> {
        if self.pools.is_empty() {
            self.grow()?;
        }

        match self.pools.last().unwrap().allocate(&[layout]) {
            Ok(mut sets) => Ok(sets.remove(0)),
            Err(RhiError::Vulkan(
                vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL,
            )) => {
                self.grow()?;
                let mut sets = self.pools.last().unwrap().allocate(&[layout])?;
                Ok(sets.remove(0))
            }
            Err(e) => Err(e),
        }
    }

    /// Invalidates every set from every pool without destroying the pools.
    ///
    /// No set may still be referenced by pending GPU work.
    pub fn reset_all(&mut self) -> RhiResult<()> {
        for pool in &self.pools {
            pool.reset()?;
        }
        debug!("Reset {} descriptor pool(s)", self.pools.len());
        Ok(())
    }

    /// Number of pools currently backing the arena.
    #[inline]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Appends a fresh pool; subsequent allocations target it.
    fn grow(&mut self) -> RhiResult<()> {
        let pool = DescriptorPool::new(
            self.device.clone(),
            ARENA_SETS_PER_POOL,
            &arena_pool_sizes(),
        )?;
        self.pools.push(pool);
        debug!("Descriptor arena grew to {} pool(s)", self.pools.len());
        Ok(())
    }
}

/// Writes resource bindings into descriptor sets.
pub fn update_descriptor_sets(device: &Device, writes: &[vk::WriteDescriptorSet]) {
    if writes.is_empty() {
        return;
    }
    unsafe {
        device.handle().update_descriptor_sets(writes, &[]);
    }
}

/// Uniform-buffer layout binding at `binding` visible to `stage_flags`.
#[inline]
pub fn uniform_buffer_binding(
    binding: u32,
    stage_flags: vk::ShaderStageFlags,
) -> vk::DescriptorSetLayoutBinding<'static> {
    vk::DescriptorSetLayoutBinding::default()
        .binding(binding)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .descriptor_count(1)
        .stage_flags(stage_flags)
}

/// Combined image sampler layout binding at `binding`.
#[inline]
pub fn combined_image_sampler_binding(
    binding: u32,
    stage_flags: vk::ShaderStageFlags,
) -> vk::DescriptorSetLayoutBinding<'static> {
    vk::DescriptorSetLayoutBinding::default()
        .binding(binding)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .descriptor_count(1)
        .stage_flags(stage_flags)
}

/// Buffer info for descriptor writes.
#[inline]
pub fn buffer_info(
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
    range: vk::DeviceSize,
) -> vk::DescriptorBufferInfo {
    vk::DescriptorBufferInfo::default()
        .buffer(buffer)
        .offset(offset)
        .range(range)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_buffer_binding() {
        let binding = uniform_buffer_binding(0, vk::ShaderStageFlags::VERTEX);
        assert_eq!(binding.binding, 0);
        assert_eq!(binding.descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(binding.descriptor_count, 1);
        assert_eq!(binding.stage_flags, vk::ShaderStageFlags::VERTEX);
    }

    #[test]
    fn test_combined_image_sampler_binding() {
        let binding = combined_image_sampler_binding(2, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(binding.binding, 2);
        assert_eq!(
            binding.descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
    }

    #[test]
    fn test_buffer_info_helper() {
        let info = buffer_info(vk::Buffer::null(), 64, 128);
        assert_eq!(info.offset, 64);
        assert_eq!(info.range, 128);
    }

    #[test]
    fn test_arena_pool_sizes_cover_bound_categories() {
        let sizes = arena_pool_sizes();
        assert!(sizes.iter().all(|s| s.descriptor_count > 0));
        assert!(
            sizes
                .iter()
                .any(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER)
        );
        assert!(
            sizes
                .iter()
                .any(|s| s.ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        );
        // Every pool can satisfy at least a full complement of sets.
        assert!(ARENA_SETS_PER_POOL > 0);
    }
}
