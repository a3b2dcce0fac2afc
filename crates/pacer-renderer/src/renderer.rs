//! Top-level renderer: wires the frame pacer, the surface lifecycle, and
//! the pipeline onto a window.
//!
//! # Resource destruction order
//!
//! Vulkan handles have no automatic lifetime tracking, so teardown runs in
//! strict reverse order of creation, after the device is confirmed idle:
//! frame pacer, staging uploader, geometry, pipeline state, pipeline cache
//! (which persists itself), descriptor state, surface resources, surface,
//! device, instance. `ManuallyDrop` encodes that order explicitly.

use std::mem::ManuallyDrop;
use std::path::Path;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, info};

use pacer_platform::{Surface, Window};
use pacer_rhi::buffer::{Buffer, BufferUsage};
use pacer_rhi::command::CommandBuffer;
use pacer_rhi::descriptor::{DescriptorArena, DescriptorSetLayout, uniform_buffer_binding};
use pacer_rhi::device::Device;
use pacer_rhi::instance::Instance;
use pacer_rhi::physical_device::select_physical_device;
use pacer_rhi::pipeline::{CullMode, Pipeline, PipelineBuilder, PipelineLayout};
use pacer_rhi::pipeline_cache::{CacheKey, PipelineCacheStore};
use pacer_rhi::shader::{Shader, ShaderStage};
use pacer_rhi::staging::StagingUploader;
use pacer_rhi::vertex::Vertex;
use pacer_rhi::{RhiError, RhiResult};

use crate::depth_buffer::DEFAULT_DEPTH_FORMAT;
use crate::frame_pacer::{Acquire, FramePacer};
use crate::render_surface::RenderSurface;
use crate::ubo::FrameUniform;

/// Directory the pipeline cache blob is persisted under.
const PIPELINE_CACHE_DIR: &str = "cache";

/// SPIR-V paths, relative to the working directory.
const VERTEX_SHADER_PATH: &str = "shaders/triangle.vert.spv";
const FRAGMENT_SHADER_PATH: &str = "shaders/triangle.frag.spv";

/// The presentation engine's public control surface.
///
/// `new` builds everything, [`draw_frame`](Self::draw_frame) renders
/// exactly one frame (or performs a surface rebuild and returns), and
/// resize notifications arrive via [`resize`](Self::resize). Teardown
/// happens on drop.
pub struct Renderer {
    // Held for the zero-size wait during surface recreation.
    window: Arc<winit::window::Window>,

    instance: ManuallyDrop<Instance>,
    device: ManuallyDrop<Arc<Device>>,
    surface: ManuallyDrop<Surface>,
    render_surface: ManuallyDrop<RenderSurface>,

    descriptor_set_layout: ManuallyDrop<DescriptorSetLayout>,
    descriptor_arena: ManuallyDrop<DescriptorArena>,

    pipeline_cache: ManuallyDrop<PipelineCacheStore>,
    vertex_shader: ManuallyDrop<Shader>,
    fragment_shader: ManuallyDrop<Shader>,
    pipeline_layout: ManuallyDrop<PipelineLayout>,
    pipeline: ManuallyDrop<Pipeline>,

    vertex_buffer: ManuallyDrop<Buffer>,
    vertex_count: u32,
    staging: ManuallyDrop<StagingUploader>,

    pacer: ManuallyDrop<FramePacer>,

    /// Set by resize notifications and stale presents; consumed at the
    /// top of the next frame.
    framebuffer_resized: bool,
}

impl Renderer {
    /// Initializes the renderer against `window`.
    ///
    /// # Errors
    ///
    /// Returns an error when any GPU object creation fails or the shader
    /// blobs cannot be loaded.
    pub fn new(window: &Window) -> RhiResult<Self> {
        let (width, height) = window.framebuffer_size();
        info!("Initializing renderer ({}x{})", width, height);

        let instance = Instance::new(cfg!(debug_assertions))?;

        let surface = window
            .create_surface(instance.entry(), instance.handle())
            .map_err(|e| RhiError::Surface(e.to_string()))?;

        let physical_device_info =
            select_physical_device(instance.handle(), surface.handle(), surface.loader())?;
        let cache_key =
            CacheKey::from_physical_device(instance.handle(), physical_device_info.device);

        let device = Device::new(&instance, &physical_device_info)?;

        let render_surface =
            RenderSurface::new(&instance, device.clone(), surface.handle(), width, height)?;

        // One uniform block, visible to both stages
        let descriptor_set_layout = DescriptorSetLayout::new(
            device.clone(),
            &[uniform_buffer_binding(
                0,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            )],
        )?;
        let mut descriptor_arena = DescriptorArena::new(device.clone());

        let pipeline_cache =
            PipelineCacheStore::new(device.clone(), &cache_key, Path::new(PIPELINE_CACHE_DIR));

        let vertex_shader = Shader::from_spirv_file(
            device.clone(),
            Path::new(VERTEX_SHADER_PATH),
            ShaderStage::Vertex,
            "main",
        )?;
        let fragment_shader = Shader::from_spirv_file(
            device.clone(),
            Path::new(FRAGMENT_SHADER_PATH),
            ShaderStage::Fragment,
            "main",
        )?;

        let pipeline_layout =
            PipelineLayout::new(device.clone(), &[descriptor_set_layout.handle()], &[])?;
        let pipeline = Self::bake_pipeline(
            device.clone(),
            &vertex_shader,
            &fragment_shader,
            &pipeline_layout,
            render_surface.format(),
            pipeline_cache.handle(),
        )?;

        // Demo geometry: uploaded once into device-local memory.
        let mut staging = StagingUploader::new(device.clone())?;
        let vertices = [
            Vertex::new([0.0, -0.5, 0.0], [1.0, 0.3, 0.3]),
            Vertex::new([0.5, 0.5, 0.0], [0.3, 1.0, 0.3]),
            Vertex::new([-0.5, 0.5, 0.0], [0.3, 0.3, 1.0]),
        ];
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&vertices);
        let vertex_buffer = Buffer::new(
            device.clone(),
            BufferUsage::Vertex,
            vertex_bytes.len() as vk::DeviceSize,
        )?;
        staging.upload(vertex_bytes, &vertex_buffer, 0)?;

        let pacer = FramePacer::new(
            device.clone(),
            render_surface.image_count(),
            FrameUniform::SIZE as vk::DeviceSize,
            &mut descriptor_arena,
            &descriptor_set_layout,
        )?;

        info!(
            "Renderer initialized: {} images, {} frames in flight",
            render_surface.image_count(),
            crate::MAX_FRAMES_IN_FLIGHT
        );

        Ok(Self {
            window: window.inner_arc(),
            instance: ManuallyDrop::new(instance),
            device: ManuallyDrop::new(device),
            surface: ManuallyDrop::new(surface),
            render_surface: ManuallyDrop::new(render_surface),
            descriptor_set_layout: ManuallyDrop::new(descriptor_set_layout),
            descriptor_arena: ManuallyDrop::new(descriptor_arena),
            pipeline_cache: ManuallyDrop::new(pipeline_cache),
            vertex_shader: ManuallyDrop::new(vertex_shader),
            fragment_shader: ManuallyDrop::new(fragment_shader),
            pipeline_layout: ManuallyDrop::new(pipeline_layout),
            pipeline: ManuallyDrop::new(pipeline),
            vertex_buffer: ManuallyDrop::new(vertex_buffer),
            vertex_count: vertices.len() as u32,
            staging: ManuallyDrop::new(staging),
            pacer: ManuallyDrop::new(pacer),
            framebuffer_resized: false,
        })
    }

    /// Notifies the renderer that the window changed size.
    ///
    /// The rebuild itself is deferred to the top of the next frame, since
    /// it requires an idle device.
    pub fn resize(&mut self, width: u32, height: u32) {
        debug!("Resize notification: {}x{}", width, height);
        self.framebuffer_resized = true;
    }

    /// Renders exactly one frame with `frame` as its uniform data, or
    /// performs a surface rebuild and returns without presenting.
    ///
    /// # Errors
    ///
    /// Surface staleness is handled internally; any other failure from
    /// acquire, submit, or present is unexpected and propagated. The frame
    /// loop is expected to stop on it.
    pub fn draw_frame(&mut self, frame: &FrameUniform) -> RhiResult<()> {
        if self.framebuffer_resized {
            self.recreate_surface()?;
        }

        self.pacer.wait_slot()?;

        let (image_index, suboptimal_acquire) =
            match self.pacer.acquire(self.render_surface.swapchain())? {
                Acquire::Ready {
                    image_index,
                    suboptimal,
                } => (image_index, suboptimal),
                Acquire::Stale => {
                    // No image was acquired; rebuild and abandon the frame.
                    self.recreate_surface()?;
                    self.pacer.advance();
                    return Ok(());
                }
            };

        self.pacer.wait_image_owner()?;

        self.pacer.write_uniform(bytemuck::bytes_of(frame))?;

        let cmd = self.pacer.begin_record()?;
        self.record_commands(cmd, image_index)?;
        cmd.end()?;

        let render_finished = self.render_surface.render_finished(image_index as usize);
        self.pacer.submit(render_finished)?;

        let stale_present = self
            .pacer
            .present(self.render_surface.swapchain(), render_finished)?;

        self.pacer.advance();

        if stale_present || suboptimal_acquire {
            self.framebuffer_resized = true;
        }

        Ok(())
    }

    /// Returns the current surface extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.render_surface.extent()
    }

    /// Rebuild cascade for surface invalidation, in fixed order: surface
    /// resources first, then the pacer's per-image state, then the
    /// pipeline when its baked color format no longer matches.
    fn recreate_surface(&mut self) -> RhiResult<()> {
        let report = self.render_surface.recreate(
            &self.instance,
            self.surface.handle(),
            self.window.as_ref(),
        )?;

        self.pacer.rebuild_for_surface(report.image_count)?;

        if report.format_changed {
            info!("Surface format changed, rebaking pipeline");
            let pipeline = Self::bake_pipeline(
                Arc::clone(&self.device),
                &self.vertex_shader,
                &self.fragment_shader,
                &self.pipeline_layout,
                self.render_surface.format(),
                self.pipeline_cache.handle(),
            )?;
            unsafe {
                ManuallyDrop::drop(&mut self.pipeline);
            }
            self.pipeline = ManuallyDrop::new(pipeline);
        }

        self.framebuffer_resized = false;
        Ok(())
    }

    /// Bakes the triangle pipeline for the given surface format.
    fn bake_pipeline(
        device: Arc<Device>,
        vertex_shader: &Shader,
        fragment_shader: &Shader,
        layout: &PipelineLayout,
        color_format: vk::Format,
        cache: vk::PipelineCache,
    ) -> RhiResult<Pipeline> {
        PipelineBuilder::new()
            .stage(vertex_shader)
            .stage(fragment_shader)
            .vertex_binding(Vertex::binding_description())
            .vertex_attributes(&Vertex::attribute_descriptions())
            .color_attachment_format(color_format)
            .depth_attachment_format(DEFAULT_DEPTH_FORMAT)
            .cull_mode(CullMode::None)
            .layout(layout)
            .pipeline_cache(cache)
            .build(device)
    }

    /// Records the frame's commands into `cmd`.
    fn record_commands(&self, cmd: &CommandBuffer, image_index: u32) -> RhiResult<()> {
        let swapchain = self.render_surface.swapchain();
        let extent = swapchain.extent();
        let color_image = swapchain.image(image_index as usize);

        self.transition_image(
            cmd,
            color_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );
        self.transition_image(
            cmd,
            self.render_surface.depth_buffer().image(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            vk::ImageAspectFlags::DEPTH,
        );

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(swapchain.image_view(image_index as usize))
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.07, 0.17, 0.33, 1.0],
                },
            });

        let depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(self.render_surface.depth_buffer().image_view())
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });

        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment))
            .depth_attachment(&depth_attachment);

        cmd.begin_rendering(&rendering_info);

        cmd.set_viewport(&vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        cmd.set_scissor(&vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        });

        cmd.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, self.pipeline.handle());
        cmd.bind_descriptor_sets(
            vk::PipelineBindPoint::GRAPHICS,
            self.pipeline_layout.handle(),
            0,
            &[self.pacer.current_slot().descriptor_set()],
        );
        cmd.bind_vertex_buffers(0, &[self.vertex_buffer.handle()], &[0]);
        cmd.draw(self.vertex_count, 1, 0, 0);

        cmd.end_rendering();

        self.transition_image(
            cmd,
            color_image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageAspectFlags::COLOR,
        );

        Ok(())
    }

    /// Records an image layout transition for the cases the frame loop
    /// hits.
    fn transition_image(
        &self,
        cmd: &CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        aspect_mask: vk::ImageAspectFlags,
    ) {
        let (src_stage, src_access, dst_stage, dst_access) = match (old_layout, new_layout) {
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL) => (
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL) => (
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
            (vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR) => (
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::AccessFlags::empty(),
            ),
            _ => (
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            ),
        };

        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect_mask)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);

        cmd.pipeline_barrier(src_stage, dst_stage, &[barrier]);
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for device idle during teardown: {:?}", e);
        }

        // Reverse order of creation. The pipeline cache store saves its
        // blob as part of dropping; the device goes down before the
        // instance it was created from.
        unsafe {
            ManuallyDrop::drop(&mut self.pacer);
            ManuallyDrop::drop(&mut self.staging);
            ManuallyDrop::drop(&mut self.vertex_buffer);
            ManuallyDrop::drop(&mut self.pipeline);
            ManuallyDrop::drop(&mut self.pipeline_layout);
            ManuallyDrop::drop(&mut self.fragment_shader);
            ManuallyDrop::drop(&mut self.vertex_shader);
            ManuallyDrop::drop(&mut self.pipeline_cache);
            ManuallyDrop::drop(&mut self.descriptor_arena);
            ManuallyDrop::drop(&mut self.descriptor_set_layout);
            ManuallyDrop::drop(&mut self.render_surface);
            ManuallyDrop::drop(&mut self.surface);
            ManuallyDrop::drop(&mut self.device);
            ManuallyDrop::drop(&mut self.instance);
        }

        info!("Renderer destroyed");
    }
}
