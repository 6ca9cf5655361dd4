//! Tracked resource creation: every native handle created here is recorded
//! and destroyed in bulk, in dependency order, at teardown. No per-object
//! destroy is exposed.

use ash::vk;
use log::info;

use crate::context::RenderContext;
use crate::memory::{Allocation, DeviceArena};

/// Owns the memory arena and every resource created through it until
/// `release_all`. Creation failures are fatal and propagate; driver state
/// after a failed call is treated as undefined.
pub struct ResourceRegistry {
    device: ash::Device,
    arena: DeviceArena,

    buffers: Vec<(vk::Buffer, Allocation)>,
    images: Vec<(vk::Image, Allocation)>,
    image_views: Vec<vk::ImageView>,
    samplers: Vec<vk::Sampler>,
    render_passes: Vec<vk::RenderPass>,
    framebuffers: Vec<vk::Framebuffer>,
    descriptor_set_layouts: Vec<vk::DescriptorSetLayout>,
    pipeline_layouts: Vec<vk::PipelineLayout>,
    pipelines: Vec<vk::Pipeline>,
    shader_modules: Vec<vk::ShaderModule>,
    semaphores: Vec<vk::Semaphore>,
    fences: Vec<vk::Fence>,
    command_pools: Vec<vk::CommandPool>,
    descriptor_pools: Vec<vk::DescriptorPool>,
    query_pools: Vec<vk::QueryPool>,
}

impl ResourceRegistry {
    pub fn new(ctx: &RenderContext) -> Self {
        Self {
            device: ctx.device.clone(),
            arena: DeviceArena::new(ctx.memory_properties),
            buffers: Vec::new(),
            images: Vec::new(),
            image_views: Vec::new(),
            samplers: Vec::new(),
            render_passes: Vec::new(),
            framebuffers: Vec::new(),
            descriptor_set_layouts: Vec::new(),
            pipeline_layouts: Vec::new(),
            pipelines: Vec::new(),
            shader_modules: Vec::new(),
            semaphores: Vec::new(),
            fences: Vec::new(),
            command_pools: Vec::new(),
            descriptor_pools: Vec::new(),
            query_pools: Vec::new(),
        }
    }

    /// The arena backing this registry, for components that bind their own
    /// buffers (staging, acceleration structures).
    pub fn arena_mut(&mut self) -> &mut DeviceArena {
        &mut self.arena
    }

    /// Create a buffer, bind arena memory to it, and track it. Returns the
    /// mapped pointer for host-visible buffers.
    pub fn allocate_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> Result<(vk::Buffer, Option<*mut u8>), String> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            self.device
                .create_buffer(&buffer_info, None)
                .map_err(|e| format!("Failed to create buffer of {} bytes: {:?}", size, e))?
        };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let allocation = self.arena.allocate(&self.device, requirements, host_visible)?;

        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory, allocation.offset)
                .map_err(|e| format!("Failed to bind buffer memory: {:?}", e))?;
        }

        let mapped = allocation.mapped;
        self.buffers.push((buffer, allocation));
        Ok((buffer, mapped))
    }

    /// Create a device-local image, bind arena memory to it, and track it.
    pub fn allocate_image(&mut self, info: &vk::ImageCreateInfo) -> Result<vk::Image, String> {
        let image = unsafe {
            self.device
                .create_image(info, None)
                .map_err(|e| format!("Failed to create image: {:?}", e))?
        };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = self.arena.allocate(&self.device, requirements, false)?;

        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory, allocation.offset)
                .map_err(|e| format!("Failed to bind image memory: {:?}", e))?;
        }

        self.images.push((image, allocation));
        Ok(image)
    }

    pub fn create_image_view(
        &mut self,
        info: &vk::ImageViewCreateInfo,
    ) -> Result<vk::ImageView, String> {
        let view = unsafe {
            self.device
                .create_image_view(info, None)
                .map_err(|e| format!("Failed to create image view: {:?}", e))?
        };
        self.image_views.push(view);
        Ok(view)
    }

    pub fn create_sampler(&mut self, info: &vk::SamplerCreateInfo) -> Result<vk::Sampler, String> {
        let sampler = unsafe {
            self.device
                .create_sampler(info, None)
                .map_err(|e| format!("Failed to create sampler: {:?}", e))?
        };
        self.samplers.push(sampler);
        Ok(sampler)
    }

    pub fn create_render_pass(
        &mut self,
        info: &vk::RenderPassCreateInfo,
    ) -> Result<vk::RenderPass, String> {
        let render_pass = unsafe {
            self.device
                .create_render_pass(info, None)
                .map_err(|e| format!("Failed to create render pass: {:?}", e))?
        };
        self.render_passes.push(render_pass);
        Ok(render_pass)
    }

    pub fn create_framebuffer(
        &mut self,
        info: &vk::FramebufferCreateInfo,
    ) -> Result<vk::Framebuffer, String> {
        let framebuffer = unsafe {
            self.device
                .create_framebuffer(info, None)
                .map_err(|e| format!("Failed to create framebuffer: {:?}", e))?
        };
        self.framebuffers.push(framebuffer);
        Ok(framebuffer)
    }

    pub fn create_descriptor_set_layout(
        &mut self,
        info: &vk::DescriptorSetLayoutCreateInfo,
    ) -> Result<vk::DescriptorSetLayout, String> {
        let layout = unsafe {
            self.device
                .create_descriptor_set_layout(info, None)
                .map_err(|e| format!("Failed to create descriptor set layout: {:?}", e))?
        };
        self.descriptor_set_layouts.push(layout);
        Ok(layout)
    }

    pub fn create_pipeline_layout(
        &mut self,
        info: &vk::PipelineLayoutCreateInfo,
    ) -> Result<vk::PipelineLayout, String> {
        let layout = unsafe {
            self.device
                .create_pipeline_layout(info, None)
                .map_err(|e| format!("Failed to create pipeline layout: {:?}", e))?
        };
        self.pipeline_layouts.push(layout);
        Ok(layout)
    }

    pub fn create_shader_module(&mut self, code: &[u32]) -> Result<vk::ShaderModule, String> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        let module = unsafe {
            self.device
                .create_shader_module(&info, None)
                .map_err(|e| format!("Failed to create shader module: {:?}", e))?
        };
        self.shader_modules.push(module);
        Ok(module)
    }

    pub fn create_graphics_pipeline(
        &mut self,
        info: &vk::GraphicsPipelineCreateInfo,
    ) -> Result<vk::Pipeline, String> {
        let pipeline = unsafe {
            self.device
                .create_graphics_pipelines(
                    vk::PipelineCache::null(),
                    std::slice::from_ref(info),
                    None,
                )
                .map_err(|(_, e)| format!("Failed to create graphics pipeline: {:?}", e))?[0]
        };
        self.pipelines.push(pipeline);
        Ok(pipeline)
    }

    /// Track a pipeline created elsewhere (e.g. through the ray tracing
    /// pipeline loader) so it participates in bulk teardown.
    pub fn track_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.pipelines.push(pipeline);
    }

    pub fn create_semaphore(&mut self) -> Result<vk::Semaphore, String> {
        let semaphore = unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                .map_err(|e| format!("Failed to create semaphore: {:?}", e))?
        };
        self.semaphores.push(semaphore);
        Ok(semaphore)
    }

    pub fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence, String> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
                .map_err(|e| format!("Failed to create fence: {:?}", e))?
        };
        self.fences.push(fence);
        Ok(fence)
    }

    pub fn create_command_pool(&mut self, queue_family: u32) -> Result<vk::CommandPool, String> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe {
            self.device
                .create_command_pool(&info, None)
                .map_err(|e| format!("Failed to create command pool: {:?}", e))?
        };
        self.command_pools.push(pool);
        Ok(pool)
    }

    pub fn create_descriptor_pool(
        &mut self,
        info: &vk::DescriptorPoolCreateInfo,
    ) -> Result<vk::DescriptorPool, String> {
        let pool = unsafe {
            self.device
                .create_descriptor_pool(info, None)
                .map_err(|e| format!("Failed to create descriptor pool: {:?}", e))?
        };
        self.descriptor_pools.push(pool);
        Ok(pool)
    }

    pub fn create_query_pool(
        &mut self,
        info: &vk::QueryPoolCreateInfo,
    ) -> Result<vk::QueryPool, String> {
        let pool = unsafe {
            self.device
                .create_query_pool(info, None)
                .map_err(|e| format!("Failed to create query pool: {:?}", e))?
        };
        self.query_pools.push(pool);
        Ok(pool)
    }

    pub fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        unsafe { self.device.get_buffer_device_address(&info) }
    }

    /// Destroy every tracked resource, dependents before their dependencies:
    /// samplers and views before images and buffers, framebuffers before
    /// render passes, pipelines before pipeline layouts before descriptor
    /// set layouts, then pools and sync objects, then the arena itself.
    /// Safe to call more than once.
    pub fn release_all(&mut self) {
        let total = self.buffers.len()
            + self.images.len()
            + self.image_views.len()
            + self.samplers.len()
            + self.render_passes.len()
            + self.framebuffers.len()
            + self.descriptor_set_layouts.len()
            + self.pipeline_layouts.len()
            + self.pipelines.len()
            + self.shader_modules.len()
            + self.semaphores.len()
            + self.fences.len()
            + self.command_pools.len()
            + self.descriptor_pools.len()
            + self.query_pools.len();

        unsafe {
            for sampler in self.samplers.drain(..) {
                self.device.destroy_sampler(sampler, None);
            }
            for view in self.image_views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
            for (image, _) in self.images.drain(..) {
                self.device.destroy_image(image, None);
            }
            for (buffer, _) in self.buffers.drain(..) {
                self.device.destroy_buffer(buffer, None);
            }
            for framebuffer in self.framebuffers.drain(..) {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            for render_pass in self.render_passes.drain(..) {
                self.device.destroy_render_pass(render_pass, None);
            }
            for pipeline in self.pipelines.drain(..) {
                self.device.destroy_pipeline(pipeline, None);
            }
            for layout in self.pipeline_layouts.drain(..) {
                self.device.destroy_pipeline_layout(layout, None);
            }
            for layout in self.descriptor_set_layouts.drain(..) {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
            for module in self.shader_modules.drain(..) {
                self.device.destroy_shader_module(module, None);
            }
            for pool in self.descriptor_pools.drain(..) {
                self.device.destroy_descriptor_pool(pool, None);
            }
            for pool in self.query_pools.drain(..) {
                self.device.destroy_query_pool(pool, None);
            }
            for semaphore in self.semaphores.drain(..) {
                self.device.destroy_semaphore(semaphore, None);
            }
            for fence in self.fences.drain(..) {
                self.device.destroy_fence(fence, None);
            }
            for pool in self.command_pools.drain(..) {
                self.device.destroy_command_pool(pool, None);
            }
        }

        self.arena.destroy(&self.device);

        if total > 0 {
            info!("Released {} tracked resources", total);
        }
    }
}
