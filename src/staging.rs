//! Host-visible staging: one growable buffer reused as the source side of
//! every CPU→GPU transfer. Grows to the maximum historical requirement and
//! is never shrunk.

use ash::vk;
use log::info;

use crate::context::RenderContext;
use crate::memory::{DedicatedAllocation, DeviceArena};

/// Growable staging buffer on dedicated host-visible memory.
///
/// Growth destroys and recreates the buffer and its memory, which
/// invalidates any previously obtained mapped pointer. Callers must
/// re-acquire the mapping through `mapped_slice_mut` on every use; the
/// `generation` counter exists so callers can assert they did.
pub struct StagingArena {
    buffer: vk::Buffer,
    memory: Option<DedicatedAllocation>,
    capacity: vk::DeviceSize,
    generation: u64,
}

/// New capacity required for a request, or `None` when the current capacity
/// already covers it.
fn grow_plan(capacity: vk::DeviceSize, requested: vk::DeviceSize) -> Option<vk::DeviceSize> {
    (requested > capacity).then_some(requested)
}

impl StagingArena {
    pub fn new() -> Self {
        Self {
            buffer: vk::Buffer::null(),
            memory: None,
            capacity: 0,
            generation: 0,
        }
    }

    pub fn capacity(&self) -> vk::DeviceSize {
        self.capacity
    }

    /// Bumped on every growth. A mapped pointer obtained under an older
    /// generation is dangling.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Grow the buffer to hold at least `size` bytes. No-op when the current
    /// capacity already suffices.
    pub fn ensure_capacity(
        &mut self,
        ctx: &RenderContext,
        arena: &mut DeviceArena,
        size: vk::DeviceSize,
    ) -> Result<(), String> {
        let Some(new_capacity) = grow_plan(self.capacity, size) else {
            return Ok(());
        };

        self.release(ctx, arena);

        let buffer_info = vk::BufferCreateInfo::default()
            .size(new_capacity)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            ctx.device
                .create_buffer(&buffer_info, None)
                .map_err(|e| format!("Failed to create staging buffer: {:?}", e))?
        };

        let requirements = unsafe { ctx.device.get_buffer_memory_requirements(buffer) };

        // Dedicated memory rather than a pooled chunk: this buffer is large,
        // long-lived, and must be freeable when it is replaced on growth.
        let allocation = arena.allocate_dedicated(&ctx.device, requirements, true)?;

        unsafe {
            ctx.device
                .bind_buffer_memory(buffer, allocation.memory, 0)
                .map_err(|e| format!("Failed to bind staging buffer memory: {:?}", e))?;
        }

        info!("Staging buffer grown to {} bytes", new_capacity);

        self.buffer = buffer;
        self.memory = Some(allocation);
        self.capacity = new_capacity;
        self.generation += 1;
        Ok(())
    }

    /// The writable mapping for the current buffer. Valid only until the
    /// next growth.
    pub fn mapped_slice_mut(&mut self) -> Result<&mut [u8], String> {
        let allocation = self
            .memory
            .as_ref()
            .ok_or("Staging buffer has no backing memory")?;
        let ptr = allocation.mapped.ok_or("Staging buffer is not mapped")?;
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, self.capacity as usize) })
    }

    /// Stage `data` and copy it into `dst` at `dst_offset` via a one-shot
    /// submission, with the transfer barrier the device read requires.
    pub fn upload_to_buffer<T: bytemuck::Pod>(
        &mut self,
        ctx: &RenderContext,
        arena: &mut DeviceArena,
        data: &[T],
        dst: vk::Buffer,
        dst_offset: vk::DeviceSize,
    ) -> Result<(), String> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.is_empty() {
            return Err("Refusing to upload an empty slice".to_string());
        }

        self.ensure_capacity(ctx, arena, bytes.len() as vk::DeviceSize)?;
        self.mapped_slice_mut()?[..bytes.len()].copy_from_slice(bytes);

        let cmd = ctx.begin_one_shot()?;

        let region = vk::BufferCopy::default()
            .src_offset(0)
            .dst_offset(dst_offset)
            .size(bytes.len() as vk::DeviceSize);

        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ);

        unsafe {
            ctx.device.cmd_copy_buffer(cmd, self.buffer, dst, &[region]);
            ctx.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }

        ctx.submit_one_shot(cmd)
    }

    /// Stage tightly packed pixel data and copy it into `image`, leaving it
    /// in `final_layout`.
    pub fn upload_to_image(
        &mut self,
        ctx: &RenderContext,
        arena: &mut DeviceArena,
        data: &[u8],
        image: vk::Image,
        extent: vk::Extent3D,
        final_layout: vk::ImageLayout,
    ) -> Result<(), String> {
        if data.is_empty() {
            return Err("Refusing to upload an empty image".to_string());
        }

        self.ensure_capacity(ctx, arena, data.len() as vk::DeviceSize)?;
        self.mapped_slice_mut()?[..data.len()].copy_from_slice(data);

        let cmd = ctx.begin_one_shot()?;

        cmd_transition_image(
            &ctx.device,
            cmd,
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        );

        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_extent(extent);

        unsafe {
            ctx.device.cmd_copy_buffer_to_image(
                cmd,
                self.buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        cmd_transition_image(
            &ctx.device,
            cmd,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            final_layout,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::ALL_COMMANDS,
        );

        ctx.submit_one_shot(cmd)
    }

    /// Destroy the buffer and return its memory to the driver. Safe to call
    /// more than once.
    pub fn destroy(&mut self, ctx: &RenderContext, arena: &mut DeviceArena) {
        self.release(ctx, arena);
    }

    fn release(&mut self, ctx: &RenderContext, arena: &mut DeviceArena) {
        if self.buffer != vk::Buffer::null() {
            unsafe {
                ctx.device.destroy_buffer(self.buffer, None);
            }
            self.buffer = vk::Buffer::null();
        }
        if let Some(allocation) = self.memory.take() {
            arena.free_dedicated(&ctx.device, allocation);
        }
        self.capacity = 0;
    }
}

impl Default for StagingArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Record an image layout transition.
pub fn cmd_transition_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        );

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_only_when_capacity_is_exceeded() {
        assert_eq!(grow_plan(0, 100), Some(100));
        assert_eq!(grow_plan(100, 200), Some(200));
        assert_eq!(grow_plan(100, 100), None);
        assert_eq!(grow_plan(100, 50), None);
        assert_eq!(grow_plan(100, 0), None);
    }

    #[test]
    fn capacity_never_shrinks_across_a_request_sequence() {
        let mut capacity = 0;
        let mut growths = 0;
        for &request in &[64u64, 1024, 512, 1024, 4096, 1] {
            if let Some(new_capacity) = grow_plan(capacity, request) {
                assert!(new_capacity > capacity);
                capacity = new_capacity;
                growths += 1;
            }
            assert!(capacity >= request);
        }
        // 64 -> 1024 -> 4096; repeats and smaller requests are no-ops.
        assert_eq!(growths, 3);
        assert_eq!(capacity, 4096);
    }
}
