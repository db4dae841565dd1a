//! Device-level dispatch interface.
//!
//! The dump engine never loads Vulkan entry points itself. Everything it
//! records or submits goes through [`DeviceDispatch`], the narrow slice of the
//! device table it actually needs: command buffer lifetime, fence
//! synchronization, render pass / buffer creation for clones, and the copy /
//! barrier / draw commands injected into cloned command buffers.
//!
//! The replay driver hands in its `ash::Device` (the blanket impl below); test
//! suites substitute a recording fake.

use ash::vk;

/// Device-scoped dispatch table consumed by the dump engine.
///
/// All methods operate on the device the implementation was created for, so no
/// `VkDevice` parameter appears here. Implementations are expected to be cheap
/// to clone (`ash::Device` is internally reference counted).
pub trait DeviceDispatch {
    // Command buffer lifetime.
    fn allocate_command_buffers(
        &self,
        info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result>;
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result>;
    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<(), vk::Result>;

    // Synchronization.
    fn create_fence(&self, info: &vk::FenceCreateInfo<'_>) -> Result<vk::Fence, vk::Result>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<(), vk::Result>;
    fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result>;
    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result>;

    // Render pass clones.
    fn create_render_pass(
        &self,
        info: &vk::RenderPassCreateInfo<'_>,
    ) -> Result<vk::RenderPass, vk::Result>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    // Clone buffer allocation.
    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> Result<vk::Buffer, vk::Result>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn get_buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn allocate_memory(
        &self,
        info: &vk::MemoryAllocateInfo<'_>,
    ) -> Result<vk::DeviceMemory, vk::Result>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result>;

    // Recorded commands.
    fn cmd_begin_render_pass(
        &self,
        buffer: vk::CommandBuffer,
        info: &vk::RenderPassBeginInfo<'_>,
        contents: vk::SubpassContents,
    );
    fn cmd_next_subpass(&self, buffer: vk::CommandBuffer, contents: vk::SubpassContents);
    fn cmd_end_render_pass(&self, buffer: vk::CommandBuffer);
    fn cmd_begin_rendering(&self, buffer: vk::CommandBuffer, info: &vk::RenderingInfo<'_>);
    fn cmd_end_rendering(&self, buffer: vk::CommandBuffer);
    fn cmd_copy_buffer(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    fn cmd_pipeline_barrier(
        &self,
        buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    );
    fn cmd_draw(
        &self,
        buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    #[allow(clippy::too_many_arguments)]
    fn cmd_draw_indexed(
        &self,
        buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_draw_indirect(
        &self,
        buffer: vk::CommandBuffer,
        params: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    );
    fn cmd_draw_indexed_indirect(
        &self,
        buffer: vk::CommandBuffer,
        params: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    );
    #[allow(clippy::too_many_arguments)]
    fn cmd_draw_indirect_count(
        &self,
        buffer: vk::CommandBuffer,
        params: vk::Buffer,
        offset: vk::DeviceSize,
        count: vk::Buffer,
        count_offset: vk::DeviceSize,
        max_draw_count: u32,
        stride: u32,
    );
    #[allow(clippy::too_many_arguments)]
    fn cmd_draw_indexed_indirect_count(
        &self,
        buffer: vk::CommandBuffer,
        params: vk::Buffer,
        offset: vk::DeviceSize,
        count: vk::Buffer,
        count_offset: vk::DeviceSize,
        max_draw_count: u32,
        stride: u32,
    );
}

impl DeviceDispatch for ash::Device {
    fn allocate_command_buffers(
        &self,
        info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        // SAFETY: info is fully initialised; the pool belongs to this device.
        unsafe { ash::Device::allocate_command_buffers(self, info) }
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        // SAFETY: buffers were allocated from pool on this device.
        unsafe { ash::Device::free_command_buffers(self, pool, buffers) }
    }

    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        // SAFETY: buffer is a valid primary command buffer of this device.
        unsafe { ash::Device::begin_command_buffer(self, buffer, info) }
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<(), vk::Result> {
        // SAFETY: buffer is in the recording state.
        unsafe { ash::Device::end_command_buffer(self, buffer) }
    }

    fn create_fence(&self, info: &vk::FenceCreateInfo<'_>) -> Result<vk::Fence, vk::Result> {
        // SAFETY: info is fully initialised.
        unsafe { ash::Device::create_fence(self, info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        // SAFETY: fence was created from this device and is unsignaled or idle.
        unsafe { ash::Device::destroy_fence(self, fence, None) }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<(), vk::Result> {
        // SAFETY: fences belong to this device and are not in use by a queue.
        unsafe { ash::Device::reset_fences(self, fences) }
    }

    fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        // SAFETY: fences belong to this device.
        unsafe { ash::Device::wait_for_fences(self, fences, wait_all, timeout_ns) }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        // SAFETY: queue and the referenced command buffers belong to this
        // device; submits is fully initialised.
        unsafe { ash::Device::queue_submit(self, queue, submits, fence) }
    }

    fn create_render_pass(
        &self,
        info: &vk::RenderPassCreateInfo<'_>,
    ) -> Result<vk::RenderPass, vk::Result> {
        // SAFETY: info is fully initialised.
        unsafe { ash::Device::create_render_pass(self, info, None) }
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        // SAFETY: render_pass was created from this device and is idle.
        unsafe { ash::Device::destroy_render_pass(self, render_pass, None) }
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: info is fully initialised.
        unsafe { ash::Device::create_buffer(self, info, None) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: buffer was created from this device and is idle.
        unsafe { ash::Device::destroy_buffer(self, buffer, None) }
    }

    fn get_buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        // SAFETY: buffer is a valid buffer of this device.
        unsafe { ash::Device::get_buffer_memory_requirements(self, buffer) }
    }

    fn allocate_memory(
        &self,
        info: &vk::MemoryAllocateInfo<'_>,
    ) -> Result<vk::DeviceMemory, vk::Result> {
        // SAFETY: info is fully initialised.
        unsafe { ash::Device::allocate_memory(self, info, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: memory was allocated from this device and is unbound or its
        // buffers are destroyed.
        unsafe { ash::Device::free_memory(self, memory, None) }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: buffer and memory belong to this device; offset satisfies
        // the buffer's alignment requirement (0 for a dedicated allocation).
        unsafe { ash::Device::bind_buffer_memory(self, buffer, memory, offset) }
    }

    fn cmd_begin_render_pass(
        &self,
        buffer: vk::CommandBuffer,
        info: &vk::RenderPassBeginInfo<'_>,
        contents: vk::SubpassContents,
    ) {
        // SAFETY: buffer is recording; info is fully initialised.
        unsafe { ash::Device::cmd_begin_render_pass(self, buffer, info, contents) }
    }

    fn cmd_next_subpass(&self, buffer: vk::CommandBuffer, contents: vk::SubpassContents) {
        // SAFETY: buffer is recording inside a render pass.
        unsafe { ash::Device::cmd_next_subpass(self, buffer, contents) }
    }

    fn cmd_end_render_pass(&self, buffer: vk::CommandBuffer) {
        // SAFETY: buffer is recording inside a render pass.
        unsafe { ash::Device::cmd_end_render_pass(self, buffer) }
    }

    fn cmd_begin_rendering(&self, buffer: vk::CommandBuffer, info: &vk::RenderingInfo<'_>) {
        // SAFETY: buffer is recording; info is fully initialised.
        unsafe { ash::Device::cmd_begin_rendering(self, buffer, info) }
    }

    fn cmd_end_rendering(&self, buffer: vk::CommandBuffer) {
        // SAFETY: buffer is recording inside dynamic rendering.
        unsafe { ash::Device::cmd_end_rendering(self, buffer) }
    }

    fn cmd_copy_buffer(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: buffer is recording outside a render pass; regions are
        // in-bounds for both buffers.
        unsafe { ash::Device::cmd_copy_buffer(self, buffer, src, dst, regions) }
    }

    fn cmd_pipeline_barrier(
        &self,
        buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        // SAFETY: buffer is recording; barriers reference live resources.
        unsafe {
            ash::Device::cmd_pipeline_barrier(
                self,
                buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                buffer_barriers,
                image_barriers,
            )
        }
    }

    fn cmd_draw(
        &self,
        buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        // SAFETY: buffer is recording inside a render pass with graphics state
        // bound (mirrored from the original stream).
        unsafe {
            ash::Device::cmd_draw(
                self,
                buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        }
    }

    fn cmd_draw_indexed(
        &self,
        buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        // SAFETY: see cmd_draw; an index buffer is bound.
        unsafe {
            ash::Device::cmd_draw_indexed(
                self,
                buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }

    fn cmd_draw_indirect(
        &self,
        buffer: vk::CommandBuffer,
        params: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    ) {
        // SAFETY: see cmd_draw; params satisfies the indirect validity rules.
        unsafe { ash::Device::cmd_draw_indirect(self, buffer, params, offset, draw_count, stride) }
    }

    fn cmd_draw_indexed_indirect(
        &self,
        buffer: vk::CommandBuffer,
        params: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    ) {
        // SAFETY: see cmd_draw_indirect; an index buffer is bound.
        unsafe {
            ash::Device::cmd_draw_indexed_indirect(self, buffer, params, offset, draw_count, stride)
        }
    }

    fn cmd_draw_indirect_count(
        &self,
        buffer: vk::CommandBuffer,
        params: vk::Buffer,
        offset: vk::DeviceSize,
        count: vk::Buffer,
        count_offset: vk::DeviceSize,
        max_draw_count: u32,
        stride: u32,
    ) {
        // SAFETY: see cmd_draw_indirect; count holds the GPU-written count.
        unsafe {
            ash::Device::cmd_draw_indirect_count(
                self,
                buffer,
                params,
                offset,
                count,
                count_offset,
                max_draw_count,
                stride,
            )
        }
    }

    fn cmd_draw_indexed_indirect_count(
        &self,
        buffer: vk::CommandBuffer,
        params: vk::Buffer,
        offset: vk::DeviceSize,
        count: vk::Buffer,
        count_offset: vk::DeviceSize,
        max_draw_count: u32,
        stride: u32,
    ) {
        // SAFETY: see cmd_draw_indirect_count; an index buffer is bound.
        unsafe {
            ash::Device::cmd_draw_indexed_indirect_count(
                self,
                buffer,
                params,
                offset,
                count,
                count_offset,
                max_draw_count,
                stride,
            )
        }
    }
}
