//! Test doubles for the device dispatch, object table, readback utility, and
//! dumping delegate.
//!
//! `MockDevice` keeps a virtual byte store per buffer handle. Recorded buffer
//! copies stay pending until the command buffer holding them is submitted,
//! mirroring when a real queue would execute them; readback after the (mock)
//! fence wait then observes the same bytes a real submission would have
//! produced.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use ash::vk::{self, Handle as _};

use vk_dump_resources::{
    BufferId, BufferInfo, DeviceDispatch, DumpDelegate, DumpLocation, DumpResult, DrawCallDump,
    DumpError, ImageId, ImageInfo, ImageViewId, ImageViewInfo, ObjectTable, ResourceDump,
    ResourceDumpKind, ResourceReadback,
};

/// Routes crate tracing output through the test harness's capture.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A render pass created through the mock, with enough of its create info
/// retained to assert on.
pub struct CreatedRenderPass {
    pub handle: vk::RenderPass,
    pub subpass_count: u32,
    pub dependencies: Vec<vk::SubpassDependency>,
    pub attachments: Vec<vk::AttachmentDescription>,
}

#[derive(Default)]
pub struct MockGpu {
    next_handle: u64,
    /// Virtual contents, keyed by raw buffer handle.
    pub buffers: HashMap<u64, Vec<u8>>,
    /// Virtual image contents, keyed by raw image handle.
    pub images: HashMap<u64, Vec<u8>>,
    pub render_passes: Vec<CreatedRenderPass>,
    /// Raw command buffer handles of each submission, in order.
    pub submissions: Vec<Vec<u64>>,
    /// Raw fence handle each submission was paired with.
    pub submit_fences: Vec<u64>,
    /// Raw fence handles passed to `reset_fences`, in order.
    pub fence_resets: Vec<u64>,
    /// Copies recorded per command buffer, executed when it is submitted.
    pending_copies: HashMap<u64, Vec<(u64, u64, vk::BufferCopy)>>,
    pub destroyed_buffers: Vec<u64>,
    pub destroyed_render_passes: Vec<u64>,
}

impl MockGpu {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn apply_copy(&mut self, src: u64, dst: u64, region: vk::BufferCopy) {
        let bytes: Vec<u8> = match self.buffers.get(&src) {
            Some(data) => {
                let start = region.src_offset as usize;
                let end = (start + region.size as usize).min(data.len());
                data.get(start..end).map(<[u8]>::to_vec).unwrap_or_default()
            }
            None => Vec::new(),
        };
        if let Some(dst_data) = self.buffers.get_mut(&dst) {
            let at = region.dst_offset as usize;
            let end = (at + bytes.len()).min(dst_data.len());
            dst_data[at..end].copy_from_slice(&bytes[..end - at]);
        }
    }
}

#[derive(Clone)]
pub struct MockDevice {
    pub gpu: Rc<RefCell<MockGpu>>,
}

impl MockDevice {
    pub fn new() -> Self {
        MockDevice {
            gpu: Rc::new(RefCell::new(MockGpu::default())),
        }
    }

    /// Registers an application-owned buffer with known contents and returns
    /// its description for the object table and bind calls.
    pub fn app_buffer(&self, id: u64, contents: Vec<u8>) -> BufferInfo {
        let mut gpu = self.gpu.borrow_mut();
        let raw = gpu.handle();
        let size = contents.len() as vk::DeviceSize;
        gpu.buffers.insert(raw, contents);
        BufferInfo {
            id: BufferId(id),
            handle: vk::Buffer::from_raw(raw),
            size,
            queue_family_index: 0,
        }
    }

    /// Registers an application-owned image's contents for `read_image`.
    pub fn seed_image(&self, raw_handle: u64, contents: Vec<u8>) {
        self.gpu.borrow_mut().images.insert(raw_handle, contents);
    }

    pub fn queue(&self) -> vk::Queue {
        vk::Queue::from_raw(0x5151)
    }
}

impl DeviceDispatch for MockDevice {
    fn allocate_command_buffers(
        &self,
        info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        let mut gpu = self.gpu.borrow_mut();
        Ok((0..info.command_buffer_count)
            .map(|_| vk::CommandBuffer::from_raw(gpu.handle()))
            .collect())
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, _buffers: &[vk::CommandBuffer]) {}

    fn begin_command_buffer(
        &self,
        _buffer: vk::CommandBuffer,
        _info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        Ok(())
    }

    fn end_command_buffer(&self, _buffer: vk::CommandBuffer) -> Result<(), vk::Result> {
        Ok(())
    }

    fn create_fence(&self, _info: &vk::FenceCreateInfo<'_>) -> Result<vk::Fence, vk::Result> {
        Ok(vk::Fence::from_raw(self.gpu.borrow_mut().handle()))
    }

    fn destroy_fence(&self, _fence: vk::Fence) {}

    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<(), vk::Result> {
        let mut gpu = self.gpu.borrow_mut();
        gpu.fence_resets.extend(fences.iter().map(|f| f.as_raw()));
        Ok(())
    }

    fn wait_for_fences(
        &self,
        _fences: &[vk::Fence],
        _wait_all: bool,
        _timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        Ok(())
    }

    fn queue_submit(
        &self,
        _queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        let mut gpu = self.gpu.borrow_mut();
        for submit in submits {
            // SAFETY: the submit info is built by the code under test with a
            // valid command buffer array.
            let cbs = unsafe {
                std::slice::from_raw_parts(
                    submit.p_command_buffers,
                    submit.command_buffer_count as usize,
                )
            };
            let raws: Vec<u64> = cbs.iter().map(|cb| cb.as_raw()).collect();
            for raw in &raws {
                let copies = gpu.pending_copies.get(raw).cloned().unwrap_or_default();
                for (src, dst, region) in copies {
                    gpu.apply_copy(src, dst, region);
                }
            }
            gpu.submissions.push(raws);
            gpu.submit_fences.push(fence.as_raw());
        }
        Ok(())
    }

    fn create_render_pass(
        &self,
        info: &vk::RenderPassCreateInfo<'_>,
    ) -> Result<vk::RenderPass, vk::Result> {
        let mut gpu = self.gpu.borrow_mut();
        let handle = vk::RenderPass::from_raw(gpu.handle());
        // SAFETY: the create info is built by the code under test with valid
        // array pointers.
        let (dependencies, attachments) = unsafe {
            (
                std::slice::from_raw_parts(info.p_dependencies, info.dependency_count as usize)
                    .to_vec(),
                std::slice::from_raw_parts(info.p_attachments, info.attachment_count as usize)
                    .to_vec(),
            )
        };
        gpu.render_passes.push(CreatedRenderPass {
            handle,
            subpass_count: info.subpass_count,
            dependencies,
            attachments,
        });
        Ok(handle)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.gpu
            .borrow_mut()
            .destroyed_render_passes
            .push(render_pass.as_raw());
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> Result<vk::Buffer, vk::Result> {
        let mut gpu = self.gpu.borrow_mut();
        let raw = gpu.handle();
        gpu.buffers.insert(raw, vec![0u8; info.size as usize]);
        Ok(vk::Buffer::from_raw(raw))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut gpu = self.gpu.borrow_mut();
        gpu.buffers.remove(&buffer.as_raw());
        gpu.destroyed_buffers.push(buffer.as_raw());
    }

    fn get_buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self
            .gpu
            .borrow()
            .buffers
            .get(&buffer.as_raw())
            .map(|b| b.len() as vk::DeviceSize)
            .unwrap_or(0);
        vk::MemoryRequirements {
            size,
            alignment: 16,
            memory_type_bits: 1,
        }
    }

    fn allocate_memory(
        &self,
        _info: &vk::MemoryAllocateInfo<'_>,
    ) -> Result<vk::DeviceMemory, vk::Result> {
        Ok(vk::DeviceMemory::from_raw(self.gpu.borrow_mut().handle()))
    }

    fn free_memory(&self, _memory: vk::DeviceMemory) {}

    fn bind_buffer_memory(
        &self,
        _buffer: vk::Buffer,
        _memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        Ok(())
    }

    fn cmd_begin_render_pass(
        &self,
        _buffer: vk::CommandBuffer,
        _info: &vk::RenderPassBeginInfo<'_>,
        _contents: vk::SubpassContents,
    ) {
    }

    fn cmd_next_subpass(&self, _buffer: vk::CommandBuffer, _contents: vk::SubpassContents) {}

    fn cmd_end_render_pass(&self, _buffer: vk::CommandBuffer) {}

    fn cmd_begin_rendering(&self, _buffer: vk::CommandBuffer, _info: &vk::RenderingInfo<'_>) {}

    fn cmd_end_rendering(&self, _buffer: vk::CommandBuffer) {}

    fn cmd_copy_buffer(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        let mut gpu = self.gpu.borrow_mut();
        let pending = gpu.pending_copies.entry(buffer.as_raw()).or_default();
        for region in regions {
            pending.push((src.as_raw(), dst.as_raw(), *region));
        }
    }

    fn cmd_pipeline_barrier(
        &self,
        _buffer: vk::CommandBuffer,
        _src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
        _buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        _image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
    }

    fn cmd_draw(
        &self,
        _buffer: vk::CommandBuffer,
        _vertex_count: u32,
        _instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
    }

    fn cmd_draw_indexed(
        &self,
        _buffer: vk::CommandBuffer,
        _index_count: u32,
        _instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
    }

    fn cmd_draw_indirect(
        &self,
        _buffer: vk::CommandBuffer,
        _params: vk::Buffer,
        _offset: vk::DeviceSize,
        _draw_count: u32,
        _stride: u32,
    ) {
    }

    fn cmd_draw_indexed_indirect(
        &self,
        _buffer: vk::CommandBuffer,
        _params: vk::Buffer,
        _offset: vk::DeviceSize,
        _draw_count: u32,
        _stride: u32,
    ) {
    }

    fn cmd_draw_indirect_count(
        &self,
        _buffer: vk::CommandBuffer,
        _params: vk::Buffer,
        _offset: vk::DeviceSize,
        _count: vk::Buffer,
        _count_offset: vk::DeviceSize,
        _max_draw_count: u32,
        _stride: u32,
    ) {
    }

    fn cmd_draw_indexed_indirect_count(
        &self,
        _buffer: vk::CommandBuffer,
        _params: vk::Buffer,
        _offset: vk::DeviceSize,
        _count: vk::Buffer,
        _count_offset: vk::DeviceSize,
        _max_draw_count: u32,
        _stride: u32,
    ) {
    }
}

pub struct MockReadback {
    pub gpu: Rc<RefCell<MockGpu>>,
}

impl ResourceReadback for MockReadback {
    fn read_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        _queue_family_index: u32,
    ) -> DumpResult<Vec<u8>> {
        let gpu = self.gpu.borrow();
        let data = gpu
            .buffers
            .get(&buffer.as_raw())
            .ok_or_else(|| DumpError::Readback(format!("unknown buffer {:#x}", buffer.as_raw())))?;
        let start = offset as usize;
        let end = start + size as usize;
        data.get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| DumpError::Readback(format!("range {start}..{end} out of bounds")))
    }

    fn read_image(
        &self,
        image: &ImageInfo,
        _layout: vk::ImageLayout,
        _queue_family_index: u32,
    ) -> DumpResult<Vec<u8>> {
        self.gpu
            .borrow()
            .images
            .get(&image.handle.as_raw())
            .cloned()
            .ok_or_else(|| {
                DumpError::Readback(format!("unknown image {:#x}", image.handle.as_raw()))
            })
    }
}

#[derive(Default)]
pub struct MockObjectTable {
    pub buffers: HashMap<BufferId, BufferInfo>,
    pub images: HashMap<ImageId, ImageInfo>,
    pub views: HashMap<ImageViewId, ImageViewInfo>,
}

impl MockObjectTable {
    /// Adds a 2D color image plus a view over it, returning the view id.
    pub fn add_image(&mut self, id: u64, format: vk::Format) -> ImageViewId {
        let image_id = ImageId(id);
        let view_id = ImageViewId(id + 1000);
        self.images.insert(
            image_id,
            ImageInfo {
                id: image_id,
                handle: vk::Image::from_raw(id),
                format,
                extent: vk::Extent3D {
                    width: 64,
                    height: 64,
                    depth: 1,
                },
                level_count: 1,
                layer_count: 1,
                queue_family_index: 0,
            },
        );
        self.views.insert(
            view_id,
            ImageViewInfo {
                id: view_id,
                handle: vk::ImageView::from_raw(id + 2000),
                image: image_id,
            },
        );
        view_id
    }
}

impl ObjectTable for MockObjectTable {
    fn buffer(&self, id: BufferId) -> Option<&BufferInfo> {
        self.buffers.get(&id)
    }

    fn image(&self, id: ImageId) -> Option<&ImageInfo> {
        self.images.get(&id)
    }

    fn image_view(&self, id: ImageViewId) -> Option<&ImageViewInfo> {
        self.views.get(&id)
    }
}

pub struct RecordedResource {
    pub location: DumpLocation,
    pub before: bool,
    pub kind: ResourceDumpKind,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct RecordingDelegate {
    pub draw_calls: Vec<DumpLocation>,
    pub resources: Vec<RecordedResource>,
}

impl RecordingDelegate {
    pub fn count_kind(&self, matcher: impl Fn(&ResourceDumpKind) -> bool) -> usize {
        self.resources.iter().filter(|r| matcher(&r.kind)).count()
    }
}

impl DumpDelegate for RecordingDelegate {
    fn dump_draw_call(&mut self, info: &DrawCallDump<'_>) -> DumpResult<()> {
        self.draw_calls.push(info.location);
        Ok(())
    }

    fn dump_resource(&mut self, resource: &ResourceDump) -> DumpResult<()> {
        self.resources.push(RecordedResource {
            location: resource.location,
            before: resource.before_draw,
            kind: resource.kind.clone(),
            data: resource.data.clone(),
        });
        Ok(())
    }
}

pub fn memory_properties() -> vk::PhysicalDeviceMemoryProperties {
    let mut props = vk::PhysicalDeviceMemoryProperties::default();
    props.memory_type_count = 1;
    props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    props.memory_heap_count = 1;
    props
}
