//! The dump context: owns the cloned command buffers and drives capture.
//!
//! One context shadows one original command buffer. As the replay driver
//! re-records that buffer it mirrors every call here; binds update the bound
//! state tracker, render-pass boundaries and draws are re-issued into every
//! still-recording clone. A clone is finalized right after its assigned draw
//! call (right before it, for the "before" clone of a pair), so clone i holds
//! the original command stream truncated at captured draw i. At submission
//! time `dump_draw_calls` runs each clone to completion behind a fence and
//! extracts the draw's inputs and outputs between submissions.

use std::collections::{BTreeMap, HashMap, HashSet};

use ash::vk;

use crate::delegate::{
    DrawCallDump, DumpDelegate, DumpLocation, RenderTargets, ResourceDump, ResourceDumpKind,
};
use crate::dispatch::DeviceDispatch;
use crate::draw_call::{
    CloneBuffer, DrawCallRecord, DrawIndexedIndirectArgs, DrawIndirectArgs, DrawParams,
    IndirectCountParams, IndirectParams, ResolvedDraws,
};
use crate::error::{DumpError, DumpResult};
use crate::format::format_aspect_mask;
use crate::indirect;
use crate::object_table::{
    BufferId, BufferInfo, DescriptorSetInfo, FramebufferInfo, ImageId, ImageInfo, ImageViewId,
    ObjectTable, PipelineInfo, RenderPassInfo, VertexInputState,
};
use crate::readback::ResourceReadback;
use crate::render_pass::{build_render_pass_clones, create_render_pass_clones};
use crate::state::{resolve_descriptor_range, BoundState};
use crate::vertex::dump_vertex_index_data;

/// What to extract for each captured draw call.
#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    /// Also capture resource state immediately before each draw executes,
    /// doubling the clone count.
    pub dump_before: bool,
    /// Capture the depth attachment in addition to color.
    pub dump_depth: bool,
    /// Restrict color attachment capture to one index; `None` captures all.
    pub color_attachment_index: Option<usize>,
    pub dump_vertex_index_buffers: bool,
    pub dump_immutable_resources: bool,
}

/// Semaphore payload of the original submission, redistributed across the
/// per-clone submissions.
#[derive(Debug, Clone, Default)]
pub struct SubmitDesc {
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_dst_stage_mask: Vec<vk::PipelineStageFlags>,
    pub signal_semaphores: Vec<vk::Semaphore>,
}

/// One attachment of a dynamic rendering scope.
#[derive(Clone, Copy)]
pub struct RenderingAttachmentDesc {
    pub view: ImageViewId,
    pub image_layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_value: vk::ClearValue,
}

/// `vkCmdBeginRendering` parameters, pre-resolved to trace identifiers.
#[derive(Clone)]
pub struct RenderingDesc {
    pub render_area: vk::Rect2D,
    pub layer_count: u32,
    pub view_mask: u32,
    pub color_attachments: Vec<RenderingAttachmentDesc>,
    pub depth_attachment: Option<RenderingAttachmentDesc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassState {
    None,
    RenderPass,
    DynamicRendering,
}

/// The render pass being recorded, kept until its end boundary.
struct ActivePass {
    handle: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    info: RenderPassInfo,
    framebuffer_attachments: Vec<ImageViewId>,
    render_area: vk::Rect2D,
    clear_values: Vec<vk::ClearValue>,
    handled: bool,
}

struct ActiveRendering {
    desc: RenderingDesc,
    handled: bool,
}

/// Pre-draw copy of a storage buffer descriptor, taken so the "before" dump
/// of a draw still sees the bytes the draw could overwrite.
struct DescriptorBackup {
    set: u32,
    binding: u32,
    element: usize,
    source: BufferInfo,
    source_offset: vk::DeviceSize,
    clone: CloneBuffer,
}

/// Identities already extracted within one render pass.
#[derive(Default)]
struct DumpedDescriptors {
    images: HashSet<ImageId>,
    buffers: HashSet<BufferId>,
    inline_blocks: HashSet<(u32, u32)>,
}

/// Linear scan over sorted per-render-pass marker rows. Row r holds the
/// stream indices of that pass's boundary calls (begin, each next-subpass,
/// end); a draw strictly between markers s and s+1 sits in subpass s.
fn locate_in_markers(markers: &[Vec<u64>], draw_index: u64) -> Option<(u64, u64)> {
    for (rp, row) in markers.iter().enumerate() {
        for sp in 0..row.len().saturating_sub(1) {
            if row[sp] < draw_index && draw_index < row[sp + 1] {
                return Some((rp as u64, sp as u64));
            }
        }
    }
    None
}

fn markers_contain(markers: &[Vec<u64>], index: u64) -> bool {
    markers.iter().any(|row| match (row.first(), row.last()) {
        (Some(&first), Some(&last)) => first <= index && index <= last,
        _ => false,
    })
}

fn is_image_descriptor(ty: vk::DescriptorType) -> bool {
    matches!(
        ty,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            | vk::DescriptorType::SAMPLED_IMAGE
            | vk::DescriptorType::STORAGE_IMAGE
            | vk::DescriptorType::INPUT_ATTACHMENT
    )
}

fn is_buffer_descriptor(ty: vk::DescriptorType) -> bool {
    matches!(
        ty,
        vk::DescriptorType::UNIFORM_BUFFER
            | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
            | vk::DescriptorType::STORAGE_BUFFER
            | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
            | vk::DescriptorType::UNIFORM_TEXEL_BUFFER
            | vk::DescriptorType::STORAGE_TEXEL_BUFFER
    )
}

fn is_storage_buffer(ty: vk::DescriptorType) -> bool {
    matches!(
        ty,
        vk::DescriptorType::STORAGE_BUFFER | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
    )
}

/// Capture context for one command buffer's worth of draw calls.
pub struct DumpContext<D: DeviceDispatch> {
    device: D,
    queue_family_index: u32,
    command_pool: vk::CommandPool,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    options: DumpOptions,

    /// Sorted stream indices of the draw calls to capture.
    draw_call_indices: Vec<u64>,
    /// Boundary-call indices of each render pass containing a captured draw.
    render_pass_markers: Vec<Vec<u64>>,
    begin_command_buffer_index: u64,

    command_buffers: Vec<vk::CommandBuffer>,
    /// First clone still recording; everything before it is finalized.
    current_clone: usize,
    aux_command_buffer: vk::CommandBuffer,
    aux_fence: vk::Fence,

    bound: BoundState,
    records: BTreeMap<u64, DrawCallRecord>,
    backups: HashMap<u64, Vec<DescriptorBackup>>,
    last_draw_index: Option<u64>,

    pass_state: PassState,
    active_pass: Option<ActivePass>,
    active_rendering: Option<ActiveRendering>,
    /// Count of handled passes completed; indexes the per-pass vectors below
    /// while a pass is being recorded.
    current_render_pass: u64,
    current_subpass: u64,
    render_pass_clones: Vec<Vec<vk::RenderPass>>,
    render_targets: Vec<Vec<RenderTargets>>,
    /// Pre-capture layout of every render target, per pass and subpass, for
    /// the layout revert after capture.
    revert_layouts: Vec<Vec<Vec<(ImageInfo, vk::ImageLayout)>>>,
    render_areas: Vec<vk::Rect2D>,

    dumped: HashMap<u64, DumpedDescriptors>,
}

impl<D: DeviceDispatch> DumpContext<D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: D,
        queue_family_index: u32,
        command_pool: vk::CommandPool,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        draw_call_indices: Vec<u64>,
        render_pass_markers: Vec<Vec<u64>>,
        begin_command_buffer_index: u64,
        options: DumpOptions,
    ) -> Self {
        debug_assert!(draw_call_indices.windows(2).all(|w| w[0] < w[1]));
        debug_assert!(render_pass_markers
            .iter()
            .all(|row| row.windows(2).all(|w| w[0] < w[1])));
        DumpContext {
            device,
            queue_family_index,
            command_pool,
            memory_properties,
            options,
            draw_call_indices,
            render_pass_markers,
            begin_command_buffer_index,
            command_buffers: Vec::new(),
            current_clone: 0,
            aux_command_buffer: vk::CommandBuffer::null(),
            aux_fence: vk::Fence::null(),
            bound: BoundState::default(),
            records: BTreeMap::new(),
            backups: HashMap::new(),
            last_draw_index: None,
            pass_state: PassState::None,
            active_pass: None,
            active_rendering: None,
            current_render_pass: 0,
            current_subpass: 0,
            render_pass_clones: Vec::new(),
            render_targets: Vec::new(),
            revert_layouts: Vec::new(),
            render_areas: Vec::new(),
            dumped: HashMap::new(),
        }
    }

    fn clones_per_draw(&self) -> usize {
        if self.options.dump_before {
            2
        } else {
            1
        }
    }

    fn clone_slot(&self, clone_index: usize) -> usize {
        clone_index / self.clones_per_draw()
    }

    fn clone_draw_index(&self, clone_index: usize) -> u64 {
        self.draw_call_indices[self.clone_slot(clone_index)]
    }

    /// Is this draw-call stream index in the capture set?
    pub fn must_dump_draw_call(&self, index: u64) -> bool {
        self.draw_call_indices.binary_search(&index).is_ok()
    }

    /// Does the render pass whose boundary call has this stream index contain
    /// a captured draw?
    pub fn should_handle_render_pass(&self, index: u64) -> bool {
        markers_contain(&self.render_pass_markers, index)
    }

    /// The (render pass, subpass) pair a captured draw index falls in.
    fn render_pass_location(&self, draw_index: u64) -> (u64, u64) {
        match locate_in_markers(&self.render_pass_markers, draw_index) {
            Some(location) => location,
            None => {
                debug_assert!(false, "draw {draw_index} outside every render pass range");
                tracing::warn!(draw_index, "draw call outside every render pass range");
                (0, 0)
            }
        }
    }

    /// Allocates and begins the cloned command buffers, one (or two) per
    /// captured draw call, plus the auxiliary buffer used for layout reverts.
    /// Mirrors the original buffer's begin.
    pub fn clone_command_buffer(&mut self) -> DumpResult<()> {
        debug_assert!(self.command_buffers.is_empty());
        let count = self.draw_call_indices.len() * self.clones_per_draw() + 1;
        let alloc = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);
        let mut buffers = self
            .device
            .allocate_command_buffers(&alloc)
            .map_err(|e| DumpError::api("vkAllocateCommandBuffers", e))?;
        self.aux_command_buffer = buffers.pop().unwrap_or(vk::CommandBuffer::null());
        let begin = vk::CommandBufferBeginInfo::default();
        for &cb in &buffers {
            self.device
                .begin_command_buffer(cb, &begin)
                .map_err(|e| DumpError::api("vkBeginCommandBuffer", e))?;
        }
        self.command_buffers = buffers;
        let fence = vk::FenceCreateInfo::default();
        self.aux_fence = self
            .device
            .create_fence(&fence)
            .map_err(|e| DumpError::api("vkCreateFence", e))?;
        Ok(())
    }

    /// Clones still recording; the replay driver forwards every command that
    /// has no mirror operation here into each of these directly.
    pub fn active_command_buffers(&self) -> &[vk::CommandBuffer] {
        &self.command_buffers[self.current_clone..]
    }

    // Bind mirrors. These only update the tracker; the replay driver forwards
    // the actual commands through `active_command_buffers`.

    pub fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: PipelineInfo) {
        self.bound.bind_pipeline(bind_point, pipeline);
    }

    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        first_set: u32,
        sets: &[DescriptorSetInfo],
        dynamic_offsets: &[u32],
    ) {
        self.bound
            .bind_descriptor_sets(bind_point, first_set, sets, dynamic_offsets);
    }

    pub fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[Option<BufferInfo>],
        offsets: &[vk::DeviceSize],
    ) {
        self.bound.bind_vertex_buffers(first_binding, buffers, offsets);
    }

    pub fn bind_vertex_buffers2(
        &mut self,
        first_binding: u32,
        buffers: &[Option<BufferInfo>],
        offsets: &[vk::DeviceSize],
        sizes: Option<&[vk::DeviceSize]>,
        strides: Option<&[vk::DeviceSize]>,
    ) {
        self.bound
            .bind_vertex_buffers2(first_binding, buffers, offsets, sizes, strides);
    }

    pub fn set_vertex_input(&mut self, state: VertexInputState) {
        self.bound.set_vertex_input(state);
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: Option<BufferInfo>,
        offset: vk::DeviceSize,
        size: Option<vk::DeviceSize>,
        index_type: vk::IndexType,
    ) {
        self.bound.bind_index_buffer(buffer, offset, size, index_type);
    }

    // Render pass boundaries.

    #[allow(clippy::too_many_arguments)]
    pub fn begin_render_pass(
        &mut self,
        table: &dyn ObjectTable,
        index: u64,
        render_pass: &RenderPassInfo,
        framebuffer: &FramebufferInfo,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
        contents: vk::SubpassContents,
    ) -> DumpResult<()> {
        debug_assert_eq!(self.pass_state, PassState::None);
        let handled = self.should_handle_render_pass(index);
        if handled {
            let descs = build_render_pass_clones(render_pass);
            let clones = create_render_pass_clones(&self.device, &descs)?;
            self.render_pass_clones.push(clones);
            let (targets, reverts) =
                framebuffer_targets(table, render_pass, &framebuffer.attachments, 0);
            self.render_targets.push(vec![targets]);
            self.revert_layouts.push(vec![reverts]);
            self.render_areas.push(render_area);
        }
        self.active_pass = Some(ActivePass {
            handle: render_pass.handle,
            framebuffer: framebuffer.handle,
            info: render_pass.clone(),
            framebuffer_attachments: framebuffer.attachments.clone(),
            render_area,
            clear_values: clear_values.to_vec(),
            handled,
        });
        self.pass_state = PassState::RenderPass;
        self.current_subpass = 0;

        for i in self.current_clone..self.command_buffers.len() {
            let cb = self.command_buffers[i];
            let handle = self.pass_handle_for_clone(i, handled);
            let info = vk::RenderPassBeginInfo::default()
                .render_pass(handle)
                .framebuffer(framebuffer.handle)
                .render_area(render_area)
                .clear_values(clear_values);
            self.device.cmd_begin_render_pass(cb, &info, contents);
        }
        Ok(())
    }

    /// Picks the render pass a clone begins with: the truncated clone for its
    /// assigned subpass when its draw sits in the pass being recorded, the
    /// original pass otherwise.
    fn pass_handle_for_clone(&self, clone_index: usize, handled: bool) -> vk::RenderPass {
        let original = self
            .active_pass
            .as_ref()
            .map(|p| p.handle)
            .unwrap_or(vk::RenderPass::null());
        if !handled {
            return original;
        }
        let draw_index = self.clone_draw_index(clone_index);
        let (rp, sp) = self.render_pass_location(draw_index);
        if rp != self.current_render_pass {
            return original;
        }
        self.render_pass_clones[rp as usize]
            .get(sp as usize)
            .copied()
            .unwrap_or(original)
    }

    pub fn next_subpass(&mut self, table: &dyn ObjectTable, contents: vk::SubpassContents) {
        debug_assert_eq!(self.pass_state, PassState::RenderPass);
        self.current_subpass += 1;
        if let Some(pass) = &self.active_pass {
            if pass.handled {
                let (targets, reverts) = framebuffer_targets(
                    table,
                    &pass.info,
                    &pass.framebuffer_attachments,
                    self.current_subpass as usize,
                );
                if let Some(row) = self.render_targets.last_mut() {
                    row.push(targets);
                }
                if let Some(row) = self.revert_layouts.last_mut() {
                    row.push(reverts);
                }
            }
        }
        for i in self.current_clone..self.command_buffers.len() {
            self.device
                .cmd_next_subpass(self.command_buffers[i], contents);
        }
    }

    pub fn end_render_pass(&mut self) {
        debug_assert_eq!(self.pass_state, PassState::RenderPass);
        for i in self.current_clone..self.command_buffers.len() {
            self.device.cmd_end_render_pass(self.command_buffers[i]);
        }
        if self.active_pass.as_ref().is_some_and(|p| p.handled) {
            self.current_render_pass += 1;
        }
        self.active_pass = None;
        self.pass_state = PassState::None;
        self.current_subpass = 0;
    }

    pub fn begin_rendering(
        &mut self,
        table: &dyn ObjectTable,
        index: u64,
        desc: &RenderingDesc,
    ) -> DumpResult<()> {
        debug_assert_eq!(self.pass_state, PassState::None);
        let handled = self.should_handle_render_pass(index);
        if handled {
            // Keeps the per-pass vectors aligned with the marker rows; a
            // dynamic rendering scope has no render pass objects to clone.
            self.render_pass_clones.push(Vec::new());
            let (targets, reverts) = rendering_targets(table, desc);
            self.render_targets.push(vec![targets]);
            self.revert_layouts.push(vec![reverts]);
            self.render_areas.push(desc.render_area);
        }
        self.active_rendering = Some(ActiveRendering {
            desc: desc.clone(),
            handled,
        });
        self.pass_state = PassState::DynamicRendering;
        self.current_subpass = 0;

        for i in self.current_clone..self.command_buffers.len() {
            let cb = self.command_buffers[i];
            // Force stores only in the clones that will be captured from this
            // scope; the rest replay the original ops.
            let force_store = handled && {
                let (rp, _) = self.render_pass_location(self.clone_draw_index(i));
                rp == self.current_render_pass
            };
            record_begin_rendering(&self.device, table, cb, desc, force_store);
        }
        Ok(())
    }

    pub fn end_rendering(&mut self) {
        debug_assert_eq!(self.pass_state, PassState::DynamicRendering);
        for i in self.current_clone..self.command_buffers.len() {
            self.device.cmd_end_rendering(self.command_buffers[i]);
        }
        if self.active_rendering.as_ref().is_some_and(|r| r.handled) {
            self.current_render_pass += 1;
        }
        self.active_rendering = None;
        self.pass_state = PassState::None;
    }

    // Draw mirrors.

    pub fn draw(
        &mut self,
        index: u64,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> DumpResult<()> {
        self.handle_draw(
            index,
            DrawParams::Draw(DrawIndirectArgs {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            }),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw_indexed(
        &mut self,
        index: u64,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> DumpResult<()> {
        self.handle_draw(
            index,
            DrawParams::DrawIndexed(DrawIndexedIndirectArgs {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            }),
        )
    }

    pub fn draw_indirect(
        &mut self,
        index: u64,
        indexed: bool,
        buffer: BufferInfo,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    ) -> DumpResult<()> {
        self.handle_draw(
            index,
            DrawParams::DrawIndirect(IndirectParams {
                indexed,
                buffer,
                offset,
                draw_count,
                stride,
                clone: None,
                resolved: ResolvedDraws::Pending,
            }),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw_indirect_count(
        &mut self,
        index: u64,
        indexed: bool,
        buffer: BufferInfo,
        offset: vk::DeviceSize,
        count_buffer: BufferInfo,
        count_offset: vk::DeviceSize,
        max_draw_count: u32,
        stride: u32,
    ) -> DumpResult<()> {
        self.handle_draw(
            index,
            DrawParams::DrawIndirectCount(IndirectCountParams {
                indexed,
                buffer,
                offset,
                count_buffer,
                count_offset,
                max_draw_count,
                stride,
                clone: None,
                count_clone: None,
                actual_draw_count: None,
                resolved: ResolvedDraws::Pending,
            }),
        )
    }

    fn handle_draw(&mut self, index: u64, params: DrawParams) -> DumpResult<()> {
        debug_assert!(
            self.last_draw_index.is_none_or(|last| last < index),
            "draw call indices must be strictly increasing"
        );
        self.last_draw_index = Some(index);

        let capture = self.must_dump_draw_call(index);
        if capture {
            let mut recorded = params.clone();
            indirect::create_param_clones(&self.device, &self.memory_properties, &mut recorded)?;
            let record = DrawCallRecord {
                params: recorded,
                vertex_input: self.bound.effective_vertex_input(),
                vertex_buffers: self.bound.vertex_buffers.clone(),
                index_buffer: self.bound.index_buffer,
                descriptor_sets: self.bound.descriptor_sets.clone(),
                render_pass: self.current_render_pass,
                subpass: self.current_subpass,
            };
            let dump_before = self.options.dump_before;
            if dump_before {
                self.stage_descriptor_backups(index, &record)?;
            }
            self.records.insert(index, record);
            if dump_before {
                // The "before" clone ends without the draw.
                self.finalize_active_clone(Some(index), false)?;
            }
        }
        for i in self.current_clone..self.command_buffers.len() {
            self.record_draw(self.command_buffers[i], &params);
        }
        if capture {
            self.finalize_active_clone(Some(index), true)?;
        }
        Ok(())
    }

    fn record_draw(&self, cb: vk::CommandBuffer, params: &DrawParams) {
        match params {
            DrawParams::Draw(a) => self.device.cmd_draw(
                cb,
                a.vertex_count,
                a.instance_count,
                a.first_vertex,
                a.first_instance,
            ),
            DrawParams::DrawIndexed(a) => self.device.cmd_draw_indexed(
                cb,
                a.index_count,
                a.instance_count,
                a.first_index,
                a.vertex_offset,
                a.first_instance,
            ),
            DrawParams::DrawIndirect(p) => {
                if p.indexed {
                    self.device.cmd_draw_indexed_indirect(
                        cb,
                        p.buffer.handle,
                        p.offset,
                        p.draw_count,
                        p.stride,
                    );
                } else {
                    self.device.cmd_draw_indirect(
                        cb,
                        p.buffer.handle,
                        p.offset,
                        p.draw_count,
                        p.stride,
                    );
                }
            }
            DrawParams::DrawIndirectCount(p) => {
                if p.indexed {
                    self.device.cmd_draw_indexed_indirect_count(
                        cb,
                        p.buffer.handle,
                        p.offset,
                        p.count_buffer.handle,
                        p.count_offset,
                        p.max_draw_count,
                        p.stride,
                    );
                } else {
                    self.device.cmd_draw_indirect_count(
                        cb,
                        p.buffer.handle,
                        p.offset,
                        p.count_buffer.handle,
                        p.count_offset,
                        p.max_draw_count,
                        p.stride,
                    );
                }
            }
        }
    }

    /// Clones the storage-class buffer descriptors a draw can overwrite, so
    /// the "before" dump still observes their pre-draw contents. The copy
    /// itself is recorded while finalizing the "before" clone.
    fn stage_descriptor_backups(&mut self, index: u64, record: &DrawCallRecord) -> DumpResult<()> {
        let mut backups = Vec::new();
        for (&set, set_info) in &record.descriptor_sets {
            for (&binding, binding_info) in &set_info.bindings {
                if !is_storage_buffer(binding_info.descriptor_type) {
                    continue;
                }
                for (element, desc) in binding_info.buffers.iter().enumerate() {
                    let Some(buffer) = desc.buffer else { continue };
                    let range = resolve_descriptor_range(desc);
                    if range == 0 {
                        continue;
                    }
                    let clone =
                        indirect::create_clone_buffer(&self.device, &self.memory_properties, range)?;
                    backups.push(DescriptorBackup {
                        set,
                        binding,
                        element,
                        source: buffer,
                        source_offset: desc.offset,
                        clone,
                    });
                }
            }
        }
        if !backups.is_empty() {
            self.backups.insert(index, backups);
        }
        Ok(())
    }

    /// Closes the first still-recording clone: ends the pass it is inside,
    /// records the staged transfer work that must sit outside a render pass,
    /// and ends the command buffer.
    fn finalize_active_clone(&mut self, draw_index: Option<u64>, is_after: bool) -> DumpResult<()> {
        let cb = self.command_buffers[self.current_clone];
        match self.pass_state {
            PassState::None => {}
            PassState::RenderPass => self.device.cmd_end_render_pass(cb),
            PassState::DynamicRendering => {
                self.device.cmd_end_rendering(cb);
                self.record_rendering_capture_transitions(cb);
            }
        }
        if let Some(index) = draw_index {
            // Parameter snapshots go into whichever clone of the pair runs
            // first, so the first fence wait already observes real values.
            if is_after != self.options.dump_before {
                if let Some(record) = self.records.get(&index) {
                    indirect::record_param_copies(&self.device, cb, &record.params);
                }
            }
            if !is_after {
                if let Some(backups) = self.backups.get(&index) {
                    let mut barriers = Vec::with_capacity(backups.len());
                    for backup in backups {
                        let region = vk::BufferCopy {
                            src_offset: backup.source_offset,
                            dst_offset: 0,
                            size: backup.clone.size,
                        };
                        self.device.cmd_copy_buffer(
                            cb,
                            backup.source.handle,
                            backup.clone.buffer,
                            &[region],
                        );
                        barriers.push(
                            vk::BufferMemoryBarrier::default()
                                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                                .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .buffer(backup.clone.buffer)
                                .offset(0)
                                .size(backup.clone.size),
                        );
                    }
                    if !barriers.is_empty() {
                        self.device.cmd_pipeline_barrier(
                            cb,
                            vk::PipelineStageFlags::TRANSFER,
                            vk::PipelineStageFlags::TRANSFER,
                            &barriers,
                            &[],
                        );
                    }
                }
            }
        }
        self.device
            .end_command_buffer(cb)
            .map_err(|e| DumpError::api("vkEndCommandBuffer", e))?;
        self.current_clone += 1;
        Ok(())
    }

    /// A truncated render pass clone leaves its attachments transfer-readable
    /// through its forced final layouts; dynamic rendering has no equivalent,
    /// so the transition is recorded explicitly after `vkCmdEndRendering`.
    fn record_rendering_capture_transitions(&self, cb: vk::CommandBuffer) {
        let rp = self.current_render_pass as usize;
        let Some(reverts) = self.revert_layouts.get(rp).and_then(|row| row.first()) else {
            return;
        };
        let barriers: Vec<vk::ImageMemoryBarrier<'_>> = reverts
            .iter()
            .map(|(image, layout)| {
                vk::ImageMemoryBarrier::default()
                    .src_access_mask(
                        vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                    )
                    .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                    .old_layout(*layout)
                    .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image.handle)
                    .subresource_range(full_subresource_range(image))
            })
            .collect();
        if barriers.is_empty() {
            return;
        }
        self.device.cmd_pipeline_barrier(
            cb,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::PipelineStageFlags::TRANSFER,
            &[],
            &barriers,
        );
    }

    /// Ends every clone still recording. Mirrors the original buffer's
    /// `vkEndCommandBuffer`; clones whose draw never arrived become no-op
    /// tails and still submit cleanly.
    pub fn finalize_command_buffer(&mut self) -> DumpResult<()> {
        debug_assert_eq!(self.pass_state, PassState::None);
        while self.current_clone < self.command_buffers.len() {
            self.finalize_active_clone(None, false)?;
        }
        Ok(())
    }

    // Submission and extraction.

    /// Submits each clone behind a fence, in order, extracting the assigned
    /// draw call's resources after every wait. Wait semaphores of the
    /// original submission apply only to the first clone, and signal
    /// semaphores plus the original submission's `fence` only to the last,
    /// so external synchronization observes one logical submission. The
    /// caller's fence is never reset here; intermediate waits run on an
    /// internally owned fence.
    pub fn dump_draw_calls(
        &mut self,
        table: &dyn ObjectTable,
        readback: &dyn ResourceReadback,
        delegate: &mut dyn DumpDelegate,
        queue: vk::Queue,
        submit: &SubmitDesc,
        fence: Option<vk::Fence>,
        queue_submit_index: u64,
    ) -> DumpResult<()> {
        let info = vk::FenceCreateInfo::default();
        let owned = self
            .device
            .create_fence(&info)
            .map_err(|e| DumpError::api("vkCreateFence", e))?;
        let result = self.dump_with_fence(
            table,
            readback,
            delegate,
            queue,
            submit,
            owned,
            fence,
            queue_submit_index,
        );
        self.device.destroy_fence(owned);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn dump_with_fence(
        &mut self,
        table: &dyn ObjectTable,
        readback: &dyn ResourceReadback,
        delegate: &mut dyn DumpDelegate,
        queue: vk::Queue,
        submit: &SubmitDesc,
        owned_fence: vk::Fence,
        caller_fence: Option<vk::Fence>,
        queue_submit_index: u64,
    ) -> DumpResult<()> {
        let total = self.command_buffers.len();
        for i in 0..total {
            let cb = self.command_buffers[i];
            let last = i + 1 == total;
            let command_buffers = [cb];
            let mut info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            if i == 0 {
                info = info
                    .wait_semaphores(&submit.wait_semaphores)
                    .wait_dst_stage_mask(&submit.wait_dst_stage_mask);
            }
            if last {
                info = info.signal_semaphores(&submit.signal_semaphores);
            }
            // The caller's fence carries the original submission's contract:
            // it signals exactly once, on the last clone, and its state is the
            // caller's to manage. Only the owned fence ever gets reset.
            let fence = match caller_fence {
                Some(external) if last => external,
                _ => {
                    self.device
                        .reset_fences(&[owned_fence])
                        .map_err(|e| DumpError::api("vkResetFences", e))?;
                    owned_fence
                }
            };
            self.device
                .queue_submit(queue, &[info], fence)
                .map_err(|e| DumpError::api("vkQueueSubmit", e))?;
            self.device
                .wait_for_fences(&[fence], true, u64::MAX)
                .map_err(|e| DumpError::api("vkWaitForFences", e))?;

            let draw_index = self.clone_draw_index(i);
            let before = self.options.dump_before && i % 2 == 0;
            let Some(mut record) = self.records.remove(&draw_index) else {
                debug_assert!(false, "captured draw {draw_index} has no recorded parameters");
                tracing::warn!(draw_index, "captured draw has no recorded parameters");
                continue;
            };
            let result = self.dump_one_clone(
                table,
                readback,
                delegate,
                queue,
                draw_index,
                &mut record,
                before,
                queue_submit_index,
            );
            self.records.insert(draw_index, record);
            result?;
        }

        // Reset for a clean re-dump if the application resubmits the buffer.
        for record in self.records.values_mut() {
            indirect::reset_params(&mut record.params);
        }
        self.dumped.clear();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn dump_one_clone(
        &mut self,
        table: &dyn ObjectTable,
        readback: &dyn ResourceReadback,
        delegate: &mut dyn DumpDelegate,
        queue: vk::Queue,
        draw_index: u64,
        record: &mut DrawCallRecord,
        before: bool,
        queue_submit_index: u64,
    ) -> DumpResult<()> {
        indirect::fetch_params(readback, self.queue_family_index, &mut record.params)?;
        let location = DumpLocation {
            draw_call_index: draw_index,
            queue_submit_index,
            begin_command_buffer_index: self.begin_command_buffer_index,
            render_pass: record.render_pass,
            subpass: record.subpass,
        };
        // Draw-scoped resources are extracted once per draw: on the "before"
        // clone of a pair, or the sole clone otherwise.
        let once_per_draw = !self.options.dump_before || before;

        if self.options.dump_vertex_index_buffers && once_per_draw {
            dump_vertex_index_data(readback, delegate, record, location, before)?;
        }
        self.dump_render_targets(readback, delegate, record, location, before)?;
        if self.options.dump_immutable_resources {
            self.dump_descriptors(
                table,
                readback,
                delegate,
                draw_index,
                record,
                location,
                before,
                once_per_draw,
            )?;
        }
        if !before {
            let rp = record.render_pass as usize;
            let sp = record.subpass as usize;
            let targets = self
                .render_targets
                .get(rp)
                .and_then(|row| row.get(sp))
                .cloned()
                .unwrap_or_default();
            let render_area = self.render_areas.get(rp).copied().unwrap_or_default();
            delegate.dump_draw_call(&DrawCallDump {
                location,
                render_targets: &targets,
                render_area,
                record,
            })?;
        }
        self.revert_render_target_layouts(queue, record.render_pass as usize, record.subpass as usize)
    }

    /// Captured attachments sit in TRANSFER_SRC_OPTIMAL when the clone's
    /// fence signals, through the clone pass's forced final layout or the
    /// explicit transition recorded for dynamic rendering.
    fn dump_render_targets(
        &self,
        readback: &dyn ResourceReadback,
        delegate: &mut dyn DumpDelegate,
        record: &DrawCallRecord,
        location: DumpLocation,
        before: bool,
    ) -> DumpResult<()> {
        let rp = record.render_pass as usize;
        let sp = record.subpass as usize;
        let Some(targets) = self.render_targets.get(rp).and_then(|row| row.get(sp)) else {
            debug_assert!(false, "no render target snapshot for pass {rp} subpass {sp}");
            tracing::warn!(rp, sp, "no render target snapshot for captured draw");
            return Ok(());
        };
        for (attachment_index, image) in targets.color.iter().enumerate() {
            if let Some(only) = self.options.color_attachment_index {
                if attachment_index != only {
                    continue;
                }
            }
            let data = readback.read_image(
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                self.queue_family_index,
            )?;
            delegate.dump_resource(&ResourceDump {
                location,
                before_draw: before,
                kind: ResourceDumpKind::ColorAttachment {
                    attachment_index,
                    image: *image,
                },
                data,
            })?;
        }
        if self.options.dump_depth {
            if let Some(depth) = &targets.depth {
                let data = readback.read_image(
                    depth,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    self.queue_family_index,
                )?;
                delegate.dump_resource(&ResourceDump {
                    location,
                    before_draw: before,
                    kind: ResourceDumpKind::DepthAttachment { image: *depth },
                    data,
                })?;
            }
        }
        Ok(())
    }

    /// Extracts descriptor-bound resources. Immutable descriptors are dumped
    /// at most once per render pass; storage buffers backed up for
    /// before/after capture bypass that memoization and are dumped on both
    /// sides of the draw.
    #[allow(clippy::too_many_arguments)]
    fn dump_descriptors(
        &mut self,
        table: &dyn ObjectTable,
        readback: &dyn ResourceReadback,
        delegate: &mut dyn DumpDelegate,
        draw_index: u64,
        record: &DrawCallRecord,
        location: DumpLocation,
        before: bool,
        include_immutable: bool,
    ) -> DumpResult<()> {
        let dumped = self.dumped.entry(record.render_pass).or_default();
        let backups = self.backups.get(&draw_index);
        for (&set, set_info) in &record.descriptor_sets {
            for (&binding, binding_info) in &set_info.bindings {
                let ty = binding_info.descriptor_type;
                if is_image_descriptor(ty) {
                    if !include_immutable {
                        continue;
                    }
                    for desc in &binding_info.images {
                        let Some(view_id) = desc.view else { continue };
                        let Some(image) = resolve_view_image(table, view_id) else {
                            continue;
                        };
                        if !dumped.images.insert(image.id) {
                            continue;
                        }
                        let data =
                            readback.read_image(&image, desc.layout, self.queue_family_index)?;
                        delegate.dump_resource(&ResourceDump {
                            location,
                            before_draw: before,
                            kind: ResourceDumpKind::ImageDescriptor { image },
                            data,
                        })?;
                    }
                } else if is_buffer_descriptor(ty) {
                    let backed_up = self.options.dump_before && is_storage_buffer(ty);
                    for (element, desc) in binding_info.buffers.iter().enumerate() {
                        let Some(buffer) = desc.buffer else { continue };
                        let range = resolve_descriptor_range(desc);
                        if range == 0 {
                            continue;
                        }
                        if backed_up {
                            let backup = backups.and_then(|list| {
                                list.iter().find(|b| {
                                    b.set == set && b.binding == binding && b.element == element
                                })
                            });
                            let data = match backup {
                                Some(backup) if before => readback.read_buffer(
                                    backup.clone.buffer,
                                    0,
                                    backup.clone.size,
                                    self.queue_family_index,
                                )?,
                                _ => readback.read_buffer(
                                    buffer.handle,
                                    desc.offset,
                                    range,
                                    buffer.queue_family_index,
                                )?,
                            };
                            delegate.dump_resource(&ResourceDump {
                                location,
                                before_draw: before,
                                kind: ResourceDumpKind::BufferDescriptor {
                                    buffer,
                                    offset: desc.offset,
                                    range,
                                },
                                data,
                            })?;
                            continue;
                        }
                        if !include_immutable || !dumped.buffers.insert(buffer.id) {
                            continue;
                        }
                        let data = readback.read_buffer(
                            buffer.handle,
                            desc.offset,
                            range,
                            buffer.queue_family_index,
                        )?;
                        delegate.dump_resource(&ResourceDump {
                            location,
                            before_draw: before,
                            kind: ResourceDumpKind::BufferDescriptor {
                                buffer,
                                offset: desc.offset,
                                range,
                            },
                            data,
                        })?;
                    }
                } else if ty == vk::DescriptorType::INLINE_UNIFORM_BLOCK {
                    if !include_immutable
                        || binding_info.inline_uniform_block.is_empty()
                        || !dumped.inline_blocks.insert((set, binding))
                    {
                        continue;
                    }
                    delegate.dump_resource(&ResourceDump {
                        location,
                        before_draw: before,
                        kind: ResourceDumpKind::InlineUniformBlock { set, binding },
                        data: binding_info.inline_uniform_block.clone(),
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Returns each captured attachment to the layout the original stream
    /// expects, through a one-off submission on the auxiliary command buffer.
    fn revert_render_target_layouts(&self, queue: vk::Queue, rp: usize, sp: usize) -> DumpResult<()> {
        let Some(reverts) = self.revert_layouts.get(rp).and_then(|row| row.get(sp)) else {
            return Ok(());
        };
        let barriers: Vec<vk::ImageMemoryBarrier<'_>> = reverts
            .iter()
            .filter(|(_, layout)| {
                *layout != vk::ImageLayout::TRANSFER_SRC_OPTIMAL
                    && *layout != vk::ImageLayout::UNDEFINED
            })
            .map(|(image, layout)| {
                vk::ImageMemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::TRANSFER_READ)
                    .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
                    .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                    .new_layout(*layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image.handle)
                    .subresource_range(full_subresource_range(image))
            })
            .collect();
        if barriers.is_empty() {
            return Ok(());
        }
        let begin =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.device
            .begin_command_buffer(self.aux_command_buffer, &begin)
            .map_err(|e| DumpError::api("vkBeginCommandBuffer", e))?;
        self.device.cmd_pipeline_barrier(
            self.aux_command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::ALL_COMMANDS,
            &[],
            &barriers,
        );
        self.device
            .end_command_buffer(self.aux_command_buffer)
            .map_err(|e| DumpError::api("vkEndCommandBuffer", e))?;
        self.device
            .reset_fences(&[self.aux_fence])
            .map_err(|e| DumpError::api("vkResetFences", e))?;
        let command_buffers = [self.aux_command_buffer];
        let info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        self.device
            .queue_submit(queue, &[info], self.aux_fence)
            .map_err(|e| DumpError::api("vkQueueSubmit", e))?;
        self.device
            .wait_for_fences(&[self.aux_fence], true, u64::MAX)
            .map_err(|e| DumpError::api("vkWaitForFences", e))
    }

    /// Releases every device object this context owns. Idempotent; also run
    /// on drop.
    pub fn release(&mut self) {
        for record in self.records.values_mut() {
            indirect::release_params(&self.device, &mut record.params);
        }
        for backups in self.backups.values_mut() {
            for backup in backups.drain(..) {
                indirect::destroy_clone_buffer(&self.device, backup.clone);
            }
        }
        self.backups.clear();
        for clones in self.render_pass_clones.drain(..) {
            for clone in clones {
                self.device.destroy_render_pass(clone);
            }
        }
        if !self.command_buffers.is_empty() || self.aux_command_buffer != vk::CommandBuffer::null()
        {
            let mut buffers = std::mem::take(&mut self.command_buffers);
            if self.aux_command_buffer != vk::CommandBuffer::null() {
                buffers.push(self.aux_command_buffer);
                self.aux_command_buffer = vk::CommandBuffer::null();
            }
            self.device.free_command_buffers(self.command_pool, &buffers);
        }
        if self.aux_fence != vk::Fence::null() {
            self.device.destroy_fence(self.aux_fence);
            self.aux_fence = vk::Fence::null();
        }
    }
}

impl<D: DeviceDispatch> Drop for DumpContext<D> {
    fn drop(&mut self) {
        self.release();
    }
}

fn full_subresource_range(image: &ImageInfo) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: format_aspect_mask(image.format),
        base_mip_level: 0,
        level_count: image.level_count,
        base_array_layer: 0,
        layer_count: image.layer_count,
    }
}

fn resolve_view_image(table: &dyn ObjectTable, view_id: ImageViewId) -> Option<ImageInfo> {
    let Some(view) = table.image_view(view_id) else {
        tracing::warn!(?view_id, "image view missing from object table");
        return None;
    };
    let image = view.image;
    match table.image(image) {
        Some(info) => Some(*info),
        None => {
            tracing::warn!(?image, "image missing from object table");
            None
        }
    }
}

/// Resolves the attachments a framebuffer-based subpass renders into, along
/// with each image's pre-capture layout (the original pass's final layout).
fn framebuffer_targets(
    table: &dyn ObjectTable,
    pass: &RenderPassInfo,
    framebuffer_attachments: &[ImageViewId],
    subpass: usize,
) -> (RenderTargets, Vec<(ImageInfo, vk::ImageLayout)>) {
    let mut targets = RenderTargets::default();
    let mut reverts = Vec::new();
    let Some(subpass_info) = pass.subpasses.get(subpass) else {
        debug_assert!(false, "subpass {subpass} out of range");
        tracing::warn!(subpass, "subpass index out of range for render pass");
        return (targets, reverts);
    };
    let mut resolve = |attachment: u32| -> Option<ImageInfo> {
        if attachment == vk::ATTACHMENT_UNUSED {
            return None;
        }
        let view_id = *framebuffer_attachments.get(attachment as usize)?;
        let image = resolve_view_image(table, view_id)?;
        let final_layout = pass
            .attachments
            .get(attachment as usize)
            .map(|a| a.final_layout)
            .unwrap_or(vk::ImageLayout::UNDEFINED);
        reverts.push((image, final_layout));
        Some(image)
    };
    for reference in &subpass_info.color_attachments {
        if let Some(image) = resolve(reference.attachment) {
            targets.color.push(image);
        }
    }
    if let Some(depth) = &subpass_info.depth_attachment {
        targets.depth = resolve(depth.attachment);
    }
    (targets, reverts)
}

/// Resolves the attachments of a dynamic rendering scope; the pre-capture
/// layout is the attachment's own rendering layout.
fn rendering_targets(
    table: &dyn ObjectTable,
    desc: &RenderingDesc,
) -> (RenderTargets, Vec<(ImageInfo, vk::ImageLayout)>) {
    let mut targets = RenderTargets::default();
    let mut reverts = Vec::new();
    for attachment in &desc.color_attachments {
        if let Some(image) = resolve_view_image(table, attachment.view) {
            reverts.push((image, attachment.image_layout));
            targets.color.push(image);
        }
    }
    if let Some(depth) = &desc.depth_attachment {
        if let Some(image) = resolve_view_image(table, depth.view) {
            reverts.push((image, depth.image_layout));
            targets.depth = Some(image);
        }
    }
    (targets, reverts)
}

fn record_begin_rendering<D: DeviceDispatch>(
    device: &D,
    table: &dyn ObjectTable,
    cb: vk::CommandBuffer,
    desc: &RenderingDesc,
    force_store: bool,
) {
    let view_handle = |id: ImageViewId| {
        table
            .image_view(id)
            .map(|v| v.handle)
            .unwrap_or(vk::ImageView::null())
    };
    let attachment_info = |a: &RenderingAttachmentDesc| {
        vk::RenderingAttachmentInfo::default()
            .image_view(view_handle(a.view))
            .image_layout(a.image_layout)
            .load_op(a.load_op)
            .store_op(if force_store {
                vk::AttachmentStoreOp::STORE
            } else {
                a.store_op
            })
            .clear_value(a.clear_value)
    };
    let color: Vec<vk::RenderingAttachmentInfo<'_>> =
        desc.color_attachments.iter().map(attachment_info).collect();
    let mut info = vk::RenderingInfo::default()
        .render_area(desc.render_area)
        .layer_count(desc.layer_count)
        .view_mask(desc.view_mask)
        .color_attachments(&color);
    let depth;
    if let Some(attachment) = &desc.depth_attachment {
        depth = attachment_info(attachment);
        info = info.depth_attachment(&depth);
    }
    device.cmd_begin_rendering(cb, &info);
}
