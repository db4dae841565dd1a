//! Per-draw-call parameter records.
//!
//! Every captured draw call keeps a [`DrawCallRecord`]: its call parameters
//! (with indirect parameters resolved after the relevant submission
//! completes) plus a value snapshot of the bound state it observed. Records
//! are owned by the dump context and survive until the pass is released.

use std::collections::BTreeMap;

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::object_table::{BufferInfo, DescriptorSetInfo, VertexInputState};
use crate::state::{BoundIndexBuffer, BoundVertexBuffer};

/// `VkDrawIndirectCommand`, also the record of a direct `vkCmdDraw`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DrawIndirectArgs {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

/// `VkDrawIndexedIndirectCommand`, also the record of `vkCmdDrawIndexed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DrawIndexedIndirectArgs {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

/// A device-local buffer created by this crate to snapshot indirect
/// parameters at execution position. Freed by `release`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloneBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

/// Indirect argument structures read back from a clone buffer, or
/// [`ResolvedDraws::Pending`] until the submission they were copied in has
/// completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedDraws {
    Pending,
    Draws(Vec<DrawIndirectArgs>),
    IndexedDraws(Vec<DrawIndexedIndirectArgs>),
}

impl ResolvedDraws {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, ResolvedDraws::Pending)
    }
}

/// `vkCmdDrawIndirect` / `vkCmdDrawIndexedIndirect` parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct IndirectParams {
    pub indexed: bool,
    pub buffer: BufferInfo,
    pub offset: vk::DeviceSize,
    pub draw_count: u32,
    pub stride: u32,
    /// Snapshot of the parameter region, copied while the cloned command
    /// buffer executes. Created during finalize.
    pub clone: Option<CloneBuffer>,
    pub resolved: ResolvedDraws,
}

/// `vkCmdDrawIndirectCount` / `vkCmdDrawIndexedIndirectCount` parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct IndirectCountParams {
    pub indexed: bool,
    pub buffer: BufferInfo,
    pub offset: vk::DeviceSize,
    pub count_buffer: BufferInfo,
    pub count_offset: vk::DeviceSize,
    pub max_draw_count: u32,
    pub stride: u32,
    /// Snapshot of up to `max_draw_count` parameter structures.
    pub clone: Option<CloneBuffer>,
    /// Snapshot of the 4-byte draw count.
    pub count_clone: Option<CloneBuffer>,
    /// GPU-written count, bounded by `max_draw_count`. Known after fetch.
    pub actual_draw_count: Option<u32>,
    pub resolved: ResolvedDraws,
}

/// Closed set of capturable draw call shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawParams {
    Draw(DrawIndirectArgs),
    DrawIndexed(DrawIndexedIndirectArgs),
    DrawIndirect(IndirectParams),
    DrawIndirectCount(IndirectCountParams),
}

impl DrawParams {
    pub fn is_indexed(&self) -> bool {
        match self {
            DrawParams::Draw(_) => false,
            DrawParams::DrawIndexed(_) => true,
            DrawParams::DrawIndirect(p) => p.indexed,
            DrawParams::DrawIndirectCount(p) => p.indexed,
        }
    }

    /// Size in bytes of one indirect argument structure for this call shape.
    pub fn indirect_cmd_size(&self) -> u32 {
        if self.is_indexed() {
            std::mem::size_of::<DrawIndexedIndirectArgs>() as u32
        } else {
            std::mem::size_of::<DrawIndirectArgs>() as u32
        }
    }

    /// True once the record carries executable parameters: always for direct
    /// draws, after fetch for indirect ones.
    pub fn is_resolved(&self) -> bool {
        match self {
            DrawParams::Draw(_) | DrawParams::DrawIndexed(_) => true,
            DrawParams::DrawIndirect(p) => p.resolved.is_resolved(),
            DrawParams::DrawIndirectCount(p) => p.resolved.is_resolved(),
        }
    }

    /// Indexed argument structures of this call, one per sub-draw. Empty for
    /// non-indexed calls and for indirect calls not yet resolved.
    pub fn indexed_draws(&self) -> &[DrawIndexedIndirectArgs] {
        match self {
            DrawParams::DrawIndexed(args) => std::slice::from_ref(args),
            DrawParams::DrawIndirect(IndirectParams {
                resolved: ResolvedDraws::IndexedDraws(draws),
                ..
            })
            | DrawParams::DrawIndirectCount(IndirectCountParams {
                resolved: ResolvedDraws::IndexedDraws(draws),
                ..
            }) => draws,
            _ => &[],
        }
    }

    /// Non-indexed argument structures, one per sub-draw.
    pub fn direct_draws(&self) -> &[DrawIndirectArgs] {
        match self {
            DrawParams::Draw(args) => std::slice::from_ref(args),
            DrawParams::DrawIndirect(IndirectParams {
                resolved: ResolvedDraws::Draws(draws),
                ..
            })
            | DrawParams::DrawIndirectCount(IndirectCountParams {
                resolved: ResolvedDraws::Draws(draws),
                ..
            }) => draws,
            _ => &[],
        }
    }
}

/// Everything recorded about one captured draw call.
#[derive(Debug, Clone)]
pub struct DrawCallRecord {
    pub params: DrawParams,
    /// Vertex-input layout in effect when the call was recorded.
    pub vertex_input: VertexInputState,
    /// Vertex buffer bindings referenced by `vertex_input`.
    pub vertex_buffers: BTreeMap<u32, BoundVertexBuffer>,
    pub index_buffer: Option<BoundIndexBuffer>,
    /// Graphics descriptor sets visible to the call, dynamic offsets applied.
    pub descriptor_sets: BTreeMap<u32, DescriptorSetInfo>,
    /// Render pass counter within the command buffer at record time.
    pub render_pass: u64,
    /// Subpass within that render pass.
    pub subpass: u64,
}
