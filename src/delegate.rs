//! The dumping delegate interface and the records handed to it.
//!
//! The delegate persists dumped data (file formats, image encoding, naming).
//! This crate only produces typed, addressed regions of raw resource data; a
//! delegate failure status is propagated verbatim and aborts the dump pass.

use ash::vk;

use crate::draw_call::DrawCallRecord;
use crate::error::DumpResult;
use crate::object_table::{BufferInfo, ImageInfo};

/// Identifies where in the replayed stream a record was produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpLocation {
    /// Index of the draw call within the command stream.
    pub draw_call_index: u64,
    /// Index of the enclosing queue submission.
    pub queue_submit_index: u64,
    /// Index of the originating `vkBeginCommandBuffer`.
    pub begin_command_buffer_index: u64,
    /// Render pass counter within the command buffer.
    pub render_pass: u64,
    /// Subpass within that render pass.
    pub subpass: u64,
}

/// Attachments live when a captured draw call executed.
#[derive(Debug, Clone, Default)]
pub struct RenderTargets {
    pub color: Vec<ImageInfo>,
    pub depth: Option<ImageInfo>,
}

/// Per-draw-call metadata record, sent once per captured draw call after all
/// of its resource records.
#[derive(Debug)]
pub struct DrawCallDump<'a> {
    pub location: DumpLocation,
    pub render_targets: &'a RenderTargets,
    pub render_area: vk::Rect2D,
    /// Full call parameters, including resolved indirect arguments.
    pub record: &'a DrawCallRecord,
}

/// One extracted resource.
#[derive(Debug)]
pub struct ResourceDump {
    pub location: DumpLocation,
    /// True when this record reflects state before the draw call executed
    /// (before/after dumping only).
    pub before_draw: bool,
    pub kind: ResourceDumpKind,
    /// Raw bytes of the dumped range. Attachment and image records carry the
    /// full subresource contents as returned by the readback utility;
    /// encoding them into an output format stays the delegate's problem.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum ResourceDumpKind {
    VertexBuffer {
        binding: u32,
        buffer: BufferInfo,
        /// Offset at which the dumped range starts within the buffer.
        offset: vk::DeviceSize,
    },
    IndexBuffer {
        buffer: BufferInfo,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    },
    ColorAttachment {
        attachment_index: usize,
        image: ImageInfo,
    },
    DepthAttachment {
        image: ImageInfo,
    },
    ImageDescriptor {
        image: ImageInfo,
    },
    BufferDescriptor {
        buffer: BufferInfo,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    InlineUniformBlock {
        set: u32,
        binding: u32,
    },
}

/// Receives every record produced by a dump pass.
pub trait DumpDelegate {
    fn dump_draw_call(&mut self, info: &DrawCallDump<'_>) -> DumpResult<()>;
    fn dump_resource(&mut self, resource: &ResourceDump) -> DumpResult<()>;
}
