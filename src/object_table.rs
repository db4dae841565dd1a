//! Trace-time object identities and the lookup interface.
//!
//! The replay driver owns a table mapping trace-time identifiers to live
//! objects. This crate never frees anything resolved through it: every `*Info`
//! returned here is a non-owning description of externally owned storage,
//! valid for the duration of one dump pass.

use std::collections::BTreeMap;

use ash::vk;

macro_rules! trace_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);
    };
}

trace_id!(
    /// Trace-time identifier of a `VkBuffer`.
    BufferId
);
trace_id!(
    /// Trace-time identifier of a `VkImage`.
    ImageId
);
trace_id!(
    /// Trace-time identifier of a `VkImageView`.
    ImageViewId
);

/// Lookup table for the identifiers this crate resolves on its own.
///
/// Device-scope objects (device, queue, command pool, physical-device memory
/// properties) are furnished directly by the replay driver when the context is
/// constructed, so they do not appear here. The table is strictly read-only
/// from the dump engine's perspective.
pub trait ObjectTable {
    fn buffer(&self, id: BufferId) -> Option<&BufferInfo>;
    fn image(&self, id: ImageId) -> Option<&ImageInfo>;
    fn image_view(&self, id: ImageViewId) -> Option<&ImageViewInfo>;
}

/// Live-buffer metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub id: BufferId,
    pub handle: vk::Buffer,
    pub size: vk::DeviceSize,
    pub queue_family_index: u32,
}

/// Live-image metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: ImageId,
    pub handle: vk::Image,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub level_count: u32,
    pub layer_count: u32,
    pub queue_family_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageViewInfo {
    pub id: ImageViewId,
    pub handle: vk::ImageView,
    pub image: ImageId,
}

/// Framebuffer description passed into `begin_render_pass`.
#[derive(Debug, Clone)]
pub struct FramebufferInfo {
    pub handle: vk::Framebuffer,
    /// Attachment image views, indexed by attachment slot.
    pub attachments: Vec<ImageViewId>,
}

/// One subpass of an original render pass.
#[derive(Debug, Clone, Default)]
pub struct SubpassInfo {
    pub flags: vk::SubpassDescriptionFlags,
    pub pipeline_bind_point: vk::PipelineBindPoint,
    pub input_attachments: Vec<vk::AttachmentReference>,
    pub color_attachments: Vec<vk::AttachmentReference>,
    pub resolve_attachments: Vec<vk::AttachmentReference>,
    pub depth_attachment: Option<vk::AttachmentReference>,
    pub preserve_attachments: Vec<u32>,
}

/// Multiview parameters of an original render pass, copied verbatim onto
/// every clone.
#[derive(Debug, Clone, Default)]
pub struct MultiviewInfo {
    pub view_masks: Vec<u32>,
    pub view_offsets: Vec<i32>,
    pub correlation_masks: Vec<u32>,
}

/// Recorded description of an original render pass.
#[derive(Debug, Clone)]
pub struct RenderPassInfo {
    pub handle: vk::RenderPass,
    pub attachments: Vec<vk::AttachmentDescription>,
    pub subpasses: Vec<SubpassInfo>,
    pub dependencies: Vec<vk::SubpassDependency>,
    pub multiview: Option<MultiviewInfo>,
}

/// Vertex-input layout baked into a graphics pipeline, or supplied at record
/// time through `vkCmdSetVertexInputEXT`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VertexInputState {
    /// binding index -> description.
    pub bindings: BTreeMap<u32, VertexBindingDesc>,
    /// attribute location -> description.
    pub attributes: BTreeMap<u32, VertexAttributeDesc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VertexBindingDesc {
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VertexAttributeDesc {
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// The slice of pipeline state the dump engine cares about.
#[derive(Debug, Clone, Default)]
pub struct PipelineInfo {
    pub vertex_input: VertexInputState,
    /// `VK_DYNAMIC_STATE_VERTEX_INPUT_EXT` enabled: the whole vertex-input
    /// state comes from `vkCmdSetVertexInputEXT` instead of the pipeline.
    pub dynamic_vertex_input: bool,
    /// `VK_DYNAMIC_STATE_VERTEX_INPUT_BINDING_STRIDE_EXT` enabled: strides
    /// come from `vkCmdBindVertexBuffers2`.
    pub dynamic_vertex_binding_stride: bool,
}

/// One descriptor binding of a descriptor set, as recorded by the trace.
#[derive(Debug, Clone, Default)]
pub struct DescriptorBindingInfo {
    pub descriptor_type: vk::DescriptorType,
    /// Image-class descriptors bound to this binding, by array element.
    pub images: Vec<ImageDescriptorInfo>,
    /// Buffer-class descriptors bound to this binding, by array element.
    pub buffers: Vec<BufferDescriptorInfo>,
    /// Payload of a `VK_DESCRIPTOR_TYPE_INLINE_UNIFORM_BLOCK` binding.
    pub inline_uniform_block: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDescriptorInfo {
    pub view: Option<ImageViewId>,
    /// Layout the descriptor promises the image is in while bound.
    pub layout: vk::ImageLayout,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BufferDescriptorInfo {
    pub buffer: Option<BufferInfo>,
    pub offset: vk::DeviceSize,
    /// Descriptor range; `vk::WHOLE_SIZE` means "to the end of the buffer".
    pub range: vk::DeviceSize,
}

/// A descriptor set as passed to `bind_descriptor_sets`.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetInfo {
    /// binding index -> recorded binding contents.
    pub bindings: BTreeMap<u32, DescriptorBindingInfo>,
}
