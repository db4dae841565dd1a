//! Draw-call resource dumping for Vulkan capture/replay.
//!
//! During replay of a recorded command stream, a [`DumpContext`] shadows one
//! command buffer and captures a chosen subset of its draw calls: the vertex
//! and index ranges each draw consumed, the descriptor resources it could
//! read, and the render-target attachments it wrote, before and optionally
//! after the draw executed. Capture works by cloning the command buffer once
//! (or twice) per chosen draw, truncating each clone right after (or before)
//! its draw with a render pass rebuilt to store and expose its attachments,
//! then submitting the clones one at a time behind a fence and reading
//! resources back between submissions. Indirect draw parameters are
//! snapshotted GPU-side at execution position and resolved from the snapshot
//! after the fence wait.
//!
//! The crate deliberately stops at typed, addressed regions of raw resource
//! data. Persisting them (file naming, image encoding) belongs to the
//! [`DumpDelegate`] implementation, and object lookup, byte readback, and the
//! device dispatch table are likewise supplied by the caller as narrow
//! traits.

pub mod context;
pub mod delegate;
pub mod dispatch;
pub mod draw_call;
pub mod error;
pub mod format;
pub mod object_table;
pub mod readback;
pub mod state;

mod indirect;
mod render_pass;
mod vertex;

pub use context::{
    DumpContext, DumpOptions, RenderingAttachmentDesc, RenderingDesc, SubmitDesc,
};
pub use delegate::{
    DrawCallDump, DumpDelegate, DumpLocation, RenderTargets, ResourceDump, ResourceDumpKind,
};
pub use dispatch::DeviceDispatch;
pub use draw_call::{
    DrawCallRecord, DrawIndexedIndirectArgs, DrawIndirectArgs, DrawParams, IndirectCountParams,
    IndirectParams, ResolvedDraws,
};
pub use error::{DumpError, DumpResult};
pub use object_table::{
    BufferDescriptorInfo, BufferId, BufferInfo, DescriptorBindingInfo, DescriptorSetInfo,
    FramebufferInfo, ImageDescriptorInfo, ImageId, ImageInfo, ImageViewId, ImageViewInfo,
    MultiviewInfo, ObjectTable, PipelineInfo, RenderPassInfo, SubpassInfo, VertexAttributeDesc,
    VertexBindingDesc, VertexInputState,
};
pub use readback::ResourceReadback;
pub use state::{BoundIndexBuffer, BoundState, BoundVertexBuffer};
