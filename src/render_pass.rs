//! Render pass cloning.
//!
//! Capturing an attachment after subpass k requires a render pass that ends
//! at subpass k with the attachment contents stored and transfer-readable.
//! For an original pass with N subpasses this module builds N clones, where
//! clone k contains subpasses 0..=k, every attachment forced to store with a
//! transfer-source final layout, and the dependency graph truncated and
//! re-terminated at subpass k.

use ash::vk;

use crate::dispatch::DeviceDispatch;
use crate::error::{DumpError, DumpResult};
use crate::format::format_has_stencil;
use crate::object_table::{MultiviewInfo, RenderPassInfo, SubpassInfo};

/// Owned description of one clone, held separately from the created handle so
/// the construction logic stays independent of the device.
#[derive(Debug, Clone)]
pub(crate) struct RenderPassCloneDesc {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub subpasses: Vec<SubpassInfo>,
    pub dependencies: Vec<vk::SubpassDependency>,
    pub multiview: Option<MultiviewInfo>,
}

fn forced_attachment(desc: &vk::AttachmentDescription) -> vk::AttachmentDescription {
    let mut forced = *desc;
    forced.store_op = vk::AttachmentStoreOp::STORE;
    if format_has_stencil(desc.format) {
        forced.stencil_store_op = vk::AttachmentStoreOp::STORE;
    }
    forced.final_layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
    forced
}

/// Truncates the dependency list for a clone ending at `last_subpass`.
///
/// Dependencies sourced past the truncation point cannot execute and are
/// dropped; in-range dependencies whose destination lies past it are clamped
/// so their effects still land inside the clone. External endpoints pass
/// through untouched.
fn truncated_dependencies(
    dependencies: &[vk::SubpassDependency],
    last_subpass: u32,
) -> Vec<vk::SubpassDependency> {
    dependencies
        .iter()
        .filter(|dep| dep.src_subpass == vk::SUBPASS_EXTERNAL || dep.src_subpass <= last_subpass)
        .map(|dep| {
            let mut dep = *dep;
            if dep.dst_subpass != vk::SUBPASS_EXTERNAL && dep.dst_subpass > last_subpass {
                dep.dst_subpass = last_subpass;
            }
            dep
        })
        .collect()
}

fn uses_color(subpass: &SubpassInfo) -> bool {
    subpass
        .color_attachments
        .iter()
        .any(|a| a.attachment != vk::ATTACHMENT_UNUSED)
}

fn uses_depth(subpass: &SubpassInfo) -> bool {
    subpass
        .depth_attachment
        .is_some_and(|a| a.attachment != vk::ATTACHMENT_UNUSED)
}

/// Dependencies guarding the forced store of the clone's last subpass against
/// the transfer reads that capture it, synthesized only when the original
/// graph has no subpass-to-external edge from `last_subpass`.
fn closing_dependencies(
    dependencies: &[vk::SubpassDependency],
    last: &SubpassInfo,
    last_subpass: u32,
) -> Vec<vk::SubpassDependency> {
    let already_closed = dependencies
        .iter()
        .any(|dep| dep.src_subpass == last_subpass && dep.dst_subpass == vk::SUBPASS_EXTERNAL);
    if already_closed {
        return Vec::new();
    }
    let mut synthesized = Vec::new();
    if uses_color(last) {
        synthesized.push(vk::SubpassDependency {
            src_subpass: last_subpass,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::TRANSFER,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::TRANSFER_READ,
            dependency_flags: vk::DependencyFlags::empty(),
        });
    }
    if uses_depth(last) {
        synthesized.push(vk::SubpassDependency {
            src_subpass: last_subpass,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            dst_stage_mask: vk::PipelineStageFlags::TRANSFER,
            src_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::TRANSFER_READ,
            dependency_flags: vk::DependencyFlags::empty(),
        });
    }
    synthesized
}

/// Builds the clone descriptions for an original render pass, one per
/// subpass.
pub(crate) fn build_render_pass_clones(original: &RenderPassInfo) -> Vec<RenderPassCloneDesc> {
    let attachments: Vec<vk::AttachmentDescription> =
        original.attachments.iter().map(forced_attachment).collect();
    (0..original.subpasses.len())
        .map(|k| {
            let last_subpass = k as u32;
            let subpasses: Vec<SubpassInfo> = original.subpasses[..=k].to_vec();
            let mut dependencies = truncated_dependencies(&original.dependencies, last_subpass);
            dependencies.extend(closing_dependencies(
                &original.dependencies,
                &subpasses[k],
                last_subpass,
            ));
            RenderPassCloneDesc {
                attachments: attachments.clone(),
                subpasses,
                dependencies,
                multiview: original.multiview.clone(),
            }
        })
        .collect()
}

/// Creates the device objects for a set of clone descriptions.
pub(crate) fn create_render_pass_clones<D: DeviceDispatch>(
    device: &D,
    descs: &[RenderPassCloneDesc],
) -> DumpResult<Vec<vk::RenderPass>> {
    let mut clones = Vec::with_capacity(descs.len());
    for desc in descs {
        match create_clone(device, desc) {
            Ok(clone) => clones.push(clone),
            Err(e) => {
                for clone in clones {
                    device.destroy_render_pass(clone);
                }
                return Err(e);
            }
        }
    }
    Ok(clones)
}

fn create_clone<D: DeviceDispatch>(
    device: &D,
    desc: &RenderPassCloneDesc,
) -> DumpResult<vk::RenderPass> {
    let subpasses: Vec<vk::SubpassDescription<'_>> = desc
        .subpasses
        .iter()
        .map(|s| {
            let mut d = vk::SubpassDescription::default()
                .flags(s.flags)
                .pipeline_bind_point(s.pipeline_bind_point)
                .input_attachments(&s.input_attachments)
                .color_attachments(&s.color_attachments)
                .preserve_attachments(&s.preserve_attachments);
            if !s.resolve_attachments.is_empty() {
                d = d.resolve_attachments(&s.resolve_attachments);
            }
            if let Some(depth) = &s.depth_attachment {
                d = d.depth_stencil_attachment(depth);
            }
            d
        })
        .collect();
    let mut info = vk::RenderPassCreateInfo::default()
        .attachments(&desc.attachments)
        .subpasses(&subpasses)
        .dependencies(&desc.dependencies);
    let mut multiview = vk::RenderPassMultiviewCreateInfo::default();
    if let Some(mv) = &desc.multiview {
        multiview = multiview
            .view_masks(&mv.view_masks)
            .view_offsets(&mv.view_offsets)
            .correlation_masks(&mv.correlation_masks);
        info = info.push_next(&mut multiview);
    }
    device
        .create_render_pass(&info)
        .map_err(|e| DumpError::api("vkCreateRenderPass", e))
}
