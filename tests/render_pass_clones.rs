//! Render pass cloning observed through the device dispatch layer.

mod common;

use ash::vk::{self, Handle as _};
use pretty_assertions::assert_eq;

use common::{init_logging, memory_properties, MockDevice, MockObjectTable};
use vk_dump_resources::{
    DumpContext, DumpOptions, FramebufferInfo, RenderPassInfo, SubpassInfo,
};

fn three_subpass_pass() -> RenderPassInfo {
    let attachment = vk::AttachmentDescription {
        format: vk::Format::R8G8B8A8_UNORM,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::DONT_CARE,
        final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ..Default::default()
    };
    let subpass = |att: u32| SubpassInfo {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachments: vec![vk::AttachmentReference {
            attachment: att,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }],
        ..Default::default()
    };
    RenderPassInfo {
        handle: vk::RenderPass::from_raw(0x9000),
        attachments: vec![attachment; 3],
        subpasses: vec![subpass(0), subpass(1), subpass(2)],
        dependencies: vec![
            vk::SubpassDependency {
                src_subpass: 0,
                dst_subpass: 1,
                src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
                src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_access_mask: vk::AccessFlags::SHADER_READ,
                dependency_flags: vk::DependencyFlags::empty(),
            },
            vk::SubpassDependency {
                src_subpass: 1,
                dst_subpass: 2,
                src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
                src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_access_mask: vk::AccessFlags::SHADER_READ,
                dependency_flags: vk::DependencyFlags::empty(),
            },
        ],
        multiview: None,
    }
}

#[test]
fn begin_render_pass_creates_one_clone_per_subpass() {
    init_logging();
    let device = MockDevice::new();
    let mut table = MockObjectTable::default();
    let views = vec![
        table.add_image(1, vk::Format::R8G8B8A8_UNORM),
        table.add_image(2, vk::Format::R8G8B8A8_UNORM),
        table.add_image(3, vk::Format::R8G8B8A8_UNORM),
    ];
    let framebuffer = FramebufferInfo {
        handle: vk::Framebuffer::from_raw(0x8000),
        attachments: views,
    };

    let mut ctx = DumpContext::new(
        device.clone(),
        0,
        vk::CommandPool::from_raw(0x7000),
        memory_properties(),
        vec![25],
        vec![vec![10, 20, 30, 40]],
        1,
        DumpOptions::default(),
    );
    ctx.clone_command_buffer().unwrap();
    ctx.begin_render_pass(
        &table,
        10,
        &three_subpass_pass(),
        &framebuffer,
        vk::Rect2D::default(),
        &[],
        vk::SubpassContents::INLINE,
    )
    .unwrap();

    {
        let gpu = device.gpu.borrow();
        assert_eq!(gpu.render_passes.len(), 3);
        for (k, clone) in gpu.render_passes.iter().enumerate() {
            assert_eq!(clone.subpass_count as usize, k + 1, "clone {k}");

            for attachment in &clone.attachments {
                assert_eq!(attachment.store_op, vk::AttachmentStoreOp::STORE);
                assert_eq!(
                    attachment.final_layout,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL
                );
            }

            // No original dependency ends at external, so every clone gets a
            // synthesized transfer-read closure from its last subpass.
            let closing: Vec<_> = clone
                .dependencies
                .iter()
                .filter(|d| {
                    d.src_subpass == k as u32 && d.dst_subpass == vk::SUBPASS_EXTERNAL
                })
                .collect();
            assert_eq!(closing.len(), 1, "clone {k}");
            assert_eq!(closing[0].dst_access_mask, vk::AccessFlags::TRANSFER_READ);

            // Every in-range dependency resolves to a subpass within the
            // clone.
            for dep in &clone.dependencies {
                if dep.src_subpass != vk::SUBPASS_EXTERNAL {
                    assert!(dep.src_subpass <= k as u32);
                }
                if dep.dst_subpass != vk::SUBPASS_EXTERNAL {
                    assert!(dep.dst_subpass <= k as u32);
                }
            }
        }
    }

    drop(ctx);
    assert_eq!(device.gpu.borrow().destroyed_render_passes.len(), 3);
}
