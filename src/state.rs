//! Graphics state tracking for the command buffer being mirrored.
//!
//! State-setting commands never reach the cloned command buffers from here
//! (the replay driver forwards them itself); this tracker only remembers what
//! is bound so draw calls can snapshot it.

use std::collections::BTreeMap;

use ash::vk;

use crate::object_table::{
    BufferDescriptorInfo, BufferInfo, DescriptorSetInfo, PipelineInfo, VertexInputState,
};

/// One bound vertex buffer binding.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundVertexBuffer {
    pub buffer: Option<BufferInfo>,
    pub offset: vk::DeviceSize,
    /// Bound range; `None` when the bind did not carry sizes, in which case
    /// the range extends to the end of the buffer.
    pub size: Option<vk::DeviceSize>,
    /// Stride supplied by `vkCmdBindVertexBuffers2`. Only authoritative when
    /// the bound pipeline declares dynamic vertex binding strides.
    pub stride: Option<u32>,
}

impl BoundVertexBuffer {
    /// Byte length of the bound range, resolving "whole buffer" binds.
    pub fn bound_size(&self) -> vk::DeviceSize {
        let total = self.buffer.map(|b| b.size).unwrap_or(0);
        match self.size {
            Some(size) if size != vk::WHOLE_SIZE => size,
            _ => total.saturating_sub(self.offset),
        }
    }
}

/// The bound index buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundIndexBuffer {
    pub buffer: Option<BufferInfo>,
    pub offset: vk::DeviceSize,
    /// Bound range from `vkCmdBindIndexBuffer2`; `None` for the classic bind.
    pub size: Option<vk::DeviceSize>,
    pub index_type: vk::IndexType,
}

impl BoundIndexBuffer {
    pub fn bound_size(&self) -> vk::DeviceSize {
        let total = self.buffer.map(|b| b.size).unwrap_or(0);
        match self.size {
            Some(size) if size != vk::WHOLE_SIZE => size,
            _ => total.saturating_sub(self.offset),
        }
    }
}

/// Everything a draw call can observe, updated by the mirrored bind commands.
#[derive(Debug, Clone, Default)]
pub struct BoundState {
    pub pipeline: Option<PipelineInfo>,
    /// Vertex-input state from the latest `vkCmdSetVertexInputEXT`.
    dynamic_vertex_input: VertexInputState,
    pub vertex_buffers: BTreeMap<u32, BoundVertexBuffer>,
    pub index_buffer: Option<BoundIndexBuffer>,
    /// Graphics-bind-point descriptor sets, by set index, with dynamic
    /// offsets already folded into the buffer descriptor offsets.
    pub descriptor_sets: BTreeMap<u32, DescriptorSetInfo>,
}

impl BoundState {
    pub fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: PipelineInfo) {
        if bind_point == vk::PipelineBindPoint::GRAPHICS {
            self.pipeline = Some(pipeline);
        }
    }

    pub fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[Option<BufferInfo>],
        offsets: &[vk::DeviceSize],
    ) {
        for (i, (buffer, &offset)) in buffers.iter().zip(offsets).enumerate() {
            self.vertex_buffers.insert(
                first_binding + i as u32,
                BoundVertexBuffer {
                    buffer: *buffer,
                    offset,
                    size: None,
                    stride: None,
                },
            );
        }
    }

    /// `vkCmdBindVertexBuffers2`. `sizes` and `strides` are optional arrays
    /// parallel to `buffers`.
    pub fn bind_vertex_buffers2(
        &mut self,
        first_binding: u32,
        buffers: &[Option<BufferInfo>],
        offsets: &[vk::DeviceSize],
        sizes: Option<&[vk::DeviceSize]>,
        strides: Option<&[vk::DeviceSize]>,
    ) {
        for (i, (buffer, &offset)) in buffers.iter().zip(offsets).enumerate() {
            self.vertex_buffers.insert(
                first_binding + i as u32,
                BoundVertexBuffer {
                    buffer: *buffer,
                    offset,
                    size: sizes.map(|s| s[i]),
                    stride: strides.map(|s| s[i] as u32),
                },
            );
        }
    }

    pub fn set_vertex_input(&mut self, state: VertexInputState) {
        self.dynamic_vertex_input = state;
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: Option<BufferInfo>,
        offset: vk::DeviceSize,
        size: Option<vk::DeviceSize>,
        index_type: vk::IndexType,
    ) {
        self.index_buffer = Some(BoundIndexBuffer {
            buffer,
            offset,
            size,
            index_type,
        });
    }

    /// Mirrors `vkCmdBindDescriptorSets`. Dynamic offsets are consumed in
    /// binding order across the bound sets and folded into the stored
    /// descriptor offsets, so later snapshots see absolute offsets.
    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        first_set: u32,
        sets: &[DescriptorSetInfo],
        dynamic_offsets: &[u32],
    ) {
        if bind_point != vk::PipelineBindPoint::GRAPHICS {
            return;
        }
        let mut offsets = dynamic_offsets.iter().copied();
        for (i, set) in sets.iter().enumerate() {
            let mut set = set.clone();
            for binding in set.bindings.values_mut() {
                if !is_dynamic_buffer(binding.descriptor_type) {
                    continue;
                }
                for desc in &mut binding.buffers {
                    match offsets.next() {
                        Some(dyn_offset) => desc.offset += vk::DeviceSize::from(dyn_offset),
                        None => {
                            tracing::warn!(
                                set = first_set + i as u32,
                                "descriptor set bind ran out of dynamic offsets"
                            );
                        }
                    }
                }
            }
            self.descriptor_sets.insert(first_set + i as u32, set);
        }
    }

    /// The vertex-input layout in effect for the next draw, merging pipeline
    /// state with the dynamic-state overrides the pipeline opted into.
    pub fn effective_vertex_input(&self) -> VertexInputState {
        let Some(pipeline) = &self.pipeline else {
            return VertexInputState::default();
        };
        if pipeline.dynamic_vertex_input {
            return self.dynamic_vertex_input.clone();
        }
        let mut state = pipeline.vertex_input.clone();
        if pipeline.dynamic_vertex_binding_stride {
            for (&binding, desc) in &mut state.bindings {
                if let Some(stride) = self.vertex_buffers.get(&binding).and_then(|b| b.stride) {
                    desc.stride = stride;
                }
            }
        }
        state
    }
}

fn is_dynamic_buffer(ty: vk::DescriptorType) -> bool {
    matches!(
        ty,
        vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
    )
}

/// Buffer-class descriptor range with `vk::WHOLE_SIZE` resolved against the
/// underlying buffer.
pub fn resolve_descriptor_range(desc: &BufferDescriptorInfo) -> vk::DeviceSize {
    let total = desc.buffer.map(|b| b.size).unwrap_or(0);
    if desc.range == vk::WHOLE_SIZE {
        total.saturating_sub(desc.offset)
    } else {
        desc.range
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_table::{
        BufferId, DescriptorBindingInfo, VertexAttributeDesc, VertexBindingDesc,
    };
    use ash::vk::Handle as _;

    fn buffer(id: u64, size: vk::DeviceSize) -> BufferInfo {
        BufferInfo {
            id: BufferId(id),
            handle: vk::Buffer::from_raw(id),
            size,
            queue_family_index: 0,
        }
    }

    #[test]
    fn whole_size_bind_resolves_to_remaining_bytes() {
        let mut state = BoundState::default();
        state.bind_vertex_buffers2(
            0,
            &[Some(buffer(1, 256))],
            &[64],
            Some(&[vk::WHOLE_SIZE]),
            None,
        );
        assert_eq!(state.vertex_buffers[&0].bound_size(), 192);
    }

    #[test]
    fn dynamic_offsets_fold_into_descriptor_offsets() {
        let mut set = DescriptorSetInfo::default();
        set.bindings.insert(
            0,
            DescriptorBindingInfo {
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                buffers: vec![BufferDescriptorInfo {
                    buffer: Some(buffer(1, 1024)),
                    offset: 16,
                    range: 64,
                }],
                ..Default::default()
            },
        );
        let mut state = BoundState::default();
        state.bind_descriptor_sets(vk::PipelineBindPoint::GRAPHICS, 2, &[set], &[112]);
        let bound = &state.descriptor_sets[&2].bindings[&0].buffers[0];
        assert_eq!(bound.offset, 128);
    }

    #[test]
    fn compute_descriptor_binds_are_ignored() {
        let mut state = BoundState::default();
        state.bind_descriptor_sets(
            vk::PipelineBindPoint::COMPUTE,
            0,
            &[DescriptorSetInfo::default()],
            &[],
        );
        assert!(state.descriptor_sets.is_empty());
    }

    #[test]
    fn dynamic_stride_overrides_pipeline_stride() {
        let mut vertex_input = VertexInputState::default();
        vertex_input.bindings.insert(
            0,
            VertexBindingDesc {
                stride: 12,
                input_rate: vk::VertexInputRate::VERTEX,
            },
        );
        vertex_input.attributes.insert(
            0,
            VertexAttributeDesc {
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
        );
        let mut state = BoundState::default();
        state.bind_pipeline(
            vk::PipelineBindPoint::GRAPHICS,
            PipelineInfo {
                vertex_input,
                dynamic_vertex_input: false,
                dynamic_vertex_binding_stride: true,
            },
        );
        state.bind_vertex_buffers2(
            0,
            &[Some(buffer(1, 256))],
            &[0],
            None,
            Some(&[32]),
        );
        assert_eq!(state.effective_vertex_input().bindings[&0].stride, 32);
    }

    #[test]
    fn dynamic_vertex_input_replaces_pipeline_state() {
        let mut dynamic = VertexInputState::default();
        dynamic.bindings.insert(
            3,
            VertexBindingDesc {
                stride: 8,
                input_rate: vk::VertexInputRate::INSTANCE,
            },
        );
        let mut state = BoundState::default();
        state.bind_pipeline(
            vk::PipelineBindPoint::GRAPHICS,
            PipelineInfo {
                dynamic_vertex_input: true,
                ..Default::default()
            },
        );
        state.set_vertex_input(dynamic.clone());
        assert_eq!(state.effective_vertex_input(), dynamic);
    }
}
