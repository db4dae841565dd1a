//! Indirect draw parameter capture.
//!
//! Indirect argument buffers can be rewritten by the GPU between draw calls,
//! so the values a captured draw actually consumed must be snapshotted at its
//! execution position. Each indirect record gets a small device-local clone
//! buffer; a transfer copy into it is recorded after the cloned command
//! buffer's render pass ends (copies are not legal inside one), followed by a
//! transfer-to-transfer barrier so later readback observes the copy. Once the
//! enclosing submission's fence signals, the clone is read back and decoded.

use ash::vk;

use crate::dispatch::DeviceDispatch;
use crate::draw_call::{
    CloneBuffer, DrawIndexedIndirectArgs, DrawIndirectArgs, DrawParams, ResolvedDraws,
};
use crate::error::{DumpError, DumpResult};
use crate::readback::ResourceReadback;

/// Bytes needed to hold `draw_count` argument structures laid out at
/// `stride`. The final structure is not padded to the stride.
pub(crate) fn clone_buffer_size(draw_count: u32, stride: u32, cmd_size: u32) -> vk::DeviceSize {
    debug_assert!(draw_count > 0);
    vk::DeviceSize::from(stride) * vk::DeviceSize::from(draw_count - 1)
        + vk::DeviceSize::from(cmd_size)
}

/// Copy regions that compact strided source parameters into tightly packed
/// structures in the clone. A tightly packed source collapses to one region.
pub(crate) fn param_copy_regions(
    src_offset: vk::DeviceSize,
    draw_count: u32,
    stride: u32,
    cmd_size: u32,
) -> Vec<vk::BufferCopy> {
    if stride == cmd_size {
        return vec![vk::BufferCopy {
            src_offset,
            dst_offset: 0,
            size: vk::DeviceSize::from(draw_count) * vk::DeviceSize::from(cmd_size),
        }];
    }
    (0..draw_count)
        .map(|i| vk::BufferCopy {
            src_offset: src_offset + vk::DeviceSize::from(i) * vk::DeviceSize::from(stride),
            dst_offset: vk::DeviceSize::from(i) * vk::DeviceSize::from(cmd_size),
            size: vk::DeviceSize::from(cmd_size),
        })
        .collect()
}

fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
) -> DumpResult<u32> {
    let types = &memory_properties.memory_types[..memory_properties.memory_type_count as usize];
    let usable = |(index, _): &(usize, &vk::MemoryType)| type_bits & (1 << index) != 0;
    // Prefer device-local memory; the clone only ever feeds transfer ops.
    let device_local = types.iter().enumerate().filter(usable).find(|(_, ty)| {
        ty.property_flags
            .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
    });
    device_local
        .or_else(|| types.iter().enumerate().find(usable))
        .map(|(index, _)| index as u32)
        .ok_or(DumpError::NoSuitableMemoryType { type_bits })
}

/// Creates and binds one clone buffer usable as both copy source and
/// destination.
pub(crate) fn create_clone_buffer<D: DeviceDispatch>(
    device: &D,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    size: vk::DeviceSize,
) -> DumpResult<CloneBuffer> {
    let info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let buffer = device
        .create_buffer(&info)
        .map_err(|e| DumpError::api("vkCreateBuffer", e))?;

    let requirements = device.get_buffer_memory_requirements(buffer);
    let memory_type_index = match find_memory_type(memory_properties, requirements.memory_type_bits)
    {
        Ok(index) => index,
        Err(e) => {
            device.destroy_buffer(buffer);
            return Err(e);
        }
    };
    let alloc = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);
    let memory = match device.allocate_memory(&alloc) {
        Ok(memory) => memory,
        Err(e) => {
            device.destroy_buffer(buffer);
            return Err(DumpError::api("vkAllocateMemory", e));
        }
    };
    if let Err(e) = device.bind_buffer_memory(buffer, memory, 0) {
        device.destroy_buffer(buffer);
        device.free_memory(memory);
        return Err(DumpError::api("vkBindBufferMemory", e));
    }
    Ok(CloneBuffer {
        buffer,
        memory,
        size,
    })
}

pub(crate) fn destroy_clone_buffer<D: DeviceDispatch>(device: &D, clone: CloneBuffer) {
    device.destroy_buffer(clone.buffer);
    device.free_memory(clone.memory);
}

/// Allocates the clone buffers an indirect record needs. Zero-draw records
/// resolve immediately to an empty parameter list and get no clones. Safe to
/// call again for the same record (the second clone of a before/after pair
/// reuses the clones created for the first).
pub(crate) fn create_param_clones<D: DeviceDispatch>(
    device: &D,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    params: &mut DrawParams,
) -> DumpResult<()> {
    let empty = |indexed: bool| {
        if indexed {
            ResolvedDraws::IndexedDraws(Vec::new())
        } else {
            ResolvedDraws::Draws(Vec::new())
        }
    };
    let cmd_size = params.indirect_cmd_size();
    match params {
        DrawParams::Draw(_) | DrawParams::DrawIndexed(_) => Ok(()),
        DrawParams::DrawIndirect(p) => {
            if p.clone.is_some() {
                return Ok(());
            }
            if p.draw_count == 0 {
                p.resolved = empty(p.indexed);
                return Ok(());
            }
            let size = clone_buffer_size(p.draw_count, p.stride, cmd_size);
            debug_assert!(
                size <= p.buffer.size.saturating_sub(p.offset),
                "indirect parameters overrun the bound buffer"
            );
            p.clone = Some(create_clone_buffer(device, memory_properties, size)?);
            Ok(())
        }
        DrawParams::DrawIndirectCount(p) => {
            if p.clone.is_some() {
                return Ok(());
            }
            if p.max_draw_count == 0 {
                p.actual_draw_count = Some(0);
                p.resolved = empty(p.indexed);
                return Ok(());
            }
            let size = clone_buffer_size(p.max_draw_count, p.stride, cmd_size);
            debug_assert!(
                size <= p.buffer.size.saturating_sub(p.offset),
                "indirect parameters overrun the bound buffer"
            );
            p.clone = Some(create_clone_buffer(device, memory_properties, size)?);
            p.count_clone = Some(create_clone_buffer(
                device,
                memory_properties,
                std::mem::size_of::<u32>() as vk::DeviceSize,
            )?);
            Ok(())
        }
    }
}

/// Records the copies that snapshot an indirect record's parameters into its
/// clone buffers, plus the barrier making them visible to later transfers.
/// Must be recorded outside any render pass.
pub(crate) fn record_param_copies<D: DeviceDispatch>(
    device: &D,
    command_buffer: vk::CommandBuffer,
    params: &DrawParams,
) {
    let cmd_size = params.indirect_cmd_size();
    let mut barriers = Vec::new();
    match params {
        DrawParams::Draw(_) | DrawParams::DrawIndexed(_) => return,
        DrawParams::DrawIndirect(p) => {
            let Some(clone) = p.clone else { return };
            let regions = param_copy_regions(p.offset, p.draw_count, p.stride, cmd_size);
            device.cmd_copy_buffer(command_buffer, p.buffer.handle, clone.buffer, &regions);
            barriers.push(clone);
        }
        DrawParams::DrawIndirectCount(p) => {
            let Some(clone) = p.clone else { return };
            let regions = param_copy_regions(p.offset, p.max_draw_count, p.stride, cmd_size);
            device.cmd_copy_buffer(command_buffer, p.buffer.handle, clone.buffer, &regions);
            barriers.push(clone);
            if let Some(count_clone) = p.count_clone {
                let region = vk::BufferCopy {
                    src_offset: p.count_offset,
                    dst_offset: 0,
                    size: std::mem::size_of::<u32>() as vk::DeviceSize,
                };
                device.cmd_copy_buffer(
                    command_buffer,
                    p.count_buffer.handle,
                    count_clone.buffer,
                    &[region],
                );
                barriers.push(count_clone);
            }
        }
    }
    let buffer_barriers: Vec<vk::BufferMemoryBarrier<'_>> = barriers
        .iter()
        .map(|clone| {
            vk::BufferMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(clone.buffer)
                .offset(0)
                .size(clone.size)
        })
        .collect();
    device.cmd_pipeline_barrier(
        command_buffer,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::TRANSFER,
        &buffer_barriers,
        &[],
    );
}

fn decode_resolved(bytes: &[u8], indexed: bool) -> ResolvedDraws {
    if indexed {
        ResolvedDraws::IndexedDraws(bytemuck::pod_collect_to_vec::<u8, DrawIndexedIndirectArgs>(
            bytes,
        ))
    } else {
        ResolvedDraws::Draws(bytemuck::pod_collect_to_vec::<u8, DrawIndirectArgs>(bytes))
    }
}

/// Reads an indirect record's clone buffers back and decodes the argument
/// structures. No-op for direct draws and already resolved records, so a
/// record shared by a before/after clone pair is only fetched once.
pub(crate) fn fetch_params(
    readback: &dyn ResourceReadback,
    queue_family_index: u32,
    params: &mut DrawParams,
) -> DumpResult<()> {
    if params.is_resolved() {
        return Ok(());
    }
    let cmd_size = vk::DeviceSize::from(params.indirect_cmd_size());
    match params {
        DrawParams::Draw(_) | DrawParams::DrawIndexed(_) => Ok(()),
        DrawParams::DrawIndirect(p) => {
            let Some(clone) = p.clone else {
                return Ok(());
            };
            let size = vk::DeviceSize::from(p.draw_count) * cmd_size;
            let bytes = readback.read_buffer(clone.buffer, 0, size, queue_family_index)?;
            p.resolved = decode_resolved(&bytes, p.indexed);
            Ok(())
        }
        DrawParams::DrawIndirectCount(p) => {
            let (Some(clone), Some(count_clone)) = (p.clone, p.count_clone) else {
                return Ok(());
            };
            let count_bytes =
                readback.read_buffer(count_clone.buffer, 0, 4, queue_family_index)?;
            let count_bytes: [u8; 4] = count_bytes
                .try_into()
                .map_err(|_| DumpError::Readback("short read of draw count".into()))?;
            let gpu_count = u32::from_le_bytes(count_bytes);
            let count = gpu_count.min(p.max_draw_count);
            if gpu_count > p.max_draw_count {
                tracing::debug!(
                    gpu_count,
                    max_draw_count = p.max_draw_count,
                    "draw count exceeds maximum"
                );
            }
            p.actual_draw_count = Some(count);
            if count == 0 {
                p.resolved = decode_resolved(&[], p.indexed);
                return Ok(());
            }
            let size = vk::DeviceSize::from(count) * cmd_size;
            let bytes = readback.read_buffer(clone.buffer, 0, size, queue_family_index)?;
            p.resolved = decode_resolved(&bytes, p.indexed);
            Ok(())
        }
    }
}

/// Forgets fetched parameters so a later dump pass over the same command
/// buffer re-fetches fresh values. Clone buffers are kept for reuse.
pub(crate) fn reset_params(params: &mut DrawParams) {
    match params {
        DrawParams::Draw(_) | DrawParams::DrawIndexed(_) => {}
        DrawParams::DrawIndirect(p) => {
            if p.clone.is_some() {
                p.resolved = ResolvedDraws::Pending;
            }
        }
        DrawParams::DrawIndirectCount(p) => {
            if p.clone.is_some() {
                p.resolved = ResolvedDraws::Pending;
                p.actual_draw_count = None;
            }
        }
    }
}

/// Frees an indirect record's clone buffers.
pub(crate) fn release_params<D: DeviceDispatch>(device: &D, params: &mut DrawParams) {
    match params {
        DrawParams::Draw(_) | DrawParams::DrawIndexed(_) => {}
        DrawParams::DrawIndirect(p) => {
            if let Some(clone) = p.clone.take() {
                destroy_clone_buffer(device, clone);
            }
        }
        DrawParams::DrawIndirectCount(p) => {
            if let Some(clone) = p.clone.take() {
                destroy_clone_buffer(device, clone);
            }
            if let Some(clone) = p.count_clone.take() {
                destroy_clone_buffer(device, clone);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn clone_size_does_not_pad_the_final_command() {
        assert_eq!(clone_buffer_size(1, 32, 20), 20);
        assert_eq!(clone_buffer_size(3, 32, 20), 84);
        assert_eq!(clone_buffer_size(3, 20, 20), 60);
    }

    #[test]
    fn tightly_packed_source_copies_in_one_region() {
        let regions = param_copy_regions(128, 4, 16, 16);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].src_offset, 128);
        assert_eq!(regions[0].dst_offset, 0);
        assert_eq!(regions[0].size, 64);
    }

    #[test]
    fn strided_source_copies_one_region_per_draw() {
        let regions = param_copy_regions(0, 3, 32, 20);
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[2].src_offset, 64);
        assert_eq!(regions[2].dst_offset, 40);
        assert_eq!(regions[2].size, 20);
    }

    #[test]
    fn memory_type_prefers_device_local() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 2;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;
        props.memory_types[1].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        assert_eq!(find_memory_type(&props, 0b11).unwrap(), 1);
        assert_eq!(find_memory_type(&props, 0b01).unwrap(), 0);
        assert!(matches!(
            find_memory_type(&props, 0b100),
            Err(DumpError::NoSuitableMemoryType { type_bits: 0b100 })
        ));
    }
}
