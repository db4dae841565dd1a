//! Vertex and index buffer extraction.
//!
//! A draw call rarely consumes a whole bound buffer. This module computes the
//! byte range each draw actually referenced: for indexed draws the bound index
//! range is read back first and scanned for the minimum and maximum referenced
//! vertex index, which then bounds the vertex-buffer capture; non-indexed
//! draws derive the bound directly from the call parameters.

use std::collections::BTreeMap;

use ash::vk;

use crate::delegate::{DumpDelegate, DumpLocation, ResourceDump, ResourceDumpKind};
use crate::draw_call::{DrawCallRecord, DrawIndexedIndirectArgs, DrawIndirectArgs};
use crate::error::DumpResult;
use crate::format::{format_element_size, index_type_bytes};
use crate::object_table::VertexAttributeDesc;
use crate::readback::ResourceReadback;
use crate::state::BoundVertexBuffer;

/// Number of indices needed to cover every sub-draw, measured from the start
/// of the index binding.
fn index_extent(draws: &[DrawIndexedIndirectArgs]) -> u32 {
    draws
        .iter()
        .map(|d| d.first_index.saturating_add(d.index_count))
        .max()
        .unwrap_or(0)
}

/// Greatest `first + count` extents of non-indexed sub-draws, for the vertex
/// and instance dimensions respectively.
fn direct_extents(draws: &[DrawIndirectArgs]) -> (u32, u32) {
    let vertices = draws
        .iter()
        .map(|d| d.first_vertex.saturating_add(d.vertex_count))
        .max()
        .unwrap_or(0);
    let instances = draws
        .iter()
        .map(|d| d.first_instance.saturating_add(d.instance_count))
        .max()
        .unwrap_or(0);
    (vertices, instances)
}

fn indexed_instance_extent(draws: &[DrawIndexedIndirectArgs]) -> u32 {
    draws
        .iter()
        .map(|d| d.first_instance.saturating_add(d.instance_count))
        .max()
        .unwrap_or(0)
}

/// Scans the referenced sub-ranges of raw index data for the smallest and
/// largest vertex index actually fetched, with each sub-draw's
/// `vertex_offset` applied. Returns `None` when no index falls inside the
/// data.
fn scan_min_max_indices(
    data: &[u8],
    index_type: vk::IndexType,
    draws: &[DrawIndexedIndirectArgs],
) -> Option<(u32, u32)> {
    let index_size = index_type_bytes(index_type) as usize;
    let available = data.len() / index_size;
    let mut bounds: Option<(u32, u32)> = None;
    for draw in draws {
        let first = draw.first_index as usize;
        let end = (first + draw.index_count as usize).min(available);
        for i in first..end {
            let at = i * index_size;
            let value = match index_type {
                vk::IndexType::UINT8_EXT => u32::from(data[at]),
                vk::IndexType::UINT16 => {
                    u32::from(u16::from_le_bytes([data[at], data[at + 1]]))
                }
                _ => u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]),
            };
            let shifted = i64::from(value) + i64::from(draw.vertex_offset);
            if shifted < 0 {
                tracing::warn!(
                    value,
                    vertex_offset = draw.vertex_offset,
                    "vertex offset underflows index"
                );
                continue;
            }
            let shifted = shifted as u32;
            bounds = Some(match bounds {
                None => (shifted, shifted),
                Some((lo, hi)) => (lo.min(shifted), hi.max(shifted)),
            });
        }
    }
    bounds
}

/// Fallback size for a zero-stride binding: one vertex's worth of data, taken
/// as the sum of the element sizes of every attribute sourced from the
/// binding plus the smallest attribute offset.
fn zero_stride_binding_size(
    binding: u32,
    attributes: &BTreeMap<u32, VertexAttributeDesc>,
) -> vk::DeviceSize {
    let mut total: vk::DeviceSize = 0;
    let mut min_offset: Option<u32> = None;
    for attr in attributes.values().filter(|a| a.binding == binding) {
        total += vk::DeviceSize::from(format_element_size(attr.format));
        min_offset = Some(match min_offset {
            None => attr.offset,
            Some(lo) => lo.min(attr.offset),
        });
    }
    total + vk::DeviceSize::from(min_offset.unwrap_or(0))
}

/// Clamps a computed capture size to the bytes actually available in the
/// binding past `range_offset` bytes into it.
fn clamp_to_binding(
    what: &str,
    binding: u32,
    bound: &BoundVertexBuffer,
    range_offset: vk::DeviceSize,
    size: vk::DeviceSize,
) -> vk::DeviceSize {
    let available = bound.bound_size().saturating_sub(range_offset);
    if size > available {
        tracing::warn!(
            what,
            binding,
            size,
            available,
            "capture range exceeds bound buffer, clamping"
        );
        available
    } else {
        size
    }
}

/// Reads back and dumps the vertex and index data one captured draw call
/// consumed. Indirect parameters must already be resolved; a resolved empty
/// parameter list produces no records.
pub(crate) fn dump_vertex_index_data(
    readback: &dyn ResourceReadback,
    delegate: &mut dyn DumpDelegate,
    record: &DrawCallRecord,
    location: DumpLocation,
    before_draw: bool,
) -> DumpResult<()> {
    // Vertex-rate capture bounds, derived below per draw shape.
    let first_vertex: u32;
    let vertex_count: u32;
    let instance_count: u32;

    if record.params.is_indexed() {
        let draws = record.params.indexed_draws();
        let extent = index_extent(draws);
        if extent == 0 {
            return Ok(());
        }
        let Some(index_buffer) = record.index_buffer.as_ref() else {
            tracing::warn!("indexed draw captured without a bound index buffer");
            return Ok(());
        };
        let Some(buffer) = index_buffer.buffer else {
            return Ok(());
        };
        let index_size = index_type_bytes(index_buffer.index_type);
        let mut size = vk::DeviceSize::from(extent) * vk::DeviceSize::from(index_size);
        let available = index_buffer.bound_size();
        if size > available {
            tracing::warn!(size, available, "index range exceeds bound buffer, clamping");
            size = available;
        }
        let data = readback.read_buffer(
            buffer.handle,
            index_buffer.offset,
            size,
            buffer.queue_family_index,
        )?;
        let bounds = scan_min_max_indices(&data, index_buffer.index_type, draws);
        delegate.dump_resource(&ResourceDump {
            location,
            before_draw,
            kind: ResourceDumpKind::IndexBuffer {
                buffer,
                offset: index_buffer.offset,
                index_type: index_buffer.index_type,
            },
            data,
        })?;
        let Some((min_index, max_index)) = bounds else {
            return Ok(());
        };
        first_vertex = min_index;
        vertex_count = max_index - min_index + 1;
        instance_count = indexed_instance_extent(draws);
    } else {
        let draws = record.params.direct_draws();
        let (vertices, instances) = direct_extents(draws);
        if vertices == 0 {
            return Ok(());
        }
        first_vertex = 0;
        vertex_count = vertices;
        instance_count = instances;
    }

    for (&binding, desc) in &record.vertex_input.bindings {
        let Some(bound) = record.vertex_buffers.get(&binding) else {
            tracing::warn!(binding, "vertex-input binding has no bound buffer");
            continue;
        };
        let Some(buffer) = bound.buffer else {
            continue;
        };
        let count = match desc.input_rate {
            vk::VertexInputRate::INSTANCE => instance_count,
            _ => vertex_count,
        };
        let mut range_offset: vk::DeviceSize = 0;
        let size = match bound.size {
            Some(explicit) if explicit != vk::WHOLE_SIZE => explicit,
            _ if desc.stride > 0 => {
                if count == 0 {
                    continue;
                }
                if desc.input_rate != vk::VertexInputRate::INSTANCE {
                    range_offset =
                        vk::DeviceSize::from(first_vertex) * vk::DeviceSize::from(desc.stride);
                }
                vk::DeviceSize::from(desc.stride) * vk::DeviceSize::from(count)
            }
            _ => zero_stride_binding_size(binding, &record.vertex_input.attributes),
        };
        let size = clamp_to_binding("vertex buffer", binding, bound, range_offset, size);
        if size == 0 {
            continue;
        }
        let offset = bound.offset + range_offset;
        let data = readback.read_buffer(buffer.handle, offset, size, buffer.queue_family_index)?;
        delegate.dump_resource(&ResourceDump {
            location,
            before_draw,
            kind: ResourceDumpKind::VertexBuffer {
                binding,
                buffer,
                offset,
            },
            data,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn indexed(index_count: u32, first_index: u32) -> DrawIndexedIndirectArgs {
        DrawIndexedIndirectArgs {
            index_count,
            instance_count: 1,
            first_index,
            vertex_offset: 0,
            first_instance: 0,
        }
    }

    #[test]
    fn extent_spans_every_sub_draw() {
        let draws = [indexed(6, 0), indexed(3, 10)];
        assert_eq!(index_extent(&draws), 13);
        assert_eq!(index_extent(&[]), 0);
    }

    #[test]
    fn min_max_scan_covers_only_referenced_ranges() {
        // Indices: [7, 2, 9, 0, 5, 1]; the draw references elements 1..=4.
        let data: Vec<u8> = [7u16, 2, 9, 0, 5, 1]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let bounds = scan_min_max_indices(&data, vk::IndexType::UINT16, &[indexed(4, 1)]);
        assert_eq!(bounds, Some((0, 9)));
    }

    #[test]
    fn min_max_scan_accumulates_across_draws() {
        let data: Vec<u8> = [3u32, 8, 120, 1]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let bounds = scan_min_max_indices(
            &data,
            vk::IndexType::UINT32,
            &[indexed(2, 0), indexed(2, 2)],
        );
        assert_eq!(bounds, Some((1, 120)));
    }

    #[test]
    fn min_max_scan_applies_vertex_offset() {
        let data: Vec<u8> = [0u16, 2, 1]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut draw = indexed(3, 0);
        draw.vertex_offset = 3;
        let bounds = scan_min_max_indices(&data, vk::IndexType::UINT16, &[draw]);
        assert_eq!(bounds, Some((3, 5)));

        // An offset that drags every index negative leaves no usable bound.
        draw.vertex_offset = -10;
        assert_eq!(
            scan_min_max_indices(&data, vk::IndexType::UINT16, &[draw]),
            None
        );
    }

    #[test]
    fn min_max_scan_truncates_at_data_end() {
        let data = [5u8, 2];
        let bounds = scan_min_max_indices(&data, vk::IndexType::UINT8_EXT, &[indexed(10, 0)]);
        assert_eq!(bounds, Some((2, 5)));
        assert_eq!(
            scan_min_max_indices(&data, vk::IndexType::UINT8_EXT, &[indexed(4, 7)]),
            None
        );
    }

    #[test]
    fn zero_stride_fallback_sums_attribute_sizes() {
        let mut attributes = BTreeMap::new();
        attributes.insert(
            0,
            VertexAttributeDesc {
                binding: 2,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 8,
            },
        );
        attributes.insert(
            1,
            VertexAttributeDesc {
                binding: 2,
                format: vk::Format::R8G8B8A8_UNORM,
                offset: 4,
            },
        );
        attributes.insert(
            2,
            VertexAttributeDesc {
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: 0,
            },
        );
        // 12 + 4 from binding 2's attributes, plus min offset 4.
        assert_eq!(zero_stride_binding_size(2, &attributes), 20);
        assert_eq!(zero_stride_binding_size(5, &attributes), 0);
    }

    #[test]
    fn direct_extents_take_the_farthest_reach() {
        let draws = [
            DrawIndirectArgs {
                vertex_count: 3,
                instance_count: 2,
                first_vertex: 9,
                first_instance: 0,
            },
            DrawIndirectArgs {
                vertex_count: 6,
                instance_count: 1,
                first_vertex: 0,
                first_instance: 4,
            },
        ];
        assert_eq!(direct_extents(&draws), (12, 5));
    }
}
