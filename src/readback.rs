//! Synchronous resource readback interface.

use ash::vk;

use crate::error::DumpResult;
use crate::object_table::ImageInfo;

/// Reads raw bytes out of live GPU resources.
///
/// The implementation (owned by the replay driver) is responsible for staging
/// and queue-family ownership transfer; from this crate's perspective the call
/// blocks until the bytes are available. A dump pass only invokes it after the
/// corresponding submission's fence has signaled, so the returned bytes always
/// observe a fully complete prior submission.
pub trait ResourceReadback {
    fn read_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        queue_family_index: u32,
    ) -> DumpResult<Vec<u8>>;

    /// Reads the full subresource contents of an image. `layout` is the
    /// layout the image is in when the call is made; the implementation must
    /// return it to that layout before completing.
    fn read_image(
        &self,
        image: &ImageInfo,
        layout: vk::ImageLayout,
        queue_family_index: u32,
    ) -> DumpResult<Vec<u8>>;
}
