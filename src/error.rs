use ash::vk;
use thiserror::Error;

/// Error type propagated through every layer of a dump pass.
///
/// GPU API failures are assumed non-transient: no retry is performed anywhere,
/// and the first failure aborts the pass. Resources already handed to the
/// delegate by earlier draw calls are not unwound.
#[derive(Debug, Error)]
pub enum DumpError {
    /// An underlying Vulkan entry point failed. `call` names the originating
    /// entry point so the failure can be attributed without a backtrace.
    #[error("{call} failed with {result:?}")]
    Api {
        call: &'static str,
        result: vk::Result,
    },

    /// Host allocation for a temporary readback buffer failed.
    #[error("out of host memory while staging readback data")]
    OutOfHostMemory,

    /// The resource readback utility failed to return the requested range.
    #[error("resource readback failed: {0}")]
    Readback(String),

    /// The dumping delegate refused a record. Propagated verbatim.
    #[error("dump delegate failed: {0}")]
    Delegate(String),

    /// No memory type of the replay device satisfies the clone buffer's
    /// requirements.
    #[error("no suitable memory type for clone buffer (type bits {type_bits:#x})")]
    NoSuitableMemoryType { type_bits: u32 },
}

impl DumpError {
    pub(crate) fn api(call: &'static str, result: vk::Result) -> Self {
        tracing::error!(call, ?result, "vulkan call failed during resource dump");
        DumpError::Api { call, result }
    }
}

/// Shorthand used throughout the crate.
pub type DumpResult<T> = Result<T, DumpError>;
