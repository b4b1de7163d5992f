//! Error taxonomy for the runtime.

use std::ffi::CStr;

use ash::vk;

/// Errors returned by runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The Vulkan driver returned an error code.
    #[error("vulkan error: {0:?}")]
    Vk(#[from] vk::Result),

    /// A required extension or feature is not available on the device.
    #[error("missing feature or extension: {0:?}")]
    MissingFeature(&'static CStr),

    /// No Vulkan physical device was found on the system.
    #[error("no physical devices available")]
    NoDevices,

    /// No queue family on the device can serve the requested role.
    #[error("no queue available for role {0:?}")]
    NoQueueForRole(crate::queue::QueueRole),

    /// The executor was in the wrong state for the requested operation.
    #[error("executor is {actual:?}, operation requires {expected:?}")]
    InvalidExecutorState {
        expected: crate::executor::ExecutorState,
        actual: crate::executor::ExecutorState,
    },

    /// A write landed outside the bounds of a push constant block.
    #[error("push constant write of {len} bytes at offset {offset} exceeds block size {size}")]
    PushConstantOutOfBounds { offset: u32, len: u32, size: u32 },

    /// The resource was not created with export support.
    #[error("buffer memory was not allocated as exportable")]
    NotExportable,

    /// A host-side write landed outside a buffer's mapped range.
    #[error("mapped write of {len} bytes at offset {offset} exceeds buffer size {size}")]
    MappedWriteOutOfBounds { offset: u64, len: u64, size: u64 },

    /// The buffer's memory is not host visible, or was not mapped.
    #[error("buffer memory is not mapped")]
    NotMapped,
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;
