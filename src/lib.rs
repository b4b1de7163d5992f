//! A Vulkan resource and command execution runtime.
//!
//! One logical device is created per physical device on the system, each
//! with graphics, compute, and transfer queues backed by timeline
//! semaphores. Resources live in generational handle pools and are published
//! to four fixed bindless descriptor tables. Work is recorded as typed
//! [`Record`]s on an [`Executor`], which infers minimal pipeline barriers
//! from declared accesses at commit time. Cross-device ordering uses
//! imported timeline semaphores where the hardware allows and degrades to
//! host waits where it does not.

pub mod alloc;
pub mod bindless;
pub mod buffer;
pub mod descriptor;
mod device;
pub mod error;
pub mod executor;
pub mod image;
mod instance;
mod physical_device;
pub mod pool;
pub mod push_constant;
pub mod queue;
pub mod record;
pub mod resources;
pub mod runtime;
pub mod sync;
pub mod tracking;
pub mod utils;

pub use ash;
pub use ash::vk;

pub use alloc::Allocator;
pub use bindless::{BindlessTables, TableKind};
pub use buffer::{Buffer, BufferDesc, HostAccess};
pub use device::{Device, DeviceBuilder, HasDevice};
pub use error::{Result, RuntimeError};
pub use executor::{Executor, ExecutorState, Submission};
pub use image::{Image, ImageDesc};
pub use instance::{Instance, InstanceBuilder, InstanceCreateInfo};
pub use physical_device::{MemoryClass, PhysicalDevice, PhysicalDeviceProperties};
pub use pool::{Handle, Pool, RawHandle};
pub use push_constant::PushConstantBlock;
pub use queue::{Queue, QueueGuard, QueueRole};
pub use record::{BufferUse, ColorAttachment, ImageUse, Record};
pub use resources::ResourceManager;
pub use runtime::{DeviceContext, Runtime, RuntimeOptions};
pub use sync::{Semaphore, SharedSemaphore};
pub use tracking::{Access, MemoryBarrier, ResourceState};
