//! Memory allocator wrapper and heap accounting.

use crate::{physical_device::MemoryClass, Device, HasDevice};
use ash::prelude::VkResult;
use std::{
    ops::Deref,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};

/// The device memory allocator.
///
/// Wraps a VMA allocator together with running totals of allocated memory
/// per heap class.
#[derive(Clone)]
pub struct Allocator(Arc<AllocatorInner>);

pub struct AllocatorInner {
    device: Device,
    allocator: vk_mem::Allocator,
    accounting: MemoryAccounting,
}

impl HasDevice for Allocator {
    fn device(&self) -> &Device {
        &self.0.device
    }
}
impl Deref for Allocator {
    type Target = vk_mem::Allocator;
    fn deref(&self) -> &Self::Target {
        &self.0.allocator
    }
}

impl Allocator {
    pub fn new(device: Device) -> VkResult<Self> {
        let mut info = vk_mem::AllocatorCreateInfo::new(
            device.instance(),
            &device,
            crate::utils::AsVkHandle::vk_handle(device.physical_device()),
        );
        info.flags |= vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;
        let allocator = unsafe { vk_mem::Allocator::new(info)? };
        Ok(Self(Arc::new(AllocatorInner {
            device,
            allocator,
            accounting: MemoryAccounting::default(),
        })))
    }

    pub fn accounting(&self) -> &MemoryAccounting {
        &self.0.accounting
    }

    /// Classifies a memory type index for accounting.
    pub fn memory_class(&self, memory_type_index: u32) -> MemoryClass {
        self.0
            .device
            .physical_device()
            .properties()
            .memory_class(memory_type_index)
    }

    /// Records an allocation of `size` bytes from `memory_type_index`.
    pub fn track_allocation(&self, memory_type_index: u32, size: u64) {
        self.0
            .accounting
            .add(self.memory_class(memory_type_index), size);
    }

    /// Records the release of `size` bytes from `memory_type_index`.
    pub fn track_release(&self, memory_type_index: u32, size: u64) {
        self.0
            .accounting
            .sub(self.memory_class(memory_type_index), size);
    }
}

/// Running totals of allocated device memory, in bytes.
#[derive(Default)]
pub struct MemoryAccounting {
    device_local: AtomicU64,
    host_shared: AtomicU64,
    multi_instance: AtomicU64,
}

/// A point-in-time snapshot of [`MemoryAccounting`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryUsage {
    pub device_local: u64,
    pub host_shared: u64,
    pub multi_instance: u64,
}

impl MemoryAccounting {
    fn counter(&self, class: MemoryClass) -> &AtomicU64 {
        match class {
            MemoryClass::DeviceLocal => &self.device_local,
            MemoryClass::HostShared => &self.host_shared,
            MemoryClass::MultiInstance => &self.multi_instance,
        }
    }

    pub fn add(&self, class: MemoryClass, size: u64) {
        self.counter(class).fetch_add(size, Ordering::Relaxed);
    }

    /// Subtracts `size` from the class total. Totals never go below zero;
    /// an underflow clamps and logs.
    pub fn sub(&self, class: MemoryClass, size: u64) {
        let counter = self.counter(class);
        let mut current = counter.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(size);
            if next == 0 && size > current {
                tracing::warn!(?class, size, current, "memory accounting underflow");
            }
            match counter.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn snapshot(&self) -> MemoryUsage {
        MemoryUsage {
            device_local: self.device_local.load(Ordering::Relaxed),
            host_shared: self.host_shared.load(Ordering::Relaxed),
            multi_instance: self.multi_instance.load(Ordering::Relaxed),
        }
    }
}
