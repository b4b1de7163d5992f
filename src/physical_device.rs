//! Physical device enumeration and properties.
//!
//! A [`PhysicalDevice`] caches the queue family table, memory properties, and
//! the derived [`MemoryTypeMap`] used for allocation strategy and heap
//! accounting.

use super::Instance;
use crate::utils::{AsVkHandle, Version};
use ash::{prelude::VkResult, vk};
use std::{ffi::CStr, ops::Deref, sync::Arc};

/// A handle to a physical GPU device.
///
/// Reference-counted and cheap to clone.
#[derive(Clone)]
pub struct PhysicalDevice(Arc<PhysicalDeviceInner>);
impl PartialEq for PhysicalDevice {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for PhysicalDevice {}

struct PhysicalDeviceInner {
    instance: Instance,
    physical_device: vk::PhysicalDevice,
    properties: PhysicalDeviceProperties,
}

impl Instance {
    /// Enumerates all physical devices (GPUs) available on the system.
    pub fn enumerate_physical_devices(
        &self,
    ) -> VkResult<impl ExactSizeIterator<Item = PhysicalDevice> + '_> {
        let pdevices = unsafe { self.deref().enumerate_physical_devices()? };
        Ok(pdevices.into_iter().map(|pdevice| {
            let properties = PhysicalDeviceProperties::new(self.clone(), pdevice);
            PhysicalDevice(Arc::new(PhysicalDeviceInner {
                instance: self.clone(),
                physical_device: pdevice,
                properties,
            }))
        }))
    }
}
impl AsVkHandle for PhysicalDevice {
    type Handle = vk::PhysicalDevice;

    fn vk_handle(&self) -> Self::Handle {
        self.0.physical_device
    }
}
impl PhysicalDevice {
    /// Returns the instance this physical device was enumerated from.
    pub fn instance(&self) -> &Instance {
        &self.0.instance
    }

    pub(crate) fn get_queue_family_properties(&self) -> Vec<vk::QueueFamilyProperties> {
        unsafe {
            self.0
                .instance
                .get_physical_device_queue_family_properties(self.0.physical_device)
        }
    }

    /// Returns the physical device properties.
    pub fn properties(&self) -> &PhysicalDeviceProperties {
        &self.0.properties
    }

    /// Whether timeline semaphores on this device can be exported and
    /// imported over the opaque-fd handle type.
    pub fn supports_timeline_semaphore_fd(&self) -> bool {
        let mut type_info = vk::SemaphoreTypeCreateInfo {
            semaphore_type: vk::SemaphoreType::TIMELINE,
            ..Default::default()
        };
        let info = vk::PhysicalDeviceExternalSemaphoreInfo {
            handle_type: vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD,
            ..Default::default()
        }
        .push_next(&mut type_info);
        let mut props = vk::ExternalSemaphoreProperties::default();
        unsafe {
            self.0
                .instance
                .get_physical_device_external_semaphore_properties(
                    self.0.physical_device,
                    &info,
                    &mut props,
                );
        }
        props.external_semaphore_features.contains(
            vk::ExternalSemaphoreFeatureFlags::EXPORTABLE
                | vk::ExternalSemaphoreFeatureFlags::IMPORTABLE,
        )
    }
}

/// Broad classification for heap accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryClass {
    /// DEVICE_LOCAL memory with no host access.
    DeviceLocal,
    /// Memory visible to the host (staging, readback, BAR).
    HostShared,
    /// Heaps flagged MULTI_INSTANCE on linked device groups.
    MultiInstance,
}

/// Properties and capabilities of a physical device.
pub struct PhysicalDeviceProperties {
    inner: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    memory_type_map: MemoryTypeMap,
}

impl PhysicalDeviceProperties {
    fn new(instance: Instance, pdevice: vk::PhysicalDevice) -> Self {
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(pdevice) };
        let pdevice_properties = unsafe { instance.get_physical_device_properties(pdevice) };

        let memory_types =
            &memory_properties.memory_types[0..memory_properties.memory_type_count as usize];
        let memory_heaps =
            &memory_properties.memory_heaps[0..memory_properties.memory_heap_count as usize];
        let memory_type_map =
            MemoryTypeMap::new(memory_types, memory_heaps, pdevice_properties.device_type);

        Self {
            memory_properties,
            memory_type_map,
            inner: pdevice_properties,
        }
    }

    /// Returns the device name as a C string.
    pub fn device_name(&self) -> &CStr {
        self.inner.device_name_as_c_str().unwrap_or(c"unknown")
    }

    /// Returns the maximum supported API version for this physical device.
    pub fn api_version(&self) -> Version {
        Version(self.inner.api_version)
    }

    /// Returns the available memory types.
    pub fn memory_types(&self) -> &[vk::MemoryType] {
        &self.memory_properties.memory_types[0..self.memory_properties.memory_type_count as usize]
    }

    /// Returns the available memory heaps.
    pub fn memory_heaps(&self) -> &[vk::MemoryHeap] {
        &self.memory_properties.memory_heaps[0..self.memory_properties.memory_heap_count as usize]
    }

    /// Returns the pre-calculated memory type indices for common allocation strategies.
    pub fn memory_type_map(&self) -> &MemoryTypeMap {
        &self.memory_type_map
    }

    /// Classifies a memory type index for heap accounting.
    pub fn memory_class(&self, memory_type_index: u32) -> MemoryClass {
        let mt = &self.memory_types()[memory_type_index as usize];
        let heap = &self.memory_heaps()[mt.heap_index as usize];
        if heap.flags.contains(vk::MemoryHeapFlags::MULTI_INSTANCE) {
            MemoryClass::MultiInstance
        } else if mt
            .property_flags
            .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            && !mt
                .property_flags
                .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            MemoryClass::DeviceLocal
        } else {
            MemoryClass::HostShared
        }
    }
}
impl Deref for PhysicalDeviceProperties {
    type Target = vk::PhysicalDeviceProperties;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Pre-calculated memory type indices for common buffer allocation strategies.
///
/// Computed once during physical device enumeration. The selection accounts
/// for the memory type patterns seen across GPU architectures: unified
/// integrated heaps, discrete VRAM + system RAM, 256MB BAR windows, and
/// resizable BAR.
#[derive(Debug, Clone, Copy)]
pub struct MemoryTypeMap {
    /// GPU-exclusive memory for render targets and GPU-generated data.
    /// DEVICE_LOCAL required, prefers non-HOST_VISIBLE.
    pub private: u32,

    /// Staging memory for CPU-to-GPU transfers.
    /// HOST_VISIBLE required, prefers HOST_COHERENT, avoids HOST_CACHED.
    pub host: u32,

    /// CPU-readable memory for GPU-to-CPU readback.
    /// HOST_VISIBLE + HOST_CACHED required, prefers DEVICE_LOCAL.
    pub readback: u32,

    /// Upload memory for CPU-written, GPU-read data.
    /// DEVICE_LOCAL required, prefers HOST_VISIBLE (avoids staging).
    pub upload: u32,

    /// Whether [`upload`](Self::upload) memory is host visible.
    /// False on discrete GPUs without resizable BAR.
    pub upload_host_visible: bool,
}

impl MemoryTypeMap {
    /// # Panics
    ///
    /// Panics if required memory types cannot be found (exotic hardware).
    pub(crate) fn new(
        memory_types: &[vk::MemoryType],
        memory_heaps: &[vk::MemoryHeap],
        device_type: vk::PhysicalDeviceType,
    ) -> Self {
        let has_flags = |mt: &vk::MemoryType, required: vk::MemoryPropertyFlags| {
            mt.property_flags.contains(required)
        };
        let heap_size = |mt: &vk::MemoryType| memory_heaps[mt.heap_index as usize].size;

        // DEVICE_LOCAL, prefer non-HOST_VISIBLE. Pure VRAM without BAR access
        // is typically faster on discrete GPUs.
        let private = memory_types
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, mt)| has_flags(mt, vk::MemoryPropertyFlags::DEVICE_LOCAL))
            .max_by_key(|(_, mt)| {
                let not_host_visible = !mt
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
                (not_host_visible, heap_size(mt))
            })
            .map(|(i, _)| i as u32)
            .expect("No DEVICE_LOCAL memory type found - unsupported hardware");

        // HOST_VISIBLE, prefer HOST_COHERENT, avoid HOST_CACHED. Write-combined
        // memory is ideal for staging.
        let host = memory_types
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, mt)| has_flags(mt, vk::MemoryPropertyFlags::HOST_VISIBLE))
            .max_by_key(|(_, mt)| {
                let coherent = mt
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::HOST_COHERENT);
                let not_cached = !mt
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::HOST_CACHED);
                let not_device_local = !mt
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL);
                (coherent, not_cached, not_device_local, heap_size(mt))
            })
            .map(|(i, _)| i as u32)
            .expect("No HOST_VISIBLE memory type found - unsupported hardware");

        // HOST_VISIBLE + HOST_CACHED for fast CPU reads.
        let readback = memory_types
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, mt)| {
                has_flags(
                    mt,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
                )
            })
            .max_by_key(|(_, mt)| {
                let device_local = mt
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL);
                let coherent = mt
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::HOST_COHERENT);
                (device_local, coherent, heap_size(mt))
            })
            .map(|(i, _)| i as u32)
            // Some mobile drivers expose no HOST_CACHED type; fall back to host.
            .unwrap_or(host);

        // DEVICE_LOCAL, prefer HOST_VISIBLE so writes skip staging.
        let (upload, upload_host_visible) = {
            let device_local_host_visible = memory_types
                .iter()
                .enumerate()
                .rev()
                .filter(|(_, mt)| {
                    has_flags(
                        mt,
                        vk::MemoryPropertyFlags::DEVICE_LOCAL
                            | vk::MemoryPropertyFlags::HOST_VISIBLE,
                    )
                })
                .max_by_key(|(_, mt)| heap_size(mt));

            if let Some((idx, mt)) = device_local_host_visible {
                let is_small_heap = heap_size(mt) <= 256 * 1024 * 1024;
                if is_small_heap {
                    if device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
                        // APU carve-out heap is too small for general use;
                        // system RAM is what the GPU actually reads anyway.
                        (host, true)
                    } else {
                        // 256MB BAR on a discrete GPU: staging required.
                        (private, false)
                    }
                } else {
                    (idx as u32, true)
                }
            } else if device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
                (host, false)
            } else {
                (private, false)
            }
        };

        Self {
            private,
            host,
            readback,
            upload,
            upload_host_visible,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1024 * 1024 * 1024;
    const MB: u64 = 1024 * 1024;

    const DL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HV: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const HC: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;
    const HCA: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_CACHED;

    fn flags(list: &[vk::MemoryPropertyFlags]) -> vk::MemoryPropertyFlags {
        let mut result = vk::MemoryPropertyFlags::empty();
        for f in list {
            result |= *f;
        }
        result
    }

    fn mem_type(heap_index: u32, flags: vk::MemoryPropertyFlags) -> vk::MemoryType {
        vk::MemoryType {
            property_flags: flags,
            heap_index,
        }
    }

    fn mem_heap(size: u64, device_local: bool) -> vk::MemoryHeap {
        vk::MemoryHeap {
            size,
            flags: if device_local {
                vk::MemoryHeapFlags::DEVICE_LOCAL
            } else {
                vk::MemoryHeapFlags::empty()
            },
        }
    }

    /// Intel integrated: single unified heap, everything is one type.
    #[test]
    fn test_unified_memory() {
        let heaps = [mem_heap(25 * GB, true)];
        let types = [mem_type(0, flags(&[DL, HV, HC, HCA]))];

        let map = MemoryTypeMap::new(&types, &heaps, vk::PhysicalDeviceType::INTEGRATED_GPU);

        assert_eq!(map.private, 0);
        assert_eq!(map.host, 0);
        assert_eq!(map.readback, 0);
        assert_eq!(map.upload, 0);
        assert!(map.upload_host_visible);
    }

    /// Discrete GPU without resizable BAR: upload requires staging.
    #[test]
    fn test_discrete_no_rebar() {
        let heaps = [mem_heap(10 * GB, true), mem_heap(32 * GB, false)];
        let types = [
            mem_type(0, DL),
            mem_type(1, flags(&[HV, HC])),
            mem_type(1, flags(&[HV, HC, HCA])),
        ];

        let map = MemoryTypeMap::new(&types, &heaps, vk::PhysicalDeviceType::DISCRETE_GPU);

        assert_eq!(map.private, 0);
        assert_eq!(map.host, 1);
        assert_eq!(map.readback, 2);
        assert_eq!(map.upload, 0);
        assert!(!map.upload_host_visible);
    }

    /// Resizable BAR: whole VRAM is host-visible, direct upload works.
    #[test]
    fn test_discrete_rebar() {
        let heaps = [mem_heap(10 * GB, true), mem_heap(32 * GB, false)];
        let types = [
            mem_type(0, DL),
            mem_type(0, flags(&[DL, HV, HC])),
            mem_type(1, flags(&[HV, HC])),
            mem_type(1, flags(&[HV, HC, HCA])),
        ];

        let map = MemoryTypeMap::new(&types, &heaps, vk::PhysicalDeviceType::DISCRETE_GPU);

        assert_eq!(map.private, 0, "private prefers pure VRAM");
        assert_eq!(map.host, 2, "staging stays in system RAM");
        assert_eq!(map.upload, 1, "upload uses the ReBAR type");
        assert!(map.upload_host_visible);
    }

    /// 256MB BAR only: too small for general upload on a discrete GPU.
    #[test]
    fn test_256mb_bar() {
        let heaps = [
            mem_heap(16 * GB, true),
            mem_heap(256 * MB, true),
            mem_heap(16 * GB, false),
        ];
        let types = [
            mem_type(0, DL),
            mem_type(1, flags(&[DL, HV, HC])),
            mem_type(2, flags(&[HV, HC])),
            mem_type(2, flags(&[HV, HC, HCA])),
        ];

        let map = MemoryTypeMap::new(&types, &heaps, vk::PhysicalDeviceType::DISCRETE_GPU);

        assert_eq!(map.upload, 0, "upload falls back to private + staging");
        assert!(!map.upload_host_visible);
    }
}
