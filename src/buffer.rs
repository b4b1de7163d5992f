//! Buffers: allocator-managed, exportable, imported, and host-pointer backed.

use crate::{
    alloc::Allocator,
    error::RuntimeError,
    physical_device::MemoryTypeMap,
    tracking::ResourceState,
    utils::AsVkHandle,
    Device, HasDevice,
};
use ash::vk;
use std::os::fd::RawFd;
use vk_mem::Alloc;

/// How the host needs to touch a buffer's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostAccess {
    /// Device-only; host never maps it.
    #[default]
    None,
    /// Host writes sequentially (staging, uploads).
    SequentialWrite,
    /// Host reads back results.
    Random,
}

/// Parameters for [`crate::ResourceManager::create_buffer`].
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub host_access: HostAccess,
    /// Minimum alignment of the allocation, 1 for no requirement.
    pub alignment: vk::DeviceSize,
    /// Allocate from dedicated, exportable device memory so
    /// [`Buffer::export_memory`] works.
    pub exportable: bool,
}
impl Default for BufferDesc {
    fn default() -> Self {
        Self {
            size: 0,
            usage: vk::BufferUsageFlags::empty(),
            host_access: HostAccess::None,
            alignment: 1,
            exportable: false,
        }
    }
}

enum BufferMemory {
    /// Allocated and owned by the VMA allocator.
    Managed(vk_mem::Allocation),
    /// Raw device memory, owned: exportable or fd-imported allocations.
    Dedicated(vk::DeviceMemory),
    /// Raw device memory wrapping a host pointer the caller owns.
    HostPointer(vk::DeviceMemory),
}

/// A GPU buffer together with its memory and synchronization state.
pub struct Buffer {
    allocator: Allocator,
    buffer: vk::Buffer,
    memory: BufferMemory,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_type_index: u32,
    mapped: *mut u8,
    /// Whether this buffer's memory is counted in the allocator's heap
    /// accounting. Imported memory belongs to the exporting device.
    tracked: bool,
    pub(crate) state: ResourceState,
    pub(crate) bindless_uniform: Option<u32>,
    pub(crate) bindless_storage: Option<u32>,
    pub(crate) tables: Option<std::sync::Arc<crate::bindless::BindlessTables>>,
}
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl HasDevice for Buffer {
    fn device(&self) -> &Device {
        self.allocator.device()
    }
}
impl AsVkHandle for Buffer {
    type Handle = vk::Buffer;
    fn vk_handle(&self) -> vk::Buffer {
        self.buffer
    }
}

impl Buffer {
    /// All buffers can be the source and destination of transfer commands,
    /// so copy records never fail on a missing usage bit.
    pub(crate) fn effective_usage(usage: vk::BufferUsageFlags) -> vk::BufferUsageFlags {
        usage | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST
    }

    pub(crate) fn new_managed(allocator: Allocator, desc: &BufferDesc) -> Result<Self, RuntimeError> {
        let usage = Self::effective_usage(desc.usage);
        let buffer_info = vk::BufferCreateInfo {
            size: desc.size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let mut create_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };
        match desc.host_access {
            HostAccess::None => {}
            HostAccess::SequentialWrite => {
                create_info.flags |= vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE
                    | vk_mem::AllocationCreateFlags::MAPPED;
                create_info.usage = vk_mem::MemoryUsage::Auto;
            }
            HostAccess::Random => {
                create_info.flags |= vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM
                    | vk_mem::AllocationCreateFlags::MAPPED;
                create_info.usage = vk_mem::MemoryUsage::Auto;
            }
        }
        let (buffer, allocation) = unsafe {
            allocator.create_buffer_with_alignment(&buffer_info, &create_info, desc.alignment)?
        };
        let info = allocator.get_allocation_info(&allocation);
        allocator.track_allocation(info.memory_type, info.size);
        Ok(Self {
            buffer,
            memory: BufferMemory::Managed(allocation),
            size: desc.size,
            usage,
            memory_type_index: info.memory_type,
            mapped: info.mapped_data as *mut u8,
            tracked: true,
            state: ResourceState::default(),
            bindless_uniform: None,
            bindless_storage: None,
            tables: None,
            allocator,
        })
    }

    /// Creates a buffer backed by a dedicated, exportable memory allocation.
    ///
    /// VMA owns no exportable pools, so this path allocates raw device
    /// memory with the opaque-fd export handle type.
    pub(crate) fn new_exportable(
        allocator: Allocator,
        desc: &BufferDesc,
    ) -> Result<Self, RuntimeError> {
        let device = allocator.device();
        // The loader must be present or the export later would fail anyway.
        device.external_memory_fd()?;
        let usage = Self::effective_usage(desc.usage);
        let mut external_info = vk::ExternalMemoryBufferCreateInfo {
            handle_types: vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD,
            ..Default::default()
        };
        let buffer_info = vk::BufferCreateInfo {
            size: desc.size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        }
        .push_next(&mut external_info);
        let buffer = unsafe { device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let map = device.physical_device().properties().memory_type_map();
        let (preferred_index, preferred_flags) = Self::raw_memory_preference(map, desc.host_access);
        let memory_type_index = Self::pick_memory_type(
            device,
            requirements.memory_type_bits,
            preferred_index,
            preferred_flags,
        );
        let mut export_info = vk::ExportMemoryAllocateInfo {
            handle_types: vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD,
            ..Default::default()
        };
        let allocate_info = vk::MemoryAllocateInfo {
            allocation_size: requirements.size,
            memory_type_index,
            ..Default::default()
        }
        .push_next(&mut export_info);
        let memory = match unsafe { device.allocate_memory(&allocate_info, None) } {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err.into());
            }
        };
        unsafe { device.bind_buffer_memory(buffer, memory, 0)? };
        // Raw allocations are not mapped by VMA; map here when the caller
        // asked for host access and the chosen type allows it.
        let host_visible = device.physical_device().properties().memory_types()
            [memory_type_index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        let mapped = if desc.host_access != HostAccess::None && host_visible {
            match unsafe {
                device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            } {
                Ok(ptr) => ptr as *mut u8,
                Err(err) => {
                    unsafe {
                        device.destroy_buffer(buffer, None);
                        device.free_memory(memory, None);
                    }
                    return Err(err.into());
                }
            }
        } else {
            std::ptr::null_mut()
        };
        allocator.track_allocation(memory_type_index, requirements.size);
        Ok(Self {
            buffer,
            memory: BufferMemory::Dedicated(memory),
            size: desc.size,
            usage,
            memory_type_index,
            mapped,
            tracked: true,
            state: ResourceState::default(),
            bindless_uniform: None,
            bindless_storage: None,
            tables: None,
            allocator,
        })
    }

    /// Creates a buffer bound to memory imported from `exported`.
    ///
    /// The fd is consumed. Panics if the new buffer needs more memory than
    /// the exporting device allocated; continuing would corrupt memory the
    /// importing device does not own.
    pub(crate) fn new_imported(
        allocator: Allocator,
        exported: ExportedBufferMemory,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self, RuntimeError> {
        let device = allocator.device();
        device.external_memory_fd()?;
        let usage = Self::effective_usage(usage);
        let mut external_info = vk::ExternalMemoryBufferCreateInfo {
            handle_types: vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD,
            ..Default::default()
        };
        let buffer_info = vk::BufferCreateInfo {
            size: exported.size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        }
        .push_next(&mut external_info);
        let buffer = unsafe { device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        assert!(
            requirements.size <= exported.allocation_size,
            "imported buffer memory too small: need {} bytes, exporter allocated {}",
            requirements.size,
            exported.allocation_size,
        );

        let memory_type_index = Self::pick_memory_type(
            device,
            requirements.memory_type_bits,
            device.physical_device().properties().memory_type_map().private,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        let mut import_info = vk::ImportMemoryFdInfoKHR {
            handle_type: vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD,
            fd: exported.fd,
            ..Default::default()
        };
        let allocate_info = vk::MemoryAllocateInfo {
            allocation_size: exported.allocation_size,
            memory_type_index,
            ..Default::default()
        }
        .push_next(&mut import_info);
        let memory = match unsafe { device.allocate_memory(&allocate_info, None) } {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err.into());
            }
        };
        unsafe { device.bind_buffer_memory(buffer, memory, 0)? };
        Ok(Self {
            buffer,
            memory: BufferMemory::Dedicated(memory),
            size: exported.size,
            usage,
            memory_type_index,
            mapped: std::ptr::null_mut(),
            tracked: false,
            state: ResourceState::default(),
            bindless_uniform: None,
            bindless_storage: None,
            tables: None,
            allocator,
        })
    }

    /// Creates a buffer over caller-owned host memory.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid and unmoved for the life of the buffer, be
    /// aligned to `minImportedHostPointerAlignment`, and span `size` bytes.
    pub(crate) unsafe fn new_host_import(
        allocator: Allocator,
        ptr: *mut std::ffi::c_void,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self, RuntimeError> {
        let device = allocator.device();
        let loader = device.external_memory_host()?;
        let usage = Self::effective_usage(usage);

        let mut pointer_properties = vk::MemoryHostPointerPropertiesEXT::default();
        (loader.fp().get_memory_host_pointer_properties_ext)(
            loader.device(),
            vk::ExternalMemoryHandleTypeFlags::HOST_ALLOCATION_EXT,
            ptr,
            &mut pointer_properties,
        )
        .result()?;

        let mut external_info = vk::ExternalMemoryBufferCreateInfo {
            handle_types: vk::ExternalMemoryHandleTypeFlags::HOST_ALLOCATION_EXT,
            ..Default::default()
        };
        let buffer_info = vk::BufferCreateInfo {
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        }
        .push_next(&mut external_info);
        let buffer = device.create_buffer(&buffer_info, None)?;
        let requirements = device.get_buffer_memory_requirements(buffer);
        assert!(
            requirements.size <= size,
            "imported host memory too small: need {} bytes, caller provided {}",
            requirements.size,
            size,
        );

        let memory_type_bits =
            requirements.memory_type_bits & pointer_properties.memory_type_bits;
        if memory_type_bits == 0 {
            device.destroy_buffer(buffer, None);
            return Err(RuntimeError::Vk(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE));
        }
        let memory_type_index = Self::pick_memory_type(
            device,
            memory_type_bits,
            device.physical_device().properties().memory_type_map().host,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        let mut import_info = vk::ImportMemoryHostPointerInfoEXT {
            handle_type: vk::ExternalMemoryHandleTypeFlags::HOST_ALLOCATION_EXT,
            p_host_pointer: ptr,
            ..Default::default()
        };
        let allocate_info = vk::MemoryAllocateInfo {
            allocation_size: size,
            memory_type_index,
            ..Default::default()
        }
        .push_next(&mut import_info);
        let memory = match device.allocate_memory(&allocate_info, None) {
            Ok(memory) => memory,
            Err(err) => {
                device.destroy_buffer(buffer, None);
                return Err(err.into());
            }
        };
        device.bind_buffer_memory(buffer, memory, 0)?;
        Ok(Self {
            buffer,
            memory: BufferMemory::HostPointer(memory),
            size,
            usage,
            memory_type_index,
            mapped: ptr as *mut u8,
            tracked: false,
            state: ResourceState::default(),
            bindless_uniform: None,
            bindless_storage: None,
            tables: None,
            allocator,
        })
    }

    /// The memory-type preference for a raw allocation, from the device's
    /// pre-calculated [`MemoryTypeMap`]: device-only buffers want private
    /// VRAM, host-written buffers want the upload type when it is mappable
    /// (falling back to staging memory when it is not), and readback buffers
    /// want cached host memory.
    fn raw_memory_preference(
        map: &MemoryTypeMap,
        host_access: HostAccess,
    ) -> (u32, vk::MemoryPropertyFlags) {
        match host_access {
            HostAccess::None => (map.private, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            HostAccess::SequentialWrite if map.upload_host_visible => (
                map.upload,
                vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
            ),
            HostAccess::SequentialWrite => (map.host, vk::MemoryPropertyFlags::HOST_VISIBLE),
            HostAccess::Random => (
                map.readback,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
            ),
        }
    }

    /// Picks a memory type for a raw allocation: the pre-calculated index
    /// from the device's [`MemoryTypeMap`] when the requirements allow it,
    /// otherwise the best flag match.
    fn pick_memory_type(
        device: &Device,
        memory_type_bits: u32,
        preferred_index: u32,
        preferred_flags: vk::MemoryPropertyFlags,
    ) -> u32 {
        if memory_type_bits & (1 << preferred_index) != 0 {
            return preferred_index;
        }
        let types = device.physical_device().properties().memory_types();
        types
            .iter()
            .enumerate()
            .filter(|(i, _)| memory_type_bits & (1 << i) != 0)
            .max_by_key(|(_, mt)| mt.property_flags.contains(preferred_flags))
            .map(|(i, _)| i as u32)
            .unwrap_or_else(|| memory_type_bits.trailing_zeros())
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Whether this buffer's memory can be exported over an opaque fd.
    pub fn is_exportable(&self) -> bool {
        matches!(self.memory, BufferMemory::Dedicated(_))
    }

    /// Exports the backing memory as an opaque fd for another device to
    /// import. Each call produces a new fd.
    pub fn export_memory(&self) -> Result<ExportedBufferMemory, RuntimeError> {
        let memory = match &self.memory {
            BufferMemory::Dedicated(memory) => *memory,
            _ => return Err(RuntimeError::NotExportable),
        };
        let device = self.device();
        let requirements = unsafe { device.get_buffer_memory_requirements(self.buffer) };
        let info = vk::MemoryGetFdInfoKHR {
            memory,
            handle_type: vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD,
            ..Default::default()
        };
        let fd = unsafe { device.external_memory_fd()?.get_memory_fd(&info)? };
        Ok(ExportedBufferMemory {
            fd,
            size: self.size,
            allocation_size: requirements.size,
        })
    }

    /// Pointer to the mapped memory, if host visible and mapped.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        (!self.mapped.is_null()).then_some(self.mapped)
    }

    /// Copies `data` into the mapped memory at `offset`.
    pub fn write_mapped(&mut self, offset: usize, data: &[u8]) -> Result<(), RuntimeError> {
        let Some(ptr) = self.mapped_ptr() else {
            return Err(RuntimeError::NotMapped);
        };
        if offset + data.len() > self.size as usize {
            return Err(RuntimeError::MappedWriteOutOfBounds {
                offset: offset as u64,
                len: data.len() as u64,
                size: self.size,
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset), data.len());
        }
        Ok(())
    }

    /// Device address, when created with
    /// [`vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS`].
    pub fn device_address(&self) -> Option<vk::DeviceAddress> {
        if !self.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            return None;
        }
        let info = vk::BufferDeviceAddressInfo {
            buffer: self.buffer,
            ..Default::default()
        };
        Some(unsafe { self.device().get_buffer_device_address(&info) })
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // The last reference may die right after a commit, while the
        // submission still reads this memory. Freeing it then is the one
        // unrecoverable hazard here, so teardown stalls the whole device.
        if let Err(err) = unsafe { self.allocator.device().device_wait_idle() } {
            tracing::error!(?err, "device_wait_idle failed before buffer teardown");
        }
        if let Some(tables) = &self.tables {
            if let Some(index) = self.bindless_uniform {
                tables.free(crate::bindless::TableKind::UniformBuffer, index);
            }
            if let Some(index) = self.bindless_storage {
                tables.free(crate::bindless::TableKind::StorageBuffer, index);
            }
        }
        let device = self.allocator.device().clone();
        match &mut self.memory {
            BufferMemory::Managed(allocation) => {
                let info = self.allocator.get_allocation_info(allocation);
                self.allocator.track_release(info.memory_type, info.size);
                unsafe {
                    self.allocator.destroy_buffer(self.buffer, allocation);
                }
            }
            BufferMemory::Dedicated(memory) => {
                if self.tracked {
                    let requirements =
                        unsafe { device.get_buffer_memory_requirements(self.buffer) };
                    self.allocator
                        .track_release(self.memory_type_index, requirements.size);
                }
                unsafe {
                    device.destroy_buffer(self.buffer, None);
                    device.free_memory(*memory, None);
                }
            }
            BufferMemory::HostPointer(memory) => unsafe {
                device.destroy_buffer(self.buffer, None);
                device.free_memory(*memory, None);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discrete_rebar_map() -> MemoryTypeMap {
        MemoryTypeMap {
            private: 0,
            host: 1,
            readback: 2,
            upload: 3,
            upload_host_visible: true,
        }
    }

    #[test]
    fn test_raw_memory_preference_device_only() {
        let map = discrete_rebar_map();
        let (index, flags) = Buffer::raw_memory_preference(&map, HostAccess::None);
        assert_eq!(index, map.private);
        assert_eq!(flags, vk::MemoryPropertyFlags::DEVICE_LOCAL);
    }

    #[test]
    fn test_raw_memory_preference_upload_uses_bar() {
        let map = discrete_rebar_map();
        let (index, _) = Buffer::raw_memory_preference(&map, HostAccess::SequentialWrite);
        assert_eq!(index, map.upload);
    }

    #[test]
    fn test_raw_memory_preference_upload_falls_back_to_staging() {
        let map = MemoryTypeMap {
            upload_host_visible: false,
            ..discrete_rebar_map()
        };
        let (index, flags) = Buffer::raw_memory_preference(&map, HostAccess::SequentialWrite);
        assert_eq!(index, map.host);
        assert_eq!(flags, vk::MemoryPropertyFlags::HOST_VISIBLE);
    }

    #[test]
    fn test_raw_memory_preference_readback_wants_cached() {
        let map = discrete_rebar_map();
        let (index, flags) = Buffer::raw_memory_preference(&map, HostAccess::Random);
        assert_eq!(index, map.readback);
        assert!(flags.contains(vk::MemoryPropertyFlags::HOST_CACHED));
    }
}

/// An exported buffer memory handle, ready to hand to another device.
pub struct ExportedBufferMemory {
    pub fd: RawFd,
    /// Logical buffer size in bytes.
    pub size: vk::DeviceSize,
    /// Size of the underlying allocation (may exceed `size` due to
    /// alignment padding).
    pub allocation_size: vk::DeviceSize,
}
