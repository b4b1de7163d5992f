//! The per-device resource manager.
//!
//! Owns the allocator, the resource pools, and the bindless tables for one
//! logical device. All buffer and image creation goes through here so every
//! resource is reachable by handle and representable in the tables.

use crate::{
    alloc::{Allocator, MemoryUsage},
    bindless::{BindlessTables, TableKind},
    buffer::{Buffer, BufferDesc, ExportedBufferMemory},
    error::RuntimeError,
    image::{Image, ImageDesc},
    pool::{Handle, Pool},
    Device, HasDevice,
};
use ash::vk;
use std::sync::Arc;

pub struct ResourceManager {
    allocator: Allocator,
    tables: Arc<BindlessTables>,
    buffers: Pool<Buffer>,
    images: Pool<Image>,
}

impl HasDevice for ResourceManager {
    fn device(&self) -> &Device {
        self.allocator.device()
    }
}

impl ResourceManager {
    pub fn new(device: Device) -> Result<Self, RuntimeError> {
        let allocator = Allocator::new(device.clone())?;
        let tables = Arc::new(BindlessTables::new(device)?);
        Ok(Self {
            allocator,
            tables,
            buffers: Pool::new(),
            images: Pool::new(),
        })
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn tables(&self) -> &Arc<BindlessTables> {
        &self.tables
    }

    /// Current heap usage totals for this device.
    pub fn memory_usage(&self) -> MemoryUsage {
        self.allocator.accounting().snapshot()
    }

    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<Handle<Buffer>, RuntimeError> {
        let mut buffer = if desc.exportable {
            Buffer::new_exportable(self.allocator.clone(), desc)?
        } else {
            Buffer::new_managed(self.allocator.clone(), desc)?
        };
        buffer.tables = Some(self.tables.clone());
        Ok(self.buffers.insert(buffer))
    }

    pub fn create_image(&self, desc: &ImageDesc) -> Result<Handle<Image>, RuntimeError> {
        let mut image = Image::new(self.allocator.clone(), desc)?;
        image.tables = Some(self.tables.clone());
        Ok(self.images.insert(image))
    }

    /// Exports a buffer's backing memory for another device to import.
    pub fn export_buffer_memory(
        &self,
        buffer: &Handle<Buffer>,
    ) -> Result<ExportedBufferMemory, RuntimeError> {
        buffer.read().export_memory()
    }

    /// Imports buffer memory exported from another device, consuming the fd.
    pub fn import_buffer_memory(
        &self,
        exported: ExportedBufferMemory,
        usage: vk::BufferUsageFlags,
    ) -> Result<Handle<Buffer>, RuntimeError> {
        let mut buffer = Buffer::new_imported(self.allocator.clone(), exported, usage)?;
        buffer.tables = Some(self.tables.clone());
        Ok(self.buffers.insert(buffer))
    }

    /// Wraps caller-owned host memory in a buffer.
    ///
    /// # Safety
    ///
    /// See [`Buffer`] host-pointer requirements: `ptr` must stay valid and
    /// properly aligned for the life of the buffer.
    pub unsafe fn import_host_buffer(
        &self,
        ptr: *mut std::ffi::c_void,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Handle<Buffer>, RuntimeError> {
        let mut buffer = Buffer::new_host_import(self.allocator.clone(), ptr, size, usage)?;
        buffer.tables = Some(self.tables.clone());
        Ok(self.buffers.insert(buffer))
    }

    /// Publishes a buffer into a bindless table and returns its index.
    ///
    /// Idempotent: storing the same buffer into the same table again returns
    /// the index of the first call.
    pub fn store_buffer_descriptor(
        &self,
        buffer: &Handle<Buffer>,
        kind: TableKind,
    ) -> Result<u32, RuntimeError> {
        debug_assert!(matches!(
            kind,
            TableKind::UniformBuffer | TableKind::StorageBuffer
        ));
        let mut guard = buffer.write();
        let slot = match kind {
            TableKind::UniformBuffer => &mut guard.bindless_uniform,
            _ => &mut guard.bindless_storage,
        };
        if let Some(index) = *slot {
            return Ok(index);
        }
        let index = self.tables.store_buffer(
            kind,
            crate::utils::AsVkHandle::vk_handle(&*guard),
            0,
            vk::WHOLE_SIZE,
        );
        let slot = match kind {
            TableKind::UniformBuffer => &mut guard.bindless_uniform,
            _ => &mut guard.bindless_storage,
        };
        *slot = Some(index);
        Ok(index)
    }

    /// Publishes an image's whole-image view into a bindless table.
    ///
    /// Idempotent per `(table, image)`.
    pub fn store_image_descriptor(
        &self,
        image: &Handle<Image>,
        kind: TableKind,
    ) -> Result<u32, RuntimeError> {
        self.store_image_descriptor_inner(image, kind, None)
    }

    /// Publishes a single-mip view of an image into a bindless table.
    ///
    /// Idempotent per `(table, image, mip)`.
    pub fn store_image_descriptor_mip(
        &self,
        image: &Handle<Image>,
        kind: TableKind,
        mip_level: u32,
    ) -> Result<u32, RuntimeError> {
        self.store_image_descriptor_inner(image, kind, Some(mip_level))
    }

    fn store_image_descriptor_inner(
        &self,
        image: &Handle<Image>,
        kind: TableKind,
        mip_level: Option<u32>,
    ) -> Result<u32, RuntimeError> {
        debug_assert!(matches!(
            kind,
            TableKind::SampledImage | TableKind::StorageImage
        ));
        let mut guard = image.write();
        let cache = match kind {
            TableKind::SampledImage => &guard.bindless_sampled,
            _ => &guard.bindless_storage,
        };
        if let Some(index) = cache.get(&mip_level) {
            return Ok(*index);
        }
        let view = match mip_level {
            Some(mip) => guard.mip_view(mip)?,
            None => guard.view(),
        };
        let layout = match kind {
            TableKind::SampledImage => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            _ => vk::ImageLayout::GENERAL,
        };
        let index = self.tables.store_image(kind, view, layout);
        let cache = match kind {
            TableKind::SampledImage => &mut guard.bindless_sampled,
            _ => &mut guard.bindless_storage,
        };
        cache.insert(mip_level, index);
        Ok(index)
    }

    /// Destroys a buffer.
    ///
    /// Blocks until the device is idle first so in-flight command buffers
    /// can no longer reference it, then releases this reference. The memory
    /// is reclaimed once the last clone of the handle drops.
    pub fn destroy_buffer(&self, buffer: Handle<Buffer>) -> Result<(), RuntimeError> {
        unsafe {
            self.device().device_wait_idle()?;
        }
        tracing::debug!(size = buffer.read().size(), "destroying buffer");
        drop(buffer);
        Ok(())
    }

    /// Destroys an image. Same idle-blocking contract as
    /// [`Self::destroy_buffer`].
    pub fn destroy_image(&self, image: Handle<Image>) -> Result<(), RuntimeError> {
        unsafe {
            self.device().device_wait_idle()?;
        }
        tracing::debug!(extent = ?image.read().extent(), "destroying image");
        drop(image);
        Ok(())
    }
}
