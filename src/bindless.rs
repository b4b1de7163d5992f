//! The four fixed bindless descriptor tables.
//!
//! Every shader sees the same four runtime-sized arrays: uniform buffers,
//! sampled images, storage buffers, and storage images, one descriptor set
//! each. Resources are stored at stable indices handed out by a free-list
//! allocator, and the index is what shaders receive.

use crate::{
    descriptor::{DescriptorPool, DescriptorSetLayout},
    error::RuntimeError,
    utils::{AsVkHandle, IdAlloc},
    Device,
};
use ash::vk;
use std::sync::Mutex;

/// Capacity of each bindless table.
pub const TABLE_CAPACITY: u32 = 65536;

/// Identifies one of the four bindless tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    UniformBuffer,
    SampledImage,
    StorageBuffer,
    StorageImage,
}
impl TableKind {
    pub const ALL: [TableKind; 4] = [
        TableKind::UniformBuffer,
        TableKind::SampledImage,
        TableKind::StorageBuffer,
        TableKind::StorageImage,
    ];

    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            TableKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            TableKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            TableKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            TableKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        }
    }

    fn index(&self) -> usize {
        match self {
            TableKind::UniformBuffer => 0,
            TableKind::SampledImage => 1,
            TableKind::StorageBuffer => 2,
            TableKind::StorageImage => 3,
        }
    }
}

struct DescriptorTable {
    layout: DescriptorSetLayout,
    // Pool must outlive the set allocated from it.
    _pool: DescriptorPool,
    set: vk::DescriptorSet,
    ids: Mutex<IdAlloc>,
}

/// The per-device bindless tables.
pub struct BindlessTables {
    device: Device,
    tables: [DescriptorTable; 4],
}

impl BindlessTables {
    pub fn new(device: Device) -> Result<Self, RuntimeError> {
        let mut tables = Vec::with_capacity(4);
        for kind in TableKind::ALL {
            let ty = kind.descriptor_type();
            let layout = DescriptorSetLayout::new_variable(
                device.clone(),
                ty,
                TABLE_CAPACITY,
                vk::ShaderStageFlags::ALL,
            )?;
            let pool = DescriptorPool::new(device.clone(), ty, TABLE_CAPACITY)?;
            let set = pool.allocate_one_variably_sized(&layout, TABLE_CAPACITY)?;
            tables.push(DescriptorTable {
                layout,
                _pool: pool,
                set,
                ids: Mutex::new(IdAlloc::default()),
            });
        }
        let tables: [DescriptorTable; 4] = match tables.try_into() {
            Ok(tables) => tables,
            Err(_) => unreachable!(),
        };
        Ok(Self { device, tables })
    }

    fn table(&self, kind: TableKind) -> &DescriptorTable {
        &self.tables[kind.index()]
    }

    pub fn set(&self, kind: TableKind) -> vk::DescriptorSet {
        self.table(kind).set
    }

    pub fn layout(&self, kind: TableKind) -> vk::DescriptorSetLayout {
        self.table(kind).layout.vk_handle()
    }

    fn allocate_index(&self, kind: TableKind) -> u32 {
        let mut ids = match self.table(kind).ids.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ids.alloc_one()
    }

    /// Writes a buffer descriptor into `kind` and returns its index.
    pub fn store_buffer(
        &self,
        kind: TableKind,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> u32 {
        debug_assert!(matches!(
            kind,
            TableKind::UniformBuffer | TableKind::StorageBuffer
        ));
        let index = self.allocate_index(kind);
        let buffer_info = vk::DescriptorBufferInfo {
            buffer,
            offset,
            range,
        };
        let write = vk::WriteDescriptorSet {
            dst_set: self.table(kind).set,
            dst_binding: 0,
            dst_array_element: index,
            descriptor_count: 1,
            descriptor_type: kind.descriptor_type(),
            p_buffer_info: &buffer_info,
            ..Default::default()
        };
        unsafe {
            self.device.update_descriptor_sets(&[write], &[]);
        }
        tracing::trace!(?kind, index, "stored buffer descriptor");
        index
    }

    /// Writes an image descriptor into `kind` and returns its index.
    pub fn store_image(
        &self,
        kind: TableKind,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    ) -> u32 {
        debug_assert!(matches!(
            kind,
            TableKind::SampledImage | TableKind::StorageImage
        ));
        let index = self.allocate_index(kind);
        let image_info = vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: view,
            image_layout: layout,
        };
        let write = vk::WriteDescriptorSet {
            dst_set: self.table(kind).set,
            dst_binding: 0,
            dst_array_element: index,
            descriptor_count: 1,
            descriptor_type: kind.descriptor_type(),
            p_image_info: &image_info,
            ..Default::default()
        };
        unsafe {
            self.device.update_descriptor_sets(&[write], &[]);
        }
        tracing::trace!(?kind, index, "stored image descriptor");
        index
    }

    /// Returns a table index to the free list. The slot contents stay stale
    /// until the next store; PARTIALLY_BOUND makes that legal as long as
    /// shaders no longer index it.
    pub fn free(&self, kind: TableKind, index: u32) {
        let mut ids = match self.table(kind).ids.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ids.free(index);
    }
}
