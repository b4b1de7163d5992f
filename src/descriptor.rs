//! Descriptor set layout and pool wrappers.

use crate::{utils::AsVkHandle, Device, HasDevice};
use ash::{prelude::VkResult, vk};

/// A descriptor set layout with a single variably-sized binding.
pub struct DescriptorSetLayout {
    device: Device,
    layout: vk::DescriptorSetLayout,
    descriptor_type: vk::DescriptorType,
    capacity: u32,
}
impl HasDevice for DescriptorSetLayout {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl AsVkHandle for DescriptorSetLayout {
    type Handle = vk::DescriptorSetLayout;
    fn vk_handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl DescriptorSetLayout {
    /// Creates a layout holding one runtime-sized array of `descriptor_type`
    /// at binding 0, updateable after bind and partially bound.
    pub fn new_variable(
        device: Device,
        descriptor_type: vk::DescriptorType,
        capacity: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> VkResult<Self> {
        let binding = vk::DescriptorSetLayoutBinding {
            binding: 0,
            descriptor_type,
            descriptor_count: capacity,
            stage_flags,
            ..Default::default()
        };
        let binding_flags = vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING
            | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT;
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo {
            binding_count: 1,
            p_binding_flags: &binding_flags,
            ..Default::default()
        };
        let info = vk::DescriptorSetLayoutCreateInfo {
            flags: vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL,
            binding_count: 1,
            p_bindings: &binding,
            ..Default::default()
        }
        .push_next(&mut flags_info);
        let layout = unsafe { device.create_descriptor_set_layout(&info, None)? };
        Ok(Self {
            device,
            layout,
            descriptor_type,
            capacity,
        })
    }

    pub fn descriptor_type(&self) -> vk::DescriptorType {
        self.descriptor_type
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}
impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// A descriptor pool sized for exactly one variably-sized set.
pub struct DescriptorPool {
    device: Device,
    pool: vk::DescriptorPool,
}
impl HasDevice for DescriptorPool {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl AsVkHandle for DescriptorPool {
    type Handle = vk::DescriptorPool;
    fn vk_handle(&self) -> vk::DescriptorPool {
        self.pool
    }
}

impl DescriptorPool {
    pub fn new(
        device: Device,
        descriptor_type: vk::DescriptorType,
        capacity: u32,
    ) -> VkResult<Self> {
        let pool_size = vk::DescriptorPoolSize {
            ty: descriptor_type,
            descriptor_count: capacity,
        };
        let info = vk::DescriptorPoolCreateInfo {
            flags: vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND,
            max_sets: 1,
            pool_size_count: 1,
            p_pool_sizes: &pool_size,
            ..Default::default()
        };
        let pool = unsafe { device.create_descriptor_pool(&info, None)? };
        Ok(Self { device, pool })
    }

    /// Allocates the pool's one set with `count` descriptors in the variable
    /// binding.
    pub fn allocate_one_variably_sized(
        &self,
        layout: &DescriptorSetLayout,
        count: u32,
    ) -> VkResult<vk::DescriptorSet> {
        let mut variable_info = vk::DescriptorSetVariableDescriptorCountAllocateInfo {
            descriptor_set_count: 1,
            p_descriptor_counts: &count,
            ..Default::default()
        };
        let layout_handle = layout.vk_handle();
        let info = vk::DescriptorSetAllocateInfo {
            descriptor_pool: self.pool,
            descriptor_set_count: 1,
            p_set_layouts: &layout_handle,
            ..Default::default()
        }
        .push_next(&mut variable_info);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info)? };
        Ok(sets[0])
    }
}
impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}
