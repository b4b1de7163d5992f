//! Logical device creation.

use crate::{error::RuntimeError, utils::Version, Instance, PhysicalDevice};
use ash::{prelude::VkResult, vk};
use std::{collections::BTreeMap, ffi::CStr, ops::Deref, sync::Arc};

/// Trait for objects that hold a reference to a logical device.
pub trait HasDevice {
    fn device(&self) -> &Device;
    fn instance(&self) -> &Instance {
        self.device().physical_device().instance()
    }
    fn physical_device(&self) -> &PhysicalDevice {
        self.device().physical_device()
    }
}
impl<T: HasDevice> HasDevice for &T {
    fn device(&self) -> &Device {
        (*self).device()
    }
}

/// A logical Vulkan device.
///
/// Reference-counted; the underlying `vkDevice` is destroyed when the last
/// clone is dropped.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);

struct DeviceInner {
    physical_device: PhysicalDevice,
    device: ash::Device,
    external_memory_fd: Option<ash::khr::external_memory_fd::Device>,
    external_semaphore_fd: Option<ash::khr::external_semaphore_fd::Device>,
    external_memory_host: Option<ash::ext::external_memory_host::Device>,
}

impl HasDevice for Device {
    fn device(&self) -> &Device {
        self
    }
}

impl Device {
    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.0.physical_device
    }

    pub fn instance(&self) -> &Instance {
        self.0.physical_device.instance()
    }

    /// Loader for `VK_KHR_external_memory_fd`, if the extension was enabled.
    pub fn external_memory_fd(
        &self,
    ) -> Result<&ash::khr::external_memory_fd::Device, RuntimeError> {
        self.0
            .external_memory_fd
            .as_ref()
            .ok_or(RuntimeError::MissingFeature(
                ash::khr::external_memory_fd::NAME,
            ))
    }

    /// Loader for `VK_KHR_external_semaphore_fd`, if the extension was enabled.
    pub fn external_semaphore_fd(
        &self,
    ) -> Result<&ash::khr::external_semaphore_fd::Device, RuntimeError> {
        self.0
            .external_semaphore_fd
            .as_ref()
            .ok_or(RuntimeError::MissingFeature(
                ash::khr::external_semaphore_fd::NAME,
            ))
    }

    /// Loader for `VK_EXT_external_memory_host`, if the extension was enabled.
    pub fn external_memory_host(
        &self,
    ) -> Result<&ash::ext::external_memory_host::Device, RuntimeError> {
        self.0
            .external_memory_host
            .as_ref()
            .ok_or(RuntimeError::MissingFeature(
                ash::ext::external_memory_host::NAME,
            ))
    }
}

impl Deref for Device {
    type Target = ash::Device;

    fn deref(&self) -> &Self::Target {
        &self.0.device
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        tracing::info!(device = ?self.device.handle(), "drop device");
        // Safety: Host Synchronization rule for vkDestroyDevice:
        // - Host access to device must be externally synchronized.
        // - Host access to all VkQueue objects created from device must be
        //   externally synchronized.
        // We have &mut self and therefore exclusive control of the device.
        // Queue objects hold an Arc to the device, so if the device is
        // dropped, they must have been dropped too.
        unsafe {
            self.device.destroy_device(None);
        }
    }
}

/// Builder for creating a logical [`Device`] from a [`PhysicalDevice`].
pub struct DeviceBuilder {
    physical_device: PhysicalDevice,
    available_extensions: BTreeMap<&'static CStr, Version>,
    enabled_extensions: Vec<*const std::ffi::c_char>,
    queue_priorities: Vec<Vec<f32>>,
}

impl DeviceBuilder {
    pub fn new(physical_device: PhysicalDevice) -> VkResult<Self> {
        let extension_names = unsafe {
            physical_device
                .instance()
                .enumerate_device_extension_properties(
                    crate::utils::AsVkHandle::vk_handle(&physical_device),
                )?
        };
        let available_extensions = extension_names
            .iter()
            .filter_map(|ext| {
                let name = ext.extension_name_as_c_str().ok()?;
                // Leak into 'static: extension names are a small fixed set.
                let name: &'static CStr =
                    Box::leak(name.to_owned().into_boxed_c_str());
                Some((name, Version(ext.spec_version)))
            })
            .collect::<BTreeMap<_, _>>();
        let num_queue_families = physical_device.get_queue_family_properties().len();
        Ok(Self {
            physical_device,
            available_extensions,
            enabled_extensions: Vec::new(),
            queue_priorities: vec![Vec::new(); num_queue_families],
        })
    }

    pub fn extension_available(&self, extension: &CStr) -> bool {
        self.available_extensions.contains_key(extension)
    }

    /// Enables a device extension, or returns [`RuntimeError::MissingFeature`]
    /// if the physical device does not support it.
    pub fn enable_extension(&mut self, extension: &'static CStr) -> Result<(), RuntimeError> {
        if self.available_extensions.contains_key(extension) {
            self.enabled_extensions.push(extension.as_ptr());
            Ok(())
        } else {
            Err(RuntimeError::MissingFeature(extension))
        }
    }

    /// Enables one queue from the given queue family.
    ///
    /// Returns the index of the queue within its family.
    pub fn enable_queue(&mut self, family_index: u32, priority: f32) -> u32 {
        let priorities = &mut self.queue_priorities[family_index as usize];
        priorities.push(priority);
        priorities.len() as u32 - 1
    }

    /// Enables one queue from the family that most specifically matches
    /// `required_caps`: among families containing all required capabilities
    /// and with spare queue capacity, picks the one with the fewest total
    /// capability bits. Dedicated transfer queues win over the all-purpose
    /// graphics family.
    ///
    /// Returns `(family_index, queue_index)`, or `None` if no family has the
    /// required capabilities and room for another queue.
    pub fn enable_queue_with_caps(
        &mut self,
        required_caps: vk::QueueFlags,
        priority: f32,
    ) -> Option<(u32, u32)> {
        let family_index = self
            .physical_device
            .get_queue_family_properties()
            .iter()
            .enumerate()
            .filter(|(i, family)| {
                family.queue_flags.contains(required_caps)
                    && (self.queue_priorities[*i].len() as u32) < family.queue_count
            })
            .min_by_key(|(_, family)| family.queue_flags.as_raw().count_ones())
            .map(|(i, _)| i as u32)?;
        let queue_index = self.enable_queue(family_index, priority);
        Some((family_index, queue_index))
    }

    pub fn build(self) -> VkResult<Device> {
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = self
            .queue_priorities
            .iter()
            .enumerate()
            .filter(|(_, priorities)| !priorities.is_empty())
            .map(|(family_index, priorities)| vk::DeviceQueueCreateInfo {
                queue_family_index: family_index as u32,
                queue_count: priorities.len() as u32,
                p_queue_priorities: priorities.as_ptr(),
                ..Default::default()
            })
            .collect();

        let features = vk::PhysicalDeviceFeatures {
            shader_uniform_buffer_array_dynamic_indexing: vk::TRUE,
            shader_sampled_image_array_dynamic_indexing: vk::TRUE,
            shader_storage_buffer_array_dynamic_indexing: vk::TRUE,
            shader_storage_image_array_dynamic_indexing: vk::TRUE,
            ..Default::default()
        };
        let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features {
            timeline_semaphore: vk::TRUE,
            buffer_device_address: vk::TRUE,
            descriptor_indexing: vk::TRUE,
            shader_sampled_image_array_non_uniform_indexing: vk::TRUE,
            shader_storage_buffer_array_non_uniform_indexing: vk::TRUE,
            shader_storage_image_array_non_uniform_indexing: vk::TRUE,
            shader_uniform_buffer_array_non_uniform_indexing: vk::TRUE,
            descriptor_binding_sampled_image_update_after_bind: vk::TRUE,
            descriptor_binding_storage_buffer_update_after_bind: vk::TRUE,
            descriptor_binding_storage_image_update_after_bind: vk::TRUE,
            descriptor_binding_uniform_buffer_update_after_bind: vk::TRUE,
            descriptor_binding_partially_bound: vk::TRUE,
            descriptor_binding_update_unused_while_pending: vk::TRUE,
            descriptor_binding_variable_descriptor_count: vk::TRUE,
            runtime_descriptor_array: vk::TRUE,
            ..Default::default()
        };
        let mut vulkan13_features = vk::PhysicalDeviceVulkan13Features {
            synchronization2: vk::TRUE,
            ..Default::default()
        };

        let create_info = vk::DeviceCreateInfo {
            queue_create_info_count: queue_create_infos.len() as u32,
            p_queue_create_infos: queue_create_infos.as_ptr(),
            enabled_extension_count: self.enabled_extensions.len() as u32,
            pp_enabled_extension_names: self.enabled_extensions.as_ptr(),
            p_enabled_features: &features,
            ..Default::default()
        }
        .push_next(&mut vulkan12_features)
        .push_next(&mut vulkan13_features);

        let instance = self.physical_device.instance();
        let device = unsafe {
            instance.create_device(
                crate::utils::AsVkHandle::vk_handle(&self.physical_device),
                &create_info,
                None,
            )?
        };

        let has = |ext: &CStr| {
            self.enabled_extensions
                .iter()
                .any(|&p| unsafe { CStr::from_ptr(p) } == ext)
        };
        let external_memory_fd = has(ash::khr::external_memory_fd::NAME)
            .then(|| ash::khr::external_memory_fd::Device::new(instance, &device));
        let external_semaphore_fd = has(ash::khr::external_semaphore_fd::NAME)
            .then(|| ash::khr::external_semaphore_fd::Device::new(instance, &device));
        let external_memory_host = has(ash::ext::external_memory_host::NAME)
            .then(|| ash::ext::external_memory_host::Device::new(instance, &device));

        tracing::info!(
            device = ?device.handle(),
            name = ?self.physical_device.properties().device_name(),
            "created device"
        );
        Ok(Device(Arc::new(DeviceInner {
            physical_device: self.physical_device,
            device,
            external_memory_fd,
            external_semaphore_fd,
            external_memory_host,
        })))
    }
}
