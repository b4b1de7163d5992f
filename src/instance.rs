//! Instance creation and management.
//!
//! The [`Instance`] is the connection between the runtime and the Vulkan
//! loader. [`Runtime::new`](crate::runtime::Runtime::new) builds one
//! internally; [`InstanceBuilder`] is exposed for callers that need layers or
//! extra extensions.

use crate::{error::RuntimeError, utils::Version};
use ash::{prelude::VkResult, vk};
use std::{
    borrow::Cow,
    collections::BTreeMap,
    ffi::{CStr, CString, c_char},
    ops::Deref,
    sync::Arc,
};

/// A Vulkan instance wrapper.
///
/// Reference-counted for cheap shared access; destroyed when the last
/// reference is dropped.
#[derive(Clone)]
pub struct Instance(Arc<InstanceInner>);
impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Instance {}

struct InstanceInner {
    entry: Arc<ash::Entry>,
    instance: ash::Instance,
    api_version: Version,
}

/// Configuration for instance creation.
pub struct InstanceCreateInfo {
    pub flags: vk::InstanceCreateFlags,
    pub application_name: Cow<'static, CStr>,
    pub application_version: Version,
    pub engine_name: Cow<'static, CStr>,
    pub engine_version: Version,
    pub api_version: Version,
}

impl Default for InstanceCreateInfo {
    fn default() -> Self {
        Self {
            flags: vk::InstanceCreateFlags::empty(),
            application_name: Cow::Borrowed(c"Unnamed Application"),
            application_version: Default::default(),
            engine_name: Cow::Borrowed(c"scoria"),
            engine_version: Default::default(),
            api_version: Version::V1_3,
        }
    }
}

impl Instance {
    pub fn builder(entry: Arc<ash::Entry>) -> InstanceBuilder {
        InstanceBuilder::new(entry)
    }

    pub fn entry(&self) -> &Arc<ash::Entry> {
        &self.0.entry
    }

    /// Returns the version of the Vulkan API used when creating the instance.
    pub fn api_version(&self) -> Version {
        self.0.api_version
    }
}

impl Deref for Instance {
    type Target = ash::Instance;

    fn deref(&self) -> &Self::Target {
        &self.0.instance
    }
}

impl Drop for InstanceInner {
    fn drop(&mut self) {
        tracing::info!(instance = ?self.instance.handle(), "drop instance");
        // Safety: Host synchronization rule for vkDestroyInstance:
        // - Host access to instance must be externally synchronized.
        // We have &mut self and therefore exclusive control on instance.
        // PhysicalDevice retains an Arc to Instance, so no VkPhysicalDevice
        // enumerated from this instance can outlive it.
        unsafe {
            self.instance.destroy_instance(None);
        }
    }
}

/// A builder for creating Vulkan instances.
pub struct InstanceBuilder {
    entry: Arc<ash::Entry>,
    available_extensions: BTreeMap<CString, Version>,
    enabled_extensions: Vec<&'static CStr>,
    available_layers: Vec<CString>,
    enabled_layers: Vec<*const c_char>,

    /// Instance creation configuration. Modify this to set application metadata.
    pub info: InstanceCreateInfo,
}

impl InstanceBuilder {
    pub fn new(entry: Arc<ash::Entry>) -> Self {
        let available_extensions = unsafe { entry.enumerate_instance_extension_properties(None) }
            .unwrap_or_default()
            .into_iter()
            .filter_map(|ext| {
                let name = ext.extension_name_as_c_str().ok()?;
                Some((name.to_owned(), Version(ext.spec_version)))
            })
            .collect::<BTreeMap<CString, Version>>();
        let available_layers = unsafe { entry.enumerate_instance_layer_properties() }
            .unwrap_or_default()
            .into_iter()
            .filter_map(|layer| Some(layer.layer_name_as_c_str().ok()?.to_owned()))
            .collect();
        Self {
            entry,
            available_extensions,
            enabled_extensions: Vec::new(),
            available_layers,
            enabled_layers: Vec::new(),
            info: InstanceCreateInfo::default(),
        }
    }

    /// Enables an instance extension by name.
    pub fn enable_extension(&mut self, name: &'static CStr) -> Result<(), RuntimeError> {
        if self.available_extensions.contains_key(name) {
            if !self.enabled_extensions.contains(&name) {
                self.enabled_extensions.push(name);
            }
            Ok(())
        } else {
            Err(RuntimeError::MissingFeature(name))
        }
    }

    /// Enables a Vulkan layer such as `VK_LAYER_KHRONOS_validation`.
    ///
    /// Returns `true` if the layer is available.
    pub fn enable_layer(&mut self, layer: &'static CStr) -> bool {
        if self.available_layers.iter().any(|l| l.as_c_str() == layer) {
            self.enabled_layers.push(layer.as_ptr());
            true
        } else {
            false
        }
    }

    pub fn build(self) -> VkResult<Instance> {
        let application_info = vk::ApplicationInfo {
            p_application_name: self.info.application_name.as_ptr(),
            application_version: self.info.application_version.0,
            p_engine_name: self.info.engine_name.as_ptr(),
            engine_version: self.info.engine_version.0,
            api_version: self.info.api_version.0,
            ..Default::default()
        };

        let enabled_extension_names = self
            .enabled_extensions
            .iter()
            .map(|name| name.as_ptr())
            .collect::<Vec<_>>();
        let create_info = vk::InstanceCreateInfo {
            p_application_info: &application_info,
            enabled_layer_count: self.enabled_layers.len() as u32,
            pp_enabled_layer_names: self.enabled_layers.as_ptr(),
            enabled_extension_count: enabled_extension_names.len() as u32,
            pp_enabled_extension_names: enabled_extension_names.as_ptr(),
            flags: self.info.flags,
            ..Default::default()
        };
        // Safety: No Host synchronization rules for vkCreateInstance.
        let instance = unsafe { self.entry.create_instance(&create_info, None)? };
        tracing::info!(instance = ?instance.handle(), api_version = %self.info.api_version, "created instance");
        Ok(Instance(Arc::new(InstanceInner {
            entry: self.entry,
            instance,
            api_version: self.info.api_version,
        })))
    }
}
unsafe impl Send for InstanceBuilder {}
unsafe impl Sync for InstanceBuilder {}
