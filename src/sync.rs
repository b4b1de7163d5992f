//! Timeline semaphore synchronization primitives.

use crate::{error::RuntimeError, Device, HasDevice};
use ash::{prelude::VkResult, vk};
use std::{
    ops::Deref,
    os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd},
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};

/// A timeline semaphore.
///
/// Tracks the latest counter value observed on the host in an atomic, so
/// readiness checks can usually avoid a driver call.
pub struct Semaphore {
    device: Device,
    semaphore: vk::Semaphore,
    /// Largest counter value the host has observed so far. Monotonic;
    /// lags behind the actual device-side value.
    cached_value: AtomicU64,
    exportable: bool,
}
impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Semaphore").field(&self.semaphore).finish()
    }
}
impl HasDevice for Semaphore {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl crate::utils::AsVkHandle for Semaphore {
    type Handle = vk::Semaphore;
    fn vk_handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Semaphore {
    /// Creates a timeline semaphore with the given initial value.
    ///
    /// When `exportable`, the semaphore payload may later be exported over an
    /// opaque fd with [`Self::export_fd`].
    pub fn new_timeline(device: Device, initial_value: u64, exportable: bool) -> VkResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo {
            semaphore_type: vk::SemaphoreType::TIMELINE,
            initial_value,
            ..Default::default()
        };
        let mut export_info = vk::ExportSemaphoreCreateInfo {
            handle_types: vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD,
            ..Default::default()
        };
        let mut info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        if exportable {
            info = info.push_next(&mut export_info);
        }
        let semaphore = unsafe { device.create_semaphore(&info, None)? };
        Ok(Self {
            device,
            semaphore,
            cached_value: AtomicU64::new(initial_value),
            exportable,
        })
    }

    /// Imports a timeline semaphore payload from an opaque fd exported by
    /// another device's semaphore. The fd is always consumed: the driver
    /// takes ownership on success, and it is closed on any failure.
    pub fn import_fd(device: Device, fd: std::os::fd::RawFd) -> Result<Self, RuntimeError> {
        // Hold the fd so every early return closes it.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let loader = device.external_semaphore_fd()?;
        let mut type_info = vk::SemaphoreTypeCreateInfo {
            semaphore_type: vk::SemaphoreType::TIMELINE,
            ..Default::default()
        };
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe { device.create_semaphore(&info, None)? };
        let import_info = vk::ImportSemaphoreFdInfoKHR {
            semaphore,
            handle_type: vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD,
            fd: fd.as_raw_fd(),
            ..Default::default()
        };
        if let Err(err) = unsafe { loader.import_semaphore_fd(&import_info) } {
            unsafe { device.destroy_semaphore(semaphore, None) };
            return Err(err.into());
        }
        // Ownership moved to the driver.
        let _ = fd.into_raw_fd();
        Ok(Self {
            device,
            semaphore,
            cached_value: AtomicU64::new(0),
            exportable: false,
        })
    }

    /// Exports the semaphore payload as an opaque fd.
    pub fn export_fd(&self) -> Result<std::os::fd::RawFd, RuntimeError> {
        if !self.exportable {
            return Err(RuntimeError::NotExportable);
        }
        let info = vk::SemaphoreGetFdInfoKHR {
            semaphore: self.semaphore,
            handle_type: vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD,
            ..Default::default()
        };
        let loader = self.device.external_semaphore_fd()?;
        let fd = unsafe { loader.get_semaphore_fd(&info)? };
        Ok(fd)
    }

    /// Queries the current counter value from the device and updates the
    /// host-side cache.
    pub fn value(&self) -> VkResult<u64> {
        let value = unsafe { self.device.get_semaphore_counter_value(self.semaphore)? };
        self.cached_value.fetch_max(value, Ordering::Relaxed);
        Ok(value)
    }

    /// Returns true if the counter has reached `value`.
    ///
    /// Consults the cached value first; only hits the driver when the cache
    /// is behind.
    pub fn is_signaled(&self, value: u64) -> bool {
        if self.cached_value.load(Ordering::Relaxed) >= value {
            return true;
        }
        match self.value() {
            Ok(current) => current >= value,
            Err(err) => {
                tracing::error!(?err, "semaphore counter query failed");
                false
            }
        }
    }

    /// Signals the semaphore from the host.
    pub fn signal(&self, value: u64) -> VkResult<()> {
        let info = vk::SemaphoreSignalInfo {
            semaphore: self.semaphore,
            value,
            ..Default::default()
        };
        unsafe { self.device.signal_semaphore(&info)? };
        self.cached_value.fetch_max(value, Ordering::Relaxed);
        Ok(())
    }

    /// Blocks the calling thread until the counter reaches `value` or the
    /// timeout (in nanoseconds) expires.
    pub fn wait_blocked(&self, value: u64, timeout_ns: u64) -> VkResult<()> {
        if self.cached_value.load(Ordering::Relaxed) >= value {
            return Ok(());
        }
        let info = vk::SemaphoreWaitInfo {
            semaphore_count: 1,
            p_semaphores: &self.semaphore,
            p_values: &value,
            ..Default::default()
        };
        unsafe { self.device.wait_semaphores(&info, timeout_ns)? };
        self.cached_value.fetch_max(value, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// A clonable reference to a [`Semaphore`].
///
/// Ordered by allocation address so semaphore lists can be deduplicated.
#[derive(Clone, Debug)]
pub struct SharedSemaphore(Arc<Semaphore>);
impl SharedSemaphore {
    pub fn new(semaphore: Semaphore) -> Self {
        Self(Arc::new(semaphore))
    }
}
impl Deref for SharedSemaphore {
    type Target = Semaphore;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl PartialEq for SharedSemaphore {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for SharedSemaphore {}
impl PartialOrd for SharedSemaphore {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SharedSemaphore {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        Arc::as_ptr(&self.0).cmp(&Arc::as_ptr(&other.0))
    }
}
