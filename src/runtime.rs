//! Runtime construction: one logical device per physical device, queue role
//! assignment, queue selection, and cross-device timeline semaphore import.

use crate::{
    device::DeviceBuilder,
    error::RuntimeError,
    instance::{InstanceBuilder, InstanceCreateInfo},
    queue::{Queue, QueueGuard, QueueRole},
    sync::{Semaphore, SharedSemaphore},
    Device, Instance,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

fn role_index(role: QueueRole) -> usize {
    match role {
        QueueRole::Transfer => 0,
        QueueRole::Compute => 1,
        QueueRole::Graphics => 2,
    }
}

/// One logical device with its queues and cross-device semaphore imports.
pub struct DeviceContext {
    device: Device,
    queues: Vec<Arc<Queue>>,
    /// Queue indices per role, in round-robin order. A role with no dedicated
    /// family falls back to the first graphics queue.
    roles: [Vec<usize>; 3],
    round_robin: [AtomicUsize; 3],
    /// Timelines of other devices' queues, imported into this device, keyed
    /// by `(device_index, queue_index)`.
    imported: Mutex<HashMap<(usize, usize), SharedSemaphore>>,
    index: usize,
}

impl DeviceContext {
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Index of this device within [`Runtime::devices`].
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn queues(&self) -> &[Arc<Queue>] {
        &self.queues
    }

    /// Selects a queue for `role` and locks it for recording, blocking until
    /// one becomes available.
    ///
    /// Rotates through the role's queues, taking the first that is unlocked
    /// and idle. After a bounded number of full passes with no idle queue,
    /// settles for the first queue it can lock at all, yielding the thread
    /// between attempts.
    pub fn select_queue(&self, role: QueueRole) -> QueueGuard<'_> {
        const IDLE_PASSES: usize = 16;
        let candidates = &self.roles[role_index(role)];
        debug_assert!(!candidates.is_empty());
        let rr = &self.round_robin[role_index(role)];
        for pass in 0.. {
            let start = rr.fetch_add(1, Ordering::Relaxed);
            for offset in 0..candidates.len() {
                let queue_index = candidates[(start + offset) % candidates.len()];
                let queue = &self.queues[queue_index];
                if let Some(guard) = queue.try_lock() {
                    if pass >= IDLE_PASSES || queue.is_idle() {
                        return guard;
                    }
                }
            }
            std::thread::yield_now();
        }
        unreachable!()
    }

    /// Locks every queue that is currently free, idle, and accepted by
    /// `predicate`. Never blocks; the result may be empty.
    pub fn pick_available_queues(
        &self,
        mut predicate: impl FnMut(&Queue) -> bool,
    ) -> Vec<QueueGuard<'_>> {
        self.queues
            .iter()
            .filter_map(|queue| {
                let guard = queue.try_lock()?;
                (queue.is_idle() && predicate(queue)).then_some(guard)
            })
            .collect()
    }

    /// Looks up the local import of another device's queue timeline.
    pub fn imported_timeline(
        &self,
        device_index: usize,
        queue_index: usize,
    ) -> Option<SharedSemaphore> {
        let imports = match self.imported.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        imports.get(&(device_index, queue_index)).cloned()
    }

    /// Blocks until every queue on this device has retired all submissions.
    pub fn wait_idle(&self) -> ash::prelude::VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }
}

/// Options for [`Runtime::new`].
#[derive(Default)]
pub struct RuntimeOptions {
    pub instance: InstanceCreateInfo,
    /// Extra instance layers to enable when present (e.g. validation).
    pub layers: Vec<&'static std::ffi::CStr>,
}

/// The top-level runtime: an instance plus one [`DeviceContext`] per
/// physical device on the system.
pub struct Runtime {
    instance: Instance,
    devices: Vec<Arc<DeviceContext>>,
}

impl Runtime {
    pub fn new(options: RuntimeOptions) -> Result<Self, RuntimeError> {
        let entry = Arc::new(unsafe { ash::Entry::load() }.map_err(|err| {
            tracing::error!(?err, "failed to load the Vulkan loader");
            RuntimeError::Vk(ash::vk::Result::ERROR_INITIALIZATION_FAILED)
        })?);
        let mut builder = InstanceBuilder::new(entry);
        builder.info = options.instance;
        for layer in options.layers {
            builder.enable_layer(layer);
        }
        let instance = builder.build()?;

        let physical_devices: Vec<_> = instance.enumerate_physical_devices()?.collect();
        if physical_devices.is_empty() {
            return Err(RuntimeError::NoDevices);
        }
        let multi_device = physical_devices.len() > 1;

        let mut devices = Vec::with_capacity(physical_devices.len());
        for (index, pdevice) in physical_devices.into_iter().enumerate() {
            let ctx = Self::build_device(pdevice, index, multi_device)?;
            devices.push(Arc::new(ctx));
        }

        let runtime = Self { instance, devices };
        runtime.import_peer_timelines();
        Ok(runtime)
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn devices(&self) -> &[Arc<DeviceContext>] {
        &self.devices
    }

    pub fn device(&self, index: usize) -> &Arc<DeviceContext> {
        &self.devices[index]
    }

    fn build_device(
        pdevice: crate::PhysicalDevice,
        index: usize,
        multi_device: bool,
    ) -> Result<DeviceContext, RuntimeError> {
        let mut builder = DeviceBuilder::new(pdevice.clone())?;

        // Cross-device sync and sharing are best-effort; skip the extensions
        // on devices that lack them and degrade to host waits later.
        let exportable_timelines = multi_device
            && pdevice.supports_timeline_semaphore_fd()
            && builder.enable_extension(ash::khr::external_semaphore_fd::NAME).is_ok();
        let _ = builder.enable_extension(ash::khr::external_memory_fd::NAME);
        let _ = builder.enable_extension(ash::ext::external_memory_host::NAME);

        // One queue per role from the most specific family supporting it.
        let mut assignments: Vec<(QueueRole, u32, u32)> = Vec::new();
        for role in QueueRole::ALL {
            if let Some((family, queue)) =
                builder.enable_queue_with_caps(role.required_flags(), 1.0)
            {
                assignments.push((role, family, queue));
            }
        }
        if !assignments.iter().any(|(role, _, _)| *role == QueueRole::Graphics) {
            return Err(RuntimeError::NoQueueForRole(QueueRole::Graphics));
        }

        let device = builder.build()?;

        let mut queues = Vec::new();
        let mut roles: [Vec<usize>; 3] = Default::default();
        for (role, family, queue_index) in assignments {
            let timeline = SharedSemaphore::new(Semaphore::new_timeline(
                device.clone(),
                0,
                exportable_timelines,
            )?);
            let queue = Queue::new(device.clone(), family, queue_index, role, timeline)?;
            roles[role_index(role)].push(queues.len());
            queues.push(Arc::new(queue));
        }
        // Roles without their own queue fall back to the graphics queue.
        let graphics = roles[role_index(QueueRole::Graphics)].clone();
        for role_queues in roles.iter_mut() {
            if role_queues.is_empty() {
                *role_queues = graphics.clone();
            }
        }

        tracing::info!(
            device = index,
            name = ?pdevice.properties().device_name(),
            queues = queues.len(),
            exportable_timelines,
            "device ready"
        );
        Ok(DeviceContext {
            device,
            queues,
            roles,
            round_robin: Default::default(),
            imported: Mutex::new(HashMap::new()),
            index,
        })
    }

    /// Imports every exportable queue timeline into every other device, so
    /// cross-device waits can ride the GPU schedule instead of the host.
    fn import_peer_timelines(&self) {
        for target in &self.devices {
            let mut imports = HashMap::new();
            for source in &self.devices {
                if source.index == target.index {
                    continue;
                }
                for (queue_index, queue) in source.queues.iter().enumerate() {
                    let fd = match queue.timeline().export_fd() {
                        Ok(fd) => fd,
                        Err(err) => {
                            tracing::debug!(
                                source = source.index,
                                target = target.index,
                                queue = queue_index,
                                ?err,
                                "timeline not exportable, cross-device waits \
                                 will fall back to the host"
                            );
                            continue;
                        }
                    };
                    match Semaphore::import_fd(target.device.clone(), fd) {
                        Ok(imported) => {
                            imports.insert(
                                (source.index, queue_index),
                                SharedSemaphore::new(imported),
                            );
                        }
                        Err(err) => {
                            tracing::warn!(
                                source = source.index,
                                target = target.index,
                                queue = queue_index,
                                ?err,
                                "timeline import failed"
                            );
                        }
                    }
                }
            }
            match target.imported.lock() {
                Ok(mut guard) => *guard = imports,
                Err(poisoned) => *poisoned.into_inner() = imports,
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        for ctx in &self.devices {
            if let Err(err) = ctx.wait_idle() {
                tracing::error!(device = ctx.index, ?err, "wait_idle failed during teardown");
            }
        }
    }
}
