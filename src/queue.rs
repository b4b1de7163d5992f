//! Queues and submission.

use crate::{
    sync::SharedSemaphore,
    utils::AsVkHandle,
    Device, HasDevice,
};
use ash::{prelude::VkResult, vk};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex, MutexGuard,
};

/// The role a queue plays in the runtime.
///
/// Ordered by specificity: a queue can run any work whose required role is
/// less than or equal to its own capability, so `Graphics` is the greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueueRole {
    Transfer,
    Compute,
    Graphics,
}
impl QueueRole {
    pub fn required_flags(&self) -> vk::QueueFlags {
        match self {
            QueueRole::Graphics => vk::QueueFlags::GRAPHICS,
            QueueRole::Compute => vk::QueueFlags::COMPUTE,
            QueueRole::Transfer => vk::QueueFlags::TRANSFER,
        }
    }
    pub const ALL: [QueueRole; 3] = [QueueRole::Graphics, QueueRole::Compute, QueueRole::Transfer];
}

/// Per-queue command recording state. Guarded by the queue mutex so only one
/// executor records and submits on a queue at a time.
pub struct RecordingSlot {
    pub(crate) command_pool: vk::CommandPool,
    pub(crate) command_buffer: vk::CommandBuffer,
}

/// A device queue with its timeline semaphore.
///
/// The timeline counter equals the number of submissions retired on this
/// queue; `target` is the number of submissions issued. A queue is available
/// when its mutex is free and the timeline has caught up with `target`.
pub struct Queue {
    device: Device,
    queue: vk::Queue,
    family_index: u32,
    role: QueueRole,
    timeline: SharedSemaphore,
    target: AtomicU64,
    recording: Mutex<RecordingSlot>,
}
impl HasDevice for Queue {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl AsVkHandle for Queue {
    type Handle = vk::Queue;
    fn vk_handle(&self) -> vk::Queue {
        self.queue
    }
}

impl Queue {
    pub(crate) fn new(
        device: Device,
        family_index: u32,
        queue_index: u32,
        role: QueueRole,
        timeline: SharedSemaphore,
    ) -> VkResult<Self> {
        let queue = unsafe { device.get_device_queue(family_index, queue_index) };
        let command_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo {
                    flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                    queue_family_index: family_index,
                    ..Default::default()
                },
                None,
            )?
        };
        let command_buffer = unsafe {
            device.allocate_command_buffers(&vk::CommandBufferAllocateInfo {
                command_pool,
                level: vk::CommandBufferLevel::PRIMARY,
                command_buffer_count: 1,
                ..Default::default()
            })?[0]
        };
        Ok(Self {
            device,
            queue,
            family_index,
            role,
            timeline,
            target: AtomicU64::new(0),
            recording: Mutex::new(RecordingSlot {
                command_pool,
                command_buffer,
            }),
        })
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn role(&self) -> QueueRole {
        self.role
    }

    pub fn timeline(&self) -> &SharedSemaphore {
        &self.timeline
    }

    /// Number of submissions issued on this queue so far.
    pub fn target(&self) -> u64 {
        self.target.load(Ordering::Relaxed)
    }

    /// Whether all issued submissions have retired.
    pub fn is_idle(&self) -> bool {
        self.timeline.is_signaled(self.target())
    }

    /// Tries to lock the recording slot without blocking.
    pub fn try_lock(&self) -> Option<QueueGuard<'_>> {
        let slot = self.recording.try_lock().ok()?;
        Some(QueueGuard { queue: self, slot })
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        // All submissions must have retired; runtime teardown waits for the
        // device to go idle before dropping queues.
        let slot = match self.recording.get_mut() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        unsafe {
            self.device.destroy_command_pool(slot.command_pool, None);
        }
    }
}

/// Exclusive access to a queue's recording slot.
pub struct QueueGuard<'a> {
    queue: &'a Queue,
    slot: MutexGuard<'a, RecordingSlot>,
}

impl<'a> QueueGuard<'a> {
    pub fn queue(&self) -> &'a Queue {
        self.queue
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.slot.command_buffer
    }

    /// Submits the recorded command buffer.
    ///
    /// Waits on `waits` (timeline semaphore, value) pairs, then signals this
    /// queue's timeline at `target + 1` and advances `target`. Returns the
    /// signaled value.
    pub fn submit(&mut self, waits: &[(SharedSemaphore, u64)]) -> VkResult<u64> {
        let signal_value = self.queue.target.load(Ordering::Relaxed) + 1;
        let wait_infos: Vec<vk::SemaphoreSubmitInfo> = waits
            .iter()
            .map(|(semaphore, value)| vk::SemaphoreSubmitInfo {
                semaphore: semaphore.vk_handle(),
                value: *value,
                stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
                ..Default::default()
            })
            .collect();
        let signal_info = vk::SemaphoreSubmitInfo {
            semaphore: self.queue.timeline.vk_handle(),
            value: signal_value,
            stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            ..Default::default()
        };
        let command_buffer_info = vk::CommandBufferSubmitInfo {
            command_buffer: self.slot.command_buffer,
            ..Default::default()
        };
        let submit = vk::SubmitInfo2 {
            wait_semaphore_info_count: wait_infos.len() as u32,
            p_wait_semaphore_infos: wait_infos.as_ptr(),
            command_buffer_info_count: 1,
            p_command_buffer_infos: &command_buffer_info,
            signal_semaphore_info_count: 1,
            p_signal_semaphore_infos: &signal_info,
            ..Default::default()
        };
        unsafe {
            self.queue
                .device
                .queue_submit2(self.queue.queue, &[submit], vk::Fence::null())?;
        }
        self.queue.target.store(signal_value, Ordering::Relaxed);
        tracing::debug!(
            queue = ?self.queue.queue,
            value = signal_value,
            waits = waits.len(),
            "submit"
        );
        Ok(signal_value)
    }
}
