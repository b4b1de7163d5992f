//! Command executors: typed recording, barrier inference, and submission.

use crate::{
    bindless::BindlessTables,
    error::RuntimeError,
    queue::QueueRole,
    record::{Record, ResourceAccess},
    runtime::DeviceContext,
    sync::SharedSemaphore,
    tracking::MemoryBarrier,
    utils::AsVkHandle,
};
use ash::vk;
use smallvec::SmallVec;
use std::sync::Arc;

/// Lifecycle state of an [`Executor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Recording,
    Committed,
}

/// A point on a queue timeline identifying one committed batch.
///
/// Cheap to clone; hand it to other executors so they can [`Executor::wait`]
/// on this work.
#[derive(Clone)]
pub struct Submission {
    pub(crate) device_index: usize,
    pub(crate) queue_index: usize,
    pub(crate) timeline: SharedSemaphore,
    pub(crate) value: u64,
}

impl Submission {
    /// Whether the submitted work has retired.
    pub fn is_complete(&self) -> bool {
        self.timeline.is_signaled(self.value)
    }

    /// Blocks the calling thread until the work retires.
    pub fn wait_blocked(&self) -> ash::prelude::VkResult<()> {
        self.timeline.wait_blocked(self.value, u64::MAX)
    }
}

/// Accumulates the barriers one record needs, then flushes them as a single
/// `vkCmdPipelineBarrier2` right before the record's commands.
#[derive(Default)]
struct BarrierBatch {
    memory: MemoryBarrier,
    image: SmallVec<[vk::ImageMemoryBarrier2<'static>; 4]>,
}

impl BarrierBatch {
    fn add_memory(&mut self, barrier: MemoryBarrier) {
        self.memory |= barrier;
    }

    fn add_image(
        &mut self,
        barrier: MemoryBarrier,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        subresource_range: vk::ImageSubresourceRange,
    ) {
        if old_layout == new_layout {
            // No transition needed; a global barrier covers the dependency.
            self.add_memory(barrier);
            return;
        }
        self.image.push(vk::ImageMemoryBarrier2 {
            src_stage_mask: barrier.src.stage,
            src_access_mask: barrier.src.access,
            dst_stage_mask: barrier.dst.stage,
            dst_access_mask: barrier.dst.access,
            old_layout,
            new_layout,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image,
            subresource_range,
            ..Default::default()
        });
    }

    fn is_empty(&self) -> bool {
        self.memory.is_empty() && self.image.is_empty()
    }

    fn flush(&mut self, device: &ash::Device, command_buffer: vk::CommandBuffer) {
        if self.is_empty() {
            return;
        }
        let memory_barrier = vk::MemoryBarrier2 {
            src_stage_mask: self.memory.src.stage,
            src_access_mask: self.memory.src.access,
            dst_stage_mask: self.memory.dst.stage,
            dst_access_mask: self.memory.dst.access,
            ..Default::default()
        };
        let dependency_info = vk::DependencyInfo {
            memory_barrier_count: if self.memory.is_empty() { 0 } else { 1 },
            p_memory_barriers: &memory_barrier,
            image_memory_barrier_count: self.image.len() as u32,
            p_image_memory_barriers: self.image.as_ptr(),
            ..Default::default()
        };
        unsafe {
            device.cmd_pipeline_barrier2(command_buffer, &dependency_info);
        }
        self.memory = MemoryBarrier::default();
        self.image.clear();
    }
}

/// Records typed commands against one device and submits them as a batch.
pub struct Executor {
    ctx: Arc<DeviceContext>,
    tables: Arc<BindlessTables>,
    role: QueueRole,
    state: ExecutorState,
    records: Vec<Record>,
    waits: Vec<Submission>,
}

fn accepts(executor_role: QueueRole, required: QueueRole) -> bool {
    required <= executor_role
}

impl Executor {
    pub fn new(ctx: Arc<DeviceContext>, tables: Arc<BindlessTables>, role: QueueRole) -> Self {
        Self {
            ctx,
            tables,
            role,
            state: ExecutorState::Idle,
            records: Vec::new(),
            waits: Vec::new(),
        }
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn role(&self) -> QueueRole {
        self.role
    }

    /// Starts a recording session.
    pub fn begin(&mut self) -> Result<(), RuntimeError> {
        if self.state != ExecutorState::Idle {
            return Err(RuntimeError::InvalidExecutorState {
                expected: ExecutorState::Idle,
                actual: self.state,
            });
        }
        self.state = ExecutorState::Recording;
        Ok(())
    }

    /// Appends a record to the batch.
    ///
    /// A record whose required role exceeds this executor's role is dropped
    /// with a warning rather than poisoning the batch; the caller picked the
    /// wrong executor for that one command, not for the whole batch.
    pub fn push(&mut self, record: Record) -> Result<(), RuntimeError> {
        if self.state != ExecutorState::Recording {
            return Err(RuntimeError::InvalidExecutorState {
                expected: ExecutorState::Recording,
                actual: self.state,
            });
        }
        if !accepts(self.role, record.required_role()) {
            tracing::warn!(
                record = record.name(),
                required = ?record.required_role(),
                executor = ?self.role,
                "record dropped: executor role cannot run it"
            );
            return Ok(());
        }
        self.records.push(record);
        Ok(())
    }

    /// Makes this batch wait for `submission` before executing.
    ///
    /// Same device: a native timeline wait. Other device: the imported copy
    /// of that queue's timeline when available, otherwise the host blocks at
    /// commit until the submission retires.
    pub fn wait(&mut self, submission: Submission) -> Result<(), RuntimeError> {
        if self.state != ExecutorState::Recording {
            return Err(RuntimeError::InvalidExecutorState {
                expected: ExecutorState::Recording,
                actual: self.state,
            });
        }
        self.waits.push(submission);
        Ok(())
    }

    /// Submits the batch.
    ///
    /// Selects an available queue for this executor's role, infers the
    /// minimal barrier for each record from the tracked resource states, and
    /// emits it immediately before that record's commands. Signals the
    /// queue's timeline one past its previous target.
    ///
    /// An empty batch (nothing pushed, or every record role-dropped) submits
    /// nothing and returns `None`; pending waits are discarded since there is
    /// no work left to order after them.
    pub fn commit(&mut self) -> Result<Option<Submission>, RuntimeError> {
        if self.state != ExecutorState::Recording {
            return Err(RuntimeError::InvalidExecutorState {
                expected: ExecutorState::Recording,
                actual: self.state,
            });
        }

        if self.records.is_empty() {
            let discarded = self.waits.drain(..).count();
            if discarded > 0 {
                tracing::debug!(discarded, "empty commit dropped pending waits");
            }
            self.state = ExecutorState::Committed;
            return Ok(None);
        }

        // Resolve cross-executor waits before touching the queue so a host
        // fallback cannot stall while holding the lock.
        let mut semaphore_waits: Vec<(SharedSemaphore, u64)> = Vec::new();
        for submission in self.waits.drain(..) {
            if submission.device_index == self.ctx.index() {
                semaphore_waits.push((submission.timeline.clone(), submission.value));
            } else if let Some(imported) = self
                .ctx
                .imported_timeline(submission.device_index, submission.queue_index)
            {
                semaphore_waits.push((imported, submission.value));
            } else {
                tracing::warn!(
                    source_device = submission.device_index,
                    target_device = self.ctx.index(),
                    "no imported timeline, degrading to a host wait"
                );
                submission.timeline.wait_blocked(submission.value, u64::MAX)?;
            }
        }

        let mut guard = self.ctx.select_queue(self.role);
        let device = self.ctx.device();
        let command_buffer = guard.command_buffer();
        unsafe {
            device.begin_command_buffer(
                command_buffer,
                &vk::CommandBufferBeginInfo {
                    flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                    ..Default::default()
                },
            )?;
        }

        // Encoding consumes the records and their handle clones; retain the
        // resource handles until the batch has actually been submitted, or a
        // last clone dying mid-loop would tear down a resource this command
        // buffer references before the queue ever sees it.
        let mut retained: Vec<ResourceAccess> = Vec::new();
        let mut batch = BarrierBatch::default();
        for record in self.records.drain(..) {
            for resource_access in record.accesses() {
                match &resource_access {
                    ResourceAccess::Buffer { buffer, access } => {
                        let mut buffer = buffer.write();
                        let barrier = buffer.state.transition(*access, false);
                        batch.add_memory(barrier);
                    }
                    ResourceAccess::Image {
                        image,
                        access,
                        layout,
                    } => {
                        let mut image = image.write();
                        let old_layout = image.state.layout;
                        let transition = old_layout != *layout;
                        let barrier = image.state.transition(*access, transition);
                        image.state.layout = *layout;
                        let range = image.subresource_range();
                        batch.add_image(barrier, image.vk_handle(), old_layout, *layout, range);
                    }
                }
                retained.push(resource_access);
            }
            batch.flush(device, command_buffer);
            tracing::trace!(record = record.name(), "encode");
            record.encode(device, command_buffer, &self.tables);
        }
        unsafe {
            device.end_command_buffer(command_buffer)?;
        }

        let value = guard.submit(&semaphore_waits)?;
        // Submitted; resource teardown from here on waits for device idle.
        drop(retained);
        let queue_index = self
            .ctx
            .queues()
            .iter()
            .position(|queue| std::ptr::eq(Arc::as_ptr(queue), guard.queue()))
            .unwrap_or_default();
        self.state = ExecutorState::Committed;
        Ok(Some(Submission {
            device_index: self.ctx.index(),
            queue_index,
            timeline: guard.queue().timeline().clone(),
            value,
        }))
    }

    /// Returns the executor to [`ExecutorState::Idle`], discarding any
    /// uncommitted records.
    pub fn reset(&mut self) {
        if !self.records.is_empty() {
            tracing::warn!(
                dropped = self.records.len(),
                "reset discarded uncommitted records"
            );
        }
        self.records.clear();
        self.waits.clear();
        self.state = ExecutorState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_acceptance() {
        assert!(accepts(QueueRole::Graphics, QueueRole::Transfer));
        assert!(accepts(QueueRole::Graphics, QueueRole::Graphics));
        assert!(accepts(QueueRole::Compute, QueueRole::Transfer));
        assert!(!accepts(QueueRole::Compute, QueueRole::Graphics));
        assert!(!accepts(QueueRole::Transfer, QueueRole::Compute));
    }

    #[test]
    fn test_barrier_batch_merges_memory_barriers() {
        use crate::tracking::Access;
        let mut batch = BarrierBatch::default();
        batch.add_memory(MemoryBarrier {
            src: Access {
                stage: vk::PipelineStageFlags2::ALL_TRANSFER,
                access: vk::AccessFlags2::TRANSFER_WRITE,
            },
            dst: Access {
                stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
                access: vk::AccessFlags2::SHADER_STORAGE_READ,
            },
        });
        batch.add_memory(MemoryBarrier {
            src: Access {
                stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
                access: vk::AccessFlags2::SHADER_STORAGE_WRITE,
            },
            dst: Access {
                stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
                access: vk::AccessFlags2::SHADER_STORAGE_READ,
            },
        });
        assert_eq!(
            batch.memory.src.stage,
            vk::PipelineStageFlags2::ALL_TRANSFER | vk::PipelineStageFlags2::COMPUTE_SHADER
        );
        assert_eq!(
            batch.memory.dst.access,
            vk::AccessFlags2::SHADER_STORAGE_READ
        );
    }

    #[test]
    fn test_barrier_batch_same_layout_collapses_to_memory_barrier() {
        use crate::tracking::Access;
        let mut batch = BarrierBatch::default();
        batch.add_image(
            MemoryBarrier {
                src: Access {
                    stage: vk::PipelineStageFlags2::ALL_TRANSFER,
                    access: vk::AccessFlags2::TRANSFER_WRITE,
                },
                dst: Access {
                    stage: vk::PipelineStageFlags2::ALL_TRANSFER,
                    access: vk::AccessFlags2::TRANSFER_READ,
                },
            },
            vk::Image::null(),
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::GENERAL,
            vk::ImageSubresourceRange::default(),
        );
        assert!(batch.image.is_empty());
        assert!(!batch.memory.is_empty());
    }
}
