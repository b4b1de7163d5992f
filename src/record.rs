//! Typed command records.
//!
//! Executors collect [`Record`]s instead of raw command buffer calls. Each
//! record declares the queue role it needs and every resource access it will
//! perform, which is what lets the executor infer barriers at commit time.

use crate::{
    bindless::{BindlessTables, TableKind},
    buffer::Buffer,
    image::Image,
    pool::Handle,
    push_constant::PushConstantBlock,
    queue::QueueRole,
    tracking::Access,
    utils::AsVkHandle,
};
use ash::vk;
use smallvec::SmallVec;

const TRANSFER_READ: Access = Access {
    stage: vk::PipelineStageFlags2::ALL_TRANSFER,
    access: vk::AccessFlags2::TRANSFER_READ,
};
const TRANSFER_WRITE: Access = Access {
    stage: vk::PipelineStageFlags2::ALL_TRANSFER,
    access: vk::AccessFlags2::TRANSFER_WRITE,
};

/// One resource access a record will perform.
pub(crate) enum ResourceAccess {
    Buffer {
        buffer: Handle<Buffer>,
        access: Access,
    },
    Image {
        image: Handle<Image>,
        access: Access,
        /// Layout the image must be in for this access.
        layout: vk::ImageLayout,
    },
}

/// A buffer the caller's shader reads or writes through the bindless tables,
/// declared up front so the executor can order it.
pub struct BufferUse {
    pub buffer: Handle<Buffer>,
    pub access: Access,
}

/// Same as [`BufferUse`], for images, including the layout the shader
/// expects.
pub struct ImageUse {
    pub image: Handle<Image>,
    pub access: Access,
    pub layout: vk::ImageLayout,
}

/// A color attachment of a raster pass.
pub struct ColorAttachment {
    pub image: Handle<Image>,
    pub load_op: vk::AttachmentLoadOp,
    pub clear: vk::ClearValue,
}

/// Callback that records draws inside an active render pass instance.
pub type DrawCallback = Box<dyn FnOnce(&ash::Device, vk::CommandBuffer) + Send>;

/// A recorded command, pending until the executor commits.
pub enum Record {
    CopyBuffer {
        src: Handle<Buffer>,
        dst: Handle<Buffer>,
        regions: SmallVec<[vk::BufferCopy; 1]>,
    },
    CopyBufferToImage {
        src: Handle<Buffer>,
        dst: Handle<Image>,
        regions: SmallVec<[vk::BufferImageCopy; 1]>,
    },
    CopyImageToBuffer {
        src: Handle<Image>,
        dst: Handle<Buffer>,
        regions: SmallVec<[vk::BufferImageCopy; 1]>,
    },
    Blit {
        src: Handle<Image>,
        dst: Handle<Image>,
        regions: SmallVec<[vk::ImageBlit; 1]>,
        filter: vk::Filter,
    },
    /// Moves an image to `new_layout` with no other work; the inferred
    /// barrier is the whole record.
    LayoutTransition {
        image: Handle<Image>,
        new_layout: vk::ImageLayout,
    },
    ComputeDispatch {
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        push_constants: Option<PushConstantBlock>,
        group_counts: glam::UVec3,
        buffers: Vec<BufferUse>,
        images: Vec<ImageUse>,
    },
    RasterPass {
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        push_constants: Option<PushConstantBlock>,
        render_area: vk::Rect2D,
        color_attachments: Vec<ColorAttachment>,
        depth_attachment: Option<ColorAttachment>,
        buffers: Vec<BufferUse>,
        images: Vec<ImageUse>,
        draw: DrawCallback,
    },
}

impl Record {
    pub fn name(&self) -> &'static str {
        match self {
            Record::CopyBuffer { .. } => "copy_buffer",
            Record::CopyBufferToImage { .. } => "copy_buffer_to_image",
            Record::CopyImageToBuffer { .. } => "copy_image_to_buffer",
            Record::Blit { .. } => "blit",
            Record::LayoutTransition { .. } => "layout_transition",
            Record::ComputeDispatch { .. } => "compute_dispatch",
            Record::RasterPass { .. } => "raster_pass",
        }
    }

    /// The least capable queue role that can execute this record.
    ///
    /// Blits do format conversion and scaling, which transfer-only queues
    /// cannot do, so they need graphics.
    pub fn required_role(&self) -> QueueRole {
        match self {
            Record::CopyBuffer { .. }
            | Record::CopyBufferToImage { .. }
            | Record::CopyImageToBuffer { .. }
            | Record::LayoutTransition { .. } => QueueRole::Transfer,
            Record::ComputeDispatch { .. } => QueueRole::Compute,
            Record::Blit { .. } | Record::RasterPass { .. } => QueueRole::Graphics,
        }
    }

    /// Every resource access this record performs, in program order.
    pub(crate) fn accesses(&self) -> SmallVec<[ResourceAccess; 4]> {
        let mut out = SmallVec::new();
        match self {
            Record::CopyBuffer { src, dst, .. } => {
                out.push(ResourceAccess::Buffer {
                    buffer: src.clone(),
                    access: TRANSFER_READ,
                });
                out.push(ResourceAccess::Buffer {
                    buffer: dst.clone(),
                    access: TRANSFER_WRITE,
                });
            }
            Record::CopyBufferToImage { src, dst, .. } => {
                out.push(ResourceAccess::Buffer {
                    buffer: src.clone(),
                    access: TRANSFER_READ,
                });
                out.push(ResourceAccess::Image {
                    image: dst.clone(),
                    access: TRANSFER_WRITE,
                    layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                });
            }
            Record::CopyImageToBuffer { src, dst, .. } => {
                out.push(ResourceAccess::Image {
                    image: src.clone(),
                    access: TRANSFER_READ,
                    layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                });
                out.push(ResourceAccess::Buffer {
                    buffer: dst.clone(),
                    access: TRANSFER_WRITE,
                });
            }
            Record::Blit { src, dst, .. } => {
                out.push(ResourceAccess::Image {
                    image: src.clone(),
                    access: TRANSFER_READ,
                    layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                });
                out.push(ResourceAccess::Image {
                    image: dst.clone(),
                    access: TRANSFER_WRITE,
                    layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                });
            }
            Record::LayoutTransition { image, new_layout } => {
                out.push(ResourceAccess::Image {
                    image: image.clone(),
                    access: Access {
                        stage: vk::PipelineStageFlags2::ALL_COMMANDS,
                        access: vk::AccessFlags2::NONE,
                    },
                    layout: *new_layout,
                });
            }
            Record::ComputeDispatch {
                buffers, images, ..
            } => {
                for b in buffers {
                    out.push(ResourceAccess::Buffer {
                        buffer: b.buffer.clone(),
                        access: b.access,
                    });
                }
                for i in images {
                    out.push(ResourceAccess::Image {
                        image: i.image.clone(),
                        access: i.access,
                        layout: i.layout,
                    });
                }
            }
            Record::RasterPass {
                color_attachments,
                depth_attachment,
                buffers,
                images,
                ..
            } => {
                for b in buffers {
                    out.push(ResourceAccess::Buffer {
                        buffer: b.buffer.clone(),
                        access: b.access,
                    });
                }
                for i in images {
                    out.push(ResourceAccess::Image {
                        image: i.image.clone(),
                        access: i.access,
                        layout: i.layout,
                    });
                }
                for attachment in color_attachments {
                    out.push(ResourceAccess::Image {
                        image: attachment.image.clone(),
                        access: Access {
                            stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                            access: vk::AccessFlags2::COLOR_ATTACHMENT_READ
                                | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                        },
                        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    });
                }
                if let Some(attachment) = depth_attachment {
                    out.push(ResourceAccess::Image {
                        image: attachment.image.clone(),
                        access: Access {
                            stage: vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                            access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                        },
                        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    });
                }
            }
        }
        out
    }

    fn bind_tables(
        device: &ash::Device,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        tables: &BindlessTables,
    ) {
        let sets: Vec<vk::DescriptorSet> =
            TableKind::ALL.iter().map(|kind| tables.set(*kind)).collect();
        unsafe {
            device.cmd_bind_descriptor_sets(command_buffer, bind_point, layout, 0, &sets, &[]);
        }
    }

    fn push_constants(
        device: &ash::Device,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        block: &PushConstantBlock,
    ) {
        let bytes = block.snapshot();
        unsafe {
            device.cmd_push_constants(
                command_buffer,
                layout,
                vk::ShaderStageFlags::ALL,
                block.offset(),
                &bytes,
            );
        }
    }

    /// Records this command into `command_buffer`. Barriers have already
    /// been emitted by the executor.
    pub(crate) fn encode(
        self,
        device: &ash::Device,
        command_buffer: vk::CommandBuffer,
        tables: &BindlessTables,
    ) {
        match self {
            Record::CopyBuffer { src, dst, regions } => unsafe {
                device.cmd_copy_buffer(
                    command_buffer,
                    src.read().vk_handle(),
                    dst.read().vk_handle(),
                    &regions,
                );
            },
            Record::CopyBufferToImage { src, dst, regions } => unsafe {
                device.cmd_copy_buffer_to_image(
                    command_buffer,
                    src.read().vk_handle(),
                    dst.read().vk_handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &regions,
                );
            },
            Record::CopyImageToBuffer { src, dst, regions } => unsafe {
                device.cmd_copy_image_to_buffer(
                    command_buffer,
                    src.read().vk_handle(),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst.read().vk_handle(),
                    &regions,
                );
            },
            Record::Blit {
                src,
                dst,
                regions,
                filter,
            } => unsafe {
                device.cmd_blit_image(
                    command_buffer,
                    src.read().vk_handle(),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst.read().vk_handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &regions,
                    filter,
                );
            },
            Record::LayoutTransition { .. } => {
                // Nothing to record: the transition rode the barrier.
            }
            Record::ComputeDispatch {
                pipeline,
                layout,
                push_constants,
                group_counts,
                ..
            } => unsafe {
                device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::COMPUTE, pipeline);
                Self::bind_tables(
                    device,
                    command_buffer,
                    vk::PipelineBindPoint::COMPUTE,
                    layout,
                    tables,
                );
                if let Some(block) = &push_constants {
                    Self::push_constants(device, command_buffer, layout, block);
                }
                device.cmd_dispatch(
                    command_buffer,
                    group_counts.x,
                    group_counts.y,
                    group_counts.z,
                );
            },
            Record::RasterPass {
                pipeline,
                layout,
                push_constants,
                render_area,
                color_attachments,
                depth_attachment,
                draw,
                ..
            } => unsafe {
                let color_infos: Vec<vk::RenderingAttachmentInfo> = color_attachments
                    .iter()
                    .map(|attachment| vk::RenderingAttachmentInfo {
                        image_view: attachment.image.read().view(),
                        image_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        load_op: attachment.load_op,
                        store_op: vk::AttachmentStoreOp::STORE,
                        clear_value: attachment.clear,
                        ..Default::default()
                    })
                    .collect();
                let depth_info = depth_attachment.as_ref().map(|attachment| {
                    vk::RenderingAttachmentInfo {
                        image_view: attachment.image.read().view(),
                        image_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                        load_op: attachment.load_op,
                        store_op: vk::AttachmentStoreOp::STORE,
                        clear_value: attachment.clear,
                        ..Default::default()
                    }
                });
                let mut rendering_info = vk::RenderingInfo {
                    render_area,
                    layer_count: 1,
                    color_attachment_count: color_infos.len() as u32,
                    p_color_attachments: color_infos.as_ptr(),
                    ..Default::default()
                };
                if let Some(depth_info) = &depth_info {
                    rendering_info.p_depth_attachment = depth_info;
                }
                device.cmd_begin_rendering(command_buffer, &rendering_info);
                device.cmd_bind_pipeline(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline,
                );
                Self::bind_tables(
                    device,
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    layout,
                    tables,
                );
                if let Some(block) = &push_constants {
                    Self::push_constants(device, command_buffer, layout, block);
                }
                draw(device, command_buffer);
                device.cmd_end_rendering(command_buffer);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_specificity_ordering() {
        assert!(QueueRole::Graphics > QueueRole::Compute);
        assert!(QueueRole::Compute > QueueRole::Transfer);
    }
}
