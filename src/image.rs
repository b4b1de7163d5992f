//! Images with allocator-backed memory and lazily created views.

use crate::{
    alloc::Allocator, error::RuntimeError, tracking::ResourceState, utils::AsVkHandle, Device,
    HasDevice,
};
use ash::vk;
use std::collections::BTreeMap;
use vk_mem::Alloc;

/// Parameters for [`crate::ResourceManager::create_image`].
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
}
impl Default for ImageDesc {
    fn default() -> Self {
        Self {
            format: vk::Format::UNDEFINED,
            extent: vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            },
            usage: vk::ImageUsageFlags::empty(),
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }
}

/// Aspect flags implied by a format.
pub fn format_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// A GPU image, its memory, and its views.
///
/// A whole-image view is created eagerly; per-mip views are created on first
/// use and cached.
pub struct Image {
    allocator: Allocator,
    image: vk::Image,
    allocation: vk_mem::Allocation,
    desc: ImageDesc,
    default_view: vk::ImageView,
    mip_views: BTreeMap<u32, vk::ImageView>,
    pub(crate) state: ResourceState,
    pub(crate) bindless_sampled: BTreeMap<Option<u32>, u32>,
    pub(crate) bindless_storage: BTreeMap<Option<u32>, u32>,
    pub(crate) tables: Option<std::sync::Arc<crate::bindless::BindlessTables>>,
}

impl HasDevice for Image {
    fn device(&self) -> &Device {
        self.allocator.device()
    }
}
impl AsVkHandle for Image {
    type Handle = vk::Image;
    fn vk_handle(&self) -> vk::Image {
        self.image
    }
}

impl Image {
    pub(crate) fn new(allocator: Allocator, desc: &ImageDesc) -> Result<Self, RuntimeError> {
        // Like buffers, all images accept transfer commands.
        let usage =
            desc.usage | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        let image_type = if desc.extent.depth > 1 {
            vk::ImageType::TYPE_3D
        } else if desc.extent.height > 1 || desc.array_layers == 1 {
            vk::ImageType::TYPE_2D
        } else {
            vk::ImageType::TYPE_1D
        };
        let image_info = vk::ImageCreateInfo {
            image_type,
            format: desc.format,
            extent: desc.extent,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
            samples: desc.samples,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let create_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };
        let (image, allocation) =
            unsafe { allocator.create_image(&image_info, &create_info)? };
        let info = allocator.get_allocation_info(&allocation);
        allocator.track_allocation(info.memory_type, info.size);

        let device = allocator.device();
        let default_view = match Self::create_view(device, image, desc, 0, desc.mip_levels) {
            Ok(view) => view,
            Err(err) => {
                let mut allocation = allocation;
                unsafe { allocator.destroy_image(image, &mut allocation) };
                return Err(err);
            }
        };

        Ok(Self {
            image,
            allocation,
            desc: ImageDesc { usage, ..*desc },
            default_view,
            mip_views: BTreeMap::new(),
            state: ResourceState::default(),
            bindless_sampled: BTreeMap::new(),
            bindless_storage: BTreeMap::new(),
            tables: None,
            allocator,
        })
    }

    fn create_view(
        device: &Device,
        image: vk::Image,
        desc: &ImageDesc,
        base_mip: u32,
        mip_count: u32,
    ) -> Result<vk::ImageView, RuntimeError> {
        let view_type = if desc.extent.depth > 1 {
            vk::ImageViewType::TYPE_3D
        } else if desc.array_layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let info = vk::ImageViewCreateInfo {
            image,
            view_type,
            format: desc.format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: format_aspect(desc.format),
                base_mip_level: base_mip,
                level_count: mip_count,
                base_array_layer: 0,
                layer_count: desc.array_layers,
            },
            ..Default::default()
        };
        Ok(unsafe { device.create_image_view(&info, None)? })
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.desc.extent
    }

    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        format_aspect(self.desc.format)
    }

    /// The whole-image view.
    pub fn view(&self) -> vk::ImageView {
        self.default_view
    }

    /// A single-mip view, created on first use.
    pub fn mip_view(&mut self, mip_level: u32) -> Result<vk::ImageView, RuntimeError> {
        if let Some(view) = self.mip_views.get(&mip_level) {
            return Ok(*view);
        }
        let view = Self::create_view(self.allocator.device(), self.image, &self.desc, mip_level, 1)?;
        self.mip_views.insert(mip_level, view);
        Ok(view)
    }

    /// The full subresource range of this image.
    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect(),
            base_mip_level: 0,
            level_count: self.desc.mip_levels,
            base_array_layer: 0,
            layer_count: self.desc.array_layers,
        }
    }

    pub fn subresource_layers(&self, mip_level: u32) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: self.aspect(),
            mip_level,
            base_array_layer: 0,
            layer_count: self.desc.array_layers,
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        // Same contract as buffer teardown: in-flight submissions may still
        // sample or write this image, so the last reference waits them out.
        if let Err(err) = unsafe { self.allocator.device().device_wait_idle() } {
            tracing::error!(?err, "device_wait_idle failed before image teardown");
        }
        if let Some(tables) = &self.tables {
            for index in self.bindless_sampled.values() {
                tables.free(crate::bindless::TableKind::SampledImage, *index);
            }
            for index in self.bindless_storage.values() {
                tables.free(crate::bindless::TableKind::StorageImage, *index);
            }
        }
        let device = self.allocator.device().clone();
        let info = self.allocator.get_allocation_info(&self.allocation);
        self.allocator.track_release(info.memory_type, info.size);
        unsafe {
            for view in self.mip_views.values() {
                device.destroy_image_view(*view, None);
            }
            device.destroy_image_view(self.default_view, None);
            self.allocator.destroy_image(self.image, &mut self.allocation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_aspects() {
        assert_eq!(
            format_aspect(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            format_aspect(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            format_aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
