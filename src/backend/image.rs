// 2D images, layout transitions and samplers

use super::device::VulkanDevice;
use super::error::Result;
use super::handle::DeviceOwned;
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Compute workgroup edge length used by the voxel shader.
pub const WORKGROUP_SIZE: u32 = 16;

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Device-local 2D image with a full view over it.
pub struct Image {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

/// Single mip, single layer, optimal tiling. Starts out in `UNDEFINED`.
pub fn create_image(
    device: &Arc<VulkanDevice>,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    width: u32,
    height: u32,
    name: &str,
) -> Result<Image> {
    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = DeviceOwned::new(
        device,
        unsafe { device.device.create_image(&image_info, None) }?,
        |device, image| unsafe { device.destroy_image(image, None) },
    );

    let requirements = unsafe { device.device.get_image_memory_requirements(image.handle()) };
    let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
        name,
        requirements,
        location: MemoryLocation::GpuOnly,
        linear: false,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    })?;

    let view = unsafe {
        device
            .device
            .bind_image_memory(image.handle(), allocation.memory(), allocation.offset())
            .and_then(|()| {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(image.handle())
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format)
                    .subresource_range(COLOR_RANGE);
                device.device.create_image_view(&view_info, None)
            })
    };
    let view = match view {
        Ok(view) => view,
        Err(e) => {
            let _ = device.allocator().lock().free(allocation);
            return Err(e.into());
        }
    };

    log::debug!("Created image '{}' {}x{} {:?}", name, width, height, format);

    Ok(Image {
        image: image.release(),
        view,
        format,
        extent: vk::Extent2D { width, height },
        allocation: Some(allocation),
        device: Arc::clone(device),
    })
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().lock().free(allocation) {
                log::error!("Failed to free image allocation: {}", e);
            }
        }
    }
}

/// Access implied by an image being in `layout`, or `None` if the layout is
/// not one the renderer transitions through.
fn layout_access(layout: vk::ImageLayout) -> Option<vk::AccessFlags> {
    let access = match layout {
        vk::ImageLayout::UNDEFINED => vk::AccessFlags::empty(),
        vk::ImageLayout::PREINITIALIZED => vk::AccessFlags::HOST_WRITE,
        vk::ImageLayout::GENERAL => vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        _ => return None,
    };
    Some(access)
}

/// Source and destination access masks for an `old -> new` transition.
///
/// Layouts outside the table contribute no access (and are logged): such a
/// barrier orders execution only.
pub fn access_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> (vk::AccessFlags, vk::AccessFlags) {
    let mut src = layout_access(old_layout).unwrap_or_else(|| {
        log::warn!("No access mask for source layout {:?}", old_layout);
        vk::AccessFlags::empty()
    });
    let dst = layout_access(new_layout).unwrap_or_else(|| {
        log::warn!("No access mask for destination layout {:?}", new_layout);
        vk::AccessFlags::empty()
    });

    // Nothing known about the producer: assume a host or transfer upload
    if new_layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL && src.is_empty() {
        src = vk::AccessFlags::HOST_WRITE | vk::AccessFlags::TRANSFER_WRITE;
    }

    (src, dst)
}

/// Record a full-image barrier moving `image` from `old_layout` to `new_layout`.
pub fn set_image_layout(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let (src_access, dst_access) = access_masks(old_layout, new_layout);

    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(COLOR_RANGE);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Nearest filtering, clamp-to-border addressing.
pub fn create_sampler(device: &Arc<VulkanDevice>) -> Result<DeviceOwned<vk::Sampler>> {
    let sampler_info = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::NEAREST)
        .min_filter(vk::Filter::NEAREST)
        .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
        .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_BORDER)
        .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_BORDER)
        .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_BORDER)
        .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK)
        .max_lod(0.0);

    let sampler = unsafe { device.device.create_sampler(&sampler_info, None) }?;
    Ok(DeviceOwned::new(device, sampler, |device, sampler| unsafe {
        device.destroy_sampler(sampler, None)
    }))
}

/// Workgroup counts covering `extent` with 16x16 groups.
///
/// Edges that are not a multiple of the group size are truncated.
pub fn dispatch_size(extent: vk::Extent2D) -> (u32, u32, u32) {
    (extent.width / WORKGROUP_SIZE, extent.height / WORKGROUP_SIZE, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_to_general_makes_shader_access_available() {
        let (src, dst) = access_masks(vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL);
        assert!(src.is_empty());
        assert_eq!(dst, vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE);
    }

    #[test]
    fn shader_read_defaults_source_to_upload_writes() {
        let (src, dst) = access_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(src, vk::AccessFlags::HOST_WRITE | vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst, vk::AccessFlags::SHADER_READ);

        let (src, _) = access_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(src, vk::AccessFlags::TRANSFER_WRITE);
    }

    #[test]
    fn attachment_and_transfer_layouts() {
        let (src, dst) = access_masks(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        assert_eq!(src, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert_eq!(dst, vk::AccessFlags::TRANSFER_READ);

        let (src, _) = access_masks(vk::ImageLayout::PREINITIALIZED, vk::ImageLayout::GENERAL);
        assert_eq!(src, vk::AccessFlags::HOST_WRITE);
    }

    #[test]
    fn unknown_layouts_fall_back_to_no_access() {
        let (src, dst) = access_masks(
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        );
        assert!(src.is_empty());
        assert!(dst.is_empty());
    }

    #[test]
    fn dispatch_covers_extent_in_16x16_groups() {
        let extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        assert_eq!(dispatch_size(extent), (80, 45, 1));

        let odd = vk::Extent2D {
            width: 100,
            height: 15,
        };
        assert_eq!(dispatch_size(odd), (6, 0, 1));
    }
}
