// Swapchain - Window presentation
//
// Owns the presentable image chain, one view per image and one
// "render finished" semaphore per image (presentation of image i waits on
// semaphore i, so a semaphore is never re-signalled while a present that
// waits on it is still queued).

use super::device::VulkanDevice;
use super::error::{RenderError, Result};
use super::surface::Surface;
use ash::vk;
use std::sync::Arc;

const PREFERRED_FORMATS: [vk::Format; 2] = [vk::Format::B8G8R8A8_SRGB, vk::Format::R8G8B8A8_SRGB];

/// 8-bit sRGB in the sRGB-nonlinear color space if offered, else whatever
/// the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            PREFERRED_FORMATS.contains(&f.format)
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
        .ok_or(RenderError::NoSurfaceFormat)
}

/// vsync: MAILBOX if available. No vsync: IMMEDIATE if available.
/// FIFO is always supported and is the fallback for both.
pub fn choose_present_mode(present_modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    let preferred = if vsync {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::IMMEDIATE
    };

    if present_modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded).
/// The driver may still hand back a different count.
pub fn desired_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// Result of asking the swapchain for an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub loader: ash::khr::swapchain::Device,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub render_finished: Vec<vk::Semaphore>,
    pub format: vk::Format,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    /// Build a swapchain for `surface`. Passing the previous swapchain lets
    /// the driver hand its resources over; it must still be dropped after.
    pub fn new(
        device: &Arc<VulkanDevice>,
        surface: &Surface,
        width: u32,
        height: u32,
        vsync: bool,
        old_swapchain: Option<&Swapchain>,
    ) -> Result<Self> {
        let support = surface.capabilities(device.physical_device)?;
        let caps = support.capabilities;

        let surface_format = choose_surface_format(&support.formats)?;
        let present_mode = choose_present_mode(&support.present_modes, vsync);
        let extent = choose_extent(&caps, width, height);
        let image_count = desired_image_count(&caps);

        log::info!(
            "Creating swapchain: {}x{} {:?} {:?}",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode
        );

        let loader = ash::khr::swapchain::Device::new(&device.instance.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.map_or(vk::SwapchainKHR::null(), |old| old.swapchain));

        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }?;

        // From here on Drop releases whatever has been created
        let mut chain = Self {
            swapchain,
            loader,
            images: Vec::new(),
            image_views: Vec::new(),
            render_finished: Vec::new(),
            format: surface_format.format,
            present_mode,
            extent,
            device: Arc::clone(device),
        };

        chain.images = unsafe { chain.loader.get_swapchain_images(swapchain) }?;
        log::info!(
            "Created swapchain with {} images (requested {})",
            chain.images.len(),
            image_count
        );

        for &image in &chain.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { device.device.create_image_view(&view_info, None) }?;
            chain.image_views.push(view);

            let semaphore =
                unsafe { device.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }?;
            chain.render_finished.push(semaphore);
        }

        Ok(chain)
    }

    /// Acquire the next image, signalling `semaphore` once it is available.
    pub fn acquire_next_image(&self, timeout_ns: u64, semaphore: vk::Semaphore) -> Result<Acquired> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, timeout_ns, semaphore, vk::Fence::null())
        };

        match result {
            Ok((index, suboptimal)) => Ok(Acquired::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::OutOfDate),
            // NOT_READY / TIMEOUT arrive as errors in ash
            Err(vk::Result::NOT_READY) => Err(RenderError::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    /// Present `image_index` once its render-finished semaphore signals.
    ///
    /// Returns true when the swapchain no longer matches the surface.
    pub fn present(&self, queue: vk::Queue, image_index: u32) -> Result<bool> {
        let wait_semaphores = [self.render_finished[image_index as usize]];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &semaphore in &self.render_finished {
                self.device.device.destroy_semaphore(semaphore, None);
            }
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}
