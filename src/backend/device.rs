// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Queue family selection (graphics + compute, presentation when windowed)
// - Logical device + queue creation
// - Memory allocator setup

use super::error::{RenderError, Result};
use super::instance::VulkanInstance;
use super::surface::Surface;
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::ffi::{c_char, CStr};
use std::mem::ManuallyDrop;
use std::sync::Arc;

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped by hand before the device is destroyed
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: Arc<VulkanInstance>,

    // Single queue used for compute, graphics, transfer and present
    pub queue: vk::Queue,
    pub queue_family: u32,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
}

impl VulkanDevice {
    /// Create the logical device on an already selected physical device.
    ///
    /// With a surface, the queue family must also present to it and the
    /// swapchain extension is required. Without one the device is headless.
    pub fn new(
        instance: Arc<VulkanInstance>,
        physical_device: vk::PhysicalDevice,
        properties: vk::PhysicalDeviceProperties,
        surface: Option<&Surface>,
    ) -> Result<Arc<Self>> {
        // Step 1: Find a queue family
        let families = unsafe {
            instance
                .instance
                .get_physical_device_queue_family_properties(physical_device)
        };
        let queue_family = select_queue_family(&families, |index| match surface {
            Some(surface) => surface.supports_queue_family(physical_device, index),
            None => Ok(true),
        })?;
        log::debug!("Using queue family {}", queue_family);

        // Step 2: Check device extensions
        let extensions: Vec<&CStr> = if surface.is_some() {
            vec![ash::khr::swapchain::NAME]
        } else {
            vec![]
        };
        let available = unsafe {
            instance
                .instance
                .enumerate_device_extension_properties(physical_device)
        }?;
        for required in &extensions {
            let present = available
                .iter()
                .any(|props| unsafe { CStr::from_ptr(props.extension_name.as_ptr()) } == *required);
            if !present {
                return Err(RenderError::DeviceExtensionMissing(
                    required.to_string_lossy().into_owned(),
                ));
            }
        }

        // Step 3: Create logical device
        let (device, queue) =
            Self::create_logical_device(&instance, physical_device, queue_family, &extensions)?;

        // Step 4: Create memory allocator
        let allocator = match Self::create_allocator(&instance, physical_device, &device) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            queue,
            queue_family,
            properties,
        }))
    }

    fn create_logical_device(
        instance: &VulkanInstance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        extensions: &[&CStr],
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities);

        let extension_ptrs: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extension_ptrs);

        let device = unsafe {
            instance
                .instance
                .create_device(physical_device, &create_info, None)
        }?;

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        Ok((device, queue))
    }

    fn create_allocator(
        instance: &VulkanInstance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                ..Default::default()
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        Ok(allocator)
    }

    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    /// Wait for device to be idle (e.g., before cleanup or recreation)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            // Every allocation returns its memory before the device goes away
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
    }
}

/// First queue family that can run both passes and, if asked, present.
pub fn select_queue_family<F>(families: &[vk::QueueFamilyProperties], mut presents: F) -> Result<u32>
where
    F: FnMut(u32) -> Result<bool>,
{
    let needed = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;

    for (index, family) in families.iter().enumerate() {
        let index = index as u32;
        if family.queue_count == 0 || !family.queue_flags.contains(needed) {
            continue;
        }
        if presents(index)? {
            return Ok(index);
        }
    }

    Err(RenderError::NoSuitableQueueFamily)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn picks_first_family_with_both_passes_and_presentation() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(select_queue_family(&families, |_| Ok(true)).unwrap(), 2);
        assert_eq!(select_queue_family(&families, |i| Ok(i == 3)).unwrap(), 3);
    }

    #[test]
    fn no_presenting_family_is_reported() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)];
        assert!(matches!(
            select_queue_family(&families, |_| Ok(false)),
            Err(RenderError::NoSuitableQueueFamily)
        ));
    }

    #[test]
    fn surface_query_errors_propagate() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)];
        let result = select_queue_family(&families, |_| Err(RenderError::DeviceLost));
        assert!(matches!(result, Err(RenderError::DeviceLost)));
    }
}
