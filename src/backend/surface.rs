// Presentation surface
//
// Binds the instance to a native window. The window itself (event loop,
// polling) belongs to the application; only its raw handles cross over.

use super::error::{RenderError, Result};
use super::instance::VulkanInstance;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::CStr;
use std::sync::Arc;

pub struct Surface {
    pub surface: vk::SurfaceKHR,
    pub loader: ash::khr::surface::Instance,
    _instance: Arc<VulkanInstance>,
}

/// Instance extensions the window's display needs for surface creation.
pub fn required_extensions<W: HasDisplayHandle>(window: &W) -> Result<Vec<&'static CStr>> {
    let display = window
        .display_handle()
        .map_err(|e| RenderError::SurfaceCreationFailed(format!("display handle: {e}")))?;

    let extensions = ash_window::enumerate_required_extensions(display.as_raw())
        .map_err(|_| RenderError::ExtensionMissing("no surface extensions for this platform".into()))?;

    Ok(extensions
        .iter()
        .map(|&name| unsafe { CStr::from_ptr(name) })
        .collect())
}

impl Surface {
    pub fn new<W>(instance: Arc<VulkanInstance>, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| RenderError::SurfaceCreationFailed(format!("display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| RenderError::SurfaceCreationFailed(format!("window handle: {e}")))?;

        let surface = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.instance,
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| RenderError::SurfaceCreationFailed(e.to_string()))?;

        let loader = ash::khr::surface::Instance::new(&instance.entry, &instance.instance);

        Ok(Self {
            surface,
            loader,
            _instance: instance,
        })
    }

    /// Whether a queue family of `physical_device` can present to this surface.
    pub fn supports_queue_family(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<bool> {
        let supported = unsafe {
            self.loader.get_physical_device_surface_support(
                physical_device,
                queue_family,
                self.surface,
            )
        }?;
        Ok(supported)
    }

    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .loader
                    .get_physical_device_surface_capabilities(physical_device, self.surface)?,
                formats: self
                    .loader
                    .get_physical_device_surface_formats(physical_device, self.surface)?,
                present_modes: self
                    .loader
                    .get_physical_device_surface_present_modes(physical_device, self.surface)?,
            })
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.surface, None) };
    }
}

/// Snapshot of what the surface offers on the selected device.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}
