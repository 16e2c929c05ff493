// Vulkan Instance - API entry point and GPU discovery
//
// Responsibilities:
// - Dynamic loading of the Vulkan library
// - Instance extension / validation layer presence checks
// - Instance creation with an optional debug messenger
// - Physical device selection (discrete first, optional fallback tier)

use super::error::{RenderError, Result};
use ash::{vk, Entry};
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Owns the loaded entry points, the instance and (optionally) the
/// validation messenger. Destroyed last, after every device object.
pub struct VulkanInstance {
    pub instance: ash::Instance,
    pub entry: Entry,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create the instance.
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `required_extensions` - Extensions the windowing system needs (empty when headless)
    /// * `enable_validation` - Require and enable the Khronos validation layer
    pub fn new(
        app_name: &str,
        required_extensions: &[&CStr],
        enable_validation: bool,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan instance: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }?;

        // Step 2: Every windowing extension must be supported
        let mut extensions: Vec<&CStr> = required_extensions.to_vec();
        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME);
        }
        let available = unsafe { entry.enumerate_instance_extension_properties(None) }?;
        let available_names: Vec<&CStr> = available
            .iter()
            .map(|props| unsafe { CStr::from_ptr(props.extension_name.as_ptr()) })
            .collect();
        if let Some(missing) = first_missing(&extensions, &available_names) {
            return Err(RenderError::ExtensionMissing(missing.to_string_lossy().into_owned()));
        }

        // Step 3: Validation layer (debug builds only, decided by the caller)
        let layers: Vec<&CStr> = if enable_validation {
            vec![VALIDATION_LAYER]
        } else {
            vec![]
        };
        let available_layers = unsafe { entry.enumerate_instance_layer_properties() }?;
        let layer_names: Vec<&CStr> = available_layers
            .iter()
            .map(|props| unsafe { CStr::from_ptr(props.layer_name.as_ptr()) })
            .collect();
        if let Some(missing) = first_missing(&layers, &layer_names) {
            return Err(RenderError::LayerMissing(missing.to_string_lossy().into_owned()));
        }

        // Step 4: Create instance
        let instance = Self::create_instance(&entry, app_name, &extensions, &layers)?;

        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Arc::new(Self {
            instance,
            entry,
            debug_utils,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        extensions: &[&CStr],
        layers: &[&CStr],
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name).unwrap_or_else(|_| CString::from(c"voxel"));
        let engine_name = c"Voxel Renderer";

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let extension_ptrs: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();
        let layer_ptrs: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None) }?;
        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    /// Enumerate physical devices and pick one according to the policy.
    pub fn pick_physical_device(
        &self,
        allow_fallback: bool,
    ) -> Result<(vk::PhysicalDevice, vk::PhysicalDeviceProperties)> {
        let devices = unsafe { self.instance.enumerate_physical_devices() }?;

        let candidates: Vec<DeviceCandidate> = devices
            .iter()
            .map(|&device| {
                let props = unsafe { self.instance.get_physical_device_properties(device) };
                DeviceCandidate {
                    name: unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                        .to_string_lossy()
                        .into_owned(),
                    device_type: props.device_type,
                }
            })
            .collect();

        for candidate in &candidates {
            log::debug!("Found GPU: {} ({:?})", candidate.name, candidate.device_type);
        }

        let index = select_physical_device(&candidates, allow_fallback)?;
        let device = devices[index];
        let properties = unsafe { self.instance.get_physical_device_properties(device) };

        log::info!("Selected GPU: {}", candidates[index].name);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        Ok((device, properties))
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// What selection needs to know about a physical device.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
}

/// Pick the highest scoring device.
///
/// Discrete GPUs always win. Other device types are only eligible when
/// `allow_fallback` is set; otherwise a machine without a discrete GPU
/// yields `NoSuitableDevice`. Ties resolve to the first enumerated device.
pub fn select_physical_device(candidates: &[DeviceCandidate], allow_fallback: bool) -> Result<usize> {
    let mut best: Option<(usize, u32)> = None;

    for (index, candidate) in candidates.iter().enumerate() {
        let score = match candidate.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            _ if !allow_fallback => continue,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
            vk::PhysicalDeviceType::CPU => 1,
            _ => continue,
        };

        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((index, score));
        }
    }

    best.map(|(index, _)| index).ok_or(RenderError::NoSuitableDevice)
}

/// First name in `required` that does not appear in `available`.
pub fn first_missing<'a>(required: &[&'a CStr], available: &[&CStr]) -> Option<&'a CStr> {
    required
        .iter()
        .copied()
        .find(|name| !available.contains(name))
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, device_type: vk::PhysicalDeviceType) -> DeviceCandidate {
        DeviceCandidate {
            name: name.to_string(),
            device_type,
        }
    }

    #[test]
    fn first_discrete_gpu_is_selected() {
        let candidates = [
            candidate("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU),
            candidate("dgpu-a", vk::PhysicalDeviceType::DISCRETE_GPU),
            candidate("dgpu-b", vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        assert_eq!(select_physical_device(&candidates, false).unwrap(), 1);
        assert_eq!(select_physical_device(&candidates, true).unwrap(), 1);
    }

    #[test]
    fn zero_discrete_gpus_is_no_suitable_device() {
        let candidates = [
            candidate("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU),
            candidate("llvmpipe", vk::PhysicalDeviceType::CPU),
        ];
        assert!(matches!(
            select_physical_device(&candidates, false),
            Err(RenderError::NoSuitableDevice)
        ));
        assert!(matches!(
            select_physical_device(&[], true),
            Err(RenderError::NoSuitableDevice)
        ));
    }

    #[test]
    fn fallback_tier_prefers_integrated_over_cpu() {
        let candidates = [
            candidate("llvmpipe", vk::PhysicalDeviceType::CPU),
            candidate("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU),
        ];
        assert_eq!(select_physical_device(&candidates, true).unwrap(), 1);
    }

    #[test]
    fn missing_extension_is_reported_by_name() {
        let required = [c"VK_KHR_surface", c"VK_KHR_xlib_surface"];
        let available = [c"VK_KHR_surface", c"VK_EXT_debug_utils"];
        assert_eq!(first_missing(&required, &available), Some(c"VK_KHR_xlib_surface"));
        assert_eq!(first_missing(&required[..1], &available), None);
    }
}
