// Scoped device handles
//
// Wraps a plain Vulkan handle together with the call that destroys it, so a
// failing bootstrap step releases everything created before it.

use super::device::VulkanDevice;
use std::sync::Arc;

pub struct DeviceOwned<H: Copy> {
    handle: H,
    destroy: fn(&ash::Device, H),
    armed: bool,
    device: Arc<VulkanDevice>,
}

impl<H: Copy> DeviceOwned<H> {
    pub fn new(device: &Arc<VulkanDevice>, handle: H, destroy: fn(&ash::Device, H)) -> Self {
        Self {
            handle,
            destroy,
            armed: true,
            device: Arc::clone(device),
        }
    }

    pub fn handle(&self) -> H {
        self.handle
    }

    /// Give up ownership; the caller is now responsible for destruction.
    pub fn release(mut self) -> H {
        self.armed = false;
        self.handle
    }
}

impl<H: Copy> Drop for DeviceOwned<H> {
    fn drop(&mut self) {
        if self.armed {
            (self.destroy)(&self.device.device, self.handle);
        }
    }
}
