// Command pool and one-shot submissions
//
// The pool is created with RESET_COMMAND_BUFFER so frame slots can re-record
// their buffers individually. One-shot work (uploads, layout transitions)
// blocks the calling thread on a fence; it is bootstrap-only.

use super::device::VulkanDevice;
use super::error::Result;
use super::handle::DeviceOwned;
use ash::vk;
use std::sync::Arc;

pub struct CommandPool {
    pub pool: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }?;

        Ok(Self {
            pool,
            device: Arc::clone(device),
        })
    }

    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }?;
        Ok(buffers)
    }

    /// Record `record` into a fresh command buffer, submit it and block until
    /// it has retired (or `timeout_ns` elapses).
    pub fn submit_one_shot<F>(&self, timeout_ns: u64, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = &self.device.device;
        let cmd = self.allocate(1)?[0];
        let result = self.run_one_shot(cmd, timeout_ns, record);
        unsafe { device.free_command_buffers(self.pool, &[cmd]) };
        result
    }

    fn run_one_shot<F>(&self, cmd: vk::CommandBuffer, timeout_ns: u64, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = &self.device.device;

        let fence = DeviceOwned::new(
            &self.device,
            unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }?,
            |device, fence| unsafe { device.destroy_fence(fence, None) },
        );

        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(cmd, &begin_info)?;
            record(device, cmd);
            device.end_command_buffer(cmd)?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            device.queue_submit(self.device.queue, &[submit_info], fence.handle())?;

            // The fence must retire before the command buffer (and anything it
            // references, e.g. a staging buffer) is released.
            if let Err(e) = device.wait_for_fences(&[fence.handle()], true, timeout_ns) {
                let _ = self.device.wait_idle();
                return Err(e.into());
            }
        }

        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Also frees every command buffer allocated from it
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}
