// Per-frame protocol
//
// compute: wait fence -> reset -> record dispatch -> submit (signals compute_finished)
// graphics: wait fence -> reset -> acquire -> record quad -> submit
//           (waits compute_finished + image_available, signals render_finished[image])
// present: waits render_finished[image]
//
// Each fence goes through its slot's FenceGate, so a command buffer is only
// ever recorded after the matching wait and reset.

use super::context::RenderContext;
use super::device::VulkanDevice;
use super::error::{RenderError, Result};
use super::image::{dispatch_size, Image};
use super::pipeline::Pipeline;
use super::swapchain::Acquired;
use super::sync::{FenceGate, FrameSlot};
use crate::voxel::VoxelPushConstants;
use ash::vk;

/// Outcome of a frame that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// The swapchain no longer matches the surface; call `recreate_swapchain`.
    SwapchainStale,
}

impl RenderContext {
    /// Run one frame. `elapsed` (seconds) drives the camera.
    pub fn render_frame(&mut self, elapsed: f32) -> Result<FrameStatus> {
        let dims = self.voxel_dims.ok_or(RenderError::VoxelDataMissing)?;
        let timeout = self.settings.timeout_ns();
        let device = &self.device;
        let slot = &mut self.frames[self.frame_counter.slot()];

        // Compute pass
        wait_and_reset(device, &mut slot.compute_gate, slot.compute_fence.handle(), timeout)?;

        let push = VoxelPushConstants::orbit(dims, elapsed);
        let compute = submit_compute(
            device,
            slot,
            &self.compute_pipeline,
            &self.render_target,
            &push,
        );
        if let Err(e) = compute {
            settle(device, &mut slot.compute_gate, slot.compute_fence.handle(), &[]);
            return Err(e);
        }

        // Graphics pass
        wait_and_reset(device, &mut slot.render_gate, slot.render_fence.handle(), timeout)?;

        let acquired = self
            .swapchain
            .acquire_next_image(timeout, slot.image_available.handle());
        let (image_index, suboptimal) = match acquired {
            Ok(Acquired::Image { index, suboptimal }) => (index, suboptimal),
            Ok(Acquired::OutOfDate) => {
                settle_empty(
                    device,
                    &mut slot.render_gate,
                    slot.render_fence.handle(),
                    &[slot.compute_finished.handle()],
                )?;
                return Ok(FrameStatus::SwapchainStale);
            }
            Err(e) => {
                settle(
                    device,
                    &mut slot.render_gate,
                    slot.render_fence.handle(),
                    &[slot.compute_finished.handle()],
                );
                return Err(e);
            }
        };

        let graphics = submit_graphics(
            device,
            slot,
            &self.graphics_pipeline,
            self.render_pass.handle(),
            self.framebuffers[image_index as usize].handle(),
            self.swapchain.extent,
            self.settings.clear_color,
            self.swapchain.render_finished[image_index as usize],
        );
        if let Err(e) = graphics {
            // The acquired image stays unpresented until the swapchain is rebuilt
            settle(
                device,
                &mut slot.render_gate,
                slot.render_fence.handle(),
                &[slot.compute_finished.handle(), slot.image_available.handle()],
            );
            return Err(e);
        }

        // Present
        let presented = self.swapchain.present(device.queue, image_index);
        self.frame_counter.advance();

        if presented? || suboptimal {
            Ok(FrameStatus::SwapchainStale)
        } else {
            Ok(FrameStatus::Presented)
        }
    }
}

fn wait_and_reset(
    device: &VulkanDevice,
    gate: &mut FenceGate,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<()> {
    gate.check_wait()?;
    unsafe { device.device.wait_for_fences(&[fence], true, timeout_ns) }?;
    gate.waited()?;

    unsafe { device.device.reset_fences(&[fence]) }?;
    gate.reset()
}

// Signal `fence` with an empty batch that consumes every semaphore still
// pending on the slot, leaving the gate in flight.
fn settle_empty(
    device: &VulkanDevice,
    gate: &mut FenceGate,
    fence: vk::Fence,
    waits: &[vk::Semaphore],
) -> Result<()> {
    let stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; waits.len()];
    let submit = vk::SubmitInfo::default()
        .wait_semaphores(waits)
        .wait_dst_stage_mask(&stages);

    unsafe { device.device.queue_submit(device.queue, &[submit], fence) }?;
    gate.signalled_empty()
}

/// `settle_empty` on an error path: the original error wins.
fn settle(
    device: &VulkanDevice,
    gate: &mut FenceGate,
    fence: vk::Fence,
    waits: &[vk::Semaphore],
) {
    if let Err(cleanup) = settle_empty(device, gate, fence, waits) {
        log::error!("Could not settle frame slot: {}", cleanup);
    }
}

fn submit_compute(
    device: &VulkanDevice,
    slot: &mut FrameSlot,
    pipeline: &Pipeline,
    target: &Image,
    push: &VoxelPushConstants,
) -> Result<()> {
    slot.compute_gate.begin_recording()?;
    record_compute(device, slot.compute_cmd, pipeline, target, push)?;

    let cmds = [slot.compute_cmd];
    let signals = [slot.compute_finished.handle()];
    let submit = vk::SubmitInfo::default()
        .command_buffers(&cmds)
        .signal_semaphores(&signals);
    unsafe {
        device
            .device
            .queue_submit(device.queue, &[submit], slot.compute_fence.handle())
    }?;
    slot.compute_gate.submitted()
}

#[allow(clippy::too_many_arguments)]
fn submit_graphics(
    device: &VulkanDevice,
    slot: &mut FrameSlot,
    pipeline: &Pipeline,
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    clear_color: [f32; 4],
    render_finished: vk::Semaphore,
) -> Result<()> {
    slot.render_gate.begin_recording()?;
    record_graphics(
        device,
        slot.graphics_cmd,
        pipeline,
        render_pass,
        framebuffer,
        extent,
        clear_color,
    )?;

    let wait_semaphores = [slot.compute_finished.handle(), slot.image_available.handle()];
    let wait_stages = [
        vk::PipelineStageFlags::VERTEX_INPUT,
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
    ];
    let cmds = [slot.graphics_cmd];
    let signals = [render_finished];
    let submit = vk::SubmitInfo::default()
        .wait_semaphores(&wait_semaphores)
        .wait_dst_stage_mask(&wait_stages)
        .command_buffers(&cmds)
        .signal_semaphores(&signals);
    unsafe {
        device
            .device
            .queue_submit(device.queue, &[submit], slot.render_fence.handle())
    }?;
    slot.render_gate.submitted()
}

fn record_compute(
    device: &VulkanDevice,
    cmd: vk::CommandBuffer,
    pipeline: &Pipeline,
    target: &Image,
    push: &VoxelPushConstants,
) -> Result<()> {
    let device_fn = &device.device;
    let (groups_x, groups_y, groups_z) = dispatch_size(target.extent);

    unsafe {
        device_fn.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device_fn.begin_command_buffer(cmd, &begin_info)?;

        // The previous frame may still be sampling the target, or writing it
        // when its graphics pass was skipped
        let (src_stage, dst_stage, barrier) = target_reuse_barrier();
        device_fn.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );

        pipeline.bind(cmd);
        if let Some(block) = pipeline.push_constants {
            device_fn.cmd_push_constants(
                cmd,
                pipeline.layout,
                vk::ShaderStageFlags::COMPUTE,
                block.offset,
                bytemuck::bytes_of(push),
            );
        }
        device_fn.cmd_dispatch(cmd, groups_x, groups_y, groups_z);

        device_fn.end_command_buffer(cmd)?;
    }
    Ok(())
}

/// Orders this frame's dispatch after every earlier read or write of the
/// render target.
fn target_reuse_barrier() -> (
    vk::PipelineStageFlags,
    vk::PipelineStageFlags,
    vk::MemoryBarrier<'static>,
) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::SHADER_WRITE)
        .dst_access_mask(vk::AccessFlags::SHADER_WRITE);
    (
        vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
        vk::PipelineStageFlags::COMPUTE_SHADER,
        barrier,
    )
}

fn record_graphics(
    device: &VulkanDevice,
    cmd: vk::CommandBuffer,
    pipeline: &Pipeline,
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    clear_color: [f32; 4],
) -> Result<()> {
    let device_fn = &device.device;

    unsafe {
        device_fn.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device_fn.begin_command_buffer(cmd, &begin_info)?;

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        }];
        let pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        device_fn.cmd_begin_render_pass(cmd, &pass_info, vk::SubpassContents::INLINE);
        pipeline.bind(cmd);
        // Full-screen quad from gl_VertexIndex, no buffers
        device_fn.cmd_draw(cmd, 4, 1, 0, 0);
        device_fn.cmd_end_render_pass(cmd);

        device_fn.end_command_buffer(cmd)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_reuse_waits_on_compute_as_well_as_fragment() {
        let (src, dst, barrier) = target_reuse_barrier();
        assert!(src.contains(vk::PipelineStageFlags::FRAGMENT_SHADER));
        assert!(src.contains(vk::PipelineStageFlags::COMPUTE_SHADER));
        assert_eq!(dst, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags::SHADER_WRITE);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags::SHADER_WRITE);
    }
}
