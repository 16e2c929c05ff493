// Synchronization primitives
//
// Fences, semaphores and command buffers for each frame in flight, plus a
// small tracker that enforces the wait -> reset -> record -> submit order
// on every fence.

use super::command::CommandPool;
use super::device::VulkanDevice;
use super::error::{RenderError, Result};
use super::handle::DeviceOwned;
use ash::vk;
use std::sync::Arc;

/// Number of frame slots rotating round-robin
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Monotonic frame counter selecting the active slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounter {
    frame: u64,
}

impl FrameCounter {
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn slot(&self) -> usize {
        (self.frame % FRAMES_IN_FLIGHT as u64) as usize
    }

    pub fn advance(&mut self) {
        self.frame += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    /// Submitted work may still be running; the fence signals when it retires
    InFlight,
    /// Signalled, nothing pending
    Retired,
    /// Reset, waiting for a submission to signal it
    Armed,
    /// Armed and its command buffer is being recorded
    Recording,
}

/// Host-side mirror of one fence.
///
/// Fences are created signalled, so a gate starts out `Retired`.
#[derive(Debug, Clone)]
pub struct FenceGate {
    slot: usize,
    name: &'static str,
    state: FenceState,
}

impl FenceGate {
    pub fn new(slot: usize, name: &'static str) -> Self {
        Self {
            slot,
            name,
            state: FenceState::Retired,
        }
    }

    pub fn state(&self) -> FenceState {
        self.state
    }

    fn transition(&mut self, allowed: &[FenceState], next: FenceState, action: &str) -> Result<()> {
        if !allowed.contains(&self.state) {
            return Err(RenderError::FenceDiscipline {
                slot: self.slot,
                message: format!("cannot {} {} fence while {:?}", action, self.name, self.state),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Check before waiting: a fence that was reset but never submitted
    /// would never signal.
    pub fn check_wait(&self) -> Result<()> {
        match self.state {
            FenceState::InFlight | FenceState::Retired => Ok(()),
            state => Err(RenderError::FenceDiscipline {
                slot: self.slot,
                message: format!("waiting on {} fence while {:?} would never return", self.name, state),
            }),
        }
    }

    pub fn waited(&mut self) -> Result<()> {
        self.transition(&[FenceState::InFlight, FenceState::Retired], FenceState::Retired, "finish waiting on")
    }

    pub fn reset(&mut self) -> Result<()> {
        self.transition(&[FenceState::Retired], FenceState::Armed, "reset")
    }

    pub fn begin_recording(&mut self) -> Result<()> {
        self.transition(&[FenceState::Armed], FenceState::Recording, "record behind")
    }

    pub fn submitted(&mut self) -> Result<()> {
        self.transition(&[FenceState::Recording], FenceState::InFlight, "submit")
    }

    /// An empty submission signals the fence without any recorded work.
    ///
    /// Also how a slot recovers when recording or submitting failed.
    pub fn signalled_empty(&mut self) -> Result<()> {
        self.transition(&[FenceState::Armed, FenceState::Recording], FenceState::InFlight, "signal")
    }
}

/// Everything one frame in flight owns exclusively.
pub struct FrameSlot {
    pub compute_cmd: vk::CommandBuffer,
    pub graphics_cmd: vk::CommandBuffer,
    pub compute_fence: DeviceOwned<vk::Fence>,
    pub render_fence: DeviceOwned<vk::Fence>,
    pub image_available: DeviceOwned<vk::Semaphore>,
    pub compute_finished: DeviceOwned<vk::Semaphore>,
    pub compute_gate: FenceGate,
    pub render_gate: FenceGate,
}

impl FrameSlot {
    /// Command buffers come from `pool` and are freed with it.
    pub fn new(device: &Arc<VulkanDevice>, pool: &CommandPool, index: usize) -> Result<Self> {
        let buffers = pool.allocate(2)?;

        // Signalled so the first wait on each fence returns immediately
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let semaphore_info = vk::SemaphoreCreateInfo::default();

        let fence = |device: &Arc<VulkanDevice>| -> Result<DeviceOwned<vk::Fence>> {
            let fence = unsafe { device.device.create_fence(&fence_info, None) }?;
            Ok(DeviceOwned::new(device, fence, |device, fence| unsafe {
                device.destroy_fence(fence, None)
            }))
        };
        let semaphore = |device: &Arc<VulkanDevice>| -> Result<DeviceOwned<vk::Semaphore>> {
            let semaphore = unsafe { device.device.create_semaphore(&semaphore_info, None) }?;
            Ok(DeviceOwned::new(device, semaphore, |device, semaphore| unsafe {
                device.destroy_semaphore(semaphore, None)
            }))
        };

        Ok(Self {
            compute_cmd: buffers[0],
            graphics_cmd: buffers[1],
            compute_fence: fence(device)?,
            render_fence: fence(device)?,
            image_available: semaphore(device)?,
            compute_finished: semaphore(device)?,
            compute_gate: FenceGate::new(index, "compute"),
            render_gate: FenceGate::new(index, "render"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_alternate() {
        let mut counter = FrameCounter::default();
        let mut slots = Vec::new();
        for _ in 0..2 * FRAMES_IN_FLIGHT {
            slots.push(counter.slot());
            counter.advance();
        }
        assert_eq!(slots, vec![0, 1, 0, 1]);
        assert_eq!(counter.frame(), 4);
    }

    #[test]
    fn full_cycle_returns_to_in_flight() {
        let mut gate = FenceGate::new(0, "compute");
        for _ in 0..3 {
            gate.check_wait().unwrap();
            gate.waited().unwrap();
            gate.reset().unwrap();
            gate.begin_recording().unwrap();
            gate.submitted().unwrap();
            assert_eq!(gate.state(), FenceState::InFlight);
        }
    }

    #[test]
    fn recording_requires_wait_then_reset() {
        let mut gate = FenceGate::new(1, "render");
        gate.waited().unwrap();
        gate.reset().unwrap();
        gate.begin_recording().unwrap();
        gate.submitted().unwrap();

        // Still in flight: neither reset nor record may happen yet
        assert!(matches!(gate.reset(), Err(RenderError::FenceDiscipline { slot: 1, .. })));
        assert!(gate.begin_recording().is_err());

        gate.waited().unwrap();
        assert!(gate.begin_recording().is_err());
        gate.reset().unwrap();
        assert!(gate.begin_recording().is_ok());
    }

    #[test]
    fn waiting_on_an_unsubmitted_fence_is_caught() {
        let mut gate = FenceGate::new(0, "render");
        gate.waited().unwrap();
        gate.reset().unwrap();
        assert!(gate.check_wait().is_err());

        gate.signalled_empty().unwrap();
        assert!(gate.check_wait().is_ok());
    }

    #[test]
    fn failed_recording_is_settled_by_an_empty_submit() {
        let mut gate = FenceGate::new(0, "compute");
        gate.check_wait().unwrap();
        gate.waited().unwrap();
        gate.reset().unwrap();
        gate.begin_recording().unwrap();

        // Recording failed: the slot is unusable until the fence is signalled
        assert!(matches!(gate.check_wait(), Err(RenderError::FenceDiscipline { slot: 0, .. })));
        gate.signalled_empty().unwrap();

        for _ in 0..3 {
            gate.check_wait().unwrap();
            gate.waited().unwrap();
            gate.reset().unwrap();
            gate.begin_recording().unwrap();
            gate.submitted().unwrap();
        }
        assert_eq!(gate.state(), FenceState::InFlight);
    }

    #[test]
    fn settled_fences_cannot_be_settled_twice() {
        let mut gate = FenceGate::new(1, "render");
        gate.waited().unwrap();
        gate.reset().unwrap();
        gate.signalled_empty().unwrap();
        assert!(gate.signalled_empty().is_err());
    }
}
