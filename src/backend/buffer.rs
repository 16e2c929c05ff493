// GPU buffers and host <-> device transfers
//
// A Buffer owns its allocation; both go away together in Drop.
// Uploads go through a host-visible staging buffer and a one-shot copy.

use super::command::CommandPool;
use super::device::VulkanDevice;
use super::error::{RenderError, Result};
use super::handle::DeviceOwned;
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::{AllocationError, MemoryLocation};
use std::sync::Arc;

/// Where a buffer's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryResidency {
    /// Device-local only; filled through transfers
    DeviceLocal,
    /// CPU-writable, GPU-readable (staging, per-frame uploads)
    HostVisible,
    /// GPU-writable, CPU-readable
    Readback,
}

impl MemoryResidency {
    pub fn location(self) -> MemoryLocation {
        match self {
            MemoryResidency::DeviceLocal => MemoryLocation::GpuOnly,
            MemoryResidency::HostVisible => MemoryLocation::CpuToGpu,
            MemoryResidency::Readback => MemoryLocation::GpuToCpu,
        }
    }
}

pub struct Buffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    residency: MemoryResidency,
    device: Arc<VulkanDevice>,
}

/// Create a buffer of exactly `size` bytes backed by memory of the given residency.
pub fn create_buffer(
    device: &Arc<VulkanDevice>,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    residency: MemoryResidency,
    name: &str,
) -> Result<Buffer> {
    if size == 0 {
        return Err(AllocationError::InvalidAllocationCreateDesc.into());
    }

    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = DeviceOwned::new(
        device,
        unsafe { device.device.create_buffer(&buffer_info, None) }?,
        |device, buffer| unsafe { device.destroy_buffer(buffer, None) },
    );

    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer.handle()) };

    let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
        name,
        requirements,
        location: residency.location(),
        linear: true,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    })?;

    let bound = unsafe {
        device
            .device
            .bind_buffer_memory(buffer.handle(), allocation.memory(), allocation.offset())
    };
    if let Err(e) = bound {
        let _ = device.allocator().lock().free(allocation);
        return Err(e.into());
    }

    log::debug!("Created buffer '{}' ({} bytes, {:?})", name, size, residency);

    Ok(Buffer {
        buffer: buffer.release(),
        allocation: Some(allocation),
        size,
        residency,
        device: Arc::clone(device),
    })
}

impl Buffer {
    /// Requested size in bytes (the allocation may be larger)
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn residency(&self) -> MemoryResidency {
        self.residency
    }

    /// Copy `data` into the start of a host-visible buffer and flush it.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        check_copy_bounds(data.len() as u64, self.size)?;
        if data.is_empty() {
            return Ok(());
        }

        let allocation = self.allocation.as_mut().ok_or(RenderError::BufferNotMapped)?;
        let mapped = allocation
            .mapped_slice_mut()
            .ok_or(RenderError::BufferNotMapped)?;
        mapped[..data.len()].copy_from_slice(data);

        self.sync_host_range(data.len() as u64, true)
    }

    /// Copy the first `length` bytes of a host-visible buffer out.
    pub fn read(&self, length: u64) -> Result<Vec<u8>> {
        check_copy_bounds(length, self.size)?;
        self.sync_host_range(length, false)?;

        let allocation = self.allocation.as_ref().ok_or(RenderError::BufferNotMapped)?;
        let mapped = allocation.mapped_slice().ok_or(RenderError::BufferNotMapped)?;
        Ok(mapped[..length as usize].to_vec())
    }

    // Flush (host wrote) or invalidate (device wrote) non-coherent memory.
    fn sync_host_range(&self, length: u64, host_wrote: bool) -> Result<()> {
        let Some(allocation) = self.allocation.as_ref() else {
            return Ok(());
        };
        if length == 0
            || allocation
                .memory_properties()
                .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return Ok(());
        }

        let atom = self.device.properties.limits.non_coherent_atom_size;
        let (offset, size) = aligned_range(allocation.offset(), length, atom);
        let range = vk::MappedMemoryRange::default()
            .memory(unsafe { allocation.memory() })
            .offset(offset)
            .size(size);

        unsafe {
            if host_wrote {
                self.device.device.flush_mapped_memory_ranges(&[range])?;
            } else {
                self.device.device.invalidate_mapped_memory_ranges(&[range])?;
            }
        }
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().lock().free(allocation) {
                log::error!("Failed to free buffer allocation: {}", e);
            }
        }
    }
}

/// Upload `data` into `dst` at offset 0 and wait for the transfer to finish.
///
/// The staging buffer lives only for the duration of this call.
pub fn copy_to_buffer(
    device: &Arc<VulkanDevice>,
    pool: &CommandPool,
    dst: &Buffer,
    data: &[u8],
    timeout_ns: u64,
) -> Result<()> {
    let length = data.len() as u64;
    check_copy_bounds(length, dst.size())?;
    if length == 0 {
        return Ok(());
    }

    let mut staging = create_buffer(
        device,
        length,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryResidency::HostVisible,
        "staging",
    )?;
    staging.write(data)?;

    pool.submit_one_shot(timeout_ns, |device, cmd| {
        let region = vk::BufferCopy::default().size(length);
        let barrier = upload_barrier(dst.buffer, length);
        unsafe {
            device.cmd_copy_buffer(cmd, staging.buffer, dst.buffer, &[region]);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
    })
}

/// Copy the whole of `src` back to the host.
///
/// `src` must have been created with TRANSFER_SRC usage.
pub fn read_buffer(
    device: &Arc<VulkanDevice>,
    pool: &CommandPool,
    src: &Buffer,
    timeout_ns: u64,
) -> Result<Vec<u8>> {
    let length = src.size();
    let readback = create_buffer(
        device,
        length,
        vk::BufferUsageFlags::TRANSFER_DST,
        MemoryResidency::Readback,
        "readback",
    )?;

    pool.submit_one_shot(timeout_ns, |device, cmd| {
        let region = vk::BufferCopy::default().size(length);
        let barrier = readback_barrier(readback.buffer, length);
        unsafe {
            device.cmd_copy_buffer(cmd, src.buffer, readback.buffer, &[region]);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
    })?;

    readback.read(length)
}

/// Transfer writes into `buffer` become visible to compute shader reads.
fn upload_barrier(buffer: vk::Buffer, size: u64) -> vk::BufferMemoryBarrier<'static> {
    transfer_write_barrier(buffer, size, vk::AccessFlags::SHADER_READ)
}

/// Transfer writes into `buffer` become visible to the host.
fn readback_barrier(buffer: vk::Buffer, size: u64) -> vk::BufferMemoryBarrier<'static> {
    transfer_write_barrier(buffer, size, vk::AccessFlags::HOST_READ)
}

fn transfer_write_barrier(
    buffer: vk::Buffer,
    size: u64,
    dst_access: vk::AccessFlags,
) -> vk::BufferMemoryBarrier<'static> {
    vk::BufferMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(0)
        .size(size)
}

fn check_copy_bounds(length: u64, capacity: u64) -> Result<()> {
    if length > capacity {
        return Err(RenderError::CopyOutOfBounds { length, capacity });
    }
    Ok(())
}

/// Widen `[offset, offset + length)` to multiples of `atom`.
fn aligned_range(offset: u64, length: u64, atom: u64) -> (u64, u64) {
    let atom = atom.max(1);
    let start = offset / atom * atom;
    let end = (offset + length).div_ceil(atom) * atom;
    (start, end - start)
}
