// Renderer error taxonomy
//
// Bootstrap failures are configuration/environment problems and abort
// startup. Per-frame failures (timeout, device loss, stale swapchain) are
// typed so the application can decide between recreation and exit.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("failed to load Vulkan entry points: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("required instance extension not present: {0}")]
    ExtensionMissing(String),

    #[error("required instance layer not present: {0}")]
    LayerMissing(String),

    #[error("no suitable physical device found")]
    NoSuitableDevice,

    #[error("surface creation failed: {0}")]
    SurfaceCreationFailed(String),

    #[error("no queue family supports graphics/compute and presentation")]
    NoSuitableQueueFamily,

    #[error("required device extension not present: {0}")]
    DeviceExtensionMissing(String),

    #[error("driver error: {0}")]
    UnknownDriverError(vk::Result),

    #[error("GPU memory allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    #[error("cannot infer shader stage from {}", .0.display())]
    UnknownShaderStage(PathBuf),

    #[error("failed to read shader {}: {source}", .path.display())]
    ShaderIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to compile shader {}: {message}", .path.display())]
    ShaderCompilation { path: PathBuf, message: String },

    #[error("shader reflection failed: {0}")]
    Reflection(String),

    #[error("descriptor pool budget exceeded: {0}")]
    DescriptorBudgetExceeded(String),

    #[error("shader {shader} does not declare binding {binding} as {expected}")]
    MissingBinding {
        shader: String,
        binding: u32,
        expected: &'static str,
    },

    #[error("push constants of {size} bytes exceed the reflected range of {available} bytes")]
    PushConstantTooLarge { size: u32, available: u32 },

    #[error("surface reports no formats")]
    NoSurfaceFormat,

    #[error("copy of {length} bytes does not fit a buffer of {capacity} bytes")]
    CopyOutOfBounds { length: u64, capacity: u64 },

    #[error("buffer memory is not host visible")]
    BufferNotMapped,

    #[error("invalid voxel grid: {0}")]
    InvalidVoxelGrid(String),

    #[error("voxel data has not been uploaded")]
    VoxelDataMissing,

    #[error("frame slot {slot}: {message}")]
    FenceDiscipline { slot: usize, message: String },

    #[error("timed out waiting for the GPU")]
    Timeout,

    #[error("GPU device lost")]
    DeviceLost,

    #[error("swapchain is out of date")]
    SwapchainOutOfDate,
}

impl From<vk::Result> for RenderError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::TIMEOUT => RenderError::Timeout,
            vk::Result::ERROR_DEVICE_LOST => RenderError::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => RenderError::SwapchainOutOfDate,
            vk::Result::ERROR_EXTENSION_NOT_PRESENT => {
                RenderError::ExtensionMissing("reported by driver".to_string())
            }
            other => RenderError::UnknownDriverError(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, RenderError>;
