// Vulkan abstraction layer
//
// Thin wrappers over ash. Everything that owns a Vulkan object releases it
// in Drop; the render context ties them together.

pub mod buffer;
pub mod command;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod frame;
pub mod handle;
pub mod image;
pub mod instance;
pub mod pipeline;
pub mod reflect;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use context::{RenderContext, RenderSettings, ShaderPaths};
pub use device::VulkanDevice;
pub use error::{RenderError, Result};
pub use frame::FrameStatus;
pub use instance::VulkanInstance;
pub use swapchain::Swapchain;
