//! Compute-driven voxel renderer on Vulkan.
//!
//! Each frame a compute shader ray-marches a dense voxel grid into an
//! offscreen image, and a full-screen quad pass copies that image to the
//! swapchain.

pub mod backend;
pub mod config;
pub mod voxel;
