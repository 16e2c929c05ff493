// Render context - owner of every GPU object
//
// Bootstrap is a fixed, fail-fast sequence. Each step's result is owned by a
// Drop guard, so an error partway through releases everything created so
// far in reverse order. Field order below is reverse creation order for the
// same reason.
//
// Shader binding contract:
//   voxel.comp       binding 0 storage image (render target)
//                    binding 1 storage buffer (voxel cells)
//                    push constants VoxelPushConstants
//   screenquad.vert  no resources
//   screenquad.frag  binding 0 combined image sampler (render target)

use super::buffer::{copy_to_buffer, create_buffer, Buffer, MemoryResidency};
use super::command::CommandPool;
use super::descriptor::{
    write_combined_image_sampler, write_storage_buffer, write_storage_image, DescriptorPool,
};
use super::device::VulkanDevice;
use super::error::{RenderError, Result};
use super::handle::DeviceOwned;
use super::image::{create_image, create_sampler, set_image_layout, Image, WORKGROUP_SIZE};
use super::instance::VulkanInstance;
use super::pipeline::{
    create_framebuffers, create_render_pass, require_binding, Pipeline, PipelineBuilder,
};
use super::reflect::ResourceKind;
use super::shader::{load_shader, CompiledShader, ShaderCompiler, ShaderStage};
use super::surface::{self, Surface};
use super::swapchain::Swapchain;
use super::sync::{FrameCounter, FrameSlot, FRAMES_IN_FLIGHT};
use crate::voxel::{VoxelGrid, VoxelPushConstants};
use ash::vk;
use glam::UVec3;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const RENDER_TARGET_BINDING: u32 = 0;
pub const VOXEL_CELLS_BINDING: u32 = 1;
pub const QUAD_TEXTURE_BINDING: u32 = 0;

pub const RENDER_TARGET_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

#[derive(Debug, Clone)]
pub struct ShaderPaths {
    pub voxel: PathBuf,
    pub quad_vertex: PathBuf,
    pub quad_fragment: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub app_name: String,
    pub vsync: bool,
    pub clear_color: [f32; 4],
    pub frame_timeout: Duration,
    pub allow_integrated_gpu: bool,
    pub validation: bool,
    pub shaders: ShaderPaths,
}

impl RenderSettings {
    pub fn timeout_ns(&self) -> u64 {
        u64::try_from(self.frame_timeout.as_nanos()).unwrap_or(u64::MAX)
    }
}

pub struct RenderContext {
    pub(super) voxel_buffer: Option<Buffer>,
    pub(super) frames: Vec<FrameSlot>,
    pub(super) sampler: DeviceOwned<vk::Sampler>,
    pub(super) render_target: Image,
    pub(super) graphics_pipeline: Pipeline,
    pub(super) compute_pipeline: Pipeline,
    pub(super) framebuffers: Vec<DeviceOwned<vk::Framebuffer>>,
    pub(super) render_pass: DeviceOwned<vk::RenderPass>,
    pub(super) descriptor_pool: Arc<DescriptorPool>,
    pub(super) command_pool: CommandPool,
    pub(super) swapchain: Swapchain,
    pub(super) device: Arc<VulkanDevice>,
    pub(super) surface: Surface,
    pub(super) _instance: Arc<VulkanInstance>,

    pub(super) quad_shaders: Vec<CompiledShader>,
    pub(super) voxel_dims: Option<UVec3>,
    pub(super) frame_counter: FrameCounter,
    pub(super) settings: RenderSettings,
}

impl RenderContext {
    pub fn new<W>(
        window: &W,
        width: u32,
        height: u32,
        settings: RenderSettings,
        compiler: &dyn ShaderCompiler,
    ) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        log::info!("Initializing render context...");

        // Entry points, extension/layer checks, instance
        let required = surface::required_extensions(window)?;
        let instance = VulkanInstance::new(&settings.app_name, &required, settings.validation)?;

        let (physical_device, properties) =
            instance.pick_physical_device(settings.allow_integrated_gpu)?;

        let surface = Surface::new(Arc::clone(&instance), window)?;

        // Queue family, logical device, allocator
        let device = VulkanDevice::new(
            Arc::clone(&instance),
            physical_device,
            properties,
            Some(&surface),
        )?;

        let swapchain = Swapchain::new(&device, &surface, width, height, settings.vsync, None)?;

        let command_pool = CommandPool::new(&device)?;
        let descriptor_pool = DescriptorPool::new(&device)?;

        let render_pass = create_render_pass(&device, swapchain.format)?;
        let framebuffers = create_framebuffers(
            &device,
            &swapchain.image_views,
            render_pass.handle(),
            swapchain.extent,
        )?;

        // Pipelines, laid out from reflection
        let builder = PipelineBuilder::new(&device, &descriptor_pool);

        let voxel_shader = load_shader(compiler, &settings.shaders.voxel)?;
        check_compute_contract(&voxel_shader)?;
        let compute_pipeline = builder.compute(&voxel_shader)?;

        let quad_shaders = vec![
            load_shader(compiler, &settings.shaders.quad_vertex)?,
            load_shader(compiler, &settings.shaders.quad_fragment)?,
        ];
        check_graphics_contract(&quad_shaders)?;
        let graphics_pipeline =
            builder.graphics(&quad_shaders, render_pass.handle(), swapchain.extent)?;

        // Offscreen target written by compute, sampled by the quad
        let render_target = create_render_target(&device, swapchain.extent)?;
        let sampler = create_sampler(&device)?;
        bind_render_target(
            &device,
            &compute_pipeline,
            &graphics_pipeline,
            &render_target,
            sampler.handle(),
        );

        let frames = (0..FRAMES_IN_FLIGHT)
            .map(|index| FrameSlot::new(&device, &command_pool, index))
            .collect::<Result<Vec<_>>>()?;

        command_pool.submit_one_shot(settings.timeout_ns(), |device, cmd| {
            set_image_layout(
                device,
                cmd,
                render_target.image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
            )
        })?;

        log::info!("Render context ready");

        Ok(Self {
            voxel_buffer: None,
            frames,
            sampler,
            render_target,
            graphics_pipeline,
            compute_pipeline,
            framebuffers,
            render_pass,
            descriptor_pool,
            command_pool,
            swapchain,
            device,
            surface,
            _instance: instance,
            quad_shaders,
            voxel_dims: None,
            frame_counter: FrameCounter::default(),
            settings,
        })
    }

    /// Upload the voxel grid and bind it to the compute pass.
    ///
    /// Replacing an existing grid waits for the device to go idle first.
    pub fn upload_voxel_data(&mut self, grid: &VoxelGrid) -> Result<()> {
        if self.voxel_buffer.is_some() {
            self.device.wait_idle()?;
        }

        let bytes = grid.as_bytes();
        let buffer = create_buffer(
            &self.device,
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryResidency::DeviceLocal,
            "voxel cells",
        )?;
        copy_to_buffer(
            &self.device,
            &self.command_pool,
            &buffer,
            bytes,
            self.settings.timeout_ns(),
        )?;

        write_storage_buffer(
            &self.device,
            self.compute_pipeline.descriptor_set,
            VOXEL_CELLS_BINDING,
            buffer.buffer,
        );

        let dims = grid.dims();
        log::info!(
            "Uploaded {}x{}x{} voxel grid ({} filled)",
            dims.x,
            dims.y,
            dims.z,
            grid.filled()
        );

        self.voxel_buffer = Some(buffer);
        self.voxel_dims = Some(dims);
        Ok(())
    }

    /// Rebuild everything that depends on the surface size.
    ///
    /// Returns false (and does nothing) for a zero-sized window.
    pub fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<bool> {
        if width == 0 || height == 0 {
            return Ok(false);
        }

        self.device.wait_idle()?;

        let swapchain = Swapchain::new(
            &self.device,
            &self.surface,
            width,
            height,
            self.settings.vsync,
            Some(&self.swapchain),
        )?;

        if swapchain.format != self.swapchain.format {
            log::info!("Surface format changed to {:?}", swapchain.format);
            self.render_pass = create_render_pass(&self.device, swapchain.format)?;
        }
        self.framebuffers = create_framebuffers(
            &self.device,
            &swapchain.image_views,
            self.render_pass.handle(),
            swapchain.extent,
        )?;

        // Viewport and scissor are baked into the pipeline
        let builder = PipelineBuilder::new(&self.device, &self.descriptor_pool);
        self.graphics_pipeline =
            builder.graphics(&self.quad_shaders, self.render_pass.handle(), swapchain.extent)?;

        if swapchain.extent != self.render_target.extent {
            self.render_target = create_render_target(&self.device, swapchain.extent)?;
            let image = self.render_target.image;
            self.command_pool
                .submit_one_shot(self.settings.timeout_ns(), |device, cmd| {
                    set_image_layout(
                        device,
                        cmd,
                        image,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::GENERAL,
                    )
                })?;
        }
        bind_render_target(
            &self.device,
            &self.compute_pipeline,
            &self.graphics_pipeline,
            &self.render_target,
            self.sampler.handle(),
        );

        self.swapchain = swapchain;
        Ok(true)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.swapchain.present_mode
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_counter.frame()
    }

    pub fn device_name(&self) -> String {
        let name = &self.device.properties.device_name;
        unsafe { std::ffi::CStr::from_ptr(name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        log::info!("Shutting down render context...");
        // Nothing may still be executing when the fields start dropping
        let _ = self.device.wait_idle();
    }
}

fn create_render_target(device: &Arc<VulkanDevice>, extent: vk::Extent2D) -> Result<Image> {
    if extent.width % WORKGROUP_SIZE != 0 || extent.height % WORKGROUP_SIZE != 0 {
        log::warn!(
            "Render target {}x{} is not a multiple of {}; edge pixels will not be written",
            extent.width,
            extent.height,
            WORKGROUP_SIZE
        );
    }

    create_image(
        device,
        RENDER_TARGET_FORMAT,
        vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
        extent.width,
        extent.height,
        "render target",
    )
}

fn bind_render_target(
    device: &VulkanDevice,
    compute: &Pipeline,
    graphics: &Pipeline,
    target: &Image,
    sampler: vk::Sampler,
) {
    write_storage_image(device, compute.descriptor_set, RENDER_TARGET_BINDING, target.view);
    write_combined_image_sampler(
        device,
        graphics.descriptor_set,
        QUAD_TEXTURE_BINDING,
        target.view,
        sampler,
    );
}

/// voxel.comp must expose the render target, the cells and room for the push constants.
pub fn check_compute_contract(shader: &CompiledShader) -> Result<()> {
    require_binding(shader, RENDER_TARGET_BINDING, ResourceKind::StorageImage)?;
    require_binding(shader, VOXEL_CELLS_BINDING, ResourceKind::StorageBuffer)?;

    let size = std::mem::size_of::<VoxelPushConstants>() as u32;
    let available = shader
        .reflection
        .push_constants
        .map_or(0, |block| block.offset + block.size);
    if size > available {
        return Err(RenderError::PushConstantTooLarge { size, available });
    }
    Ok(())
}

/// The quad's fragment stage must sample the render target.
pub fn check_graphics_contract(shaders: &[CompiledShader]) -> Result<()> {
    match shaders.iter().find(|s| s.stage == ShaderStage::Fragment) {
        Some(fragment) => require_binding(fragment, QUAD_TEXTURE_BINDING, ResourceKind::CombinedImageSampler),
        None => Err(RenderError::MissingBinding {
            shader: "fragment stage".into(),
            binding: QUAD_TEXTURE_BINDING,
            expected: ResourceKind::CombinedImageSampler.describe(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::reflect::{PushConstantBlock, ReflectedResource, ShaderReflection};

    fn compiled(
        name: &str,
        stage: ShaderStage,
        resources: &[(u32, ResourceKind)],
        push_constants: Option<PushConstantBlock>,
    ) -> CompiledShader {
        CompiledShader {
            path: PathBuf::from(name),
            stage,
            code: Vec::new(),
            reflection: ShaderReflection {
                resources: resources
                    .iter()
                    .map(|&(binding, kind)| ReflectedResource {
                        binding,
                        kind,
                        count: 1,
                    })
                    .collect(),
                push_constants,
            },
        }
    }

    const VOXEL_BINDINGS: [(u32, ResourceKind); 2] = [
        (0, ResourceKind::StorageImage),
        (1, ResourceKind::StorageBuffer),
    ];

    #[test]
    fn compute_contract_accepts_the_voxel_layout() {
        let shader = compiled(
            "voxel.comp",
            ShaderStage::Compute,
            &VOXEL_BINDINGS,
            Some(PushConstantBlock { offset: 0, size: 32 }),
        );
        assert!(check_compute_contract(&shader).is_ok());
    }

    #[test]
    fn compute_contract_needs_push_constant_room() {
        let small = compiled(
            "voxel.comp",
            ShaderStage::Compute,
            &VOXEL_BINDINGS,
            Some(PushConstantBlock { offset: 0, size: 16 }),
        );
        assert!(matches!(
            check_compute_contract(&small),
            Err(RenderError::PushConstantTooLarge {
                size: 32,
                available: 16
            })
        ));

        let none = compiled("voxel.comp", ShaderStage::Compute, &VOXEL_BINDINGS, None);
        assert!(check_compute_contract(&none).is_err());
    }

    #[test]
    fn compute_contract_needs_voxel_buffer() {
        let shader = compiled(
            "voxel.comp",
            ShaderStage::Compute,
            &VOXEL_BINDINGS[..1],
            Some(PushConstantBlock { offset: 0, size: 32 }),
        );
        assert!(matches!(
            check_compute_contract(&shader),
            Err(RenderError::MissingBinding { binding: 1, .. })
        ));
    }

    #[test]
    fn graphics_contract_looks_at_fragment_stage() {
        let vert = compiled("screenquad.vert", ShaderStage::Vertex, &[], None);
        let frag = compiled(
            "screenquad.frag",
            ShaderStage::Fragment,
            &[(0, ResourceKind::CombinedImageSampler)],
            None,
        );
        assert!(check_graphics_contract(&[vert.clone(), frag]).is_ok());
        assert!(check_graphics_contract(&[vert]).is_err());
    }

    #[test]
    fn timeout_saturates() {
        let mut settings = RenderSettings {
            app_name: "test".into(),
            vsync: true,
            clear_color: [0.0; 4],
            frame_timeout: Duration::from_millis(5000),
            allow_integrated_gpu: false,
            validation: false,
            shaders: ShaderPaths {
                voxel: PathBuf::new(),
                quad_vertex: PathBuf::new(),
                quad_fragment: PathBuf::new(),
            },
        };
        assert_eq!(settings.timeout_ns(), 5_000_000_000);

        settings.frame_timeout = Duration::MAX;
        assert_eq!(settings.timeout_ns(), u64::MAX);
    }
}
