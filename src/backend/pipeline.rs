// Pipeline creation
//
// Descriptor set layouts are derived from shader reflection, never declared
// by hand: the graphics pipeline takes the fragment stage's combined image
// samplers, the compute pipeline its storage images and storage buffers plus
// the push constant block.

use super::descriptor::{layout_bindings, DescriptorPool};
use super::device::VulkanDevice;
use super::error::{RenderError, Result};
use super::handle::DeviceOwned;
use super::reflect::{PushConstantBlock, ReflectedResource, ResourceKind, ShaderReflection};
use super::shader::{create_shader_module, load_shader, CompiledShader, ShaderCompiler, ShaderStage};
use ash::vk;
use std::path::Path;
use std::sync::Arc;

const ENTRY_POINT: &std::ffi::CStr = c"main";

const GRAPHICS_RESOURCES: &[ResourceKind] = &[ResourceKind::CombinedImageSampler];
const COMPUTE_RESOURCES: &[ResourceKind] = &[ResourceKind::StorageImage, ResourceKind::StorageBuffer];

/// Single subpass, one color attachment that ends up presentable.
pub fn create_render_pass(
    device: &Arc<VulkanDevice>,
    format: vk::Format,
) -> Result<DeviceOwned<vk::RenderPass>> {
    let color_attachment = vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

    let color_refs = [vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];

    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);

    // The layout transition out of UNDEFINED waits for the acquire semaphore,
    // which is signalled at COLOR_ATTACHMENT_OUTPUT.
    let dependency = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE);

    let attachments = [color_attachment];
    let subpasses = [subpass];
    let dependencies = [dependency];
    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    let render_pass = unsafe { device.device.create_render_pass(&render_pass_info, None) }?;
    Ok(DeviceOwned::new(device, render_pass, |device, render_pass| unsafe {
        device.destroy_render_pass(render_pass, None)
    }))
}

/// One framebuffer per swapchain image view
pub fn create_framebuffers(
    device: &Arc<VulkanDevice>,
    image_views: &[vk::ImageView],
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<Vec<DeviceOwned<vk::Framebuffer>>> {
    image_views
        .iter()
        .map(|&view| {
            let attachments = [view];
            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let framebuffer = unsafe { device.device.create_framebuffer(&framebuffer_info, None) }?;
            Ok(DeviceOwned::new(device, framebuffer, |device, framebuffer| unsafe {
                device.destroy_framebuffer(framebuffer, None)
            }))
        })
        .collect()
}

/// Pipeline plus everything derived for it: set layout, one descriptor set
/// and the pipeline layout. Immutable once built.
pub struct Pipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub set_layout: vk::DescriptorSetLayout,
    pub descriptor_set: vk::DescriptorSet,
    pub bind_point: vk::PipelineBindPoint,
    pub push_constants: Option<PushConstantBlock>,
    pub resources: Vec<ReflectedResource>,
    pool: Arc<DescriptorPool>,
    device: Arc<VulkanDevice>,
}

impl Pipeline {
    /// Bind the pipeline and its descriptor set.
    pub fn bind(&self, cmd: vk::CommandBuffer) {
        unsafe {
            self.device.device.cmd_bind_pipeline(cmd, self.bind_point, self.pipeline);
            self.device.device.cmd_bind_descriptor_sets(
                cmd,
                self.bind_point,
                self.layout,
                0,
                &[self.descriptor_set],
                &[],
            );
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline(self.pipeline, None);
            self.device.device.destroy_pipeline_layout(self.layout, None);
        }
        self.pool.free(self.descriptor_set, &self.resources);
        unsafe {
            self.device
                .device
                .destroy_descriptor_set_layout(self.set_layout, None)
        };
    }
}

pub struct PipelineBuilder<'a> {
    device: &'a Arc<VulkanDevice>,
    pool: &'a Arc<DescriptorPool>,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(device: &'a Arc<VulkanDevice>, pool: &'a Arc<DescriptorPool>) -> Self {
        Self { device, pool }
    }

    /// Compile every path (stage from its extension) and build the pipeline.
    pub fn create_graphics_pipeline(
        &self,
        compiler: &dyn ShaderCompiler,
        shader_paths: &[&Path],
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> Result<Pipeline> {
        let shaders = shader_paths
            .iter()
            .map(|path| load_shader(compiler, path))
            .collect::<Result<Vec<_>>>()?;
        self.graphics(&shaders, render_pass, extent)
    }

    pub fn create_compute_pipeline(
        &self,
        compiler: &dyn ShaderCompiler,
        shader_path: &Path,
    ) -> Result<Pipeline> {
        let shader = load_shader(compiler, shader_path)?;
        self.compute(&shader)
    }

    /// Full-screen pass: triangle strip, no vertex input, no depth, no blending.
    pub fn graphics(
        &self,
        shaders: &[CompiledShader],
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> Result<Pipeline> {
        if let Some(compute) = shaders.iter().find(|s| s.stage == ShaderStage::Compute) {
            return Err(RenderError::ShaderCompilation {
                path: compute.path.clone(),
                message: "compute shader given to a graphics pipeline".into(),
            });
        }

        let resources = match shaders.iter().find(|s| s.stage == ShaderStage::Fragment) {
            Some(fragment) => {
                select_resources(&fragment.reflection, GRAPHICS_RESOURCES, &fragment.name())
            }
            None => Vec::new(),
        };
        for shader in shaders.iter().filter(|s| s.stage != ShaderStage::Fragment) {
            if !shader.reflection.resources.is_empty() {
                log::warn!("{}: descriptor bindings outside the fragment stage are ignored", shader.name());
            }
        }

        let modules = shaders
            .iter()
            .map(|shader| create_shader_module(self.device, &shader.code))
            .collect::<Result<Vec<_>>>()?;
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = shaders
            .iter()
            .zip(&modules)
            .map(|(shader, module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(shader.stage.vk_stage())
                    .module(module.handle())
                    .name(ENTRY_POINT)
            })
            .collect();

        // The quad is generated from gl_VertexIndex
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_STRIP)
            .primitive_restart_enable(false);

        let viewports = [vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        }];
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(false)
            .depth_write_enable(false)
            .stencil_test_enable(false);

        let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blend_attachments);

        self.assemble(
            vk::PipelineBindPoint::GRAPHICS,
            vk::ShaderStageFlags::FRAGMENT,
            resources,
            None,
            |layout| {
                let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
                    .stages(&stages)
                    .vertex_input_state(&vertex_input)
                    .input_assembly_state(&input_assembly)
                    .viewport_state(&viewport_state)
                    .rasterization_state(&rasterizer)
                    .multisample_state(&multisampling)
                    .depth_stencil_state(&depth_stencil)
                    .color_blend_state(&color_blending)
                    .layout(layout)
                    .render_pass(render_pass)
                    .subpass(0);

                let pipelines = unsafe {
                    self.device.device.create_graphics_pipelines(
                        vk::PipelineCache::null(),
                        &[pipeline_info],
                        None,
                    )
                }
                .map_err(|(_, e)| RenderError::from(e))?;
                Ok(pipelines[0])
            },
        )
    }

    pub fn compute(&self, shader: &CompiledShader) -> Result<Pipeline> {
        if shader.stage != ShaderStage::Compute {
            return Err(RenderError::ShaderCompilation {
                path: shader.path.clone(),
                message: format!("{:?} shader given to a compute pipeline", shader.stage),
            });
        }

        let resources = select_resources(&shader.reflection, COMPUTE_RESOURCES, &shader.name());
        let module = create_shader_module(self.device, &shader.code)?;

        self.assemble(
            vk::PipelineBindPoint::COMPUTE,
            vk::ShaderStageFlags::COMPUTE,
            resources,
            shader.reflection.push_constants,
            |layout| {
                let stage = vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::COMPUTE)
                    .module(module.handle())
                    .name(ENTRY_POINT);
                let pipeline_info = vk::ComputePipelineCreateInfo::default()
                    .stage(stage)
                    .layout(layout);

                let pipelines = unsafe {
                    self.device.device.create_compute_pipelines(
                        vk::PipelineCache::null(),
                        &[pipeline_info],
                        None,
                    )
                }
                .map_err(|(_, e)| RenderError::from(e))?;
                Ok(pipelines[0])
            },
        )
    }

    // Set layout -> pipeline layout -> descriptor set -> pipeline
    fn assemble<F>(
        &self,
        bind_point: vk::PipelineBindPoint,
        stage: vk::ShaderStageFlags,
        resources: Vec<ReflectedResource>,
        push_constants: Option<PushConstantBlock>,
        create: F,
    ) -> Result<Pipeline>
    where
        F: FnOnce(vk::PipelineLayout) -> Result<vk::Pipeline>,
    {
        let device = &self.device.device;

        let bindings = layout_bindings(&resources, stage);
        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let set_layout = DeviceOwned::new(
            self.device,
            unsafe { device.create_descriptor_set_layout(&set_layout_info, None) }?,
            |device, layout| unsafe { device.destroy_descriptor_set_layout(layout, None) },
        );

        let push_ranges: Vec<vk::PushConstantRange> = push_constants
            .iter()
            .map(|block| vk::PushConstantRange {
                stage_flags: stage,
                offset: block.offset,
                size: block.size,
            })
            .collect();
        let set_layouts = [set_layout.handle()];
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        let layout = DeviceOwned::new(
            self.device,
            unsafe { device.create_pipeline_layout(&layout_info, None) }?,
            |device, layout| unsafe { device.destroy_pipeline_layout(layout, None) },
        );

        let descriptor_set = self.pool.allocate(set_layout.handle(), &resources)?;

        let pipeline = match create(layout.handle()) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.pool.free(descriptor_set, &resources);
                return Err(e);
            }
        };

        log::debug!(
            "Created {:?} pipeline with {} bindings",
            bind_point,
            resources.len()
        );

        Ok(Pipeline {
            pipeline,
            layout: layout.release(),
            set_layout: set_layout.release(),
            descriptor_set,
            bind_point,
            push_constants,
            resources,
            pool: Arc::clone(self.pool),
            device: Arc::clone(self.device),
        })
    }
}

/// Reflected resources a pipeline kind consumes; the rest are logged and skipped.
fn select_resources(
    reflection: &ShaderReflection,
    accepted: &[ResourceKind],
    shader: &str,
) -> Vec<ReflectedResource> {
    reflection
        .resources
        .iter()
        .filter(|resource| {
            let keep = accepted.contains(&resource.kind);
            if !keep {
                log::warn!(
                    "{}: ignoring {} at binding {}",
                    shader,
                    resource.kind.describe(),
                    resource.binding
                );
            }
            keep
        })
        .copied()
        .collect()
}

/// Fail unless `shader` declares `binding` as `kind`.
pub fn require_binding(shader: &CompiledShader, binding: u32, kind: ResourceKind) -> Result<()> {
    match shader.reflection.binding(binding) {
        Some(resource) if resource.kind == kind => Ok(()),
        _ => Err(RenderError::MissingBinding {
            shader: shader.name(),
            binding,
            expected: kind.describe(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn shader(name: &str, stage: ShaderStage, resources: Vec<ReflectedResource>) -> CompiledShader {
        CompiledShader {
            path: PathBuf::from("shaders").join(name),
            stage,
            code: Vec::new(),
            reflection: ShaderReflection {
                resources,
                push_constants: None,
            },
        }
    }

    fn resource(binding: u32, kind: ResourceKind) -> ReflectedResource {
        ReflectedResource {
            binding,
            kind,
            count: 1,
        }
    }

    #[test]
    fn graphics_keeps_only_combined_samplers() {
        let reflection = ShaderReflection {
            resources: vec![
                resource(0, ResourceKind::CombinedImageSampler),
                resource(1, ResourceKind::StorageBuffer),
                resource(2, ResourceKind::CombinedImageSampler),
            ],
            push_constants: None,
        };

        let kept = select_resources(&reflection, GRAPHICS_RESOURCES, "quad.frag");
        assert_eq!(
            kept.iter().map(|r| r.binding).collect::<Vec<_>>(),
            vec![0, 2]
        );
    }

    #[test]
    fn compute_keeps_storage_images_and_buffers() {
        let reflection = ShaderReflection {
            resources: vec![
                resource(0, ResourceKind::StorageImage),
                resource(1, ResourceKind::StorageBuffer),
                resource(2, ResourceKind::UniformBuffer),
            ],
            push_constants: None,
        };

        let kept = select_resources(&reflection, COMPUTE_RESOURCES, "voxel.comp");
        assert_eq!(kept, reflection.resources[..2].to_vec());
    }

    #[test]
    fn binding_contract_is_checked_by_index_and_kind() {
        let voxel = shader(
            "voxel.comp",
            ShaderStage::Compute,
            vec![
                resource(0, ResourceKind::StorageImage),
                resource(1, ResourceKind::StorageBuffer),
            ],
        );

        assert!(require_binding(&voxel, 0, ResourceKind::StorageImage).is_ok());
        assert!(require_binding(&voxel, 1, ResourceKind::StorageBuffer).is_ok());

        match require_binding(&voxel, 1, ResourceKind::StorageImage) {
            Err(RenderError::MissingBinding {
                shader,
                binding,
                expected,
            }) => {
                assert_eq!(shader, "voxel.comp");
                assert_eq!(binding, 1);
                assert_eq!(expected, "storage image");
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert!(require_binding(&voxel, 5, ResourceKind::StorageBuffer).is_err());
    }
}
