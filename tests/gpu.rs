// Tests against a real (headless) Vulkan device.
//
// Ignored by default; run with `cargo test -- --ignored` on a machine with a
// Vulkan driver. The pipeline tests also need `glslc` on PATH.

use ash::vk;
use std::path::Path;
use std::sync::Arc;
use voxel_renderer::backend::buffer::{copy_to_buffer, create_buffer, read_buffer, MemoryResidency};
use voxel_renderer::backend::command::CommandPool;
use voxel_renderer::backend::context::RENDER_TARGET_FORMAT;
use voxel_renderer::backend::descriptor::{DescriptorPool, MAX_SETS};
use voxel_renderer::backend::image::{create_image, set_image_layout};
use voxel_renderer::backend::pipeline::{create_render_pass, PipelineBuilder};
use voxel_renderer::backend::reflect::{ReflectedResource, ResourceKind};
use voxel_renderer::backend::shader::GlslcCompiler;
use voxel_renderer::backend::{RenderError, VulkanDevice, VulkanInstance};
use voxel_renderer::voxel::VoxelGrid;

const TIMEOUT_NS: u64 = 5_000_000_000;

fn headless_device() -> Arc<VulkanDevice> {
    let instance = VulkanInstance::new("voxel-renderer tests", &[], false).unwrap();
    let (physical_device, properties) = instance.pick_physical_device(true).unwrap();
    VulkanDevice::new(instance, physical_device, properties, None).unwrap()
}

#[test]
#[ignore]
fn buffer_has_requested_size() {
    let device = headless_device();
    let buffer = create_buffer(
        &device,
        1000,
        vk::BufferUsageFlags::STORAGE_BUFFER,
        MemoryResidency::DeviceLocal,
        "sized",
    )
    .unwrap();
    assert_eq!(buffer.size(), 1000);
    assert_eq!(buffer.residency(), MemoryResidency::DeviceLocal);
}

#[test]
#[ignore]
fn voxel_cells_survive_upload() {
    let device = headless_device();
    let pool = CommandPool::new(&device).unwrap();

    let grid = VoxelGrid::filled_sphere(glam::UVec3::splat(16), 6.0).unwrap();
    let buffer = create_buffer(
        &device,
        grid.as_bytes().len() as u64,
        vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryResidency::DeviceLocal,
        "voxels",
    )
    .unwrap();

    copy_to_buffer(&device, &pool, &buffer, grid.as_bytes(), TIMEOUT_NS).unwrap();
    let bytes = read_buffer(&device, &pool, &buffer, TIMEOUT_NS).unwrap();
    assert_eq!(bytes, grid.as_bytes());
}

#[test]
#[ignore]
fn oversized_upload_is_rejected() {
    let device = headless_device();
    let pool = CommandPool::new(&device).unwrap();
    let buffer = create_buffer(
        &device,
        16,
        vk::BufferUsageFlags::TRANSFER_DST,
        MemoryResidency::DeviceLocal,
        "small",
    )
    .unwrap();

    let err = copy_to_buffer(&device, &pool, &buffer, &[0u8; 17], TIMEOUT_NS).unwrap_err();
    assert!(matches!(
        err,
        RenderError::CopyOutOfBounds {
            length: 17,
            capacity: 16
        }
    ));
}

#[test]
#[ignore]
fn render_target_transitions_to_general() {
    let device = headless_device();
    let pool = CommandPool::new(&device).unwrap();
    let target = create_image(
        &device,
        RENDER_TARGET_FORMAT,
        vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
        320,
        240,
        "render target",
    )
    .unwrap();
    assert_eq!(target.extent, vk::Extent2D { width: 320, height: 240 });

    let image = target.image;
    pool.submit_one_shot(TIMEOUT_NS, |device, cmd| {
        set_image_layout(
            device,
            cmd,
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
        )
    })
    .unwrap();
}

#[test]
#[ignore]
fn compute_pipeline_layout_comes_from_shader() {
    let device = headless_device();
    let descriptors = DescriptorPool::new(&device).unwrap();
    let builder = PipelineBuilder::new(&device, &descriptors);

    let pipeline = builder
        .create_compute_pipeline(&GlslcCompiler::default(), Path::new("shaders/voxel.comp"))
        .unwrap();
    assert_eq!(pipeline.bind_point, vk::PipelineBindPoint::COMPUTE);
    assert_eq!(pipeline.push_constants.map(|block| block.size), Some(32));
    assert_eq!(descriptors.budget().remaining_sets(), MAX_SETS - 1);

    drop(pipeline);
    assert_eq!(descriptors.budget().remaining_sets(), MAX_SETS);
}

#[test]
#[ignore]
fn graphics_pipeline_is_built_from_shader_paths() {
    let device = headless_device();
    let descriptors = DescriptorPool::new(&device).unwrap();
    let builder = PipelineBuilder::new(&device, &descriptors);
    let render_pass = create_render_pass(&device, vk::Format::B8G8R8A8_UNORM).unwrap();

    let pipeline = builder
        .create_graphics_pipeline(
            &GlslcCompiler::default(),
            &[
                Path::new("shaders/screenquad.vert"),
                Path::new("shaders/screenquad.frag"),
            ],
            render_pass.handle(),
            vk::Extent2D {
                width: 640,
                height: 480,
            },
        )
        .unwrap();

    assert_eq!(pipeline.bind_point, vk::PipelineBindPoint::GRAPHICS);
    assert_eq!(
        pipeline.resources,
        vec![ReflectedResource {
            binding: 0,
            kind: ResourceKind::CombinedImageSampler,
            count: 1
        }]
    );
    assert_eq!(pipeline.push_constants, None);
    assert_eq!(descriptors.budget().remaining_sets(), MAX_SETS - 1);
}
