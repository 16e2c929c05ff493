// Reflection of real glslc output.
//
// Ignored by default; needs `glslc` on PATH. Run with
// `cargo test -- --ignored`.

use std::path::PathBuf;
use voxel_renderer::backend::reflect::{PushConstantBlock, ResourceKind};
use voxel_renderer::backend::shader::{load_shader, GlslcCompiler};

fn write_source(name: &str, source: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("{}-{}", std::process::id(), name));
    std::fs::write(&path, source).unwrap();
    path
}

#[test]
#[ignore]
fn voxel_shader_declares_its_bindings() {
    let shader = load_shader(
        &GlslcCompiler::default(),
        std::path::Path::new("shaders/voxel.comp"),
    )
    .unwrap();

    let kinds: Vec<_> = shader
        .reflection
        .resources
        .iter()
        .map(|r| (r.binding, r.kind))
        .collect();
    assert_eq!(
        kinds,
        vec![(0, ResourceKind::StorageImage), (1, ResourceKind::StorageBuffer)]
    );
}

#[test]
#[ignore]
fn buffer_reference_push_constants_have_a_size() {
    let path = write_source(
        "buffer-reference.comp",
        r#"#version 450
#extension GL_EXT_buffer_reference : require

layout(local_size_x = 1) in;

layout(buffer_reference, std430) readonly buffer Cells { uint cells[]; };
layout(std430, binding = 0) buffer Out { uint value; } result;
layout(push_constant) uniform Params {
    Cells cells;
    uvec4 grid;
} params;

void main() {
    result.value = params.cells.cells[0] + params.grid.x;
}
"#,
    );

    let shader = load_shader(&GlslcCompiler::default(), &path);
    std::fs::remove_file(&path).unwrap();
    let shader = shader.unwrap();

    assert_eq!(
        shader.reflection.push_constants,
        Some(PushConstantBlock { offset: 0, size: 32 })
    );
    assert_eq!(
        shader.reflection.binding(0).map(|r| r.kind),
        Some(ResourceKind::StorageBuffer)
    );
}
