// Shader compilation and module creation
//
// GLSL source is compiled at startup. The stage comes from the file
// extension; the compiled SPIR-V is reflected so pipeline layouts can be
// derived from it instead of being declared by hand.

use super::device::VulkanDevice;
use super::error::{RenderError, Result};
use super::handle::DeviceOwned;
use super::reflect::ShaderReflection;
use ash::vk;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// `.vert`, `.frag` or `.comp`; anything else is a configuration error.
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("vert") => Ok(ShaderStage::Vertex),
            Some("frag") => Ok(ShaderStage::Fragment),
            Some("comp") => Ok(ShaderStage::Compute),
            _ => Err(RenderError::UnknownShaderStage(path.to_path_buf())),
        }
    }

    pub fn vk_stage(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }

    fn glslc_name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vert",
            ShaderStage::Fragment => "frag",
            ShaderStage::Compute => "comp",
        }
    }
}

/// Turns GLSL source into SPIR-V words.
pub trait ShaderCompiler {
    fn compile(&self, path: &Path, source: &str, stage: ShaderStage) -> Result<Vec<u32>>;
}

/// Runs the Vulkan SDK's `glslc` as a child process.
#[derive(Debug, Clone)]
pub struct GlslcCompiler {
    pub executable: PathBuf,
    pub optimize: bool,
}

impl Default for GlslcCompiler {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("glslc"),
            optimize: false,
        }
    }
}

impl ShaderCompiler for GlslcCompiler {
    fn compile(&self, path: &Path, source: &str, stage: ShaderStage) -> Result<Vec<u32>> {
        let failed = |message: String| RenderError::ShaderCompilation {
            path: path.to_path_buf(),
            message,
        };

        let mut command = Command::new(&self.executable);
        command
            .arg(format!("-fshader-stage={}", stage.glslc_name()))
            .arg("--target-env=vulkan1.3");
        if self.optimize {
            command.arg("-O");
        }
        if let Some(dir) = path.parent() {
            command.arg("-I").arg(dir);
        }
        command
            .args(["-", "-o", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| failed(format!("cannot run {}: {}", self.executable.display(), e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(source.as_bytes())
                .map_err(|e| failed(format!("cannot feed glslc: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| failed(format!("glslc did not finish: {}", e)))?;

        if !output.status.success() {
            // glslc names stdin "<stdin>" in its diagnostics
            let stderr = String::from_utf8_lossy(&output.stderr)
                .replace("<stdin>", &path.display().to_string());
            return Err(failed(stderr.trim().to_string()));
        }

        ash::util::read_spv(&mut Cursor::new(&output.stdout))
            .map_err(|e| failed(format!("glslc produced invalid SPIR-V: {}", e)))
    }
}

/// In-process compilation through libshaderc.
#[cfg(feature = "shaderc")]
pub struct ShadercCompiler {
    compiler: shaderc::Compiler,
    optimize: bool,
}

#[cfg(feature = "shaderc")]
impl ShadercCompiler {
    pub fn new(optimize: bool) -> Result<Self> {
        let compiler = shaderc::Compiler::new().ok_or_else(|| RenderError::ShaderCompilation {
            path: PathBuf::new(),
            message: "failed to initialise shaderc".into(),
        })?;
        Ok(Self { compiler, optimize })
    }
}

#[cfg(feature = "shaderc")]
impl ShaderCompiler for ShadercCompiler {
    fn compile(&self, path: &Path, source: &str, stage: ShaderStage) -> Result<Vec<u32>> {
        let failed = |message: String| RenderError::ShaderCompilation {
            path: path.to_path_buf(),
            message,
        };

        let kind = match stage {
            ShaderStage::Vertex => shaderc::ShaderKind::Vertex,
            ShaderStage::Fragment => shaderc::ShaderKind::Fragment,
            ShaderStage::Compute => shaderc::ShaderKind::Compute,
        };

        let mut options = shaderc::CompileOptions::new()
            .ok_or_else(|| failed("failed to create compile options".into()))?;
        options.set_target_env(
            shaderc::TargetEnv::Vulkan,
            shaderc::EnvVersion::Vulkan1_3 as u32,
        );
        if self.optimize {
            options.set_optimization_level(shaderc::OptimizationLevel::Performance);
        }

        let file_name = path.to_string_lossy();
        let artifact = self
            .compiler
            .compile_into_spirv(source, kind, &file_name, "main", Some(&options))
            .map_err(|e| failed(e.to_string()))?;

        if artifact.get_num_warnings() > 0 {
            log::warn!("{}: {}", path.display(), artifact.get_warning_messages());
        }

        Ok(artifact.as_binary().to_vec())
    }
}

/// Compiled and reflected shader, ready to become a pipeline stage.
#[derive(Debug, Clone)]
pub struct CompiledShader {
    pub path: PathBuf,
    pub stage: ShaderStage,
    pub code: Vec<u32>,
    pub reflection: ShaderReflection,
}

impl CompiledShader {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Read, compile and reflect the shader at `path`.
///
/// The stage is resolved before the file is touched, so a bad extension is
/// reported even if the file does not exist.
pub fn load_shader(compiler: &dyn ShaderCompiler, path: &Path) -> Result<CompiledShader> {
    let stage = ShaderStage::from_path(path)?;

    let source = std::fs::read_to_string(path).map_err(|source| RenderError::ShaderIo {
        path: path.to_path_buf(),
        source,
    })?;

    let code = compiler.compile(path, &source, stage)?;
    let reflection = ShaderReflection::parse(&code)?;

    log::debug!(
        "Compiled {} ({:?}): {} bindings, push constants {:?}",
        path.display(),
        stage,
        reflection.resources.len(),
        reflection.push_constants
    );

    Ok(CompiledShader {
        path: path.to_path_buf(),
        stage,
        code,
        reflection,
    })
}

pub fn create_shader_module(
    device: &Arc<VulkanDevice>,
    code: &[u32],
) -> Result<DeviceOwned<vk::ShaderModule>> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);

    let module = unsafe { device.device.create_shader_module(&create_info, None) }?;
    Ok(DeviceOwned::new(device, module, |device, module| unsafe {
        device.destroy_shader_module(module, None)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::reflect::tests::Assembler;
    use std::cell::Cell;

    struct CountingCompiler {
        calls: Cell<usize>,
    }

    impl ShaderCompiler for CountingCompiler {
        fn compile(&self, _path: &Path, _source: &str, _stage: ShaderStage) -> Result<Vec<u32>> {
            self.calls.set(self.calls.get() + 1);
            Ok(Assembler::new().finish())
        }
    }

    #[test]
    fn stage_follows_extension() {
        assert_eq!(
            ShaderStage::from_path(Path::new("shaders/screenquad.vert")).unwrap(),
            ShaderStage::Vertex
        );
        assert_eq!(
            ShaderStage::from_path(Path::new("screenquad.frag")).unwrap(),
            ShaderStage::Fragment
        );
        assert_eq!(
            ShaderStage::from_path(Path::new("voxel.comp")).unwrap().vk_stage(),
            vk::ShaderStageFlags::COMPUTE
        );
    }

    #[test]
    fn unrecognised_extension_is_fatal() {
        for path in ["voxel.glsl", "voxel", "voxel.comp.spv"] {
            assert!(matches!(
                ShaderStage::from_path(Path::new(path)),
                Err(RenderError::UnknownShaderStage(_))
            ));
        }
    }

    #[test]
    fn bad_extension_is_reported_before_compiling() {
        let compiler = CountingCompiler {
            calls: Cell::new(0),
        };
        let result = load_shader(&compiler, Path::new("does/not/exist.glsl"));

        assert!(matches!(result, Err(RenderError::UnknownShaderStage(_))));
        assert_eq!(compiler.calls.get(), 0);
    }

    #[test]
    fn missing_source_is_an_io_error() {
        let compiler = CountingCompiler {
            calls: Cell::new(0),
        };
        let result = load_shader(&compiler, Path::new("does/not/exist.comp"));

        assert!(matches!(result, Err(RenderError::ShaderIo { .. })));
        assert_eq!(compiler.calls.get(), 0);
    }

    #[test]
    fn compiled_source_is_reflected() {
        let path = std::env::temp_dir().join(format!("voxel-shader-{}.frag", std::process::id()));
        std::fs::write(&path, "#version 450\nvoid main() {}\n").unwrap();

        let compiler = CountingCompiler {
            calls: Cell::new(0),
        };
        let shader = load_shader(&compiler, &path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(compiler.calls.get(), 1);
        assert_eq!(shader.stage, ShaderStage::Fragment);
        assert!(shader.reflection.resources.is_empty());
    }
}
