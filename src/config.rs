// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section is optional; missing keys take the defaults below. A missing
// or unreadable file falls back to defaults entirely.

use crate::backend::context::{RenderSettings, ShaderPaths};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub shaders: ShaderConfig,
    pub voxels: VoxelConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Voxel".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub vsync: bool,
    pub clear_color: [f32; 4],
    /// Upper bound on any fence wait or image acquire
    pub frame_timeout_ms: u64,
    /// Accept integrated, virtual and CPU devices when no discrete GPU exists
    pub allow_integrated_gpu: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            clear_color: [1.0, 0.0, 0.0, 1.0],
            frame_timeout_ms: 5000,
            allow_integrated_gpu: false,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Only honoured in debug builds
    pub validation_layers: bool,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            show_fps: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilerKind {
    Glslc,
    Shaderc,
}

/// Shader sources and how to compile them
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub compiler: CompilerKind,
    pub glslc_path: PathBuf,
    pub optimize: bool,
    pub voxel: PathBuf,
    pub quad_vertex: PathBuf,
    pub quad_fragment: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            compiler: CompilerKind::Glslc,
            glslc_path: PathBuf::from("glslc"),
            optimize: !cfg!(debug_assertions),
            voxel: PathBuf::from("shaders/voxel.comp"),
            quad_vertex: PathBuf::from("shaders/screenquad.vert"),
            quad_fragment: PathBuf::from("shaders/screenquad.frag"),
        }
    }
}

/// Sample scene
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct VoxelConfig {
    pub grid_size: [u32; 3],
    pub sphere_radius: f32,
}

impl Default for VoxelConfig {
    fn default() -> Self {
        Self {
            grid_size: [64, 64, 64],
            sphere_radius: 24.0,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Settings handed to the render context at startup
    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            app_name: self.window.title.clone(),
            vsync: self.graphics.vsync,
            clear_color: self.graphics.clear_color,
            frame_timeout: Duration::from_millis(self.graphics.frame_timeout_ms),
            allow_integrated_gpu: self.graphics.allow_integrated_gpu,
            validation: cfg!(debug_assertions) && self.debug.validation_layers,
            shaders: ShaderPaths {
                voxel: self.shaders.voxel.clone(),
                quad_vertex: self.shaders.quad_vertex.clone(),
                quad_fragment: self.shaders.quad_fragment.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 720);
        assert!(config.graphics.vsync);
        assert_eq!(config.graphics.frame_timeout_ms, 5000);
        assert!(!config.graphics.allow_integrated_gpu);
        assert_eq!(config.shaders.compiler, CompilerKind::Glslc);
        assert_eq!(config.voxels.grid_size, [64, 64, 64]);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [graphics]
            vsync = false
            frame_timeout_ms = 250

            [shaders]
            compiler = "shaderc"
            voxel = "assets/voxel.comp"
            "#,
        )
        .unwrap();

        assert!(!config.graphics.vsync);
        assert_eq!(config.graphics.clear_color, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(config.shaders.compiler, CompilerKind::Shaderc);
        assert_eq!(config.shaders.voxel, PathBuf::from("assets/voxel.comp"));
        assert_eq!(config.shaders.quad_vertex, PathBuf::from("shaders/screenquad.vert"));

        let settings = config.render_settings();
        assert_eq!(settings.frame_timeout, Duration::from_millis(250));
        assert!(!settings.vsync);
    }

    #[test]
    fn unknown_compiler_is_rejected() {
        assert!(Config::parse("[shaders]\ncompiler = \"fxc\"\n").is_err());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let config = Config::load_from_path("definitely/not/here/config.toml").unwrap();
        assert_eq!(config.window.title, "Voxel");
    }
}
