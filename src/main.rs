// =============================================================================
// VOXEL RENDERER - Compute ray marching into a window
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (window, input, redraw)                       │
// │    └── RenderContext                                            │
// │          ├── compute pipeline: voxel grid -> storage image      │
// │          └── graphics pipeline: storage image -> swapchain      │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for this slot's compute fence, dispatch the ray march
// 2. Wait for this slot's render fence, acquire a swapchain image
// 3. Draw the full-screen quad (waits on the compute semaphore)
// 4. Present
//
// =============================================================================

use anyhow::{Context, Result};
use glam::UVec3;
use std::sync::Arc;
use std::time::Instant;
use voxel_renderer::backend::shader::{GlslcCompiler, ShaderCompiler};
use voxel_renderer::backend::{FrameStatus, RenderContext, RenderError};
use voxel_renderer::config::{CompilerKind, Config};
use voxel_renderer::voxel::VoxelGrid;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    init_logging();

    let config = Config::load();
    log::info!("Starting voxel renderer");
    log::info!(
        "Window: {}x{}, vsync {}",
        config.window.width,
        config.window.height,
        if config.graphics.vsync { "on" } else { "off" }
    );

    let compiler = build_compiler(&config)?;

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let mut app = App::new(config, compiler);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Info by default, overridable through RUST_LOG
fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();
    builder.init();
}

fn build_compiler(config: &Config) -> Result<Box<dyn ShaderCompiler>> {
    match config.shaders.compiler {
        CompilerKind::Glslc => Ok(Box::new(GlslcCompiler {
            executable: config.shaders.glslc_path.clone(),
            optimize: config.shaders.optimize,
        })),
        #[cfg(feature = "shaderc")]
        CompilerKind::Shaderc => Ok(Box::new(
            voxel_renderer::backend::shader::ShadercCompiler::new(config.shaders.optimize)?,
        )),
        #[cfg(not(feature = "shaderc"))]
        CompilerKind::Shaderc => {
            anyhow::bail!("config asks for the shaderc compiler but this build lacks the `shaderc` feature")
        }
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the render context goes before the window
/// its surface was created from.
struct App {
    config: Config,
    compiler: Box<dyn ShaderCompiler>,

    context: Option<RenderContext>,
    window: Option<Arc<Window>>,

    is_minimized: bool,
    needs_resize: bool,

    start_time: Instant,
    last_fps_update: Instant,
    frames_since_update: u32,

    /// Error that ended the event loop, reported from main
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config, compiler: Box<dyn ShaderCompiler>) -> Self {
        let now = Instant::now();
        Self {
            config,
            compiler,
            context: None,
            window: None,
            is_minimized: false,
            needs_resize: false,
            start_time: now,
            last_fps_update: now,
            frames_since_update: 0,
            fatal: None,
        }
    }

    fn init_renderer(&mut self, window: &Window) -> Result<RenderContext> {
        let size = window.inner_size();
        let mut context = RenderContext::new(
            window,
            size.width,
            size.height,
            self.config.render_settings(),
            self.compiler.as_ref(),
        )
        .context("Failed to initialize Vulkan")?;

        let extent = context.extent();
        log::info!(
            "Rendering on {} at {}x{}, {:?}",
            context.device_name(),
            extent.width,
            extent.height,
            context.present_mode()
        );

        let [x, y, z] = self.config.voxels.grid_size;
        let grid = VoxelGrid::filled_sphere(UVec3::new(x, y, z), self.config.voxels.sphere_radius)
            .context("Invalid voxel grid in config")?;
        log::info!("Voxel grid {}x{}x{}, {} filled cells", x, y, z, grid.filled());

        context
            .upload_voxel_data(&grid)
            .context("Failed to upload voxel data")?;

        self.start_time = Instant::now();
        self.last_fps_update = self.start_time;
        Ok(context)
    }

    // =========================================================================
    // RENDERING
    // =========================================================================

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        if self.is_minimized {
            return;
        }
        let (Some(context), Some(window)) = (self.context.as_mut(), self.window.as_ref()) else {
            return;
        };

        if self.needs_resize {
            let size = window.inner_size();
            match context.recreate_swapchain(size.width, size.height) {
                Ok(_) => self.needs_resize = false,
                Err(e) => {
                    self.fail(event_loop, anyhow::Error::new(e).context("Failed to recreate swapchain"));
                    return;
                }
            }
        }

        let elapsed = self.start_time.elapsed().as_secs_f32();
        match context.render_frame(elapsed) {
            Ok(FrameStatus::Presented) => self.update_fps(),
            Ok(FrameStatus::SwapchainStale) => {
                log::debug!("Swapchain stale, recreating before next frame");
                self.needs_resize = true;
            }
            Err(RenderError::SwapchainOutOfDate) => self.needs_resize = true,
            Err(e @ (RenderError::DeviceLost | RenderError::Timeout)) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Frame failed"));
            }
            Err(e) => {
                // The frame slot was settled; a rebuilt swapchain drops any image
                // the failed frame acquired
                log::error!("Render error: {}", e);
                self.needs_resize = true;
            }
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.fatal = Some(error);
        event_loop.exit();
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }
        self.frames_since_update += 1;

        let since = self.last_fps_update.elapsed().as_secs_f32();
        if since < 1.0 {
            return;
        }

        let fps = self.frames_since_update as f32 / since;
        if let Some(ref window) = self.window {
            window.set_title(&format!(
                "{} - {:.0} FPS ({:.2}ms)",
                self.config.window.title,
                fps,
                1000.0 / fps.max(f32::EPSILON)
            ));
        }

        self.frames_since_update = 0;
        self.last_fps_update = Instant::now();
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match self.init_renderer(&window) {
            Ok(context) => self.context = Some(context),
            Err(e) => {
                self.fail(event_loop, e);
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    self.needs_resize = true;
                }
            }

            WindowEvent::RedrawRequested => self.redraw(event_loop),

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    /// Continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        let frames = self.context.as_ref().map_or(0, |c| c.frame_count());
        // Tear the renderer down while the window is still alive
        self.context = None;
        log::info!(
            "Exiting after {} frames in {:.1}s",
            frames,
            self.start_time.elapsed().as_secs_f32()
        );
    }
}
