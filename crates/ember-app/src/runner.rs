//! Application runner and event loop.
//!
//! The runner is the only place that decides what a frame outcome means:
//! a skipped frame draws nothing this tick, and any error is logged, the
//! render core is shut down and the event loop exits.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use ember_gpu::{FrameStatus, RenderConfig, RenderCore};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::EmberApp;
use crate::context::AppContext;
use crate::frame::FrameContext;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Enable vsync.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Ember".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: true,
            validation: cfg!(debug_assertions),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the target FPS.
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Render core settings derived from this config.
    pub fn render_config(&self) -> RenderConfig {
        RenderConfig::new()
            .with_app_name(&self.title)
            .with_validation(self.validation)
            .with_vsync(self.vsync)
    }

    /// Minimum wall time per frame, if capped.
    pub fn frame_budget(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Run an `EmberApp` with the given configuration.
///
/// Initializes logging, creates the window and render core, and runs the
/// event loop until the application exits. Returns the error that ended
/// the application, if any.
pub fn run_app<A: EmberApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        failure: None,
    };

    event_loop.run_app(&mut runner)?;

    match runner.failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Internal application runner that implements winit's ApplicationHandler.
struct AppRunner<A: EmberApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    failure: Option<anyhow::Error>,
}

/// Internal application state.
struct AppState<A: EmberApp> {
    // Dropped before the context so app-owned GPU objects go first
    app: A,
    ctx: AppContext,
    frame_budget: Option<Duration>,
    stats: FrameStats,
}

impl<A: EmberApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);
        let size = window.inner_size();

        // SAFETY: The context keeps the window alive and drops the core first
        let render = unsafe {
            RenderCore::new(
                window.as_ref(),
                size.width.max(1),
                size.height.max(1),
                &self.config.render_config(),
            )
        }
        .context("Failed to initialize renderer")?;

        let mut ctx = AppContext::new(render, window);
        let app = A::init(&mut ctx)?;

        Ok(AppState {
            app,
            ctx,
            frame_budget: self.config.frame_budget(),
            stats: FrameStats::default(),
        })
    }

    /// Log `error`, tear down and stop the event loop.
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        error!("{error:#}");
        if let Some(state) = self.state.take() {
            state.cleanup();
        }
        self.failure = Some(error);
        event_loop.exit();
    }
}

impl<A: EmberApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready");
            }
            Err(e) => self.fail(event_loop, e),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(state) = &mut self.state else {
            return;
        };

        // Let the app handle the event first
        if state.app.on_event(&event) {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(state) = self.state.take() {
                    state.cleanup();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = state.render_frame() {
                    self.fail(event_loop, e.context("Frame failed"));
                }
            }
            WindowEvent::Resized(size) => {
                if let Err(e) = state.handle_resize(size.width, size.height) {
                    self.fail(event_loop, e.context("Resize failed"));
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: EmberApp> AppState<A> {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();

        let now = Instant::now();
        let dt = now.duration_since(self.ctx.last_frame_time).as_secs_f32();
        self.ctx.last_frame_time = now;

        self.app.update(&self.ctx, dt);

        // Nothing can be presented to a minimized window
        let size = self.ctx.window.inner_size();
        if size.width == 0 || size.height == 0 {
            return Ok(());
        }

        let info = match self.ctx.render.begin_frame()? {
            FrameStatus::Ready(info) => info,
            FrameStatus::Skipped => {
                if self.ctx.render.is_rebuild_deferred() {
                    debug!("Frame skipped, swapchain rebuild deferred");
                } else {
                    debug!("Frame skipped after swapchain rebuild");
                }
                self.ctx.skipped_frames += 1;
                return Ok(());
            }
        };

        let mut frame = FrameContext::new(info, dt, self.ctx.frame_count);
        self.app.render(&self.ctx, &mut frame)?;
        self.ctx.render.end_frame()?;

        self.ctx.frame_count += 1;
        self.stats.record(dt);

        if let Some(budget) = self.frame_budget {
            let elapsed = frame_start.elapsed();
            if elapsed < budget {
                thread::sleep(budget - elapsed);
            }
        }

        Ok(())
    }

    fn handle_resize(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        if width == 0 || height == 0 {
            debug!("Window minimized");
            return Ok(());
        }

        self.ctx.render.notify_resized(width, height);
        self.app.on_resize(&mut self.ctx, width, height)?;

        info!("Resized to {}x{}", width, height);
        Ok(())
    }

    fn cleanup(mut self) {
        if let Some(summary) = self.stats.summary(self.ctx.frame_count) {
            info!("FPS Statistics:");
            info!("  Min: {:.1}", summary.min);
            info!("  Max: {:.1}", summary.max);
            info!("  Avg: {:.1}", summary.avg);
            info!("  Total frames: {}", self.ctx.frame_count);
        }
        if self.ctx.skipped_frames > 0 {
            info!("  Skipped frames: {}", self.ctx.skipped_frames);
        }

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.render.context().wait_idle() {
            error!("Failed to wait idle: {e}");
        }

        // Let the app cleanup first
        self.app.cleanup(&mut self.ctx);
        drop(self.app);

        if let Err(e) = self.ctx.render.shutdown() {
            error!("Render core shutdown failed: {e}");
        }
        info!("Cleanup complete");
    }
}

/// Running FPS statistics.
#[derive(Debug, Default)]
struct FrameStats {
    min_fps: Option<f64>,
    max_fps: f64,
    fps_sum: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct FpsSummary {
    min: f64,
    max: f64,
    avg: f64,
}

impl FrameStats {
    fn record(&mut self, dt: f32) {
        if dt <= 0.0 {
            return;
        }
        let fps = 1.0 / f64::from(dt);
        self.min_fps = Some(self.min_fps.map_or(fps, |min| min.min(fps)));
        self.max_fps = self.max_fps.max(fps);
        self.fps_sum += fps;
    }

    fn summary(&self, frames: u64) -> Option<FpsSummary> {
        let min = self.min_fps?;
        (frames > 0).then(|| FpsSummary {
            min,
            max: self.max_fps,
            avg: self.fps_sum / frames as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn config_builder() {
        let config = AppConfig::new("Viewer")
            .with_size(800, 600)
            .with_vsync(false)
            .with_validation(true)
            .with_target_fps(60);

        assert_eq!(config.title, "Viewer");
        assert_eq!((config.width, config.height), (800, 600));
        assert!(!config.vsync);

        let render = config.render_config();
        assert_eq!(render.app_name, "Viewer");
        assert!(render.validation);
        assert!(!render.vsync);
        assert_eq!(render.required_extensions, vec![ash::khr::swapchain::NAME]);
    }

    #[test]
    fn frame_budget_from_target_fps() {
        assert_eq!(AppConfig::default().frame_budget(), None);
        assert_eq!(
            AppConfig::default().with_target_fps(0).frame_budget(),
            None
        );
        assert_eq!(
            AppConfig::default().with_target_fps(50).frame_budget(),
            Some(Duration::from_millis(20))
        );
    }

    #[test]
    fn fps_statistics() {
        let mut stats = FrameStats::default();
        assert_eq!(stats.summary(0), None);

        stats.record(0.02);
        stats.record(0.01);
        stats.record(0.0);

        let summary = stats.summary(2).unwrap();
        assert_relative_eq!(summary.min, 50.0, epsilon = 1e-3);
        assert_relative_eq!(summary.max, 100.0, epsilon = 1e-3);
        assert_relative_eq!(summary.avg, 75.0, epsilon = 1e-3);
    }
}
