//! `EmberApp` trait definition.

use crate::context::AppContext;
use crate::frame::FrameContext;
use winit::event::WindowEvent;

/// Trait for Ember applications.
///
/// The framework creates the window and the render core, drives the frame
/// loop and tears everything down on exit. Applications only record commands.
pub trait EmberApp: Sized {
    /// Initialize the application.
    ///
    /// Called once after the window and render core have been created.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every tick before rendering, including ticks whose frame is
    /// skipped.
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// Record rendering commands into `frame.command_buffer`.
    ///
    /// The framework acquires the image, submits and presents. Errors end the
    /// application.
    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()>;

    /// Handle window resize.
    ///
    /// The swapchain is rebuilt after the next present; size-dependent
    /// application resources can be refreshed here.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not be processed
    /// further.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Cleanup resources before shutdown.
    ///
    /// The GPU is idle when this is called.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
