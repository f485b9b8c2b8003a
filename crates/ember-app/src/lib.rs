//! Application framework for the Ember renderer.
//!
//! This crate handles the boilerplate around the render core:
//! - Logging setup
//! - Window creation and the event loop
//! - Render core initialization and shutdown
//! - Driving the begin/end frame protocol every tick
//!
//! # Example
//!
//! ```no_run
//! use ember_app::{run_app, AppConfig, AppContext, EmberApp, FrameContext};
//!
//! struct MyApp;
//!
//! impl EmberApp for MyApp {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, _ctx: &AppContext, _dt: f32) {}
//!
//!     fn render(&mut self, _ctx: &AppContext, _frame: &mut FrameContext) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::new("My App"))
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;

pub use app::EmberApp;
pub use context::AppContext;
pub use frame::FrameContext;
pub use runner::{run_app, AppConfig};

// Re-export commonly used types for convenience
pub use ember_gpu::{RenderConfig, RenderCore};
pub use winit::event::WindowEvent;
