//! Ember Demo Viewer
//!
//! Clears the window through a render pass every frame and uploads a small
//! texture with one-shot commands at startup.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p ember-viewer -- [OPTIONS]
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use ember_app::{run_app, AppConfig};

use crate::app::Viewer;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let mut config = AppConfig::new("Ember Viewer").with_size(WIDTH, HEIGHT);
    for arg in &args {
        match arg.as_str() {
            "--no-vsync" => config = config.with_vsync(false),
            "--validation" => config = config.with_validation(true),
            "--no-validation" => config = config.with_validation(false),
            other => {
                if let Some(fps) = other.strip_prefix("--fps=") {
                    config = config.with_target_fps(fps.parse()?);
                } else {
                    anyhow::bail!("Unknown argument: {other} (see --help)");
                }
            }
        }
    }

    run_app::<Viewer>(config)
}

fn print_help() {
    eprintln!(
        "Ember Demo Viewer

USAGE:
    cargo run -p ember-viewer -- [OPTIONS]

OPTIONS:
    --no-vsync              Present without vertical sync
    --validation            Force Vulkan validation layers on
    --no-validation         Force Vulkan validation layers off
    --fps=<N>               Cap the frame rate
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
