//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use ember_gpu::RenderCore;
use winit::window::Window;

/// Application context shared across all app methods.
pub struct AppContext {
    /// Render core; declared before the window so it is dropped first.
    pub render: RenderCore,
    /// The window handle.
    pub window: Arc<Window>,
    /// Total frames rendered.
    pub frame_count: u64,
    /// Frames skipped because the swapchain was rebuilt.
    pub skipped_frames: u64,
    /// Time of last frame (for delta time calculation).
    pub(crate) last_frame_time: Instant,
}

impl AppContext {
    pub(crate) fn new(render: RenderCore, window: Arc<Window>) -> Self {
        Self {
            render,
            window,
            frame_count: 0,
            skipped_frames: 0,
            last_frame_time: Instant::now(),
        }
    }

    /// Get the current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.render.extent()
    }

    /// Get the swapchain width.
    pub fn width(&self) -> u32 {
        self.render.extent().width
    }

    /// Get the swapchain height.
    pub fn height(&self) -> u32 {
        self.render.extent().height
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        self.render.aspect_ratio()
    }

    /// Get the logical device.
    pub fn device(&self) -> &ash::Device {
        self.render.device()
    }
}
