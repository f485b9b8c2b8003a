//! Per-frame context for rendering.

use ash::vk;
use ember_gpu::FrameInfo;

/// Context for the current frame being rendered.
pub struct FrameContext {
    /// Command buffer for recording rendering commands. Already begun.
    pub command_buffer: vk::CommandBuffer,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    /// Framebuffer of the acquired image, if a render pass is attached.
    pub framebuffer: Option<vk::Framebuffer>,
    /// Swapchain extent.
    pub extent: vk::Extent2D,
    /// Slot in the frame ring.
    pub frame_index: usize,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Current frame number.
    pub frame_number: u64,
}

impl FrameContext {
    pub(crate) fn new(info: FrameInfo, dt: f32, frame_number: u64) -> Self {
        Self {
            command_buffer: info.command_buffer,
            image_index: info.image_index,
            framebuffer: info.framebuffer,
            extent: info.extent,
            frame_index: info.frame_index,
            dt,
            frame_number,
        }
    }

    /// Full-extent render area.
    pub fn render_area(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        }
    }
}
