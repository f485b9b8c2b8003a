//! Render core lifecycle.
//!
//! [`RenderCore`] owns every long-lived Vulkan object: instance, surface,
//! logical device, swapchain and frame ring. Construction either builds all of
//! them or releases whatever it created; teardown runs in reverse.

use crate::capabilities::VulkanProbe;
use crate::command::OneShotExecutor;
use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use crate::frame::{FrameStatus, FrameSynchronizer};
use crate::instance::GpuInstance;
use crate::selection::select_device;
use crate::surface::{Surface, SurfaceSwapchain};
use crate::swapchain::PresentTarget;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::CStr;
use tracing::{info, warn};

/// Render core configuration.
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Application name reported to the driver.
    pub app_name: String,
    /// Enable validation layers and the debug messenger.
    pub validation: bool,
    /// Present with vertical sync.
    pub vsync: bool,
    /// Device extensions every candidate must support.
    pub required_extensions: Vec<&'static CStr>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            app_name: "Ember".to_string(),
            validation: cfg!(debug_assertions),
            vsync: true,
            required_extensions: vec![ash::khr::swapchain::NAME],
        }
    }
}

impl RenderConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Require an additional device extension.
    pub fn with_extension(mut self, extension: &'static CStr) -> Self {
        if !self.required_extensions.contains(&extension) {
            self.required_extensions.push(extension);
        }
        self
    }
}

/// Width over height, or 1.0 for a degenerate extent.
pub fn aspect_ratio(extent: vk::Extent2D) -> f32 {
    if extent.height == 0 {
        1.0
    } else {
        extent.width as f32 / extent.height as f32
    }
}

/// Owner of the device context, swapchain and frame pacing state.
pub struct RenderCore {
    // Fields drop in declaration order
    frames: FrameSynchronizer,
    swapchain: SurfaceSwapchain,
    context: DeviceContext,
    instance: GpuInstance,
    frames_destroyed: bool,
}

impl RenderCore {
    /// Build the instance, surface, device, swapchain and frame ring.
    ///
    /// # Safety
    /// The window must outlive the returned core.
    pub unsafe fn new<W>(window: &W, width: u32, height: u32, config: &RenderConfig) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?
            .as_raw();

        let instance = GpuInstance::new(&config.app_name, display, config.validation)?;

        // SAFETY: Caller guarantees the window outlives the core
        let surface = unsafe { Surface::new(&instance, window)? };

        // SAFETY: Surface and loader come from this instance
        let probe = unsafe { VulkanProbe::new(instance.instance(), surface.loader(), surface.handle()) };
        let selected = select_device(&probe, &config.required_extensions)?;
        info!("Selected GPU: {}", selected.capabilities.summary());

        // SAFETY: The candidate was enumerated from this instance
        let context =
            unsafe { DeviceContext::new(instance.instance(), &selected, &config.required_extensions)? };

        // SAFETY: The surface belongs to the context's instance
        let swapchain = unsafe {
            SurfaceSwapchain::new(
                &context,
                surface,
                vk::Extent2D { width, height },
                config.vsync,
            )?
        };

        // SAFETY: Queues and device come from the same context
        let frames = unsafe {
            FrameSynchronizer::new(
                context.device(),
                context.queue_families(),
                context.graphics_queue(),
                context.present_queue(),
            )?
        };

        Ok(Self {
            frames,
            swapchain,
            context,
            instance,
            frames_destroyed: false,
        })
    }

    /// Start a frame. See [`FrameSynchronizer::begin_frame`].
    pub fn begin_frame(&mut self) -> Result<FrameStatus> {
        // SAFETY: All objects were created from this core's device
        unsafe { self.frames.begin_frame(self.context.device(), &mut self.swapchain) }
    }

    /// Submit and present the frame. See [`FrameSynchronizer::end_frame`].
    pub fn end_frame(&mut self) -> Result<()> {
        // SAFETY: All objects were created from this core's device
        unsafe { self.frames.end_frame(self.context.device(), &mut self.swapchain) }
    }

    /// Record a window resize. The swapchain is rebuilt after the next present.
    pub fn notify_resized(&mut self, width: u32, height: u32) {
        self.swapchain.set_desired_extent(width, height);
        self.frames.notify_resized();
    }

    /// Record and synchronously execute a command buffer.
    pub fn execute_one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = self.context.device();
        // SAFETY: The pool is only used from the thread driving this core
        unsafe { self.one_shot().run(device, |cmd| record(device, cmd)) }
    }

    /// Transition an image between supported layouts and wait for it.
    ///
    /// # Safety
    /// `image` must be a valid image of `format` created from this device.
    pub unsafe fn transition_image_layout(
        &self,
        image: vk::Image,
        format: vk::Format,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> Result<()> {
        // SAFETY: Forwarded from the caller
        unsafe {
            self.one_shot()
                .transition_image_layout(self.context.device(), image, format, old, new)
        }
    }

    /// Attach a render pass for per-image framebuffers.
    ///
    /// # Safety
    /// See [`SurfaceSwapchain::attach_render_pass`].
    pub unsafe fn attach_render_pass(&mut self, render_pass: vk::RenderPass) -> Result<()> {
        // SAFETY: Forwarded from the caller
        unsafe { self.swapchain.attach_render_pass(render_pass) }
    }

    /// Destroy the framebuffers so the attached render pass can be destroyed.
    pub fn detach_render_pass(&mut self) -> Result<()> {
        self.swapchain.detach_render_pass()
    }

    /// Wait for in-flight frames, destroy the frame ring, then release the
    /// swapchain, surface, device, debug messenger and instance.
    pub fn shutdown(mut self) -> Result<()> {
        self.destroy_frames()?;
        info!("Render core shut down");
        Ok(())
    }

    fn destroy_frames(&mut self) -> Result<()> {
        if self.frames_destroyed {
            return Ok(());
        }

        // SAFETY: The frame ring was created from this device
        unsafe { self.frames.wait_all(self.context.device())? };
        self.context.wait_idle()?;
        // SAFETY: Every slot has retired and the device is idle
        unsafe { self.frames.destroy(self.context.device()) };
        self.frames_destroyed = true;
        Ok(())
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    pub fn instance(&self) -> &GpuInstance {
        &self.instance
    }

    pub fn swapchain(&self) -> &SurfaceSwapchain {
        &self.swapchain
    }

    pub fn device(&self) -> &ash::Device {
        self.context.device()
    }

    pub fn one_shot(&self) -> OneShotExecutor {
        self.frames.one_shot()
    }

    /// Current slot index in the frame ring.
    pub fn current_frame(&self) -> usize {
        self.frames.current_frame()
    }

    /// Command buffer of the current slot.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.frames.command_buffer()
    }

    /// Framebuffer of the image acquired for the frame being recorded.
    pub fn current_framebuffer(&self) -> Option<vk::Framebuffer> {
        self.frames
            .image_index()
            .and_then(|index| self.swapchain.framebuffer(index))
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    /// The swapchain is waiting for the window to have a non-zero size.
    pub fn is_rebuild_deferred(&self) -> bool {
        self.swapchain.is_rebuild_deferred()
    }

    pub fn aspect_ratio(&self) -> f32 {
        aspect_ratio(self.swapchain.extent())
    }

    pub fn image_format(&self) -> vk::Format {
        self.swapchain.image_format()
    }

    pub fn depth_format(&self) -> vk::Format {
        self.swapchain.depth_format()
    }
}

impl Drop for RenderCore {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_frames() {
            warn!("Frame ring not destroyed cleanly: {e}");
        }
    }
}
