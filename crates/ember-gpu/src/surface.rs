//! Surface management for windowed rendering.
//!
//! [`Surface`] owns the window surface. [`SurfaceSwapchain`] owns everything
//! presented to it: the swapchain images and views, a depth attachment and,
//! once a render pass is attached, one framebuffer per image.

use crate::command::aspect_mask;
use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use crate::instance::GpuInstance;
use crate::memory::{GpuAllocator, GpuImage};
use crate::selection::QueueFamilies;
use crate::swapchain::{PresentTarget, RebuildGate, Swapchain, SwapchainPlan, SwapchainStatus};
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use tracing::info;

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// A window surface. Destroyed on drop, which must precede instance destruction.
pub struct Surface {
    surface: vk::SurfaceKHR,
    loader: ash::khr::surface::Instance,
}

impl Surface {
    /// Create a surface for `window`.
    ///
    /// # Safety
    /// The window must outlive the surface.
    pub unsafe fn new<W>(instance: &GpuInstance, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        // SAFETY: Caller guarantees the window outlives the surface
        let surface = unsafe {
            ash_window::create_surface(
                instance.entry(),
                instance.instance(),
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        let loader = ash::khr::surface::Instance::new(instance.entry(), instance.instance());

        Ok(Self { surface, loader })
    }

    /// Get the raw surface handle.
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Surface extension loader.
    pub fn loader(&self) -> &ash::khr::surface::Instance {
        &self.loader
    }

    /// Query surface capabilities.
    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceCapabilities> {
        // SAFETY: The surface is valid while self lives
        unsafe {
            let caps = self
                .loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)?;

            let formats = self
                .loader
                .get_physical_device_surface_formats(physical_device, self.surface)?;

            let present_modes = self
                .loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)?;

            Ok(SurfaceCapabilities {
                capabilities: caps,
                formats,
                present_modes,
            })
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        // SAFETY: The swapchain built on this surface is destroyed first
        unsafe { self.loader.destroy_surface(self.surface, None) };
    }
}

/// Surface capabilities query result.
#[derive(Debug, Clone)]
pub struct SurfaceCapabilities {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// First candidate whose optimal-tiling features contain `features`.
pub fn find_supported_format(
    candidates: &[vk::Format],
    features: vk::FormatFeatureFlags,
    properties: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    candidates
        .iter()
        .copied()
        .find(|&format| properties(format).optimal_tiling_features.contains(features))
}

/// Pick the depth attachment format for a device.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn find_depth_format(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<vk::Format> {
    find_supported_format(
        &DEPTH_FORMAT_CANDIDATES,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        // SAFETY: Caller guarantees both handles are valid
        |format| unsafe { instance.get_physical_device_format_properties(physical_device, format) },
    )
    .ok_or_else(|| GpuError::SwapchainCreation("No supported depth format".to_string()))
}

/// Depth image and view sized to the swapchain.
struct DepthBuffer {
    image: GpuImage,
    view: vk::ImageView,
}

impl DepthBuffer {
    fn new(
        device: &ash::Device,
        allocator: &Mutex<GpuAllocator>,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> Result<Self> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let mut image =
            allocator
                .lock()
                .create_image(&create_info, MemoryLocation::GpuOnly, "depth attachment")?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect_mask(format))
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        // SAFETY: The image was just created on this device
        match unsafe { device.create_image_view(&view_info, None) } {
            Ok(view) => Ok(Self { image, view }),
            Err(e) => {
                let _ = allocator.lock().free_image(&mut image);
                Err(e.into())
            }
        }
    }

    /// Idempotent; leaves null handles behind.
    fn destroy(&mut self, device: &ash::Device, allocator: &Mutex<GpuAllocator>) -> Result<()> {
        // SAFETY: Callers wait for the device before destroying attachments
        unsafe { device.destroy_image_view(self.view, None) };
        self.view = vk::ImageView::null();
        if self.image.image != vk::Image::null() {
            allocator.lock().free_image(&mut self.image)?;
        }
        Ok(())
    }
}

/// Swapchain, depth attachment and framebuffers for one surface.
///
/// Recreation rebuilds the contents in place, so references to this object
/// stay valid across resizes.
pub struct SurfaceSwapchain {
    device: Arc<ash::Device>,
    allocator: Arc<Mutex<GpuAllocator>>,
    physical_device: vk::PhysicalDevice,
    swapchain_loader: ash::khr::swapchain::Device,
    swapchain: Swapchain,
    depth: DepthBuffer,
    depth_format: vk::Format,
    render_pass: Option<vk::RenderPass>,
    framebuffers: Vec<vk::Framebuffer>,
    desired_extent: vk::Extent2D,
    vsync: bool,
    rebuild: RebuildGate,
    // Dropped after the swapchain is destroyed in `Drop::drop`
    surface: Surface,
}

impl SurfaceSwapchain {
    /// Build the first swapchain generation for `surface`.
    ///
    /// # Safety
    /// The surface must belong to the instance the context was created from.
    pub unsafe fn new(
        context: &DeviceContext,
        surface: Surface,
        desired_extent: vk::Extent2D,
        vsync: bool,
    ) -> Result<Self> {
        let physical_device = context.physical_device();
        let caps = surface.capabilities(physical_device)?;
        let plan = SwapchainPlan::new(&caps, desired_extent, vsync)?.ok_or_else(|| {
            GpuError::SwapchainCreation("Surface has a zero-sized extent".to_string())
        })?;

        // SAFETY: The context's instance and device are valid
        let depth_format = unsafe { find_depth_format(context.instance(), physical_device)? };

        let swapchain_loader = ash::khr::swapchain::Device::new(context.instance(), context.device());

        // SAFETY: Surface and device come from the same instance
        let swapchain = unsafe {
            Swapchain::new(
                context.device(),
                &swapchain_loader,
                surface.handle(),
                &plan,
                None,
                context.queue_families(),
            )?
        };

        let depth = match DepthBuffer::new(
            context.device(),
            context.allocator(),
            plan.extent,
            depth_format,
        ) {
            Ok(depth) => depth,
            Err(e) => {
                // SAFETY: The swapchain has never been used
                unsafe { swapchain.destroy(context.device(), &swapchain_loader) };
                return Err(e);
            }
        };

        info!(
            "Swapchain created: {}x{}, {:?}, {:?}, {} images, depth {:?}",
            plan.extent.width,
            plan.extent.height,
            plan.surface_format.format,
            plan.present_mode,
            swapchain.images.len(),
            depth_format
        );

        Ok(Self {
            device: context.device_arc(),
            allocator: context.allocator().clone(),
            physical_device,
            swapchain_loader,
            swapchain,
            depth,
            depth_format,
            render_pass: None,
            framebuffers: Vec::new(),
            desired_extent,
            vsync,
            rebuild: RebuildGate::default(),
            surface,
        })
    }

    /// Create framebuffers for every image against `render_pass` and keep them
    /// in sync across recreations.
    ///
    /// # Safety
    /// `render_pass` must have a color attachment compatible with the image
    /// format followed by a depth attachment compatible with the depth format,
    /// and must stay alive until [`Self::detach_render_pass`] or drop.
    pub unsafe fn attach_render_pass(&mut self, render_pass: vk::RenderPass) -> Result<()> {
        // SAFETY: Framebuffers are only referenced by recorded frames, which the
        // caller has finished with before swapping render passes
        unsafe {
            self.device.device_wait_idle()?;
            self.destroy_framebuffers();
        }
        self.render_pass = Some(render_pass);
        self.create_framebuffers(render_pass)
    }

    /// Destroy the framebuffers and forget the render pass.
    pub fn detach_render_pass(&mut self) -> Result<()> {
        // SAFETY: Waiting for idle guarantees no framebuffer is in use
        unsafe {
            self.device.device_wait_idle()?;
            self.destroy_framebuffers();
        }
        self.render_pass = None;
        Ok(())
    }

    /// Extent to use when the surface leaves the choice to the application.
    pub fn set_desired_extent(&mut self, width: u32, height: u32) {
        self.desired_extent = vk::Extent2D { width, height };
    }

    /// A rebuild was requested while the surface had a zero extent.
    pub fn is_rebuild_deferred(&self) -> bool {
        self.rebuild.is_deferred()
    }

    fn create_framebuffers(&mut self, render_pass: vk::RenderPass) -> Result<()> {
        let extent = self.swapchain.extent;
        for &view in &self.swapchain.image_views {
            let attachments = [view, self.depth.view];
            let create_info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            // SAFETY: Views and render pass belong to this device
            let framebuffer = unsafe { self.device.create_framebuffer(&create_info, None)? };
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    /// # Safety
    /// No framebuffer may be in use.
    unsafe fn destroy_framebuffers(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            // SAFETY: Forwarded from the caller
            unsafe { self.device.destroy_framebuffer(framebuffer, None) };
        }
    }
}

impl PresentTarget for SurfaceSwapchain {
    unsafe fn acquire_next_image(
        &mut self,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<(u32, SwapchainStatus)> {
        // SAFETY: Forwarded from the trait contract
        unsafe {
            self.swapchain
                .acquire_next_image(&self.swapchain_loader, semaphore, timeout_ns)
        }
    }

    unsafe fn present(
        &mut self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<SwapchainStatus> {
        // SAFETY: Forwarded from the trait contract
        unsafe {
            self.swapchain
                .present(&self.swapchain_loader, queue, image_index, &[wait_semaphore])
        }
    }

    fn recreate(&mut self, families: QueueFamilies) -> Result<()> {
        let caps = self.surface.capabilities(self.physical_device)?;
        let Some(plan) = self.rebuild.request(&caps, self.desired_extent, self.vsync)? else {
            return Ok(());
        };

        // SAFETY: After the idle wait nothing references the old generation
        unsafe {
            self.device.device_wait_idle()?;

            let swapchain = Swapchain::new(
                &self.device,
                &self.swapchain_loader,
                self.surface.handle(),
                &plan,
                Some(self.swapchain.swapchain),
                families,
            )?;

            self.destroy_framebuffers();
            self.swapchain.destroy(&self.device, &self.swapchain_loader);
            self.swapchain = swapchain;
        }

        self.depth.destroy(&self.device, &self.allocator)?;
        self.depth = DepthBuffer::new(&self.device, &self.allocator, plan.extent, self.depth_format)?;

        if let Some(render_pass) = self.render_pass {
            self.create_framebuffers(render_pass)?;
        }

        info!(
            "Swapchain recreated: {}x{}, {} images",
            plan.extent.width,
            plan.extent.height,
            self.swapchain.images.len()
        );

        Ok(())
    }

    fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    fn image_format(&self) -> vk::Format {
        self.swapchain.format
    }

    fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers.get(image_index as usize).copied()
    }
}

impl Drop for SurfaceSwapchain {
    fn drop(&mut self) {
        // SAFETY: Waiting for idle guarantees nothing is in use
        unsafe {
            let _ = self.device.device_wait_idle();
            self.destroy_framebuffers();
            let _ = self.depth.destroy(&self.device, &self.allocator);
            self.swapchain.destroy(&self.device, &self.swapchain_loader);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(supported: &[vk::Format]) -> impl Fn(vk::Format) -> vk::FormatProperties + '_ {
        move |format| vk::FormatProperties {
            optimal_tiling_features: if supported.contains(&format) {
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::FormatFeatureFlags::empty()
            },
            ..Default::default()
        }
    }

    #[test]
    fn depth_format_follows_preference_order() {
        let features = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;

        assert_eq!(
            find_supported_format(&DEPTH_FORMAT_CANDIDATES, features, properties(&DEPTH_FORMAT_CANDIDATES)),
            Some(vk::Format::D32_SFLOAT)
        );
        assert_eq!(
            find_supported_format(
                &DEPTH_FORMAT_CANDIDATES,
                features,
                properties(&[vk::Format::D24_UNORM_S8_UINT, vk::Format::D32_SFLOAT_S8_UINT])
            ),
            Some(vk::Format::D32_SFLOAT_S8_UINT)
        );
        assert_eq!(
            find_supported_format(&DEPTH_FORMAT_CANDIDATES, features, properties(&[])),
            None
        );
    }
}
