//! Swapchain management.
//!
//! [`PresentTarget`] is the contract the frame synchronizer relies on.
//! [`Swapchain`] is one generation of presentable images; the owning
//! [`SurfaceSwapchain`](crate::surface::SurfaceSwapchain) replaces it on
//! recreation.

use crate::error::{GpuError, Result};
use crate::selection::QueueFamilies;
use crate::surface::SurfaceCapabilities;
use ash::prelude::VkResult;
use ash::vk;
use tracing::debug;

/// Outcome of an acquire or present call that the frame loop can recover from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainStatus {
    Optimal,
    /// Still usable, but no longer matches the surface exactly.
    Suboptimal,
    /// Unusable until recreated. For acquire, no image was acquired.
    OutOfDate,
}

impl SwapchainStatus {
    /// Map an acquire result. The index is meaningless for `OutOfDate`.
    pub fn from_acquire(result: VkResult<(u32, bool)>) -> Result<(u32, Self)> {
        match result {
            Ok((index, false)) => Ok((index, Self::Optimal)),
            Ok((index, true)) => Ok((index, Self::Suboptimal)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok((0, Self::OutOfDate)),
            Err(e) => Err(GpuError::Presentation(e)),
        }
    }

    /// Map a present result.
    pub fn from_present(result: VkResult<bool>) -> Result<Self> {
        match result {
            Ok(false) => Ok(Self::Optimal),
            Ok(true) => Ok(Self::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Self::OutOfDate),
            Err(e) => Err(GpuError::Presentation(e)),
        }
    }

    /// Whether the swapchain should be rebuilt after this status.
    pub fn needs_recreate(self) -> bool {
        self != Self::Optimal
    }
}

/// The presentable image chain as seen by the frame synchronizer.
pub trait PresentTarget {
    /// Acquire the next image, signaling `semaphore` when it is ready.
    ///
    /// # Safety
    /// `semaphore` must be a valid, unsignaled semaphore of the same device.
    unsafe fn acquire_next_image(
        &mut self,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<(u32, SwapchainStatus)>;

    /// Queue `image_index` for presentation after `wait_semaphore` signals.
    ///
    /// # Safety
    /// `queue` must support presentation to this surface and
    /// `wait_semaphore` must have a pending signal operation.
    unsafe fn present(
        &mut self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<SwapchainStatus>;

    /// Rebuild the image chain in place.
    ///
    /// Safe to call repeatedly. When the surface extent is degenerate the
    /// rebuild is deferred until a usable extent is observed.
    fn recreate(&mut self, families: QueueFamilies) -> Result<()>;

    fn extent(&self) -> vk::Extent2D;
    fn image_format(&self) -> vk::Format;
    fn depth_format(&self) -> vk::Format;
    /// Framebuffer for `image_index`, if a render pass is attached.
    fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer>;
}

/// Parameters for one swapchain generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainPlan {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainPlan {
    /// Derive the next generation's parameters.
    ///
    /// Returns `Ok(None)` when the resulting extent is degenerate (minimized
    /// window), in which case no swapchain can be built yet.
    pub fn new(
        caps: &SurfaceCapabilities,
        desired_extent: vk::Extent2D,
        vsync: bool,
    ) -> Result<Option<Self>> {
        let extent = calculate_extent(&caps.capabilities, desired_extent.width, desired_extent.height);
        if extent.width == 0 || extent.height == 0 {
            return Ok(None);
        }

        let surface_format = select_surface_format(&caps.formats).ok_or_else(|| {
            GpuError::SwapchainCreation("Surface reports no formats".to_string())
        })?;

        let mut image_count = caps.capabilities.min_image_count + 1;
        if caps.capabilities.max_image_count > 0 && image_count > caps.capabilities.max_image_count {
            image_count = caps.capabilities.max_image_count;
        }

        Ok(Some(Self {
            surface_format,
            present_mode: select_present_mode(&caps.present_modes, vsync),
            extent,
            image_count,
            pre_transform: caps.capabilities.current_transform,
        }))
    }
}

/// Tracks whether a requested rebuild is waiting for a usable surface extent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildGate {
    deferred: bool,
}

impl RebuildGate {
    /// Plan the next generation for a rebuild request.
    ///
    /// A degenerate extent yields `Ok(None)` and leaves the rebuild deferred;
    /// the first request that produces a plan clears the deferral.
    pub fn request(
        &mut self,
        caps: &SurfaceCapabilities,
        desired_extent: vk::Extent2D,
        vsync: bool,
    ) -> Result<Option<SwapchainPlan>> {
        let plan = SwapchainPlan::new(caps, desired_extent, vsync)?;
        match plan {
            None if !self.deferred => {
                debug!("Surface extent is zero, deferring swapchain rebuild");
                self.deferred = true;
            }
            None => {}
            Some(_) => self.deferred = false,
        }
        Ok(plan)
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }
}

/// Swapchain wrapper.
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a new swapchain.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        plan: &SwapchainPlan,
        old_swapchain: Option<vk::SwapchainKHR>,
        families: QueueFamilies,
    ) -> Result<Self> {
        let queue_families = [families.graphics, families.present];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(plan.image_count)
            .image_format(plan.surface_format.format)
            .image_color_space(plan.surface_format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .pre_transform(plan.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(plan.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or(vk::SwapchainKHR::null()));

        // Images cross between the two families without ownership transfers.
        let create_info = if families.shares_graphics_and_present() {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_families)
        };

        // SAFETY: Caller guarantees all handles are valid
        let swapchain = unsafe {
            swapchain_loader
                .create_swapchain(&create_info, None)
                .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?
        };

        // SAFETY: The swapchain was just created from this loader
        let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                // SAFETY: Nothing references the new swapchain yet
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e.into());
            }
        };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(plan.surface_format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                );

            // SAFETY: The image belongs to the new swapchain
            match unsafe { device.create_image_view(&view_info, None) } {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    // SAFETY: Nothing references the partial chain yet
                    unsafe {
                        for &view in &image_views {
                            device.destroy_image_view(view, None);
                        }
                        swapchain_loader.destroy_swapchain(swapchain, None);
                    }
                    return Err(e.into());
                }
            }
        }

        Ok(Self {
            swapchain,
            images,
            image_views,
            format: plan.surface_format.format,
            extent: plan.extent,
        })
    }

    /// Acquire the next image.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn acquire_next_image(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<(u32, SwapchainStatus)> {
        // SAFETY: Caller guarantees all handles are valid
        let result = unsafe {
            swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout_ns,
                semaphore,
                vk::Fence::null(),
            )
        };

        SwapchainStatus::from_acquire(result)
    }

    /// Present an image.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn present(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<SwapchainStatus> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        // SAFETY: Caller guarantees all handles are valid
        let result = unsafe { swapchain_loader.queue_present(queue, &present_info) };

        SwapchainStatus::from_present(result)
    }

    /// Destroy the swapchain.
    ///
    /// # Safety
    /// All handles must be valid and swapchain must not be in use.
    pub unsafe fn destroy(
        &self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) {
        // SAFETY: Caller guarantees the chain is idle
        unsafe {
            for &view in &self.image_views {
                device.destroy_image_view(view, None);
            }
            swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// Select the best surface format.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    // Prefer SRGB
    available
        .iter()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        // Prefer FIFO (vsync)
        vk::PresentModeKHR::FIFO
    } else {
        // Prefer mailbox (triple buffering without vsync)
        for &mode in available {
            if mode == vk::PresentModeKHR::MAILBOX {
                return mode;
            }
        }
        // Fall back to immediate
        for &mode in available {
            if mode == vk::PresentModeKHR::IMMEDIATE {
                return mode;
            }
        }
        // Fall back to FIFO (always supported)
        vk::PresentModeKHR::FIFO
    }
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: vk::Extent2D) -> SurfaceCapabilities {
        SurfaceCapabilities {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 3,
                current_extent: current,
                min_image_extent: vk::Extent2D {
                    width: 1,
                    height: 1,
                },
                max_image_extent: vk::Extent2D {
                    width: 4096,
                    height: 4096,
                },
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                ..Default::default()
            },
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::R8G8B8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE],
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn acquire_statuses() {
        assert_eq!(
            SwapchainStatus::from_acquire(Ok((2, false))).unwrap(),
            (2, SwapchainStatus::Optimal)
        );
        assert_eq!(
            SwapchainStatus::from_acquire(Ok((1, true))).unwrap(),
            (1, SwapchainStatus::Suboptimal)
        );
        assert_eq!(
            SwapchainStatus::from_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR))
                .unwrap()
                .1,
            SwapchainStatus::OutOfDate
        );
        assert!(matches!(
            SwapchainStatus::from_acquire(Err(vk::Result::ERROR_SURFACE_LOST_KHR)),
            Err(GpuError::Presentation(vk::Result::ERROR_SURFACE_LOST_KHR))
        ));
    }

    #[test]
    fn present_statuses() {
        assert_eq!(
            SwapchainStatus::from_present(Ok(false)).unwrap(),
            SwapchainStatus::Optimal
        );
        assert_eq!(
            SwapchainStatus::from_present(Ok(true)).unwrap(),
            SwapchainStatus::Suboptimal
        );
        assert_eq!(
            SwapchainStatus::from_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            SwapchainStatus::OutOfDate
        );
        assert!(matches!(
            SwapchainStatus::from_present(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(GpuError::Presentation(vk::Result::ERROR_DEVICE_LOST))
        ));
        assert!(!SwapchainStatus::Optimal.needs_recreate());
        assert!(SwapchainStatus::Suboptimal.needs_recreate());
    }

    #[test]
    fn surface_format_prefers_srgb() {
        let caps = caps(extent(800, 600));
        assert_eq!(
            select_surface_format(&caps.formats).unwrap().format,
            vk::Format::B8G8R8A8_SRGB
        );
        assert_eq!(
            select_surface_format(&caps.formats[..1]).unwrap().format,
            vk::Format::R8G8B8A8_UNORM
        );
        assert_eq!(select_surface_format(&[]), None);
    }

    #[test]
    fn present_mode_fallbacks() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(select_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&modes, false), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::MAILBOX], false),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(select_present_mode(&[], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_follows_surface_or_clamps_desired() {
        let fixed = caps(extent(640, 480));
        assert_eq!(
            calculate_extent(&fixed.capabilities, 1920, 1080),
            extent(640, 480)
        );

        let free = caps(extent(u32::MAX, u32::MAX));
        assert_eq!(
            calculate_extent(&free.capabilities, 8000, 0),
            extent(4096, 1)
        );
    }

    #[test]
    fn degenerate_extent_defers_plan() {
        let minimized = caps(extent(0, 0));
        assert_eq!(
            SwapchainPlan::new(&minimized, extent(1280, 720), false).unwrap(),
            None
        );
    }

    #[test]
    fn rebuild_waits_for_usable_extent() {
        let mut gate = RebuildGate::default();
        let minimized = caps(extent(0, 0));
        let restored = caps(extent(1024, 768));

        assert_eq!(gate.request(&minimized, extent(1280, 720), true).unwrap(), None);
        assert!(gate.is_deferred());
        assert_eq!(gate.request(&minimized, extent(1280, 720), true).unwrap(), None);
        assert!(gate.is_deferred());

        let plan = gate
            .request(&restored, extent(1280, 720), true)
            .unwrap()
            .unwrap();
        assert_eq!(plan.extent, extent(1024, 768));
        assert!(!gate.is_deferred());
    }

    #[test]
    fn repeated_rebuilds_keep_extent_and_format() {
        let mut gate = RebuildGate::default();
        let surface = caps(extent(1280, 720));

        let first = gate.request(&surface, extent(1280, 720), true).unwrap();
        let second = gate.request(&surface, extent(1280, 720), true).unwrap();

        assert!(first.is_some());
        assert_eq!(first, second);
        assert!(!gate.is_deferred());
    }

    #[test]
    fn plan_is_stable_for_unchanged_surface() {
        let surface = caps(extent(1280, 720));
        let first = SwapchainPlan::new(&surface, extent(1280, 720), false)
            .unwrap()
            .unwrap();
        let second = SwapchainPlan::new(&surface, extent(1280, 720), false)
            .unwrap()
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.extent, extent(1280, 720));
        assert_eq!(first.image_count, 3);
        assert_eq!(first.surface_format.format, vk::Format::B8G8R8A8_SRGB);
    }
}
