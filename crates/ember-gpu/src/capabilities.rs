//! GPU capability detection.
//!
//! The selector never talks to Vulkan directly. It asks a [`DeviceProbe`],
//! which answers capability questions about a candidate device. The
//! [`VulkanProbe`] answers them from the driver; tests answer them from
//! synthetic device descriptions.

use ash::vk;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU properties and features.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Device class (discrete, integrated, ...)
    pub device_type: vk::PhysicalDeviceType,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Anisotropic sampling support
    pub sampler_anisotropy: bool,
    /// Geometry shader support
    pub geometry_shader: bool,
    /// Non-solid fill modes (wireframe)
    pub fill_mode_non_solid: bool,
    /// Line widths other than 1.0
    pub wide_lines: bool,
    /// Maximum sampler anisotropy
    pub max_sampler_anisotropy: f32,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        // SAFETY: Caller guarantees both handles are valid
        let (properties, features, memory_properties) = unsafe {
            (
                instance.get_physical_device_properties(physical_device),
                instance.get_physical_device_features(physical_device),
                instance.get_physical_device_memory_properties(physical_device),
            )
        };

        let device_name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed device>".to_string());

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,

            sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            geometry_shader: features.geometry_shader == vk::TRUE,
            fill_mode_non_solid: features.fill_mode_non_solid == vk::TRUE,
            wide_lines: features.wide_lines == vk::TRUE,
            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,

            device_local_memory_mb,
        }
    }

    /// Whether this is the preferred device class.
    pub fn is_discrete(&self) -> bool {
        self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }

    /// Check if the GPU has the device class and features the renderer needs.
    pub fn meets_requirements(&self) -> bool {
        self.is_discrete() && self.sampler_anisotropy && self.geometry_shader
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

/// Surface formats and present modes a device offers for the target surface.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    /// At least one format and one present mode are available.
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Capability queries against candidate devices.
///
/// Implementations must be side-effect free and idempotent. A capability that
/// cannot be determined is reported as absent.
pub trait DeviceProbe {
    /// Handle identifying a candidate device.
    type Candidate: Copy;

    /// Enumerate candidates in driver order.
    fn candidates(&self) -> crate::Result<Vec<Self::Candidate>>;

    /// Device class, properties and feature flags.
    fn capabilities(&self, candidate: Self::Candidate) -> GpuCapabilities;

    /// Capability flags of each queue family, indexed by family index.
    fn queue_families(&self, candidate: Self::Candidate) -> Vec<vk::QueueFlags>;

    /// Whether the given family can present to the target surface.
    fn supports_present(&self, candidate: Self::Candidate, family_index: u32) -> bool;

    /// Whether every extension in `required` is available.
    fn supports_extensions(&self, candidate: Self::Candidate, required: &[&CStr]) -> bool;

    /// Formats and present modes for the target surface.
    fn surface_support(&self, candidate: Self::Candidate) -> SurfaceSupport;
}

/// Return the required extensions missing from `available`.
pub fn missing_extensions<'a>(
    available: &[vk::ExtensionProperties],
    required: &[&'a CStr],
) -> Vec<&'a CStr> {
    required
        .iter()
        .copied()
        .filter(|req| {
            !available
                .iter()
                .any(|ext| ext.extension_name_as_c_str().is_ok_and(|name| name == *req))
        })
        .collect()
}

/// [`DeviceProbe`] backed by the Vulkan driver.
pub struct VulkanProbe<'a> {
    instance: &'a ash::Instance,
    surface_loader: &'a ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
}

impl<'a> VulkanProbe<'a> {
    /// Create a probe for the given surface.
    ///
    /// # Safety
    /// The instance, loader and surface must be valid for `'a`, and the
    /// surface must have been created from `instance`.
    pub unsafe fn new(
        instance: &'a ash::Instance,
        surface_loader: &'a ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Self {
        Self {
            instance,
            surface_loader,
            surface,
        }
    }
}

impl DeviceProbe for VulkanProbe<'_> {
    type Candidate = vk::PhysicalDevice;

    fn candidates(&self) -> crate::Result<Vec<vk::PhysicalDevice>> {
        // SAFETY: Instance validity is guaranteed by `VulkanProbe::new`
        let devices = unsafe { self.instance.enumerate_physical_devices()? };
        Ok(devices)
    }

    fn capabilities(&self, candidate: vk::PhysicalDevice) -> GpuCapabilities {
        // SAFETY: Candidates come from this instance
        unsafe { GpuCapabilities::query(self.instance, candidate) }
    }

    fn queue_families(&self, candidate: vk::PhysicalDevice) -> Vec<vk::QueueFlags> {
        // SAFETY: Candidates come from this instance
        let families = unsafe {
            self.instance
                .get_physical_device_queue_family_properties(candidate)
        };
        families.iter().map(|family| family.queue_flags).collect()
    }

    fn supports_present(&self, candidate: vk::PhysicalDevice, family_index: u32) -> bool {
        // SAFETY: Surface and candidate come from this instance
        let supported = unsafe {
            self.surface_loader.get_physical_device_surface_support(
                candidate,
                family_index,
                self.surface,
            )
        };
        supported.unwrap_or_else(|e| {
            tracing::debug!("Present support query failed for family {family_index}: {e}");
            false
        })
    }

    fn supports_extensions(&self, candidate: vk::PhysicalDevice, required: &[&CStr]) -> bool {
        // SAFETY: Candidates come from this instance
        let available = unsafe {
            self.instance
                .enumerate_device_extension_properties(candidate)
                .unwrap_or_default()
        };

        let missing = missing_extensions(&available, required);
        if !missing.is_empty() {
            tracing::debug!("Missing device extensions: {missing:?}");
        }
        missing.is_empty()
    }

    fn surface_support(&self, candidate: vk::PhysicalDevice) -> SurfaceSupport {
        // SAFETY: Surface and candidate come from this instance
        unsafe {
            SurfaceSupport {
                formats: self
                    .surface_loader
                    .get_physical_device_surface_formats(candidate, self.surface)
                    .unwrap_or_default(),
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(candidate, self.surface)
                    .unwrap_or_default(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extension(name: &CStr) -> vk::ExtensionProperties {
        let mut props = vk::ExtensionProperties::default();
        for (dst, src) in props.extension_name.iter_mut().zip(name.to_bytes()) {
            *dst = *src as std::ffi::c_char;
        }
        props
    }

    fn capabilities(device_type: vk::PhysicalDeviceType) -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Amd,
            device_name: "Test GPU".to_string(),
            device_type,
            api_version: vk::API_VERSION_1_0,
            driver_version: 1,
            sampler_anisotropy: true,
            geometry_shader: true,
            fill_mode_non_solid: false,
            wide_lines: false,
            max_sampler_anisotropy: 16.0,
            device_local_memory_mb: 4096,
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn requirements_need_discrete_gpu_and_features() {
        assert!(capabilities(vk::PhysicalDeviceType::DISCRETE_GPU).meets_requirements());
        assert!(!capabilities(vk::PhysicalDeviceType::INTEGRATED_GPU).meets_requirements());

        let mut caps = capabilities(vk::PhysicalDeviceType::DISCRETE_GPU);
        caps.geometry_shader = false;
        assert!(!caps.meets_requirements());

        let mut caps = capabilities(vk::PhysicalDeviceType::DISCRETE_GPU);
        caps.sampler_anisotropy = false;
        assert!(!caps.meets_requirements());
    }

    #[test]
    fn missing_extensions_reports_only_absent_names() {
        let available = [extension(ash::khr::swapchain::NAME)];
        let required = [ash::khr::swapchain::NAME, ash::khr::maintenance1::NAME];

        let missing = missing_extensions(&available, &required);
        assert_eq!(missing, vec![ash::khr::maintenance1::NAME]);
        assert!(missing_extensions(&available, &required[..1]).is_empty());
    }

    #[test]
    fn surface_support_needs_format_and_mode() {
        let mut support = SurfaceSupport::default();
        assert!(!support.is_adequate());

        support.formats.push(vk::SurfaceFormatKHR::default());
        assert!(!support.is_adequate());

        support.present_modes.push(vk::PresentModeKHR::FIFO);
        assert!(support.is_adequate());
    }
}
