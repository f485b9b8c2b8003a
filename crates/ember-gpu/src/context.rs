//! Logical device context.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use crate::memory::GpuAllocator;
use crate::selection::{QueueFamilies, SelectedDevice, SelectionPolicy};
use ash::vk;
use parking_lot::Mutex;
use std::ffi::{c_char, CStr};
use std::sync::Arc;

/// The logical device, its queues and its allocator.
///
/// Read-only after creation. Destroys the allocator and the device on drop;
/// everything created from the device must be gone by then.
pub struct DeviceContext {
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Arc<Mutex<GpuAllocator>>,
    pub(crate) policy: SelectionPolicy,

    pub(crate) families: QueueFamilies,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) present_queue: vk::Queue,
    pub(crate) transfer_queue: vk::Queue,
}

impl DeviceContext {
    /// Create the logical device for a selected candidate.
    ///
    /// One queue is created per distinct family. Anisotropic sampling and
    /// geometry shaders are always enabled; non-solid fill and wide lines are
    /// enabled when the device offers them.
    ///
    /// # Safety
    /// The instance must be valid and the candidate must come from it.
    pub unsafe fn new(
        instance: &ash::Instance,
        selected: &SelectedDevice<vk::PhysicalDevice>,
        required_extensions: &[&CStr],
    ) -> Result<Self> {
        let physical_device = selected.candidate;
        let families = selected.families;

        let queue_priority = 1.0_f32;
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(std::slice::from_ref(&queue_priority))
            })
            .collect();

        let extension_names: Vec<*const c_char> =
            required_extensions.iter().map(|ext| ext.as_ptr()).collect();
        let features = enabled_features(&selected.capabilities);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features);

        // SAFETY: Caller guarantees the instance and candidate are valid
        let device = unsafe {
            instance
                .create_device(physical_device, &device_create_info, None)
                .map_err(GpuError::from)?
        };

        // SAFETY: Every family in `families` got a queue above
        let (graphics_queue, present_queue, transfer_queue) = unsafe {
            (
                device.get_device_queue(families.graphics, 0),
                device.get_device_queue(families.present, 0),
                device.get_device_queue(families.transfer, 0),
            )
        };

        let device = Arc::new(device);

        // SAFETY: Instance, device and candidate are valid and related
        let allocator =
            match unsafe { GpuAllocator::new(instance, device.clone(), physical_device) } {
                Ok(allocator) => allocator,
                Err(e) => {
                    // SAFETY: Nothing else was created from the device
                    unsafe { device.destroy_device(None) };
                    return Err(e);
                }
            };

        tracing::info!(
            "Logical device created: graphics={}, present={}, transfer={} ({:?} selection)",
            families.graphics,
            families.present,
            families.transfer,
            selected.policy
        );

        Ok(Self {
            instance: instance.clone(),
            physical_device,
            device,
            capabilities: selected.capabilities.clone(),
            allocator: Arc::new(Mutex::new(allocator)),
            policy: selected.policy,
            families,
            graphics_queue,
            present_queue,
            transfer_queue,
        })
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Shared handle to the logical device.
    pub fn device_arc(&self) -> Arc<ash::Device> {
        self.device.clone()
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// The selection pass that accepted this device.
    pub fn selection_policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn transfer_queue(&self) -> vk::Queue {
        self.transfer_queue
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.families.graphics
    }

    pub fn present_queue_family(&self) -> u32 {
        self.families.present
    }

    pub fn transfer_queue_family(&self) -> u32 {
        self.families.transfer
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Arc<Mutex<GpuAllocator>> {
        &self.allocator
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        // SAFETY: The device is valid for the lifetime of the context
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        // SAFETY: Owners destroy every device child before the context
        unsafe {
            let _ = self.device.device_wait_idle();

            // Shutdown allocator BEFORE destroying device
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
        }
    }
}

/// Device features to enable for a device with `capabilities`.
pub fn enabled_features(capabilities: &GpuCapabilities) -> vk::PhysicalDeviceFeatures {
    vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(true)
        .geometry_shader(true)
        .fill_mode_non_solid(capabilities.fill_mode_non_solid)
        .wide_lines(capabilities.wide_lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::GpuVendor;

    #[test]
    fn optional_features_follow_device_support() {
        let mut caps = GpuCapabilities {
            vendor: GpuVendor::Nvidia,
            device_name: "Test GPU".to_string(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: vk::API_VERSION_1_0,
            driver_version: 1,
            sampler_anisotropy: true,
            geometry_shader: true,
            fill_mode_non_solid: false,
            wide_lines: true,
            max_sampler_anisotropy: 16.0,
            device_local_memory_mb: 8192,
        };

        let features = enabled_features(&caps);
        assert_eq!(features.sampler_anisotropy, vk::TRUE);
        assert_eq!(features.geometry_shader, vk::TRUE);
        assert_eq!(features.fill_mode_non_solid, vk::FALSE);
        assert_eq!(features.wide_lines, vk::TRUE);

        caps.fill_mode_non_solid = true;
        assert_eq!(enabled_features(&caps).fill_mode_non_solid, vk::TRUE);
    }
}
