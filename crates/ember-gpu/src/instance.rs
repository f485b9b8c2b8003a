//! Vulkan instance creation.

use crate::error::{GpuError, Result};
use ash::vk;
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, c_void, CStr, CString};
use tracing::{debug, error, info, warn};

/// Validation layers to enable when validation is requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Instance extensions needed to present to `display`, plus debug utils when
/// validating.
pub fn required_instance_extensions(
    display: RawDisplayHandle,
    enable_validation: bool,
) -> Result<Vec<&'static CStr>> {
    let mut extensions: Vec<&'static CStr> = ash_window::enumerate_required_extensions(display)
        .map_err(|e| GpuError::SurfaceCreation(format!("Unsupported display: {e}")))?
        .iter()
        // SAFETY: ash-window returns pointers to static extension names
        .map(|&ptr| unsafe { CStr::from_ptr(ptr) })
        .collect();

    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_enumeration::NAME);

    if enable_validation {
        extensions.push(ash::ext::debug_utils::NAME);
    }

    Ok(extensions)
}

/// Vulkan entry, instance and optional debug messenger.
///
/// Destroyed on drop; everything created from the instance must be gone by then.
pub struct GpuInstance {
    debug: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    instance: ash::Instance,
    entry: ash::Entry,
}

impl GpuInstance {
    /// Load Vulkan and create an instance able to present to `display`.
    ///
    /// Missing validation layers are skipped with a warning.
    pub fn new(app_name: &str, display: RawDisplayHandle, enable_validation: bool) -> Result<Self> {
        // SAFETY: Loading the system Vulkan library has no other preconditions
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::LoadFailed(e.to_string()))?;

        let app_name = CString::new(app_name)
            .map_err(|e| GpuError::InvalidState(format!("Invalid application name: {e}")))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"Ember")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        let extensions = required_instance_extensions(display, enable_validation)?;
        let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();

        let layers = if enable_validation {
            // SAFETY: The entry was just loaded
            let available = unsafe { entry.enumerate_instance_layer_properties()? };
            available_layers(&validation_layers(), &available)
        } else {
            vec![]
        };
        let layer_names: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

        // Required for MoltenVK on macOS
        #[cfg(target_os = "macos")]
        let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        #[cfg(not(target_os = "macos"))]
        let create_flags = vk::InstanceCreateFlags::empty();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names)
            .flags(create_flags);

        // SAFETY: All pointers in create_info outlive the call
        let instance = unsafe { entry.create_instance(&create_info, None)? };

        let messenger = if enable_validation {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            // SAFETY: The instance was created with debug utils enabled
            match unsafe { loader.create_debug_utils_messenger(&messenger_create_info(), None) } {
                Ok(messenger) => Some((loader, messenger)),
                Err(e) => {
                    // SAFETY: Nothing else was created from the instance
                    unsafe { instance.destroy_instance(None) };
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        info!(
            "Vulkan instance created (validation: {})",
            messenger.is_some()
        );

        Ok(Self {
            debug: messenger,
            instance,
            entry,
        })
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn validation_enabled(&self) -> bool {
        self.debug.is_some()
    }
}

impl Drop for GpuInstance {
    fn drop(&mut self) {
        // SAFETY: Owners drop every child object before the instance
        unsafe {
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Keep the wanted layers that `available` reports, warning about the rest.
fn available_layers(
    wanted: &[&'static CStr],
    available: &[vk::LayerProperties],
) -> Vec<&'static CStr> {
    wanted
        .iter()
        .copied()
        .filter(|layer| {
            let found = available
                .iter()
                .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == *layer));
            if !found {
                warn!("Validation layer {} not available", layer.to_string_lossy());
            }
            found
        })
        .collect()
}

fn messenger_create_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
}

/// Routes validation messages to `tracing`. Never aborts the call.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    // SAFETY: The loader passes valid callback data for the duration of the call
    let message = unsafe {
        callback_data
            .as_ref()
            .and_then(|data| data.message_as_c_str())
            .map_or_else(|| "<no message>".into(), CStr::to_string_lossy)
    };

    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => error!("[{message_type:?}] {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => warn!("[{message_type:?}] {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => info!("[{message_type:?}] {message}"),
        _ => debug!("[{message_type:?}] {message}"),
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(name: &CStr) -> vk::LayerProperties {
        let mut props = vk::LayerProperties::default();
        for (dst, src) in props.layer_name.iter_mut().zip(name.to_bytes()) {
            *dst = *src as c_char;
        }
        props
    }

    #[test]
    fn missing_layers_are_skipped() {
        assert!(available_layers(&validation_layers(), &[]).is_empty());

        let available = [layer(c"VK_LAYER_MESA_overlay"), layer(c"VK_LAYER_KHRONOS_validation")];
        assert_eq!(
            available_layers(&validation_layers(), &available),
            validation_layers()
        );
    }
}
