//! Physical device selection.
//!
//! Candidates are tried in enumeration order, first with a [`SelectionPolicy::Strict`]
//! predicate and, only when no candidate passes, again with
//! [`SelectionPolicy::Relaxed`]. Both passes run the same device, feature,
//! extension and surface checks; they differ only in how queue families may be
//! assigned to roles.

use crate::capabilities::{DeviceProbe, GpuCapabilities};
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::CStr;

/// Queue family indices gathered while scanning a candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
    pub transfer: Option<u32>,
}

impl QueueFamilyIndices {
    /// All three roles are assigned.
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some() && self.transfer.is_some()
    }

    /// Convert to resolved indices if complete.
    pub fn resolve(&self) -> Option<QueueFamilies> {
        Some(QueueFamilies {
            graphics: self.graphics?,
            present: self.present?,
            transfer: self.transfer?,
        })
    }
}

/// Resolved queue family indices of the selected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
    pub transfer: u32,
}

impl QueueFamilies {
    /// Distinct family indices, ascending.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics, self.present, self.transfer];
        families.sort_unstable();
        families.dedup();
        families
    }

    /// Graphics and present are served by the same family.
    pub fn shares_graphics_and_present(&self) -> bool {
        self.graphics == self.present
    }
}

/// Queue family constraints applied during a selection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// One family serves graphics and present; transfer runs on a family
    /// without graphics support.
    Strict,
    /// Each role is served by any capable family.
    Relaxed,
}

impl SelectionPolicy {
    /// Passes in the order they are attempted.
    pub const PASSES: [Self; 2] = [Self::Strict, Self::Relaxed];

    fn accepts_transfer(self, flags: vk::QueueFlags) -> bool {
        match self {
            Self::Strict => {
                flags.contains(vk::QueueFlags::TRANSFER) && !flags.contains(vk::QueueFlags::GRAPHICS)
            }
            Self::Relaxed => flags.contains(vk::QueueFlags::TRANSFER),
        }
    }

    fn accepts(self, indices: &QueueFamilyIndices) -> bool {
        if !indices.is_complete() {
            return false;
        }
        match self {
            Self::Strict => indices.graphics == indices.present,
            Self::Relaxed => true,
        }
    }
}

/// Scan a candidate's queue families and assign roles under `policy`.
///
/// Families are visited in index order. A visited family takes over every role
/// it qualifies for (graphics bit, then transfer bit, then present support), and
/// the scan stops at the first family after which the policy accepts the
/// assignment.
pub fn find_queue_families<P: DeviceProbe>(
    probe: &P,
    candidate: P::Candidate,
    policy: SelectionPolicy,
) -> Option<QueueFamilies> {
    let mut indices = QueueFamilyIndices::default();

    for (index, flags) in (0u32..).zip(probe.queue_families(candidate)) {
        if flags.contains(vk::QueueFlags::GRAPHICS) {
            indices.graphics = Some(index);
        }

        if policy.accepts_transfer(flags) {
            indices.transfer = Some(index);
        }

        if probe.supports_present(candidate, index) {
            indices.present = Some(index);
        }

        if policy.accepts(&indices) {
            return indices.resolve();
        }
    }

    None
}

/// Run the full suitability check for a candidate under `policy`.
///
/// Returns the queue family assignment when the candidate is acceptable.
pub fn check_candidate<P: DeviceProbe>(
    probe: &P,
    candidate: P::Candidate,
    required_extensions: &[&CStr],
    policy: SelectionPolicy,
) -> Option<(GpuCapabilities, QueueFamilies)> {
    let capabilities = probe.capabilities(candidate);
    let name = &capabilities.device_name;

    if !capabilities.meets_requirements() {
        tracing::debug!("{policy:?}: rejecting {name}: device class or features inadequate");
        return None;
    }

    let Some(families) = find_queue_families(probe, candidate, policy) else {
        tracing::debug!("{policy:?}: rejecting {name}: queue families cannot fill all roles");
        return None;
    };

    if !probe.supports_extensions(candidate, required_extensions) {
        tracing::debug!("{policy:?}: rejecting {name}: required extensions missing");
        return None;
    }

    if !probe.surface_support(candidate).is_adequate() {
        tracing::debug!("{policy:?}: rejecting {name}: no surface format or present mode");
        return None;
    }

    Some((capabilities, families))
}

/// The outcome of device selection.
#[derive(Debug, Clone)]
pub struct SelectedDevice<C> {
    pub candidate: C,
    pub capabilities: GpuCapabilities,
    pub families: QueueFamilies,
    /// Pass that accepted the device.
    pub policy: SelectionPolicy,
}

/// Select the first acceptable device, trying the strict pass before the
/// relaxed one.
pub fn select_device<P: DeviceProbe>(
    probe: &P,
    required_extensions: &[&CStr],
) -> Result<SelectedDevice<P::Candidate>> {
    let candidates = probe.candidates()?;

    if candidates.is_empty() {
        tracing::error!("No Vulkan devices found");
        return Err(GpuError::NoSuitableDevice);
    }

    for policy in SelectionPolicy::PASSES {
        for &candidate in &candidates {
            if let Some((capabilities, families)) =
                check_candidate(probe, candidate, required_extensions, policy)
            {
                tracing::info!(
                    "Selected {} ({policy:?} pass): graphics={}, present={}, transfer={}",
                    capabilities.device_name,
                    families.graphics,
                    families.present,
                    families.transfer,
                );
                return Ok(SelectedDevice {
                    candidate,
                    capabilities,
                    families,
                    policy,
                });
            }
        }
    }

    tracing::error!("None of {} devices is suitable", candidates.len());
    Err(GpuError::NoSuitableDevice)
}
