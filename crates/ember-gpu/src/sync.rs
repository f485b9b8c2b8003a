//! Synchronization primitives.

use crate::error::Result;
use crate::ops::DeviceOps;
use ash::vk;

/// Synchronization objects owned by one frame slot.
///
/// Destroyed by [`FrameSync::destroy`]; the owning frame ring calls it during
/// shutdown.
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    /// Semaphore signaled when image is available
    pub image_available: vk::Semaphore,
    /// Semaphore signaled when rendering is complete
    pub render_finished: vk::Semaphore,
    /// Fence signaled when the slot's submission retires
    pub in_flight: vk::Fence,
}

impl FrameSync {
    /// Create frame synchronization resources.
    ///
    /// The fence starts signaled so the first wait on a fresh slot returns
    /// immediately. Objects created before a failure are destroyed again.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new<D: DeviceOps>(device: &D) -> Result<Self> {
        // SAFETY: Caller guarantees the device is valid
        unsafe {
            let image_available = device.create_semaphore()?;

            let render_finished = match device.create_semaphore() {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.destroy_semaphore(image_available);
                    return Err(e);
                }
            };

            let in_flight = match device.create_fence(true) {
                Ok(fence) => fence,
                Err(e) => {
                    device.destroy_semaphore(image_available);
                    device.destroy_semaphore(render_finished);
                    return Err(e);
                }
            };

            Ok(Self {
                image_available,
                render_finished,
                in_flight,
            })
        }
    }

    /// Block until this slot's previous submission has retired.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait<D: DeviceOps>(&self, device: &D) -> Result<()> {
        // SAFETY: Caller guarantees the device is valid
        unsafe { device.wait_for_fence(self.in_flight, u64::MAX) }
    }

    /// Reset the fence for the next submission.
    ///
    /// # Safety
    /// The device must be valid and the fence must not be pending.
    pub unsafe fn reset<D: DeviceOps>(&self, device: &D) -> Result<()> {
        // SAFETY: Caller guarantees the device is valid
        unsafe { device.reset_fence(self.in_flight) }
    }

    /// Destroy synchronization resources.
    ///
    /// # Safety
    /// The device must be valid and resources must not be in use.
    pub unsafe fn destroy<D: DeviceOps>(&self, device: &D) {
        // SAFETY: Caller guarantees the objects are idle
        unsafe {
            device.destroy_semaphore(self.image_available);
            device.destroy_semaphore(self.render_finished);
            device.destroy_fence(self.in_flight);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Event, MockDevice};

    #[test]
    fn new_slot_fence_starts_signaled() {
        let device = MockDevice::new();
        let sync = unsafe { FrameSync::new(&device).unwrap() };

        assert!(device.is_signaled(sync.in_flight));
        unsafe { sync.wait(&device).unwrap() };
        assert!(device.is_signaled(sync.in_flight));
    }

    #[test]
    fn destroy_releases_every_object() {
        let device = MockDevice::new();
        let sync = unsafe { FrameSync::new(&device).unwrap() };

        unsafe { sync.destroy(&device) };

        assert_eq!(device.live_objects(), 0);
        assert!(device
            .events()
            .contains(&Event::DestroyFence(sync.in_flight)));
    }

    #[test]
    fn waiting_on_reset_fence_without_submission_is_flagged() {
        let device = MockDevice::new();
        let sync = unsafe { FrameSync::new(&device).unwrap() };

        unsafe {
            sync.reset(&device).unwrap();
            assert!(sync.wait(&device).is_err());
        }

        assert_eq!(device.violations().len(), 1);
        assert!(!device.is_signaled(sync.in_flight));
    }

    #[test]
    fn partial_creation_is_rolled_back() {
        let device = MockDevice::new();
        device.fail_fence_creation();

        assert!(unsafe { FrameSync::new(&device) }.is_err());
        assert_eq!(device.live_objects(), 0);
    }
}
