//! Frame pacing.
//!
//! A fixed ring of [`MAX_FRAMES_IN_FLIGHT`] slots, each owning a command
//! buffer and its synchronization objects. The CPU records into slot `n` only
//! after the fence of the submission previously made from slot `n` has
//! signaled, so at most [`MAX_FRAMES_IN_FLIGHT`] frames are in flight.
//!
//! Swapchain invalidation never surfaces as an error. An out-of-date acquire
//! rebuilds the swapchain and reports [`FrameStatus::Skipped`]; an out-of-date
//! or suboptimal present rebuilds after the frame was queued.

use crate::command::OneShotExecutor;
use crate::error::{GpuError, Result};
use crate::ops::{DeviceOps, Submission};
use crate::selection::QueueFamilies;
use crate::swapchain::{PresentTarget, SwapchainStatus};
use crate::sync::FrameSync;
use ash::vk;
use tracing::{debug, warn};

/// Number of frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Lifecycle of a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Not recording; any previous submission has retired or is awaited next.
    Idle,
    /// Command buffer is open for recording.
    Recording,
    /// Submitted; the fence signals when the GPU is done.
    Submitted,
}

/// One entry of the frame ring.
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub sync: FrameSync,
    pub state: SlotState,
}

/// The fixed slot sequence and the position within it.
struct FrameRing {
    slots: Vec<FrameSlot>,
    current: usize,
    image_index: Option<u32>,
}

impl FrameRing {
    fn current(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    fn current_mut(&mut self) -> &mut FrameSlot {
        &mut self.slots[self.current]
    }

    fn advance(&mut self) {
        self.current = (self.current + 1) % MAX_FRAMES_IN_FLIGHT;
    }
}

/// What the caller needs to record a frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    /// Slot index in `0..MAX_FRAMES_IN_FLIGHT`.
    pub frame_index: usize,
    /// Acquired swapchain image.
    pub image_index: u32,
    /// Open command buffer for this frame.
    pub command_buffer: vk::CommandBuffer,
    pub extent: vk::Extent2D,
    /// Framebuffer of the acquired image, if a render pass is attached.
    pub framebuffer: Option<vk::Framebuffer>,
}

/// Result of [`FrameSynchronizer::begin_frame`].
#[derive(Debug, Clone, Copy)]
pub enum FrameStatus {
    /// Recording may proceed.
    Ready(FrameInfo),
    /// The swapchain was rebuilt; draw nothing this tick.
    Skipped,
}

/// Drives the begin/end frame protocol over the frame ring.
pub struct FrameSynchronizer {
    pool: vk::CommandPool,
    ring: FrameRing,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    families: QueueFamilies,
    resize_pending: bool,
}

impl FrameSynchronizer {
    /// Create the command pool and the frame ring.
    ///
    /// The pool lives on the graphics family and allows per-buffer reset.
    /// Everything created before a failure is destroyed again.
    ///
    /// # Safety
    /// The device and queues must be valid and belong to the same device.
    pub unsafe fn new<D: DeviceOps>(
        device: &D,
        families: QueueFamilies,
        graphics_queue: vk::Queue,
        present_queue: vk::Queue,
    ) -> Result<Self> {
        // SAFETY: Caller guarantees the device is valid
        unsafe {
            let pool = device.create_command_pool(
                families.graphics,
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )?;

            let command_buffers =
                match device.allocate_command_buffers(pool, MAX_FRAMES_IN_FLIGHT as u32) {
                    Ok(buffers) => buffers,
                    Err(e) => {
                        device.destroy_command_pool(pool);
                        return Err(e);
                    }
                };

            let mut slots = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
            for &command_buffer in &command_buffers {
                match FrameSync::new(device) {
                    Ok(sync) => slots.push(FrameSlot {
                        command_buffer,
                        sync,
                        state: SlotState::Idle,
                    }),
                    Err(e) => {
                        for slot in &slots {
                            slot.sync.destroy(device);
                        }
                        // Frees the command buffers as well
                        device.destroy_command_pool(pool);
                        return Err(e);
                    }
                }
            }

            Ok(Self {
                pool,
                ring: FrameRing {
                    slots,
                    current: 0,
                    image_index: None,
                },
                graphics_queue,
                present_queue,
                families,
                resize_pending: false,
            })
        }
    }

    /// Wait for the current slot, acquire an image and open the command buffer.
    ///
    /// # Safety
    /// `device` must be the device this synchronizer was created with and
    /// `target` must present through the same device.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn begin_frame<D: DeviceOps, T: PresentTarget>(
        &mut self,
        device: &D,
        target: &mut T,
    ) -> Result<FrameStatus> {
        let frame_index = self.ring.current;
        let slot = *self.ring.current();

        if slot.state == SlotState::Recording {
            return Err(GpuError::InvalidState(format!(
                "begin_frame called while frame {frame_index} is recording"
            )));
        }

        // SAFETY: Caller guarantees the device and target are valid
        let image_index = unsafe {
            slot.sync.wait(device)?;
            self.ring.current_mut().state = SlotState::Idle;

            let (image_index, status) =
                target.acquire_next_image(slot.sync.image_available, u64::MAX)?;

            if status == SwapchainStatus::OutOfDate {
                // The fence stays signaled so the next attempt does not block
                debug!("Swapchain out of date on acquire, skipping frame {frame_index}");
                target.recreate(self.families)?;
                self.resize_pending = false;
                return Ok(FrameStatus::Skipped);
            }

            slot.sync.reset(device)?;
            device.reset_command_buffer(slot.command_buffer)?;
            device.begin_command_buffer(
                slot.command_buffer,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )?;
            image_index
        };

        self.ring.current_mut().state = SlotState::Recording;
        self.ring.image_index = Some(image_index);

        Ok(FrameStatus::Ready(FrameInfo {
            frame_index,
            image_index,
            command_buffer: slot.command_buffer,
            extent: target.extent(),
            framebuffer: target.framebuffer(image_index),
        }))
    }

    /// Close, submit and present the current frame, then advance the ring.
    ///
    /// # Safety
    /// Same as [`Self::begin_frame`].
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn end_frame<D: DeviceOps, T: PresentTarget>(
        &mut self,
        device: &D,
        target: &mut T,
    ) -> Result<()> {
        let frame_index = self.ring.current;
        let slot = *self.ring.current();

        let image_index = match (slot.state, self.ring.image_index) {
            (SlotState::Recording, Some(index)) => index,
            _ => {
                return Err(GpuError::InvalidState(format!(
                    "end_frame called without a started frame (slot {frame_index} is {:?})",
                    slot.state
                )));
            }
        };

        let command_buffers = [slot.command_buffer];
        let wait_semaphores = [slot.sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [slot.sync.render_finished];

        // SAFETY: Caller guarantees the device and target are valid
        let status = unsafe {
            device.end_command_buffer(slot.command_buffer)?;
            device.queue_submit(
                self.graphics_queue,
                &Submission {
                    command_buffers: &command_buffers,
                    wait_semaphores: &wait_semaphores,
                    wait_stages: &wait_stages,
                    signal_semaphores: &signal_semaphores,
                },
                slot.sync.in_flight,
            )?;

            self.ring.current_mut().state = SlotState::Submitted;
            self.ring.image_index = None;

            target.present(self.present_queue, image_index, slot.sync.render_finished)?
        };

        if status.needs_recreate() || self.resize_pending {
            debug!(
                "Recreating swapchain after present ({status:?}, resize pending: {})",
                self.resize_pending
            );
            target.recreate(self.families)?;
            self.resize_pending = false;
        }

        self.ring.advance();
        Ok(())
    }

    /// Mark the swapchain for recreation after the next present.
    pub fn notify_resized(&mut self) {
        self.resize_pending = true;
    }

    pub fn resize_pending(&self) -> bool {
        self.resize_pending
    }

    /// Block until every slot's submission has retired.
    ///
    /// A slot still `Recording` belongs to a frame that failed before it was
    /// submitted: its fence is reset and its acquire semaphore has a signal
    /// nobody waits on. An empty batch consumes the semaphore and signals the
    /// fence, so that slot retires like the others. If even that submission
    /// fails the slot is released without waiting.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait_all<D: DeviceOps>(&mut self, device: &D) -> Result<()> {
        let graphics_queue = self.graphics_queue;

        for (index, slot) in self.ring.slots.iter_mut().enumerate() {
            if slot.state == SlotState::Recording {
                let wait_semaphores = [slot.sync.image_available];
                let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
                let retire = Submission {
                    command_buffers: &[],
                    wait_semaphores: &wait_semaphores,
                    wait_stages: &wait_stages,
                    signal_semaphores: &[],
                };

                // SAFETY: The fence is unsignaled and has no pending submission
                if let Err(e) =
                    unsafe { device.queue_submit(graphics_queue, &retire, slot.sync.in_flight) }
                {
                    warn!("Could not retire abandoned frame {index}: {e}");
                    slot.state = SlotState::Idle;
                    continue;
                }
                debug!("Retiring abandoned frame {index}");
            }

            // SAFETY: Caller guarantees the device is valid
            unsafe { slot.sync.wait(device)? };
            slot.state = SlotState::Idle;
        }

        self.ring.image_index = None;
        Ok(())
    }

    /// Executor that records into this synchronizer's pool and submits to
    /// the graphics queue.
    pub fn one_shot(&self) -> OneShotExecutor {
        OneShotExecutor::new(self.pool, self.graphics_queue)
    }

    /// Destroy the ring and the command pool.
    ///
    /// # Safety
    /// No slot may be in flight; call [`Self::wait_all`] first.
    pub unsafe fn destroy<D: DeviceOps>(&mut self, device: &D) {
        let command_buffers: Vec<_> = self
            .ring
            .slots
            .iter()
            .map(|slot| slot.command_buffer)
            .collect();

        // SAFETY: Caller guarantees nothing is in flight
        unsafe {
            device.free_command_buffers(self.pool, &command_buffers);
            for slot in &self.ring.slots {
                slot.sync.destroy(device);
            }
            device.destroy_command_pool(self.pool);
        }

        self.ring.slots.clear();
        self.pool = vk::CommandPool::null();
    }

    /// Current slot index.
    pub fn current_frame(&self) -> usize {
        self.ring.current
    }

    /// Command buffer of the current slot.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.ring.current().command_buffer
    }

    /// Image acquired for the frame being recorded.
    pub fn image_index(&self) -> Option<u32> {
        self.ring.image_index
    }

    pub fn slot_states(&self) -> [SlotState; MAX_FRAMES_IN_FLIGHT] {
        let mut states = [SlotState::Idle; MAX_FRAMES_IN_FLIGHT];
        for (state, slot) in states.iter_mut().zip(&self.ring.slots) {
            *state = slot.state;
        }
        states
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.ring.slots
    }
}
