//! One-shot command execution and image layout transitions.

use crate::error::{GpuError, Result};
use crate::ops::{DeviceOps, Submission};
use ash::vk;

/// Records short-lived command buffers and waits for them synchronously.
///
/// Buffers are allocated from the frame pool and submitted to the graphics
/// queue. Intended for setup work such as uploads and layout transitions,
/// never for per-frame rendering.
#[derive(Debug, Clone, Copy)]
pub struct OneShotExecutor {
    pool: vk::CommandPool,
    queue: vk::Queue,
}

impl OneShotExecutor {
    pub fn new(pool: vk::CommandPool, queue: vk::Queue) -> Self {
        Self { pool, queue }
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Record with `record`, submit, and block until the queue is idle.
    ///
    /// The command buffer is freed on every path once allocated.
    ///
    /// # Safety
    /// `device` must own the pool and queue, and no other thread may use the
    /// pool concurrently.
    pub unsafe fn run<D, F>(&self, device: &D, record: F) -> Result<()>
    where
        D: DeviceOps,
        F: FnOnce(vk::CommandBuffer),
    {
        // SAFETY: Caller guarantees the pool belongs to this device
        let cmd = unsafe { device.allocate_command_buffers(self.pool, 1)? }
            .first()
            .copied()
            .ok_or_else(|| GpuError::InvalidState("No command buffer allocated".to_string()))?;

        // SAFETY: The buffer was just allocated and is not in use
        let result = unsafe { self.record_and_submit(device, cmd, record) };

        // SAFETY: Either the queue drained or the buffer never reached it
        unsafe { device.free_command_buffers(self.pool, &[cmd]) };

        result
    }

    unsafe fn record_and_submit<D, F>(&self, device: &D, cmd: vk::CommandBuffer, record: F) -> Result<()>
    where
        D: DeviceOps,
        F: FnOnce(vk::CommandBuffer),
    {
        // SAFETY: Forwarded from `run`
        unsafe {
            device.begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
            record(cmd);
            device.end_command_buffer(cmd)?;

            let command_buffers = [cmd];
            device.queue_submit(
                self.queue,
                &Submission {
                    command_buffers: &command_buffers,
                    ..Default::default()
                },
                vk::Fence::null(),
            )?;
            device.queue_wait_idle(self.queue)
        }
    }

    /// Move `image` from `old` to `new` layout and wait for completion.
    ///
    /// Unsupported pairs fail before any command buffer is allocated.
    ///
    /// # Safety
    /// Same as [`Self::run`]; `image` must be a valid image of `format`.
    pub unsafe fn transition_image_layout<D: DeviceOps>(
        &self,
        device: &D,
        image: vk::Image,
        format: vk::Format,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> Result<()> {
        let transition = LayoutTransition::resolve(old, new)?;

        // SAFETY: Forwarded from the caller
        unsafe {
            self.run(device, |cmd| {
                transition.record(device, cmd, image, format);
            })
        }
    }
}

/// Access masks and stages for one supported layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub old: vk::ImageLayout,
    pub new: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl LayoutTransition {
    /// Look up the barrier parameters for `old -> new`.
    pub fn resolve(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<Self> {
        let (src_access, dst_access, src_stage, dst_stage) = match (old, new) {
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
            ),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => (
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
            ),
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
                vk::AccessFlags::empty(),
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            ),
            _ => return Err(GpuError::UnsupportedLayoutTransition { old, new }),
        };

        Ok(Self {
            old,
            new,
            src_access,
            dst_access,
            src_stage,
            dst_stage,
        })
    }

    /// Full-image barrier for `image`.
    pub fn barrier(&self, image: vk::Image, format: vk::Format) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier::default()
            .old_layout(self.old)
            .new_layout(self.new)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect_mask(format))
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
    }

    /// Record the barrier into `cmd`.
    ///
    /// # Safety
    /// `cmd` must be in the recording state and `image` must be valid.
    pub unsafe fn record<D: DeviceOps>(
        &self,
        device: &D,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        format: vk::Format,
    ) {
        let barrier = self.barrier(image, format);
        // SAFETY: Forwarded from the caller
        unsafe { device.cmd_image_barrier(cmd, self.src_stage, self.dst_stage, &barrier) };
    }
}

/// Record a layout transition into a caller-owned command buffer.
///
/// # Safety
/// `cmd` must be in the recording state and `image` must be valid.
pub unsafe fn record_layout_transition<D: DeviceOps>(
    device: &D,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    format: vk::Format,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let transition = LayoutTransition::resolve(old, new)?;
    // SAFETY: Forwarded from the caller
    unsafe { transition.record(device, cmd, image, format) };
    Ok(())
}

/// Image aspect implied by a format.
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}
