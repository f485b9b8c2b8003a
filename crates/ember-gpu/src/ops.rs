//! Device operations used by the frame loop and the one-shot executor.
//!
//! [`DeviceOps`] is the narrow slice of the logical device that frame pacing
//! depends on. `ash::Device` implements it directly.

use crate::error::Result;
use ash::vk;

/// A single queue submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct Submission<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// Logical device operations needed for frame synchronization.
///
/// # Safety
/// Every method has the safety contract of the Vulkan command it wraps: all
/// handles passed in must have been created from this device and must not be
/// used concurrently from another thread.
pub trait DeviceOps {
    unsafe fn create_semaphore(&self) -> Result<vk::Semaphore>;
    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    unsafe fn destroy_fence(&self, fence: vk::Fence);
    /// Block until `fence` is signaled or `timeout_ns` elapses.
    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()>;
    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    unsafe fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool>;
    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);
    unsafe fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>>;
    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);

    unsafe fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;
    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()>;
    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;
    unsafe fn cmd_image_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier<'_>,
    );

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> Result<()>;
    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()>;
}

impl DeviceOps for ash::Device {
    unsafe fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        // SAFETY: Forwarded from the trait contract
        Ok(unsafe { ash::Device::create_semaphore(self, &create_info, None)? })
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: Forwarded from the trait contract
        unsafe { ash::Device::destroy_semaphore(self, semaphore, None) };
    }

    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);
        // SAFETY: Forwarded from the trait contract
        Ok(unsafe { ash::Device::create_fence(self, &create_info, None)? })
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        // SAFETY: Forwarded from the trait contract
        unsafe { ash::Device::destroy_fence(self, fence, None) };
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        // SAFETY: Forwarded from the trait contract
        unsafe { self.wait_for_fences(&[fence], true, timeout_ns)? };
        Ok(())
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        // SAFETY: Forwarded from the trait contract
        unsafe { self.reset_fences(&[fence])? };
        Ok(())
    }

    unsafe fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);
        // SAFETY: Forwarded from the trait contract
        Ok(unsafe { ash::Device::create_command_pool(self, &create_info, None)? })
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: Forwarded from the trait contract
        unsafe { ash::Device::destroy_command_pool(self, pool, None) };
    }

    unsafe fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        // SAFETY: Forwarded from the trait contract
        Ok(unsafe { ash::Device::allocate_command_buffers(self, &alloc_info)? })
    }

    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        // SAFETY: Forwarded from the trait contract
        unsafe { ash::Device::free_command_buffers(self, pool, buffers) };
    }

    unsafe fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        // SAFETY: Forwarded from the trait contract
        unsafe {
            ash::Device::reset_command_buffer(self, cmd, vk::CommandBufferResetFlags::empty())?;
        }
        Ok(())
    }

    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        // SAFETY: Forwarded from the trait contract
        unsafe { ash::Device::begin_command_buffer(self, cmd, &begin_info)? };
        Ok(())
    }

    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        // SAFETY: Forwarded from the trait contract
        unsafe { ash::Device::end_command_buffer(self, cmd)? };
        Ok(())
    }

    unsafe fn cmd_image_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier<'_>,
    ) {
        // SAFETY: Forwarded from the trait contract
        unsafe {
            self.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(barrier),
            );
        }
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> Result<()> {
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(submission.command_buffers)
            .wait_semaphores(submission.wait_semaphores)
            .wait_dst_stage_mask(submission.wait_stages)
            .signal_semaphores(submission.signal_semaphores);

        // SAFETY: Forwarded from the trait contract
        unsafe { ash::Device::queue_submit(self, queue, &[submit_info], fence)? };
        Ok(())
    }

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()> {
        // SAFETY: Forwarded from the trait contract
        unsafe { ash::Device::queue_wait_idle(self, queue)? };
        Ok(())
    }
}
