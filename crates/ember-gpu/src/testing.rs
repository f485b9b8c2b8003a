//! Synthetic device and presentation target for tests.
//!
//! [`MockDevice`] models a slow GPU: a submission stays in flight until its
//! fence is waited on (or its queue is drained), and any misuse of in-flight
//! objects is recorded as a violation instead of corrupting state. Waiting on
//! an unsignaled fence that no submission will signal is a violation too; a
//! real device would block forever there.

use crate::error::{GpuError, Result};
use crate::ops::{DeviceOps, Submission};
use crate::selection::QueueFamilies;
use crate::swapchain::{PresentTarget, SwapchainStatus};
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

/// Everything the mock device was asked to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    CreateFence(vk::Fence),
    DestroyFence(vk::Fence),
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    CreatePool(vk::CommandPool, u32),
    DestroyPool(vk::CommandPool),
    Allocate(Vec<vk::CommandBuffer>),
    Free(Vec<vk::CommandBuffer>),
    ResetCommandBuffer(vk::CommandBuffer),
    Begin(vk::CommandBuffer, vk::CommandBufferUsageFlags),
    End(vk::CommandBuffer),
    Barrier {
        cmd: vk::CommandBuffer,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        aspect: vk::ImageAspectFlags,
    },
    Submit {
        queue: vk::Queue,
        command_buffers: Vec<vk::CommandBuffer>,
        wait: Vec<vk::Semaphore>,
        signal: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    QueueWaitIdle(vk::Queue),
}

/// A submitted batch the simulated GPU has not finished yet.
struct Pending {
    queue: vk::Queue,
    fence: vk::Fence,
    command_buffers: Vec<vk::CommandBuffer>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    events: Vec<Event>,
    fences: HashMap<vk::Fence, bool>,
    live: HashSet<u64>,
    command_buffers: HashMap<vk::CommandBuffer, vk::CommandPool>,
    pending: Vec<Pending>,
    violations: Vec<String>,
    fail_fence_creation: bool,
    fail_submit: bool,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn in_flight(&self, cmd: vk::CommandBuffer) -> bool {
        self.pending
            .iter()
            .any(|batch| batch.command_buffers.contains(&cmd))
    }

    fn fence_pending(&self, fence: vk::Fence) -> bool {
        self.pending.iter().any(|batch| batch.fence == fence)
    }

    fn retire(&mut self, pred: impl Fn(vk::Queue, vk::Fence) -> bool) {
        let (retired, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|batch| pred(batch.queue, batch.fence));
        self.pending = pending;

        for batch in retired {
            if batch.fence != vk::Fence::null() {
                self.fences.insert(batch.fence, true);
            }
        }
    }
}

/// [`DeviceOps`] implementation that records calls.
#[derive(Default)]
pub struct MockDevice {
    state: Mutex<State>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_fence_creation(&self) {
        self.state.lock().fail_fence_creation = true;
    }

    pub fn fail_submit(&self) {
        self.state.lock().fail_submit = true;
    }

    pub fn allow_submit(&self) {
        self.state.lock().fail_submit = false;
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn is_signaled(&self, fence: vk::Fence) -> bool {
        self.state.lock().fences.get(&fence).copied().unwrap_or(false)
    }

    /// Semaphores, fences and pools not yet destroyed.
    pub fn live_objects(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn submissions(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|event| matches!(event, Event::Submit { .. }))
            .collect()
    }
}

impl DeviceOps for MockDevice {
    unsafe fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.state.lock();
        let raw = state.handle();
        let semaphore = vk::Semaphore::from_raw(raw);
        state.live.insert(raw);
        state.events.push(Event::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.live.remove(&semaphore.as_raw());
        state.events.push(Event::DestroySemaphore(semaphore));
    }

    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        if state.fail_fence_creation {
            return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let raw = state.handle();
        let fence = vk::Fence::from_raw(raw);
        state.live.insert(raw);
        state.fences.insert(fence, signaled);
        state.events.push(Event::CreateFence(fence));
        Ok(fence)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        if state.fence_pending(fence) {
            state.violations.push(format!("destroyed pending fence {fence:?}"));
        }
        state.live.remove(&fence.as_raw());
        state.fences.remove(&fence);
        state.events.push(Event::DestroyFence(fence));
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(Event::WaitFence(fence));
        match state.fences.get(&fence).copied() {
            None => {
                state.violations.push(format!("waited on unknown fence {fence:?}"));
                Ok(())
            }
            Some(true) => Ok(()),
            Some(false) if state.fence_pending(fence) => {
                state.retire(|_, f| f == fence);
                Ok(())
            }
            Some(false) => {
                state
                    .violations
                    .push(format!("waited on fence {fence:?} with no pending signal"));
                Err(GpuError::Vulkan(vk::Result::TIMEOUT))
            }
        }
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        if state.fence_pending(fence) {
            state.violations.push(format!("reset pending fence {fence:?}"));
        }
        state.fences.insert(fence, false);
        state.events.push(Event::ResetFence(fence));
        Ok(())
    }

    unsafe fn create_command_pool(
        &self,
        queue_family: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool> {
        let mut state = self.state.lock();
        let raw = state.handle();
        let pool = vk::CommandPool::from_raw(raw);
        state.live.insert(raw);
        state.events.push(Event::CreatePool(pool, queue_family));
        Ok(pool)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        state.command_buffers.retain(|_, owner| *owner != pool);
        state.live.remove(&pool.as_raw());
        state.events.push(Event::DestroyPool(pool));
    }

    unsafe fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        let buffers: Vec<_> = (0..count)
            .map(|_| vk::CommandBuffer::from_raw(state.handle()))
            .collect();
        for &cmd in &buffers {
            state.command_buffers.insert(cmd, pool);
        }
        state.events.push(Event::Allocate(buffers.clone()));
        Ok(buffers)
    }

    unsafe fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for cmd in buffers {
            if state.in_flight(*cmd) {
                state.violations.push(format!("freed in-flight command buffer {cmd:?}"));
            }
            state.command_buffers.remove(cmd);
        }
        state.events.push(Event::Free(buffers.to_vec()));
    }

    unsafe fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        if state.in_flight(cmd) {
            state.violations.push(format!("reset in-flight command buffer {cmd:?}"));
        }
        state.events.push(Event::ResetCommandBuffer(cmd));
        Ok(())
    }

    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.in_flight(cmd) {
            state.violations.push(format!("began in-flight command buffer {cmd:?}"));
        }
        state.events.push(Event::Begin(cmd, flags));
        Ok(())
    }

    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.state.lock().events.push(Event::End(cmd));
        Ok(())
    }

    unsafe fn cmd_image_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier<'_>,
    ) {
        self.state.lock().events.push(Event::Barrier {
            cmd,
            old: barrier.old_layout,
            new: barrier.new_layout,
            src_stage,
            dst_stage,
            aspect: barrier.subresource_range.aspect_mask,
        });
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_submit {
            return Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        }
        if fence != vk::Fence::null() && state.fences.get(&fence).copied().unwrap_or(false) {
            state.violations.push(format!("submitted with signaled fence {fence:?}"));
        }
        for &cmd in submission.command_buffers {
            if state.in_flight(cmd) {
                state.violations.push(format!("double submission of {cmd:?}"));
            }
        }
        state.pending.push(Pending {
            queue,
            fence,
            command_buffers: submission.command_buffers.to_vec(),
        });
        state.events.push(Event::Submit {
            queue,
            command_buffers: submission.command_buffers.to_vec(),
            wait: submission.wait_semaphores.to_vec(),
            signal: submission.signal_semaphores.to_vec(),
            fence,
        });
        Ok(())
    }

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()> {
        let mut state = self.state.lock();
        state.retire(|q, _| q == queue);
        state.events.push(Event::QueueWaitIdle(queue));
        Ok(())
    }
}

/// [`PresentTarget`] with scripted acquire and present results.
///
/// Unscripted calls succeed, cycling through `image_count` images.
pub struct MockTarget {
    pub acquire_results: VecDeque<std::result::Result<SwapchainStatus, vk::Result>>,
    pub present_results: VecDeque<std::result::Result<SwapchainStatus, vk::Result>>,
    pub acquired: Vec<vk::Semaphore>,
    pub presented: Vec<(u32, vk::Semaphore)>,
    pub recreated_with: Vec<QueueFamilies>,
    pub extent: vk::Extent2D,
    image_count: u32,
    next_image: u32,
}

impl MockTarget {
    pub fn new(image_count: u32) -> Self {
        Self {
            acquire_results: VecDeque::new(),
            present_results: VecDeque::new(),
            acquired: Vec::new(),
            presented: Vec::new(),
            recreated_with: Vec::new(),
            extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            image_count,
            next_image: 0,
        }
    }

    pub fn recreate_count(&self) -> usize {
        self.recreated_with.len()
    }
}

impl PresentTarget for MockTarget {
    unsafe fn acquire_next_image(
        &mut self,
        semaphore: vk::Semaphore,
        _timeout_ns: u64,
    ) -> Result<(u32, SwapchainStatus)> {
        self.acquired.push(semaphore);
        let status = match self.acquire_results.pop_front() {
            Some(Ok(status)) => status,
            Some(Err(e)) => return Err(GpuError::Presentation(e)),
            None => SwapchainStatus::Optimal,
        };
        if status == SwapchainStatus::OutOfDate {
            return Ok((0, status));
        }
        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count;
        Ok((index, status))
    }

    unsafe fn present(
        &mut self,
        _queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<SwapchainStatus> {
        self.presented.push((image_index, wait_semaphore));
        match self.present_results.pop_front() {
            Some(Ok(status)) => Ok(status),
            Some(Err(e)) => Err(GpuError::Presentation(e)),
            None => Ok(SwapchainStatus::Optimal),
        }
    }

    fn recreate(&mut self, families: QueueFamilies) -> Result<()> {
        self.recreated_with.push(families);
        self.next_image = 0;
        Ok(())
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn image_format(&self) -> vk::Format {
        vk::Format::B8G8R8A8_SRGB
    }

    fn depth_format(&self) -> vk::Format {
        vk::Format::D32_SFLOAT
    }

    fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer> {
        Some(vk::Framebuffer::from_raw(0x1000 + u64::from(image_index)))
    }
}
