//! The seam between the submission engine and the native graphics API.
//!
//! Everything the engine needs from the driver goes through [`Driver`]:
//! fences, command pools and buffers, queue submission and presentation.
//! [`crate::ash_driver::AshDriver`] implements it on a real Vulkan device,
//! [`crate::simulated::SimulatedDriver`] is a deterministic test double.

use ash::prelude::VkResult;
use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use vkq_core::{Priority, ProtectionType, QueueSerial};

/// One native queue submission, fully resolved.
#[derive(Debug, Clone, Default)]
pub struct SubmitDescriptor {
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stage_masks: Vec<vk::PipelineStageFlags>,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub protection: ProtectionType,
    /// Serial this submission completes; used for labeling only.
    pub serial: QueueSerial,
}

/// Arguments of a present call. The engine forwards these untouched.
#[derive(Debug, Clone, Default)]
pub struct PresentDescriptor {
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
    pub wait_semaphore: Option<vk::Semaphore>,
    /// Incremental present damage; empty means the whole image.
    pub regions: Vec<vk::RectLayerKHR>,
    /// Fence signaled when the presentation engine is done with the image.
    pub present_fence: Option<vk::Fence>,
    pub present_mode: Option<vk::PresentModeKHR>,
}

/// Render pass a secondary command buffer was recorded against.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderPassBegin {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub render_area: vk::Rect2D,
}

/// Outcome of the last present on a swapchain, threaded back to the
/// windowing layer. Present errors end up here instead of failing the queue.
#[derive(Debug)]
pub struct SwapchainStatus {
    is_pending: AtomicBool,
    last_present_result: Mutex<vk::Result>,
}

impl SwapchainStatus {
    pub fn new() -> Self {
        Self {
            is_pending: AtomicBool::new(false),
            last_present_result: Mutex::new(vk::Result::NOT_READY),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.is_pending.load(Ordering::Acquire)
    }

    pub fn last_present_result(&self) -> vk::Result {
        *self.last_present_result.lock()
    }

    pub(crate) fn mark_pending(&self) {
        self.is_pending.store(true, Ordering::Release);
    }

    pub(crate) fn complete(&self, result: vk::Result) {
        *self.last_present_result.lock() = result;
        self.is_pending.store(false, Ordering::Release);
    }
}

impl Default for SwapchainStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Native operations used by the submission engine.
///
/// Command buffer recording calls (`begin`, `end`, `cmd_*`, `reset`) are not
/// internally synchronized; callers serialize them per command pool.
pub trait Driver: Send + Sync {
    fn create_fence(&self) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    /// `Ok(true)` when signaled.
    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;
    /// `Err(vk::Result::TIMEOUT)` when the timeout expires first.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;

    fn create_command_pool(&self, protection: ProtectionType) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    fn cmd_execute_commands(&self, primary: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]);
    fn cmd_begin_render_pass(&self, primary: vk::CommandBuffer, begin: &RenderPassBegin);
    fn cmd_end_render_pass(&self, primary: vk::CommandBuffer);

    fn queue_submit(
        &self,
        priority: Priority,
        submit: &SubmitDescriptor,
        fence: vk::Fence,
    ) -> VkResult<()>;
    /// `Ok(true)` when the swapchain is suboptimal.
    fn queue_present(&self, priority: Priority, present: &PresentDescriptor) -> VkResult<bool>;
}
