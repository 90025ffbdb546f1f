//! Deterministic in-process [`Driver`] for tests and soak runs.
//!
//! Fences only signal when told to (or immediately, with auto-signal), which
//! lets tests complete batches in any order, hold the queue, inject failures
//! and lose the device at will.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use vkq_core::{Priority, ProtectionType, QueueSerial};

use crate::driver::{Driver, PresentDescriptor, RenderPassBegin, SubmitDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
}

/// One accepted `queue_submit` call.
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub serial: QueueSerial,
    pub priority: Priority,
    pub protection: ProtectionType,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
}

#[derive(Debug, Clone)]
pub struct PresentRecord {
    pub priority: Priority,
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
    pub region_count: usize,
}

#[derive(Default)]
struct SubmitGate {
    held: bool,
    parked: usize,
}

pub struct SimulatedDriver {
    next_handle: AtomicU64,
    auto_signal: AtomicBool,
    device_lost: AtomicBool,

    fences: DashMap<u64, bool>,
    fence_events: Mutex<u64>,
    fence_signaled: Condvar,

    pools: DashMap<u64, ProtectionType>,
    command_buffers: DashMap<u64, CommandBufferState>,

    submissions: Mutex<Vec<SubmissionRecord>>,
    presents: Mutex<Vec<PresentRecord>>,

    gate: Mutex<SubmitGate>,
    gate_changed: Condvar,

    submit_failure: Mutex<Option<vk::Result>>,
    present_result: Mutex<VkResult<bool>>,
}

impl SimulatedDriver {
    /// Fences stay unsignaled until signaled explicitly.
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(0x1000),
            auto_signal: AtomicBool::new(false),
            device_lost: AtomicBool::new(false),
            fences: DashMap::new(),
            fence_events: Mutex::new(0),
            fence_signaled: Condvar::new(),
            pools: DashMap::new(),
            command_buffers: DashMap::new(),
            submissions: Mutex::new(Vec::new()),
            presents: Mutex::new(Vec::new()),
            gate: Mutex::new(SubmitGate::default()),
            gate_changed: Condvar::new(),
            submit_failure: Mutex::new(None),
            present_result: Mutex::new(Ok(false)),
        }
    }

    /// Fences signal as soon as their submission is accepted.
    pub fn with_auto_signal() -> Self {
        let driver = Self::new();
        driver.set_auto_signal(true);
        driver
    }

    pub fn set_auto_signal(&self, enabled: bool) {
        self.auto_signal.store(enabled, Ordering::Release);
    }

    fn alloc_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    // ── Fence control ───────────────────────────────────────

    pub fn signal_fence(&self, fence: vk::Fence) {
        if let Some(mut signaled) = self.fences.get_mut(&fence.as_raw()) {
            *signaled = true;
        }
        let mut events = self.fence_events.lock();
        *events += 1;
        self.fence_signaled.notify_all();
    }

    pub fn is_fence_signaled(&self, fence: vk::Fence) -> Option<bool> {
        self.fences.get(&fence.as_raw()).map(|signaled| *signaled)
    }

    /// Signal the fence of the `position`-th accepted submission.
    pub fn signal_submission(&self, position: usize) -> bool {
        let fence = self.submissions.lock().get(position).map(|record| record.fence);
        match fence {
            Some(fence) if fence != vk::Fence::null() => {
                self.signal_fence(fence);
                true
            }
            _ => false,
        }
    }

    /// Signal the fence of the submission that completes `serial`.
    pub fn signal_serial(&self, serial: QueueSerial) -> bool {
        let fence = self
            .submissions
            .lock()
            .iter()
            .rev()
            .find(|record| record.serial == serial)
            .map(|record| record.fence);
        match fence {
            Some(fence) if fence != vk::Fence::null() => {
                self.signal_fence(fence);
                true
            }
            _ => false,
        }
    }

    /// Signal every submission accepted so far.
    pub fn signal_all(&self) {
        let fences: Vec<vk::Fence> = self
            .submissions
            .lock()
            .iter()
            .map(|record| record.fence)
            .filter(|fence| *fence != vk::Fence::null())
            .collect();
        for fence in fences {
            self.signal_fence(fence);
        }
    }

    /// Submissions whose fence exists and has not signaled yet.
    pub fn unsignaled_submissions(&self) -> Vec<SubmissionRecord> {
        self.submissions
            .lock()
            .iter()
            .filter(|record| self.is_fence_signaled(record.fence) == Some(false))
            .cloned()
            .collect()
    }

    // ── Queue control ───────────────────────────────────────

    /// Make `queue_submit` block until [`Self::release_submissions`].
    pub fn hold_submissions(&self) {
        self.gate.lock().held = true;
    }

    pub fn release_submissions(&self) {
        self.gate.lock().held = false;
        self.gate_changed.notify_all();
    }

    /// Submissions currently parked behind [`Self::hold_submissions`].
    pub fn parked_submission_count(&self) -> usize {
        self.gate.lock().parked
    }

    /// Fail the next `queue_submit` with `code`.
    pub fn fail_next_submit(&self, code: vk::Result) {
        *self.submit_failure.lock() = Some(code);
    }

    pub fn set_present_result(&self, result: VkResult<bool>) {
        *self.present_result.lock() = result;
    }

    /// Every later fence query and submission reports `ERROR_DEVICE_LOST`, and
    /// blocked fence waits return immediately.
    pub fn lose_device(&self) {
        self.device_lost.store(true, Ordering::Release);
        let mut events = self.fence_events.lock();
        *events += 1;
        self.fence_signaled.notify_all();
        drop(events);
        self.release_submissions();
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::Acquire)
    }

    // ── Inspection ──────────────────────────────────────────

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.submissions.lock().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }

    pub fn presents(&self) -> Vec<PresentRecord> {
        self.presents.lock().clone()
    }

    pub fn command_buffer_state(&self, command_buffer: vk::CommandBuffer) -> Option<CommandBufferState> {
        self.command_buffers
            .get(&command_buffer.as_raw())
            .map(|state| *state)
    }

    pub fn live_fence_count(&self) -> usize {
        self.fences.len()
    }

    pub fn live_command_buffer_count(&self) -> usize {
        self.command_buffers.len()
    }

    pub fn live_command_pool_count(&self) -> usize {
        self.pools.len()
    }

    fn check_lost(&self) -> VkResult<()> {
        if self.is_device_lost() {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        Ok(())
    }

    fn transition(
        &self,
        command_buffer: vk::CommandBuffer,
        from: &[CommandBufferState],
        to: CommandBufferState,
    ) -> VkResult<()> {
        let Some(mut state) = self.command_buffers.get_mut(&command_buffer.as_raw()) else {
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        if !from.contains(&*state) {
            debug!(
                "invalid command buffer transition {:?} -> {:?} for {:?}",
                *state, to, command_buffer
            );
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        *state = to;
        Ok(())
    }
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for SimulatedDriver {
    fn create_fence(&self) -> VkResult<vk::Fence> {
        self.check_lost()?;
        let raw = self.alloc_handle();
        self.fences.insert(raw, false);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.fences.remove(&fence.as_raw());
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        self.check_lost()?;
        match self.fences.get_mut(&fence.as_raw()) {
            Some(mut signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        self.check_lost()?;
        self.is_fence_signaled(fence).ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let mut events = self.fence_events.lock();
        loop {
            if self.fence_status(fence)? {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if self.fence_signaled.wait_until(&mut events, deadline).timed_out() {
                        return match self.fence_status(fence)? {
                            true => Ok(()),
                            false => Err(vk::Result::TIMEOUT),
                        };
                    }
                }
                None => self.fence_signaled.wait(&mut events),
            }
        }
    }

    fn create_command_pool(&self, protection: ProtectionType) -> VkResult<vk::CommandPool> {
        let raw = self.alloc_handle();
        self.pools.insert(raw, protection);
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.pools.remove(&pool.as_raw());
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        if !self.pools.contains_key(&pool.as_raw()) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let raw = self.alloc_handle();
        self.command_buffers.insert(raw, CommandBufferState::Initial);
        Ok(vk::CommandBuffer::from_raw(raw))
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        self.command_buffers.remove(&command_buffer.as_raw());
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.transition(
            command_buffer,
            &[CommandBufferState::Initial],
            CommandBufferState::Recording,
        )
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.transition(
            command_buffer,
            &[CommandBufferState::Recording],
            CommandBufferState::Executable,
        )
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.transition(
            command_buffer,
            &[
                CommandBufferState::Initial,
                CommandBufferState::Recording,
                CommandBufferState::Executable,
            ],
            CommandBufferState::Initial,
        )
    }

    fn cmd_execute_commands(&self, primary: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        debug_assert_eq!(
            self.command_buffer_state(primary),
            Some(CommandBufferState::Recording)
        );
        debug!("{:?} executes {} secondaries", primary, secondaries.len());
    }

    fn cmd_begin_render_pass(&self, primary: vk::CommandBuffer, begin: &RenderPassBegin) {
        debug!("{:?} begins render pass {:?}", primary, begin.render_pass);
    }

    fn cmd_end_render_pass(&self, primary: vk::CommandBuffer) {
        debug!("{:?} ends render pass", primary);
    }

    fn queue_submit(
        &self,
        priority: Priority,
        submit: &SubmitDescriptor,
        fence: vk::Fence,
    ) -> VkResult<()> {
        {
            let mut gate = self.gate.lock();
            if gate.held {
                gate.parked += 1;
                while gate.held {
                    self.gate_changed.wait(&mut gate);
                }
                gate.parked -= 1;
            }
        }
        self.check_lost()?;
        if let Some(code) = self.submit_failure.lock().take() {
            return Err(code);
        }

        for command_buffer in &submit.command_buffers {
            if let Some(state) = self.command_buffer_state(*command_buffer) {
                if state != CommandBufferState::Executable {
                    return Err(vk::Result::ERROR_UNKNOWN);
                }
            }
        }
        if fence != vk::Fence::null() && self.is_fence_signaled(fence) != Some(false) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }

        self.submissions.lock().push(SubmissionRecord {
            serial: submit.serial,
            priority,
            protection: submit.protection,
            command_buffers: submit.command_buffers.clone(),
            wait_semaphores: submit.wait_semaphores.clone(),
            signal_semaphores: submit.signal_semaphores.clone(),
            fence,
        });

        if self.auto_signal.load(Ordering::Acquire) && fence != vk::Fence::null() {
            self.signal_fence(fence);
        }
        Ok(())
    }

    fn queue_present(&self, priority: Priority, present: &PresentDescriptor) -> VkResult<bool> {
        self.check_lost()?;
        self.presents.lock().push(PresentRecord {
            priority,
            swapchain: present.swapchain,
            image_index: present.image_index,
            region_count: present.regions.len(),
        });
        *self.present_result.lock()
    }
}
