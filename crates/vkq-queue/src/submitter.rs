//! Front door for producers.
//!
//! [`Submitter`] owns the ledger, the [`CommandQueue`] and, in async mode, the
//! [`CommandProcessor`], and routes each call to one or the other. A
//! device-lost result from any path tears the queue down so nobody keeps
//! waiting on fences that will never signal.

use std::sync::Arc;

use ash::vk;
use tracing::info;

use vkq_core::{Priority, ProtectionType, QueueSerial, ResourceUse, SerialIndex, SerialLedger, VkqConfig};

use crate::batch::SecondaryCommands;
use crate::command_queue::CommandQueue;
use crate::driver::{Driver, PresentDescriptor, RenderPassBegin, SwapchainStatus};
use crate::error::QueueResult;
use crate::fence::SharedExternalFence;
use crate::perf::PerfCounters;
use crate::processor::CommandProcessor;
use crate::task::SubmitPolicy;

pub struct Submitter {
    ledger: Arc<SerialLedger>,
    queue: Arc<CommandQueue>,
    processor: Option<CommandProcessor>,
}

impl Submitter {
    pub fn new(driver: Arc<dyn Driver>, config: &VkqConfig) -> QueueResult<Self> {
        config.validate()?;

        let ledger = Arc::new(SerialLedger::new(config.queue.serial_index_count));
        let queue = Arc::new(CommandQueue::new(
            driver,
            ledger.clone(),
            &config.queue,
            config.device.protected_content,
        )?);
        let processor = if config.processor.async_command_queue {
            Some(CommandProcessor::new(queue.clone(), &config.processor)?)
        } else {
            None
        };

        info!(
            "submitter ready ({} mode)",
            if processor.is_some() { "async" } else { "sync" }
        );
        Ok(Self {
            ledger,
            queue,
            processor,
        })
    }

    pub fn is_async(&self) -> bool {
        self.processor.is_some()
    }

    pub fn ledger(&self) -> &Arc<SerialLedger> {
        &self.ledger
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    pub fn processor(&self) -> Option<&CommandProcessor> {
        self.processor.as_ref()
    }

    pub fn reserve_serial(&self, index: SerialIndex) -> QueueSerial {
        self.ledger.reserve_next(index)
    }

    fn escalate<T>(&self, result: QueueResult<T>) -> QueueResult<T> {
        if let Err(e) = &result {
            if e.is_device_lost() {
                self.handle_device_lost();
            }
        }
        result
    }

    // ── Recording and submission ────────────────────────────

    #[track_caller]
    pub fn flush_wait_semaphores(
        &self,
        protection: ProtectionType,
        priority: Priority,
        semaphores: Vec<vk::Semaphore>,
        stage_masks: Vec<vk::PipelineStageFlags>,
    ) -> QueueResult<()> {
        let result = match &self.processor {
            Some(processor) => {
                processor.enqueue_flush_wait_semaphores(protection, priority, semaphores, stage_masks)
            }
            None => self
                .queue
                .flush_wait_semaphores(protection, priority, semaphores, stage_masks),
        };
        self.escalate(result)
    }

    #[track_caller]
    pub fn flush_outside_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        commands: SecondaryCommands,
    ) -> QueueResult<()> {
        let result = match &self.processor {
            Some(processor) => {
                processor.enqueue_flush_outside_render_pass_commands(protection, priority, commands)
            }
            None => self
                .queue
                .flush_outside_render_pass_commands(protection, priority, commands),
        };
        self.escalate(result)
    }

    #[track_caller]
    pub fn flush_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        render_pass: RenderPassBegin,
        commands: SecondaryCommands,
    ) -> QueueResult<()> {
        let result = match &self.processor {
            Some(processor) => processor.enqueue_flush_render_pass_commands(
                protection,
                priority,
                render_pass,
                commands,
            ),
            None => self
                .queue
                .flush_render_pass_commands(protection, priority, &render_pass, commands),
        };
        self.escalate(result)
    }

    #[track_caller]
    pub fn submit_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<vk::Semaphore>,
        external_fence: Option<SharedExternalFence>,
        serial: QueueSerial,
    ) -> QueueResult<()> {
        let result = match &self.processor {
            Some(processor) => processor.enqueue_submit_commands(
                protection,
                priority,
                signal_semaphore,
                external_fence,
                serial,
            ),
            None => self.queue.submit_commands(
                protection,
                priority,
                signal_semaphore,
                external_fence,
                serial,
            ),
        };
        self.escalate(result)
    }

    #[track_caller]
    pub fn submit_one_off(
        &self,
        protection: ProtectionType,
        priority: Priority,
        command_buffer: vk::CommandBuffer,
        wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        policy: SubmitPolicy,
        serial: QueueSerial,
    ) -> QueueResult<()> {
        let result = match &self.processor {
            Some(processor) => processor.enqueue_submit_one_off(
                protection,
                priority,
                command_buffer,
                wait_semaphore,
                policy,
                serial,
            ),
            None => self
                .queue
                .submit_one_off(protection, priority, command_buffer, wait_semaphore, serial),
        };
        self.escalate(result)
    }

    /// The outcome lands in `status`; only enqueue failures are returned.
    #[track_caller]
    pub fn present(
        &self,
        priority: Priority,
        present: PresentDescriptor,
        status: Arc<SwapchainStatus>,
    ) -> QueueResult<()> {
        match &self.processor {
            Some(processor) => processor.enqueue_present(priority, present, status),
            None => {
                self.queue.present(priority, &present, &status);
                Ok(())
            }
        }
    }

    // ── Completion ──────────────────────────────────────────

    pub fn check_and_cleanup_completed(&self) -> QueueResult<()> {
        let result = match &self.processor {
            Some(processor) => {
                processor.request_commands_and_garbage_cleanup();
                processor.check_and_pop_pending_error()
            }
            None => self.queue.check_and_cleanup_completed(),
        };
        self.escalate(result)
    }

    pub fn cleanup_some_garbage(&self, min_in_flight_to_keep: usize) -> QueueResult<bool> {
        let result = self.queue.cleanup_some_garbage(min_in_flight_to_keep);
        self.escalate(result)
    }

    pub fn finish_resource_use(&self, use_: &ResourceUse, timeout_ns: u64) -> QueueResult<()> {
        let result = self.wait_submitted(use_).and_then(|()| self.queue.finish_resource_use(use_, timeout_ns));
        self.escalate(result)
    }

    pub fn finish_queue_serial(&self, queue_serial: QueueSerial, timeout_ns: u64) -> QueueResult<()> {
        self.finish_resource_use(&ResourceUse::from(queue_serial), timeout_ns)
    }

    pub fn wait_for_resource_use_to_finish_with_user_timeout(
        &self,
        use_: &ResourceUse,
        timeout_ns: u64,
    ) -> QueueResult<vk::Result> {
        let result = self.wait_submitted(use_).and_then(|()| {
            self.queue
                .wait_for_resource_use_to_finish_with_user_timeout(use_, timeout_ns)
        });
        self.escalate(result)
    }

    pub fn wait_idle(&self, timeout_ns: u64) -> QueueResult<()> {
        let submitted = match &self.processor {
            Some(processor) => processor.wait_for_all_work_to_be_submitted(),
            None => Ok(()),
        };
        let result = submitted.and_then(|()| self.queue.wait_idle(timeout_ns));
        self.escalate(result)
    }

    pub fn wait_for_present_to_be_submitted(&self, status: &SwapchainStatus) -> QueueResult<()> {
        match &self.processor {
            Some(processor) => processor.wait_for_present_to_be_submitted(status),
            None => Ok(()),
        }
    }

    fn wait_submitted(&self, use_: &ResourceUse) -> QueueResult<()> {
        match &self.processor {
            Some(processor) if !self.ledger.is_submitted(use_) => {
                processor.wait_for_resource_use_to_be_submitted(use_)
            }
            _ => Ok(()),
        }
    }

    // ── Queries ─────────────────────────────────────────────

    pub fn has_resource_use_finished(&self, use_: &ResourceUse) -> bool {
        self.ledger.is_finished(use_)
    }

    pub fn has_resource_use_submitted(&self, use_: &ResourceUse) -> bool {
        self.ledger.is_submitted(use_)
    }

    pub fn is_busy(&self) -> bool {
        match &self.processor {
            Some(processor) => processor.is_busy(),
            None => self.queue.is_busy(),
        }
    }

    pub fn perf_counters(&self) -> PerfCounters {
        self.queue.perf_counters()
    }

    pub fn reset_per_frame_perf_counters(&self) {
        self.queue.reset_per_frame_perf_counters();
    }

    // ── Teardown ────────────────────────────────────────────

    pub fn handle_device_lost(&self) {
        match &self.processor {
            Some(processor) => processor.handle_device_lost(),
            None => self.queue.handle_device_lost(),
        }
    }

    /// Drain and stop the worker, then tear down the queue.
    pub fn destroy(&self) {
        if let Some(processor) = &self.processor {
            processor.destroy();
        }
        self.queue.destroy();
    }
}

impl Drop for Submitter {
    fn drop(&mut self) {
        self.destroy();
    }
}
