//! Synchronous submission engine.
//!
//! [`CommandQueue`] turns recorded work into native queue submissions, keeps
//! the resulting batches in submission order until their fences signal, and
//! recycles their command buffers and fences afterwards. Every public method
//! is safe to call from any thread.
//!
//! Locks are always taken in declaration order: `submit`, then `in_flight`
//! (the completion lock), then `finished` (the release lock). The command
//! pool lock and the fence pool lock are innermost.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use vkq_core::config::QueueLimits;
use vkq_core::{Priority, ProtectionType, QueueSerial, ResourceUse, SerialIndex, SerialLedger};

use crate::batch::{BatchFence, CommandBatch, SecondaryCommands};
use crate::command_pool::CommandPoolAccess;
use crate::driver::{Driver, PresentDescriptor, RenderPassBegin, SubmitDescriptor, SwapchainStatus};
use crate::error::{QueueError, QueueResult};
use crate::fence::{FencePool, RecyclableFence, SharedExternalFence};
use crate::perf::PerfCounters;

type BatchQueue = VecDeque<CommandBatch>;

pub struct CommandQueue {
    driver: Arc<dyn Driver>,
    ledger: Arc<SerialLedger>,
    limits: QueueLimits,
    command_pools: CommandPoolAccess,
    fence_pool: Arc<FencePool>,

    /// Serializes native submission and in-flight pushes. Guards the counters.
    submit: Mutex<PerfCounters>,
    /// Batches whose fence has not been observed signaled, oldest first.
    in_flight: Mutex<BatchQueue>,
    /// Batches whose fence signaled, waiting for their resources to be reset.
    finished: Mutex<BatchQueue>,

    /// In-flight plus finished batches, readable without either lock.
    num_all_commands: AtomicUsize,
    destroyed: AtomicBool,
}

impl CommandQueue {
    pub fn new(
        driver: Arc<dyn Driver>,
        ledger: Arc<SerialLedger>,
        limits: &QueueLimits,
        protected_content: bool,
    ) -> QueueResult<Self> {
        limits.validate()?;
        let command_pools = CommandPoolAccess::new(driver.clone(), protected_content)?;
        let fence_pool = Arc::new(FencePool::new(driver.clone()));

        info!(
            "command queue ready (in-flight limit {}, hard cap {}, {} serial indices)",
            limits.in_flight_commands_limit,
            limits.max_finished_commands_limit,
            ledger.index_count()
        );

        Ok(Self {
            driver,
            ledger,
            limits: limits.clone(),
            command_pools,
            fence_pool,
            submit: Mutex::new(PerfCounters::default()),
            in_flight: Mutex::new(VecDeque::with_capacity(limits.in_flight_commands_limit)),
            finished: Mutex::new(VecDeque::with_capacity(limits.max_finished_commands_limit)),
            num_all_commands: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn ledger(&self) -> &Arc<SerialLedger> {
        &self.ledger
    }

    pub fn limits(&self) -> &QueueLimits {
        &self.limits
    }

    pub fn command_pools(&self) -> &CommandPoolAccess {
        &self.command_pools
    }

    pub fn fence_pool(&self) -> &Arc<FencePool> {
        &self.fence_pool
    }

    // ── Queries ─────────────────────────────────────────────

    pub fn last_submitted_serial(&self, index: SerialIndex) -> vkq_core::Serial {
        self.ledger.last_submitted(index)
    }

    pub fn has_resource_use_finished(&self, use_: &ResourceUse) -> bool {
        self.ledger.is_finished(use_)
    }

    pub fn has_queue_serial_finished(&self, queue_serial: QueueSerial) -> bool {
        self.ledger.is_serial_finished(queue_serial)
    }

    pub fn has_resource_use_submitted(&self, use_: &ResourceUse) -> bool {
        self.ledger.is_submitted(use_)
    }

    pub fn has_queue_serial_submitted(&self, queue_serial: QueueSerial) -> bool {
        self.ledger.is_serial_submitted(queue_serial)
    }

    /// True while any index has submitted work that has not completed.
    pub fn is_busy(&self) -> bool {
        (0..self.ledger.index_count()).any(|slot| {
            let index = SerialIndex::new(slot as u32);
            self.ledger.last_submitted(index) > self.ledger.last_completed(index)
        })
    }

    pub fn has_finished_commands(&self) -> bool {
        !self.finished.lock().is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.lock().len()
    }

    pub fn total_batch_count(&self) -> usize {
        self.num_all_commands.load(Ordering::Acquire)
    }

    pub fn perf_counters(&self) -> PerfCounters {
        let perf = self.submit.lock();
        let mut snapshot = *perf;
        snapshot.batches_in_flight = self.in_flight.lock().len() as u64;
        snapshot.batches_finished = self.finished.lock().len() as u64;
        snapshot
    }

    pub fn reset_per_frame_perf_counters(&self) {
        self.submit.lock().reset_per_frame();
    }

    // ── Recording flushes ───────────────────────────────────

    pub fn flush_wait_semaphores(
        &self,
        protection: ProtectionType,
        priority: Priority,
        wait_semaphores: Vec<vk::Semaphore>,
        wait_stage_masks: Vec<vk::PipelineStageFlags>,
    ) -> QueueResult<()> {
        if wait_semaphores.len() != wait_stage_masks.len() {
            return Err(QueueError::InvalidTask(format!(
                "{} wait semaphores with {} stage masks",
                wait_semaphores.len(),
                wait_stage_masks.len()
            )));
        }
        self.check_protection(protection)?;
        self.command_pools
            .flush_wait_semaphores(protection, priority, wait_semaphores, wait_stage_masks);
        Ok(())
    }

    pub fn flush_outside_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        commands: SecondaryCommands,
    ) -> QueueResult<()> {
        self.command_pools
            .flush_outside_render_pass_commands(protection, priority, commands)
    }

    pub fn flush_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        render_pass: &RenderPassBegin,
        commands: SecondaryCommands,
    ) -> QueueResult<()> {
        self.command_pools
            .flush_render_pass_commands(protection, priority, render_pass, commands)
    }

    // ── Submission ──────────────────────────────────────────

    /// End the pending recording of (protection, priority) and submit it,
    /// together with any queued wait semaphores, as batch `serial`.
    pub fn submit_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<vk::Semaphore>,
        external_fence: Option<SharedExternalFence>,
        serial: QueueSerial,
    ) -> QueueResult<()> {
        self.check_serial(serial)?;
        self.check_protection(protection)?;

        let mut batch = CommandBatch::new(serial, protection);
        let waits = match self
            .command_pools
            .flush_pending_into_batch(protection, priority, &mut batch)
        {
            Ok(waits) => waits,
            Err(e) => {
                self.discard_batch(batch);
                return Err(e);
            }
        };

        let fence = match external_fence {
            Some(fence) => BatchFence::External(fence),
            None => match RecyclableFence::new(&self.fence_pool) {
                Ok(fence) => BatchFence::Recyclable(Arc::new(fence)),
                Err(e) => {
                    self.discard_batch(batch);
                    return Err(e.into());
                }
            },
        };
        batch.set_fence(fence);

        let submit = SubmitDescriptor {
            wait_semaphores: waits.semaphores,
            wait_stage_masks: waits.stage_masks,
            command_buffers: batch.primary().into_iter().collect(),
            signal_semaphores: signal_semaphore.into_iter().collect(),
            protection,
            serial,
        };

        self.queue_submit(priority, submit, batch)?;
        self.post_submit_check()
    }

    /// Submit a command buffer the caller allocated and recorded itself. The
    /// buffer stays owned by the caller.
    pub fn submit_one_off(
        &self,
        protection: ProtectionType,
        priority: Priority,
        command_buffer: vk::CommandBuffer,
        wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        serial: QueueSerial,
    ) -> QueueResult<()> {
        self.check_serial(serial)?;
        self.check_protection(protection)?;

        let mut batch = CommandBatch::new(serial, protection);
        let fence = RecyclableFence::new(&self.fence_pool)?;
        batch.set_fence(BatchFence::Recyclable(Arc::new(fence)));

        let (wait_semaphores, wait_stage_masks) = wait_semaphore.into_iter().unzip();
        let submit = SubmitDescriptor {
            wait_semaphores,
            wait_stage_masks,
            command_buffers: if command_buffer == vk::CommandBuffer::null() {
                Vec::new()
            } else {
                vec![command_buffer]
            },
            signal_semaphores: Vec::new(),
            protection,
            serial,
        };

        self.queue_submit(priority, submit, batch)?;
        self.post_submit_check()
    }

    /// Present failures are reported through the returned code and
    /// `status`, never escalated into a queue error.
    pub fn present(
        &self,
        priority: Priority,
        present: &PresentDescriptor,
        status: &SwapchainStatus,
    ) -> vk::Result {
        let result = {
            let mut perf = self.submit.lock();
            perf.present_calls_total += 1;
            self.driver.queue_present(priority, present)
        };

        let code = match result {
            Ok(false) => vk::Result::SUCCESS,
            Ok(true) => vk::Result::SUBOPTIMAL_KHR,
            Err(e) => e,
        };
        if code != vk::Result::SUCCESS {
            warn!("present of image {} returned {}", present.image_index, code);
        }
        status.complete(code);
        code
    }

    fn queue_submit(
        &self,
        priority: Priority,
        submit: SubmitDescriptor,
        batch: CommandBatch,
    ) -> QueueResult<()> {
        let mut perf = self.submit.lock();
        // A racing submit on the same index may have overtaken this one since
        // `check_serial`; native order must follow serial order.
        let last = self.ledger.last_submitted(submit.serial.index);
        if submit.serial.serial <= last {
            drop(perf);
            self.discard_batch(batch);
            return Err(QueueError::InvalidTask(format!(
                "serial {} submitted after {}",
                submit.serial, last
            )));
        }
        perf.submit_calls_total += 1;
        perf.submit_calls_per_frame += 1;
        perf.wait_semaphores_total += submit.wait_semaphores.len() as u64;

        // Stay under the hard cap: retire the oldest batch before adding one.
        if self.num_all_commands.load(Ordering::Acquire) >= self.limits.max_finished_commands_limit {
            if let Err(e) = self.retire_oldest_batch() {
                drop(perf);
                self.discard_batch(batch);
                return Err(e);
            }
        }

        if let Err(e) = self
            .driver
            .queue_submit(priority, &submit, batch.fence_handle())
        {
            perf.native_submit_failures_total += 1;
            drop(perf);
            error!("queue submit of batch {} failed: {}", submit.serial, e);
            self.discard_batch(batch);
            return Err(e.into());
        }
        perf.native_submit_calls_total += 1;
        perf.native_submit_calls_per_frame += 1;

        debug!(
            "submitted batch {} ({} command buffers, {} waits)",
            submit.serial,
            submit.command_buffers.len(),
            submit.wait_semaphores.len()
        );

        self.num_all_commands.fetch_add(1, Ordering::AcqRel);
        // Completion checks run under the same lock, so a batch is never seen
        // in flight before its serial counts as submitted.
        let mut in_flight = self.in_flight.lock();
        self.ledger.advance_submitted(submit.serial);
        in_flight.push_back(batch);
        Ok(())
    }

    /// Called with the submit lock held.
    fn retire_oldest_batch(&self) -> QueueResult<()> {
        {
            let mut in_flight = self.in_flight.lock();
            self.check_completed_locked(&mut in_flight)?;
            if !self.has_finished_commands() && !in_flight.is_empty() {
                self.finish_one_batch_locked(&mut in_flight, self.limits.max_fence_wait_time_ns)?;
            }
        }
        self.release_finished_commands()
    }

    pub fn post_submit_check(&self) -> QueueResult<()> {
        self.check_and_cleanup_completed()?;
        while self.in_flight_count() > self.limits.in_flight_commands_limit {
            if !self.cleanup_some_garbage(self.limits.in_flight_commands_limit)? {
                break;
            }
        }
        Ok(())
    }

    // ── Completion ──────────────────────────────────────────

    /// Move every batch of the signaled prefix of the in-flight queue to the
    /// finished queue. Stops at the first unsignaled batch, so completion is
    /// only ever observed in submission order.
    pub fn check_completed(&self) -> QueueResult<()> {
        let mut in_flight = self.in_flight.lock();
        self.check_completed_locked(&mut in_flight)
    }

    pub fn check_and_cleanup_completed(&self) -> QueueResult<()> {
        self.check_completed()?;
        if self.has_finished_commands() {
            self.release_finished_commands()?;
        }
        Ok(())
    }

    fn check_completed_locked(&self, in_flight: &mut BatchQueue) -> QueueResult<()> {
        let mut status = Ok(());
        let mut done = Vec::new();
        while let Some(front) = in_flight.front() {
            match front.fence_status() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    status = Err(e.into());
                    break;
                }
            }
            if let Some(batch) = in_flight.pop_front() {
                done.push(batch);
            }
        }

        if !done.is_empty() {
            let mut finished = self.finished.lock();
            for batch in done {
                let serial = batch.serial();
                finished.push_back(batch);
                self.ledger.advance_completed(serial);
            }
        }
        status
    }

    /// Block on the oldest in-flight fence with the completion lock released,
    /// then re-check the queue.
    fn finish_one_batch_locked(
        &self,
        in_flight: &mut MutexGuard<'_, BatchQueue>,
        timeout_ns: u64,
    ) -> QueueResult<()> {
        let Some(fence) = in_flight.front().and_then(|batch| batch.fence().cloned()) else {
            return self.check_completed_locked(in_flight);
        };

        // The cloned fence keeps the native fence out of the pool until this
        // wait returns, even if the batch is released meanwhile.
        let result = MutexGuard::unlocked(in_flight, || fence.wait(timeout_ns));
        match result {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => {
                warn!("fence wait timed out after {} ns", timeout_ns);
                return Err(QueueError::Timeout { timeout_ns });
            }
            Err(e) => return Err(e.into()),
        }
        self.check_completed_locked(in_flight)
    }

    /// Block until `use_` has completed or `timeout_ns` elapses on a single
    /// fence wait.
    pub fn finish_resource_use(&self, use_: &ResourceUse, timeout_ns: u64) -> QueueResult<()> {
        if self.ledger.is_finished(use_) {
            return Ok(());
        }

        {
            let mut in_flight = self.in_flight.lock();
            self.check_completed_locked(&mut in_flight)?;
            while !self.ledger.is_finished(use_) && !in_flight.is_empty() {
                self.finish_one_batch_locked(&mut in_flight, timeout_ns)?;
            }
        }

        if !self.ledger.is_finished(use_) {
            let pending = use_
                .iter()
                .find(|qs| !self.ledger.is_serial_finished(*qs))
                .unwrap_or_default();
            return Err(QueueError::NotSubmitted(pending));
        }

        if self.has_finished_commands() {
            self.release_finished_commands()?;
        }
        Ok(())
    }

    /// Wait on behalf of an application-supplied timeout. Running out of time
    /// is reported as `TIMEOUT` rather than an error; `timeout_ns == 0` polls.
    pub fn wait_for_resource_use_to_finish_with_user_timeout(
        &self,
        use_: &ResourceUse,
        timeout_ns: u64,
    ) -> QueueResult<vk::Result> {
        match self.finish_resource_use(use_, timeout_ns) {
            Ok(()) => Ok(vk::Result::SUCCESS),
            Err(QueueError::Timeout { .. }) => Ok(vk::Result::TIMEOUT),
            Err(e) => Err(e),
        }
    }

    pub fn finish_queue_serial(&self, queue_serial: QueueSerial, timeout_ns: u64) -> QueueResult<()> {
        self.finish_resource_use(&ResourceUse::from(queue_serial), timeout_ns)
    }

    /// Wait for the most recently submitted serial of every index.
    pub fn wait_idle(&self, timeout_ns: u64) -> QueueResult<()> {
        let snapshot = self.ledger.submitted_snapshot();
        self.finish_resource_use(&snapshot, timeout_ns)
    }

    // ── Release ─────────────────────────────────────────────

    /// Release finished batches if there are any; otherwise, when more than
    /// `min_in_flight_to_keep` batches are in flight, wait for the oldest one
    /// and release it. Returns whether anything was released.
    pub fn cleanup_some_garbage(&self, min_in_flight_to_keep: usize) -> QueueResult<bool> {
        if !self.has_finished_commands() {
            let mut in_flight = self.in_flight.lock();
            self.check_completed_locked(&mut in_flight)?;
            if !self.has_finished_commands() && in_flight.len() > min_in_flight_to_keep {
                self.finish_one_batch_locked(&mut in_flight, self.limits.max_fence_wait_time_ns)?;
            }
        }

        if self.has_finished_commands() {
            self.release_finished_commands()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Drain the finished queue, resetting command buffers back into their
    /// pool and returning fences to the fence pool.
    pub fn release_finished_commands(&self) -> QueueResult<()> {
        let mut finished = self.finished.lock();
        while let Some(batch) = finished.pop_front() {
            self.num_all_commands.fetch_sub(1, Ordering::AcqRel);
            self.release_batch(batch)?;
        }
        Ok(())
    }

    fn release_batch(&self, mut batch: CommandBatch) -> QueueResult<()> {
        let reclaimed = match batch.take_primary() {
            Some(primary) => self.command_pools.reclaim(batch.protection(), primary),
            None => Ok(()),
        };
        batch.release_secondaries_and_fence();
        reclaimed
    }

    /// Give back the resources of a batch that never reached the queue.
    fn discard_batch(&self, batch: CommandBatch) {
        let serial = batch.serial();
        if let Err(e) = self.release_batch(batch) {
            warn!("failed to recycle resources of unsubmitted batch {}: {}", serial, e);
        }
    }

    // ── Teardown ────────────────────────────────────────────

    /// Treat everything in flight as finished without touching fences, and
    /// free all batch resources. Waiters are released because the ledger is
    /// forced to completion.
    pub fn handle_device_lost(&self) {
        warn!("device lost: force-completing all in-flight batches");

        let _submit = self.submit.lock();
        let mut in_flight = self.in_flight.lock();
        let mut finished = self.finished.lock();

        let lost = in_flight.len();
        finished.extend(in_flight.drain(..));
        self.ledger.force_complete_all();

        for mut batch in finished.drain(..) {
            self.num_all_commands.fetch_sub(1, Ordering::AcqRel);
            if let Some(primary) = batch.take_primary() {
                self.command_pools.destroy_primary(batch.protection(), primary);
            }
            batch.release_secondaries_and_fence();
        }
        info!("device lost: dropped {} in-flight batches", lost);
    }

    /// Wait for outstanding work and destroy pooled resources. Safe to call
    /// more than once.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.wait_idle(self.limits.max_fence_wait_time_ns) {
            warn!("command queue teardown could not drain in-flight work: {}", e);
            self.handle_device_lost();
        }
        if let Err(e) = self.release_finished_commands() {
            warn!("command queue teardown failed to release batches: {}", e);
        }
        self.command_pools.destroy();
        self.fence_pool.destroy_all();
        info!("command queue destroyed");
    }

    fn check_serial(&self, serial: QueueSerial) -> QueueResult<()> {
        if !serial.is_valid() || !self.ledger.contains(serial.index) {
            return Err(QueueError::InvalidTask(format!(
                "serial {} is outside the ledger's {} indices",
                serial,
                self.ledger.index_count()
            )));
        }
        let last = self.ledger.last_submitted(serial.index);
        if serial.serial <= last {
            return Err(QueueError::InvalidTask(format!(
                "serial {} submitted after {}",
                serial, last
            )));
        }
        Ok(())
    }

    fn check_protection(&self, protection: ProtectionType) -> QueueResult<()> {
        if !self.command_pools.supports(protection) {
            return Err(QueueError::ProtectedContentUnavailable);
        }
        Ok(())
    }
}
