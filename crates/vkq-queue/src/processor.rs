//! Asynchronous task replay.
//!
//! [`CommandProcessor`] accepts tasks from any thread into a bounded queue and
//! replays them one at a time on a dedicated worker thread against the
//! [`CommandQueue`]. Failures on the worker are recorded and handed to the
//! next caller that checks for errors.
//!
//! All task processing happens under the dequeue lock. Threads that need
//! their work submitted (`wait_for_*`) take that lock and process queued
//! tasks themselves, so once the queue is observed empty under it every
//! earlier task has reached the engine.

use std::collections::VecDeque;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

use ash::vk;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use vkq_core::config::ProcessorConfig;
use vkq_core::{CoreError, Priority, ProtectionType, QueueSerial, ResourceUse, Serial, SerialIndex, SerialLedger};

use crate::batch::SecondaryCommands;
use crate::command_queue::CommandQueue;
use crate::driver::{PresentDescriptor, RenderPassBegin, SwapchainStatus};
use crate::error::{QueueError, QueueResult};
use crate::fence::SharedExternalFence;
use crate::task::{SubmitPolicy, Task, TaskKind};

struct TaskQueue {
    tasks: VecDeque<Task>,
    exiting: bool,
}

struct Shared {
    queue: Arc<CommandQueue>,
    ledger: Arc<SerialLedger>,
    capacity: usize,

    tasks: Mutex<TaskQueue>,
    work_available: Condvar,
    space_available: Condvar,
    dequeue: Mutex<()>,

    errors: Mutex<VecDeque<QueueError>>,
    cleanup_requested: AtomicBool,
    /// Set while queued tasks are being discarded after device loss. The
    /// worker stops taking tasks until it clears.
    discarding: AtomicBool,
}

/// Give back what a task owns when it will never run.
fn reject_task(task: Task, code: vk::Result) {
    debug!("rejecting {:?}: {}", task, code);
    match task.kind {
        TaskKind::Present { status, .. } => status.complete(code),
        TaskKind::FlushOutsideRenderPassCommands { commands, .. }
        | TaskKind::FlushRenderPassCommands { commands, .. } => commands.release(),
        _ => {}
    }
}

impl Shared {
    /// Pop the next task. `Exit` is only handed to the worker itself.
    fn pop_task(&self, allow_exit: bool) -> Option<Task> {
        let mut queue = self.tasks.lock();
        if !allow_exit && queue.tasks.front().is_some_and(Task::is_exit) {
            return None;
        }
        let task = queue.tasks.pop_front()?;
        drop(queue);
        self.space_available.notify_one();
        Some(task)
    }

    fn process_task(&self, task: Task) {
        let name = task.name();
        let origin = task.origin;
        let queue = &self.queue;

        let result = match task.kind {
            TaskKind::FlushWaitSemaphores {
                protection,
                priority,
                semaphores,
                stage_masks,
            } => queue.flush_wait_semaphores(protection, priority, semaphores, stage_masks),
            TaskKind::FlushOutsideRenderPassCommands {
                protection,
                priority,
                commands,
            } => queue.flush_outside_render_pass_commands(protection, priority, commands),
            TaskKind::FlushRenderPassCommands {
                protection,
                priority,
                render_pass,
                commands,
            } => queue.flush_render_pass_commands(protection, priority, &render_pass, commands),
            TaskKind::Submit {
                protection,
                priority,
                signal_semaphore,
                external_fence,
                serial,
            } => queue.submit_commands(protection, priority, signal_semaphore, external_fence, serial),
            TaskKind::OneOffSubmit {
                protection,
                priority,
                command_buffer,
                wait_semaphore,
                serial,
            } => queue.submit_one_off(protection, priority, command_buffer, wait_semaphore, serial),
            TaskKind::Present {
                priority,
                present,
                status,
            } => {
                queue.present(priority, &present, &status);
                Ok(())
            }
            TaskKind::Exit => Ok(()),
        };

        if let Err(e) = result {
            self.record_error(e, name, origin);
        }
    }

    fn record_error(&self, e: QueueError, task: &'static str, origin: &'static Location<'static>) {
        error!("{} failed on command processor thread: {} (enqueued at {})", task, e, origin);
        self.errors.lock().push_back(QueueError::Deferred {
            code: e.code(),
            task,
            origin,
        });
    }

    /// Process queued tasks on the calling thread until `done` holds or the
    /// queue runs dry.
    fn drain_until(&self, done: impl Fn() -> bool) {
        let _dequeue = self.dequeue.lock();
        while !done() {
            match self.pop_task(false) {
                Some(task) => self.process_task(task),
                None => break,
            }
        }
    }

    fn run(self: Arc<Self>) {
        info!("command processor thread started");
        loop {
            {
                let mut queue = self.tasks.lock();
                while (queue.tasks.is_empty() || self.discarding.load(Ordering::Acquire))
                    && !self.cleanup_requested.load(Ordering::Acquire)
                {
                    self.work_available.wait(&mut queue);
                }
            }

            let _dequeue = self.dequeue.lock();
            if self.cleanup_requested.swap(false, Ordering::AcqRel) {
                if let Err(e) = self.queue.check_and_cleanup_completed() {
                    self.record_error(e, "Cleanup", Location::caller());
                }
            }

            while !self.discarding.load(Ordering::Acquire) {
                let Some(task) = self.pop_task(true) else {
                    break;
                };
                if task.is_exit() {
                    info!("command processor thread exiting");
                    return;
                }
                self.process_task(task);
            }
        }
    }
}

/// Dedicated submission thread in front of a [`CommandQueue`].
pub struct CommandProcessor {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl CommandProcessor {
    pub fn new(queue: Arc<CommandQueue>, config: &ProcessorConfig) -> QueueResult<Self> {
        if config.max_tasks == 0 {
            return Err(CoreError::ConfigError("processor.max_tasks must be at least 1".into()).into());
        }

        let shared = Arc::new(Shared {
            ledger: queue.ledger().clone(),
            queue,
            capacity: config.max_tasks,
            tasks: Mutex::new(TaskQueue {
                tasks: VecDeque::with_capacity(config.max_tasks + 1),
                exiting: false,
            }),
            work_available: Condvar::new(),
            space_available: Condvar::new(),
            dequeue: Mutex::new(()),
            errors: Mutex::new(VecDeque::new()),
            cleanup_requested: AtomicBool::new(false),
            discarding: AtomicBool::new(false),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("vkq-command-processor".into())
            .spawn(move || worker_shared.run())
            .map_err(CoreError::Io)?;
        let thread_id = worker.thread().id();

        info!("command processor ready ({} task slots)", config.max_tasks);
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            thread_id,
        })
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.shared.queue
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn queued_task_count(&self) -> usize {
        self.shared.tasks.lock().tasks.len()
    }

    pub fn is_busy(&self) -> bool {
        self.queued_task_count() > 0 || self.shared.queue.is_busy()
    }

    pub fn last_enqueued_serial(&self, index: SerialIndex) -> Serial {
        self.shared.ledger.last_enqueued(index)
    }

    pub fn has_resource_use_enqueued(&self, use_: &ResourceUse) -> bool {
        self.shared.ledger.is_enqueued(use_)
    }

    /// True while [`Self::handle_device_lost`] is discarding queued tasks.
    pub fn is_discarding_tasks(&self) -> bool {
        self.shared.discarding.load(Ordering::Acquire)
    }

    // ── Enqueue ─────────────────────────────────────────────

    #[track_caller]
    pub fn enqueue_flush_wait_semaphores(
        &self,
        protection: ProtectionType,
        priority: Priority,
        semaphores: Vec<vk::Semaphore>,
        stage_masks: Vec<vk::PipelineStageFlags>,
    ) -> QueueResult<()> {
        if semaphores.len() != stage_masks.len() {
            return Err(QueueError::InvalidTask(format!(
                "{} wait semaphores with {} stage masks",
                semaphores.len(),
                stage_masks.len()
            )));
        }
        self.enqueue(Task::new(TaskKind::FlushWaitSemaphores {
            protection,
            priority,
            semaphores,
            stage_masks,
        }))
    }

    #[track_caller]
    pub fn enqueue_flush_outside_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        commands: SecondaryCommands,
    ) -> QueueResult<()> {
        self.enqueue(Task::new(TaskKind::FlushOutsideRenderPassCommands {
            protection,
            priority,
            commands,
        }))
    }

    #[track_caller]
    pub fn enqueue_flush_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        render_pass: RenderPassBegin,
        commands: SecondaryCommands,
    ) -> QueueResult<()> {
        self.enqueue(Task::new(TaskKind::FlushRenderPassCommands {
            protection,
            priority,
            render_pass,
            commands,
        }))
    }

    #[track_caller]
    pub fn enqueue_submit_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<vk::Semaphore>,
        external_fence: Option<SharedExternalFence>,
        serial: QueueSerial,
    ) -> QueueResult<()> {
        self.enqueue(Task::new(TaskKind::Submit {
            protection,
            priority,
            signal_semaphore,
            external_fence,
            serial,
        }))
    }

    #[track_caller]
    pub fn enqueue_submit_one_off(
        &self,
        protection: ProtectionType,
        priority: Priority,
        command_buffer: vk::CommandBuffer,
        wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        policy: SubmitPolicy,
        serial: QueueSerial,
    ) -> QueueResult<()> {
        self.enqueue(Task::new(TaskKind::OneOffSubmit {
            protection,
            priority,
            command_buffer,
            wait_semaphore,
            serial,
        }))?;
        if policy == SubmitPolicy::EnsureSubmitted {
            self.wait_for_resource_use_to_be_submitted(&ResourceUse::from(serial))?;
        }
        Ok(())
    }

    #[track_caller]
    pub fn enqueue_present(
        &self,
        priority: Priority,
        present: PresentDescriptor,
        status: Arc<SwapchainStatus>,
    ) -> QueueResult<()> {
        status.mark_pending();
        self.enqueue(Task::new(TaskKind::Present {
            priority,
            present,
            status,
        }))
    }

    /// Queue `task`, or reject it and hand back whatever it owns.
    fn enqueue(&self, task: Task) -> QueueResult<()> {
        if let Err(e) = self
            .check_and_pop_pending_error()
            .and_then(|()| self.validate(&task))
        {
            reject_task(task, e.code());
            return Err(e);
        }

        let mut queue = self.shared.tasks.lock();
        while queue.tasks.len() >= self.shared.capacity && !queue.exiting {
            self.shared.space_available.wait(&mut queue);
        }
        if let Err(e) = self.admit(&queue, &task) {
            drop(queue);
            reject_task(task, e.code());
            return Err(e);
        }

        // Ordered with the push so the enqueued watermark follows queue order.
        if let Some(serial) = task.serial() {
            self.shared.ledger.advance_enqueued(serial);
        }
        debug!("enqueued {:?}", task);
        queue.tasks.push_back(task);
        drop(queue);

        self.shared.work_available.notify_one();
        Ok(())
    }

    /// Checks that need the task lock held.
    fn admit(&self, queue: &TaskQueue, task: &Task) -> QueueResult<()> {
        if queue.exiting {
            return Err(QueueError::InvalidTask(format!(
                "{} enqueued after the command processor shut down",
                task.name()
            )));
        }
        if let Some(serial) = task.serial() {
            let last = self.shared.ledger.last_enqueued(serial.index);
            if serial.serial <= last {
                return Err(QueueError::InvalidTask(format!(
                    "serial {} enqueued after {}",
                    serial, last
                )));
            }
        }
        Ok(())
    }

    fn validate(&self, task: &Task) -> QueueResult<()> {
        let protection = match &task.kind {
            TaskKind::FlushWaitSemaphores { protection, .. }
            | TaskKind::FlushOutsideRenderPassCommands { protection, .. }
            | TaskKind::FlushRenderPassCommands { protection, .. }
            | TaskKind::Submit { protection, .. }
            | TaskKind::OneOffSubmit { protection, .. } => Some(*protection),
            TaskKind::Present { .. } | TaskKind::Exit => None,
        };
        if let Some(protection) = protection {
            if !self.shared.queue.command_pools().supports(protection) {
                return Err(QueueError::ProtectedContentUnavailable);
            }
        }

        if let Some(serial) = task.serial() {
            if !serial.is_valid() || !self.shared.ledger.contains(serial.index) {
                return Err(QueueError::InvalidTask(format!(
                    "serial {} is outside the ledger's {} indices",
                    serial,
                    self.shared.ledger.index_count()
                )));
            }
        }
        Ok(())
    }

    /// Ask the worker to retire finished batches on its next wake-up.
    pub fn request_commands_and_garbage_cleanup(&self) {
        if !self.shared.cleanup_requested.swap(true, Ordering::AcqRel) {
            let _queue = self.shared.tasks.lock();
            self.shared.work_available.notify_one();
        }
    }

    // ── Waits ───────────────────────────────────────────────

    /// Surface the oldest error recorded by the worker, if any.
    pub fn check_and_pop_pending_error(&self) -> QueueResult<()> {
        match self.shared.errors.lock().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Block until every serial in `use_` has been handed to the engine. Does
    /// not wait for the GPU.
    pub fn wait_for_resource_use_to_be_submitted(&self, use_: &ResourceUse) -> QueueResult<()> {
        let ledger = &self.shared.ledger;
        if !ledger.is_submitted(use_) {
            if !ledger.is_enqueued(use_) {
                return Err(QueueError::NotSubmitted(self.first_unsubmitted(use_)));
            }
            self.shared.drain_until(|| ledger.is_submitted(use_));
        }

        self.check_and_pop_pending_error()?;
        if !ledger.is_submitted(use_) {
            return Err(QueueError::NotSubmitted(self.first_unsubmitted(use_)));
        }
        Ok(())
    }

    pub fn wait_for_queue_serial_to_be_submitted(&self, queue_serial: QueueSerial) -> QueueResult<()> {
        self.wait_for_resource_use_to_be_submitted(&ResourceUse::from(queue_serial))
    }

    pub fn wait_for_all_work_to_be_submitted(&self) -> QueueResult<()> {
        self.shared.drain_until(|| false);
        self.check_and_pop_pending_error()
    }

    pub fn wait_for_present_to_be_submitted(&self, status: &SwapchainStatus) -> QueueResult<()> {
        if status.is_pending() {
            self.shared.drain_until(|| !status.is_pending());
        }
        self.check_and_pop_pending_error()
    }

    fn first_unsubmitted(&self, use_: &ResourceUse) -> QueueSerial {
        use_.iter()
            .find(|qs| !self.shared.ledger.is_serial_submitted(*qs))
            .unwrap_or_default()
    }

    // ── Teardown ────────────────────────────────────────────

    /// Drop every queued task, then force-complete the engine.
    pub fn handle_device_lost(&self) {
        self.shared.discarding.store(true, Ordering::Release);
        let _dequeue = self.shared.dequeue.lock();
        let discarded: Vec<Task> = {
            let mut queue = self.shared.tasks.lock();
            let mut kept = VecDeque::new();
            let mut discarded = Vec::new();
            for task in queue.tasks.drain(..) {
                if task.is_exit() {
                    kept.push_back(task);
                } else {
                    discarded.push(task);
                }
            }
            queue.tasks = kept;
            discarded
        };
        self.shared.space_available.notify_all();

        warn!("device lost: discarding {} queued tasks", discarded.len());
        for task in discarded {
            reject_task(task, vk::Result::ERROR_DEVICE_LOST);
        }

        self.shared.queue.handle_device_lost();

        {
            let _queue = self.shared.tasks.lock();
            self.shared.discarding.store(false, Ordering::Release);
        }
        self.shared.work_available.notify_all();
    }

    /// Stop the worker after it has processed everything already queued.
    pub fn destroy(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        {
            let mut queue = self.shared.tasks.lock();
            queue.exiting = true;
            queue.tasks.push_back(Task::new(TaskKind::Exit));
        }
        self.shared.work_available.notify_all();
        self.shared.space_available.notify_all();

        if worker.join().is_err() {
            error!("command processor thread panicked");
        }

        for e in self.shared.errors.lock().drain(..) {
            warn!("unreported command processor error at shutdown: {}", e);
        }
        info!("command processor destroyed");
    }
}

impl Drop for CommandProcessor {
    fn drop(&mut self) {
        self.destroy();
    }
}
