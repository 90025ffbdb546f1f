//! Primary command buffer pools and per-context recording state.
//!
//! A native command pool is not safe for concurrent use, not even across
//! different buffers allocated from it. [`CommandPoolAccess`] therefore puts
//! every pool, every open primary buffer and every pending wait semaphore
//! behind a single mutex. That mutex covers:
//!
//! 1. recording into any primary buffer drawn from the pools,
//! 2. allocating, resetting or freeing those buffers,
//! 3. operations on the pools themselves.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, info};

use vkq_core::{Priority, ProtectionType};

use crate::batch::{CommandBatch, SecondaryCommands};
use crate::driver::{Driver, RenderPassBegin};
use crate::error::{QueueError, QueueResult};

/// Reusable primary command buffers of one protection domain. Not internally
/// synchronized; only reachable through [`CommandPoolAccess`].
pub struct CommandBufferPool {
    handle: vk::CommandPool,
    protection: ProtectionType,
    free: Vec<vk::CommandBuffer>,
    allocated: usize,
}

impl CommandBufferPool {
    fn new(driver: &dyn Driver, protection: ProtectionType) -> QueueResult<Self> {
        let handle = driver.create_command_pool(protection)?;
        info!("created {:?} command pool: {:?}", protection, handle);
        Ok(Self {
            handle,
            protection,
            free: Vec::new(),
            allocated: 0,
        })
    }

    /// Hand out a buffer in the initial state.
    fn allocate(&mut self, driver: &dyn Driver) -> QueueResult<vk::CommandBuffer> {
        if let Some(command_buffer) = self.free.pop() {
            return Ok(command_buffer);
        }
        let command_buffer = driver.allocate_command_buffer(self.handle)?;
        self.allocated += 1;
        debug!(
            "allocated {:?} primary command buffer #{}: {:?}",
            self.protection, self.allocated, command_buffer
        );
        Ok(command_buffer)
    }

    fn begin_recording(
        &mut self,
        driver: &dyn Driver,
        command_buffer: vk::CommandBuffer,
    ) -> QueueResult<()> {
        driver.begin_command_buffer(command_buffer)?;
        Ok(())
    }

    /// Reset a buffer and put it back on the free list.
    fn reclaim(&mut self, driver: &dyn Driver, command_buffer: vk::CommandBuffer) -> QueueResult<()> {
        debug_assert!(!self.free.contains(&command_buffer), "buffer reclaimed twice");
        if let Err(e) = driver.reset_command_buffer(command_buffer) {
            self.free_buffer(driver, command_buffer);
            return Err(e.into());
        }
        self.free.push(command_buffer);
        Ok(())
    }

    fn free_buffer(&mut self, driver: &dyn Driver, command_buffer: vk::CommandBuffer) {
        driver.free_command_buffer(self.handle, command_buffer);
        self.allocated -= 1;
    }

    fn destroy(&mut self, driver: &dyn Driver) {
        for command_buffer in std::mem::take(&mut self.free) {
            self.free_buffer(driver, command_buffer);
        }
        if self.allocated != 0 {
            tracing::warn!(
                "destroying {:?} command pool with {} buffers still outstanding",
                self.protection,
                self.allocated
            );
        }
        driver.destroy_command_pool(self.handle);
    }
}

/// Recording state of one (priority, protection) pair.
#[derive(Default)]
struct CommandsState {
    primary: Option<vk::CommandBuffer>,
    secondaries: Vec<SecondaryCommands>,
    wait_semaphores: Vec<vk::Semaphore>,
    wait_stage_masks: Vec<vk::PipelineStageFlags>,
}

struct PoolState {
    pools: [Option<CommandBufferPool>; ProtectionType::COUNT],
    commands: [[CommandsState; ProtectionType::COUNT]; Priority::COUNT],
}

impl PoolState {
    fn pool_mut(&mut self, protection: ProtectionType) -> QueueResult<&mut CommandBufferPool> {
        self.pools[protection.index()]
            .as_mut()
            .ok_or(QueueError::ProtectedContentUnavailable)
    }

    /// Make sure the pair has an open primary buffer and return it.
    fn ensure_primary(
        &mut self,
        driver: &dyn Driver,
        protection: ProtectionType,
        priority: Priority,
    ) -> QueueResult<vk::CommandBuffer> {
        if let Some(primary) = self.commands[priority.index()][protection.index()].primary {
            return Ok(primary);
        }
        let pool = self.pool_mut(protection)?;
        let primary = pool.allocate(driver)?;
        if let Err(e) = pool.begin_recording(driver, primary) {
            pool.free.push(primary);
            return Err(e);
        }
        self.commands[priority.index()][protection.index()].primary = Some(primary);
        Ok(primary)
    }
}

/// Wait semaphores collected for a submission.
#[derive(Debug, Default)]
pub struct PendingWaits {
    pub semaphores: Vec<vk::Semaphore>,
    pub stage_masks: Vec<vk::PipelineStageFlags>,
}

/// Exclusive access to the primary command pools of every protection domain.
pub struct CommandPoolAccess {
    driver: Arc<dyn Driver>,
    state: Mutex<PoolState>,
}

impl CommandPoolAccess {
    pub fn new(driver: Arc<dyn Driver>, protected_content: bool) -> QueueResult<Self> {
        let unprotected = CommandBufferPool::new(driver.as_ref(), ProtectionType::Unprotected)?;
        let protected = if protected_content {
            Some(CommandBufferPool::new(driver.as_ref(), ProtectionType::Protected)?)
        } else {
            None
        };

        Ok(Self {
            driver,
            state: Mutex::new(PoolState {
                pools: [Some(unprotected), protected],
                commands: Default::default(),
            }),
        })
    }

    pub fn supports(&self, protection: ProtectionType) -> bool {
        self.state.lock().pools[protection.index()].is_some()
    }

    pub fn allocate(&self, protection: ProtectionType) -> QueueResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        state.pool_mut(protection)?.allocate(self.driver.as_ref())
    }

    pub fn begin_recording(
        &self,
        protection: ProtectionType,
        command_buffer: vk::CommandBuffer,
    ) -> QueueResult<()> {
        let mut state = self.state.lock();
        state
            .pool_mut(protection)?
            .begin_recording(self.driver.as_ref(), command_buffer)
    }

    pub fn reclaim(
        &self,
        protection: ProtectionType,
        command_buffer: vk::CommandBuffer,
    ) -> QueueResult<()> {
        let mut state = self.state.lock();
        state
            .pool_mut(protection)?
            .reclaim(self.driver.as_ref(), command_buffer)
    }

    /// Free a buffer outright instead of recycling it. Used when the device is
    /// lost and resetting can no longer be trusted.
    pub fn destroy_primary(&self, protection: ProtectionType, command_buffer: vk::CommandBuffer) {
        let mut state = self.state.lock();
        if let Ok(pool) = state.pool_mut(protection) {
            pool.free_buffer(self.driver.as_ref(), command_buffer);
        }
    }

    pub fn free_count(&self, protection: ProtectionType) -> usize {
        self.state.lock().pools[protection.index()]
            .as_ref()
            .map_or(0, |pool| pool.free.len())
    }

    pub fn flush_wait_semaphores(
        &self,
        protection: ProtectionType,
        priority: Priority,
        mut wait_semaphores: Vec<vk::Semaphore>,
        mut wait_stage_masks: Vec<vk::PipelineStageFlags>,
    ) {
        debug_assert_eq!(wait_semaphores.len(), wait_stage_masks.len());
        let mut state = self.state.lock();
        let commands = &mut state.commands[priority.index()][protection.index()];
        commands.wait_semaphores.append(&mut wait_semaphores);
        commands.wait_stage_masks.append(&mut wait_stage_masks);
    }

    /// Execute work recorded outside any render pass into the open primary.
    pub fn flush_outside_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        commands: SecondaryCommands,
    ) -> QueueResult<()> {
        let mut state = self.state.lock();
        let primary = match state.ensure_primary(self.driver.as_ref(), protection, priority) {
            Ok(primary) => primary,
            Err(e) => {
                commands.release();
                return Err(e);
            }
        };
        self.driver
            .cmd_execute_commands(primary, &[commands.command_buffer]);
        state.commands[priority.index()][protection.index()]
            .secondaries
            .push(commands);
        Ok(())
    }

    /// Execute a render pass body into the open primary, wrapped in the
    /// render pass it was recorded against.
    pub fn flush_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        render_pass: &RenderPassBegin,
        commands: SecondaryCommands,
    ) -> QueueResult<()> {
        let mut state = self.state.lock();
        let primary = match state.ensure_primary(self.driver.as_ref(), protection, priority) {
            Ok(primary) => primary,
            Err(e) => {
                commands.release();
                return Err(e);
            }
        };
        self.driver.cmd_begin_render_pass(primary, render_pass);
        self.driver
            .cmd_execute_commands(primary, &[commands.command_buffer]);
        self.driver.cmd_end_render_pass(primary);
        state.commands[priority.index()][protection.index()]
            .secondaries
            .push(commands);
        Ok(())
    }

    /// End the open primary of the pair and move it, with the secondaries it
    /// executed, into `batch`. Returns the wait semaphores queued for the pair.
    pub fn flush_pending_into_batch(
        &self,
        protection: ProtectionType,
        priority: Priority,
        batch: &mut CommandBatch,
    ) -> QueueResult<PendingWaits> {
        let mut state = self.state.lock();
        let commands = &mut state.commands[priority.index()][protection.index()];

        if let Some(primary) = commands.primary {
            self.driver.end_command_buffer(primary)?;
            commands.primary = None;
            batch.set_primary(primary);
        }
        debug_assert!(batch.primary().is_some() || commands.secondaries.is_empty());
        batch.set_secondaries(std::mem::take(&mut commands.secondaries));

        Ok(PendingWaits {
            semaphores: std::mem::take(&mut commands.wait_semaphores),
            stage_masks: std::mem::take(&mut commands.wait_stage_masks),
        })
    }

    pub fn destroy(&self) {
        let mut state = self.state.lock();
        let PoolState { pools, commands } = &mut *state;
        for (protection_index, pool) in pools.iter_mut().enumerate() {
            let Some(mut pool) = pool.take() else {
                continue;
            };
            for per_priority in commands.iter_mut() {
                let pending = &mut per_priority[protection_index];
                if let Some(primary) = pending.primary.take() {
                    pool.free_buffer(self.driver.as_ref(), primary);
                }
                for secondary in pending.secondaries.drain(..) {
                    secondary.release();
                }
            }
            pool.destroy(self.driver.as_ref());
        }
    }
}
