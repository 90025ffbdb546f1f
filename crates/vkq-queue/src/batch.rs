use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;

use vkq_core::{ProtectionType, QueueSerial};

use crate::fence::{SharedExternalFence, SharedFence};

/// Owner of secondary command buffers recorded outside the engine. Buffers
/// are handed back once the batch that executed them has finished.
pub trait SecondaryCommandPool: Send + Sync {
    fn recycle(&self, command_buffer: vk::CommandBuffer);
}

/// A recorded secondary command buffer ready to be folded into a primary.
pub struct SecondaryCommands {
    pub command_buffer: vk::CommandBuffer,
    pub pool: Arc<dyn SecondaryCommandPool>,
}

impl SecondaryCommands {
    pub fn new(command_buffer: vk::CommandBuffer, pool: Arc<dyn SecondaryCommandPool>) -> Self {
        Self {
            command_buffer,
            pool,
        }
    }

    pub(crate) fn release(self) {
        self.pool.recycle(self.command_buffer);
    }
}

impl std::fmt::Debug for SecondaryCommands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SecondaryCommands")
            .field(&self.command_buffer)
            .finish()
    }
}

/// Completion signal of a batch.
#[derive(Clone)]
pub enum BatchFence {
    Recyclable(SharedFence),
    External(SharedExternalFence),
}

impl BatchFence {
    pub fn handle(&self) -> vk::Fence {
        match self {
            BatchFence::Recyclable(fence) => fence.handle(),
            BatchFence::External(fence) => fence.handle(),
        }
    }

    pub fn status(&self) -> VkResult<bool> {
        match self {
            BatchFence::Recyclable(fence) => fence.status(),
            BatchFence::External(fence) => fence.status(),
        }
    }

    pub fn wait(&self, timeout_ns: u64) -> VkResult<()> {
        match self {
            BatchFence::Recyclable(fence) => fence.wait(timeout_ns),
            BatchFence::External(fence) => fence.wait(timeout_ns),
        }
    }
}

/// One native queue submission and everything it keeps alive until its fence
/// signals. Batches are moved, never shared, between the in-flight and
/// finished queues.
pub struct CommandBatch {
    serial: QueueSerial,
    protection: ProtectionType,
    primary: Option<vk::CommandBuffer>,
    secondaries: Vec<SecondaryCommands>,
    fence: Option<BatchFence>,
}

impl CommandBatch {
    pub fn new(serial: QueueSerial, protection: ProtectionType) -> Self {
        Self {
            serial,
            protection,
            primary: None,
            secondaries: Vec::new(),
            fence: None,
        }
    }

    pub fn serial(&self) -> QueueSerial {
        self.serial
    }

    pub fn protection(&self) -> ProtectionType {
        self.protection
    }

    pub fn primary(&self) -> Option<vk::CommandBuffer> {
        self.primary
    }

    pub(crate) fn set_primary(&mut self, primary: vk::CommandBuffer) {
        debug_assert!(self.primary.is_none());
        self.primary = Some(primary);
    }

    pub(crate) fn take_primary(&mut self) -> Option<vk::CommandBuffer> {
        self.primary.take()
    }

    pub(crate) fn set_secondaries(&mut self, secondaries: Vec<SecondaryCommands>) {
        self.secondaries = secondaries;
    }

    pub fn secondary_count(&self) -> usize {
        self.secondaries.len()
    }

    pub(crate) fn set_fence(&mut self, fence: BatchFence) {
        self.fence = Some(fence);
    }

    pub fn fence(&self) -> Option<&BatchFence> {
        self.fence.as_ref()
    }

    pub fn fence_handle(&self) -> vk::Fence {
        self.fence.as_ref().map(BatchFence::handle).unwrap_or_default()
    }

    /// A batch without fence is treated as finished.
    pub fn fence_status(&self) -> VkResult<bool> {
        match &self.fence {
            Some(fence) => fence.status(),
            None => Ok(true),
        }
    }

    /// Return secondary buffers to their owners and drop the fence reference.
    /// The primary buffer must have been taken out beforehand.
    pub(crate) fn release_secondaries_and_fence(&mut self) {
        debug_assert!(self.primary.is_none(), "primary must go back to its pool first");
        for secondary in self.secondaries.drain(..) {
            secondary.release();
        }
        self.fence = None;
    }
}

impl std::fmt::Debug for CommandBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBatch")
            .field("serial", &self.serial)
            .field("protection", &self.protection)
            .field("primary", &self.primary)
            .field("secondaries", &self.secondaries.len())
            .field("fence", &self.fence_handle())
            .finish()
    }
}
