//! Work items replayed by the command processor thread.

use std::panic::Location;
use std::sync::Arc;

use ash::vk;

use vkq_core::{Priority, ProtectionType, QueueSerial};

use crate::batch::SecondaryCommands;
use crate::driver::{PresentDescriptor, RenderPassBegin, SwapchainStatus};
use crate::fence::SharedExternalFence;

/// Whether a one-off submission may return before it reaches the native queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubmitPolicy {
    #[default]
    AllowDeferred,
    EnsureSubmitted,
}

pub enum TaskKind {
    FlushWaitSemaphores {
        protection: ProtectionType,
        priority: Priority,
        semaphores: Vec<vk::Semaphore>,
        stage_masks: Vec<vk::PipelineStageFlags>,
    },
    FlushOutsideRenderPassCommands {
        protection: ProtectionType,
        priority: Priority,
        commands: SecondaryCommands,
    },
    FlushRenderPassCommands {
        protection: ProtectionType,
        priority: Priority,
        render_pass: RenderPassBegin,
        commands: SecondaryCommands,
    },
    Submit {
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<vk::Semaphore>,
        external_fence: Option<SharedExternalFence>,
        serial: QueueSerial,
    },
    OneOffSubmit {
        protection: ProtectionType,
        priority: Priority,
        command_buffer: vk::CommandBuffer,
        wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        serial: QueueSerial,
    },
    Present {
        priority: Priority,
        present: PresentDescriptor,
        status: Arc<SwapchainStatus>,
    },
    Exit,
}

/// A task plus the producer call site that enqueued it.
pub struct Task {
    pub kind: TaskKind,
    pub origin: &'static Location<'static>,
}

impl Task {
    #[track_caller]
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            origin: Location::caller(),
        }
    }

    pub fn name(&self) -> &'static str {
        match &self.kind {
            TaskKind::FlushWaitSemaphores { .. } => "FlushWaitSemaphores",
            TaskKind::FlushOutsideRenderPassCommands { .. } => "FlushOutsideRenderPassCommands",
            TaskKind::FlushRenderPassCommands { .. } => "FlushRenderPassCommands",
            TaskKind::Submit { .. } => "Submit",
            TaskKind::OneOffSubmit { .. } => "OneOffSubmit",
            TaskKind::Present { .. } => "Present",
            TaskKind::Exit => "Exit",
        }
    }

    /// Serial the task completes, for tasks that produce a batch.
    pub fn serial(&self) -> Option<QueueSerial> {
        match &self.kind {
            TaskKind::Submit { serial, .. } | TaskKind::OneOffSubmit { serial, .. } => {
                Some(*serial)
            }
            _ => None,
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self.kind, TaskKind::Exit)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.name())
            .field("serial", &self.serial())
            .field("origin", &self.origin)
            .finish()
    }
}
