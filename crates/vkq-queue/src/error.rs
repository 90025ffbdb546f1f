use std::panic::Location;

use ash::vk;
use vkq_core::{CoreError, QueueSerial};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("native queue call failed: {0}")]
    Native(vk::Result),

    #[error("fence wait timed out after {timeout_ns} ns")]
    Timeout { timeout_ns: u64 },

    #[error("device lost")]
    DeviceLost,

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("serial {0} was never submitted")]
    NotSubmitted(QueueSerial),

    #[error("protected content was not enabled on this queue")]
    ProtectedContentUnavailable,

    #[error("{task} failed on the command processor thread: {code} (enqueued at {origin})")]
    Deferred {
        code: vk::Result,
        task: &'static str,
        origin: &'static Location<'static>,
    },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl QueueError {
    /// Native result code that best describes this error.
    pub fn code(&self) -> vk::Result {
        match self {
            QueueError::Native(code) | QueueError::Deferred { code, .. } => *code,
            QueueError::Timeout { .. } => vk::Result::TIMEOUT,
            QueueError::DeviceLost => vk::Result::ERROR_DEVICE_LOST,
            QueueError::ProtectedContentUnavailable => vk::Result::ERROR_FEATURE_NOT_PRESENT,
            QueueError::InvalidTask(_) | QueueError::NotSubmitted(_) | QueueError::Core(_) => {
                vk::Result::ERROR_UNKNOWN
            }
        }
    }

    pub fn is_device_lost(&self) -> bool {
        self.code() == vk::Result::ERROR_DEVICE_LOST
    }
}

impl From<vk::Result> for QueueError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => QueueError::DeviceLost,
            other => QueueError::Native(other),
        }
    }
}

pub type QueueResult<T> = Result<T, QueueError>;
