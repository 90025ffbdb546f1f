pub mod ash_driver;
pub mod batch;
pub mod command_pool;
pub mod command_queue;
pub mod driver;
pub mod error;
pub mod fence;
pub mod perf;
pub mod processor;
pub mod simulated;
pub mod submitter;
pub mod task;

pub use ash_driver::{AshDriver, DeviceQueueMap};
pub use batch::{CommandBatch, SecondaryCommandPool, SecondaryCommands};
pub use command_queue::CommandQueue;
pub use driver::{Driver, PresentDescriptor, RenderPassBegin, SubmitDescriptor, SwapchainStatus};
pub use error::{QueueError, QueueResult};
pub use fence::{ExternalFence, FencePool, RecyclableFence, SharedExternalFence, SharedFence};
pub use perf::PerfCounters;
pub use processor::CommandProcessor;
pub use simulated::SimulatedDriver;
pub use submitter::Submitter;
pub use task::{SubmitPolicy, Task, TaskKind};
