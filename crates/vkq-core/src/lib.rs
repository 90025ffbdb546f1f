pub mod config;
pub mod error;
pub mod serial;
pub mod types;

pub use config::VkqConfig;
pub use error::CoreError;
pub use serial::{QueueSerial, ResourceUse, Serial, SerialIndex, SerialLedger};
pub use types::{Priority, ProtectionType};
