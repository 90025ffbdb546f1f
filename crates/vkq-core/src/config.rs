use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Top-level configuration, loaded from vkq.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VkqConfig {
    #[serde(default)]
    pub queue: QueueLimits,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub device: DeviceConfig,
}

/// Bounds on the batch queues of the command queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueLimits {
    /// Soft limit: exceeding it triggers garbage cleanup on the submit path
    #[serde(default = "default_in_flight_commands_limit")]
    pub in_flight_commands_limit: usize,
    /// Hard cap on in-flight plus finished-but-unreleased batches
    #[serde(default = "default_max_finished_commands_limit")]
    pub max_finished_commands_limit: usize,
    /// Fence wait used when the engine itself has to block
    #[serde(default = "default_max_fence_wait_time_ns")]
    pub max_fence_wait_time_ns: u64,
    /// Number of independent serial indices tracked by the ledger
    #[serde(default = "default_serial_index_count")]
    pub serial_index_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Route submissions through the background worker thread
    #[serde(default = "default_true")]
    pub async_command_queue: bool,
    /// Capacity of the task queue; producers block when it is full
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Create a command pool for protected submissions
    #[serde(default)]
    pub protected_content: bool,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            in_flight_commands_limit: default_in_flight_commands_limit(),
            max_finished_commands_limit: default_max_finished_commands_limit(),
            max_fence_wait_time_ns: default_max_fence_wait_time_ns(),
            serial_index_count: default_serial_index_count(),
        }
    }
}

impl QueueLimits {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.in_flight_commands_limit > self.max_finished_commands_limit {
            return Err(CoreError::ConfigError(format!(
                "in_flight_commands_limit ({}) must not exceed max_finished_commands_limit ({})",
                self.in_flight_commands_limit, self.max_finished_commands_limit
            )));
        }
        if self.in_flight_commands_limit == 0 {
            return Err(CoreError::ConfigError(
                "in_flight_commands_limit must be at least 1".to_string(),
            ));
        }
        if self.serial_index_count == 0 {
            return Err(CoreError::ConfigError(
                "serial_index_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            async_command_queue: true,
            max_tasks: default_max_tasks(),
        }
    }
}

impl VkqConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        let config: VkqConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(CoreError::Io(_)) => Self::default(),
            Err(e) => {
                tracing::warn!("ignoring invalid config {}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.queue.validate()?;
        if self.processor.max_tasks == 0 {
            return Err(CoreError::ConfigError(
                "processor.max_tasks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, CoreError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Returns the default config file path.
/// Search order:
/// 1. System-wide config: `/etc/vkq/vkq.toml`
/// 2. Local fallback: `./vkq.toml`
pub fn default_config_path() -> String {
    let system_path = "/etc/vkq/vkq.toml";
    if std::path::Path::new(system_path).exists() {
        return system_path.to_string();
    }
    "vkq.toml".to_string()
}

fn default_in_flight_commands_limit() -> usize {
    50
}

fn default_max_finished_commands_limit() -> usize {
    64
}

fn default_max_fence_wait_time_ns() -> u64 {
    120_000_000_000
}

fn default_serial_index_count() -> usize {
    16
}

fn default_max_tasks() -> usize {
    16
}

fn default_true() -> bool {
    true
}
