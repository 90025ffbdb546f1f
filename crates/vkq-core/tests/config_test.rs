//! Integration test: configuration loading and validation.

use vkq_core::config::{QueueLimits, VkqConfig};
use vkq_core::CoreError;

#[test]
fn test_defaults_are_valid() {
    let config = VkqConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.queue.in_flight_commands_limit, 50);
    assert_eq!(config.queue.max_finished_commands_limit, 64);
    assert_eq!(config.processor.max_tasks, 16);
    assert!(config.processor.async_command_queue);
    assert!(!config.device.protected_content);
}

#[test]
fn test_partial_toml_fills_defaults() {
    let config: VkqConfig = toml::from_str(
        r#"
        [queue]
        in_flight_commands_limit = 8

        [processor]
        async_command_queue = false
        "#,
    )
    .expect("parse config");

    assert_eq!(config.queue.in_flight_commands_limit, 8);
    assert_eq!(config.queue.max_finished_commands_limit, 64);
    assert!(!config.processor.async_command_queue);
    assert_eq!(config.processor.max_tasks, 16);
}

#[test]
fn test_in_flight_limit_above_hard_cap_is_rejected() {
    let limits = QueueLimits {
        in_flight_commands_limit: 65,
        ..QueueLimits::default()
    };
    match limits.validate() {
        Err(CoreError::ConfigError(msg)) => assert!(msg.contains("in_flight_commands_limit")),
        other => panic!("expected ConfigError, got {:?}", other),
    }
}

#[test]
fn test_round_trip_through_toml_text() {
    let mut config = VkqConfig::default();
    config.device.protected_content = true;
    let text = config.to_toml().expect("serialize config");
    let parsed: VkqConfig = toml::from_str(&text).expect("parse config");
    assert!(parsed.device.protected_content);
}

#[test]
fn test_load_or_default_with_missing_file() {
    let config = VkqConfig::load_or_default("/nonexistent/vkq.toml");
    assert_eq!(config.queue.serial_index_count, 16);
}
