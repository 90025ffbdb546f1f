use serde::{Deserialize, Serialize};

/// Memory protection domain of a submission. Each domain has its own native
/// command pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtectionType {
    #[default]
    #[serde(rename = "unprotected")]
    Unprotected,
    #[serde(rename = "protected")]
    Protected,
}

impl ProtectionType {
    pub const COUNT: usize = 2;
    pub const ALL: [ProtectionType; Self::COUNT] =
        [ProtectionType::Unprotected, ProtectionType::Protected];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_protected(self) -> bool {
        self == ProtectionType::Protected
    }
}

/// Scheduling priority requested by the submitting context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    #[serde(rename = "low")]
    Low,
    #[default]
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "high")]
    High,
}

impl Priority {
    pub const COUNT: usize = 3;
    pub const ALL: [Priority; Self::COUNT] = [Priority::Low, Priority::Medium, Priority::High];

    pub fn index(self) -> usize {
        self as usize
    }
}
