use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a backend in the write path, in attempt order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    Primary,
    PrimaryReduced,
    Secondary,
    Volatile,
}

impl TierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::PrimaryReduced => "primary-reduced",
            Self::Secondary => "secondary",
            Self::Volatile => "volatile",
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityClass {
    Bounded { quota_bytes: u64 },
    Unbounded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Durable,
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierCapability {
    pub capacity: CapacityClass,
    pub durability: Durability,
}

impl TierCapability {
    pub fn is_durable(&self) -> bool {
        self.durability == Durability::Durable
    }
}
