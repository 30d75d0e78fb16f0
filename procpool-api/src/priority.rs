//! Task priority levels
//!
//! Priorities are informational: the pool dispatches in FIFO order and only
//! records the priority for logging and statistics.
//!
//! # Usage
//!
//! ```rust
//! use procpool_api::priority::{TaskPriority, HIGH};
//!
//! assert_eq!(TaskPriority::High.value(), HIGH);
//! ```

use serde::{Deserialize, Serialize};

/// Low priority (0)
pub const LOW: u8 = 0;

/// Normal priority (1)
pub const NORMAL: u8 = 1;

/// High priority (2)
pub const HIGH: u8 = 2;

/// Urgent priority (3)
pub const URGENT: u8 = 3;

/// Priority attached to a task descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskPriority {
    /// Background or bulk work
    Low,
    /// Standard priority
    #[default]
    Normal,
    /// Time-sensitive work
    High,
    /// Must run as soon as a worker frees up
    Urgent,
}

impl TaskPriority {
    pub fn value(self) -> u8 {
        match self {
            Self::Low => LOW,
            Self::Normal => NORMAL,
            Self::High => HIGH,
            Self::Urgent => URGENT,
        }
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            LOW => Some(Self::Low),
            NORMAL => Some(Self::Normal),
            HIGH => Some(Self::High),
            URGENT => Some(Self::Urgent),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_constants() {
        assert_eq!(TaskPriority::Low.value(), LOW);
        assert_eq!(TaskPriority::Normal.value(), NORMAL);
        assert_eq!(TaskPriority::High.value(), HIGH);
        assert_eq!(TaskPriority::Urgent.value(), URGENT);
        assert_eq!(TaskPriority::from_value(URGENT), Some(TaskPriority::Urgent));
        assert_eq!(TaskPriority::from_value(9), None);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Urgent > TaskPriority::High);
        assert!(TaskPriority::Low < TaskPriority::Normal);
        assert_eq!(TaskPriority::default(), TaskPriority::Normal);
    }
}
