//! Priority tiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the three physical queues a task can land on.
///
/// The tier is selected at submission time by comparing the task's
/// priority value against the configured thresholds. Workers always
/// drain High before Normal before Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    High,
    Normal,
    Low,
}

impl PriorityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityTier::High => "high",
            PriorityTier::Normal => "normal",
            PriorityTier::Low => "low",
        }
    }

    /// All tiers in drain order (high first).
    pub const DRAIN_ORDER: [PriorityTier; 3] =
        [PriorityTier::High, PriorityTier::Normal, PriorityTier::Low];
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_order() {
        assert_eq!(
            PriorityTier::DRAIN_ORDER,
            [PriorityTier::High, PriorityTier::Normal, PriorityTier::Low]
        );
    }

    #[test]
    fn test_tier_serde() {
        let json = serde_json::to_string(&PriorityTier::High).unwrap();
        assert_eq!(json, "\"high\"");
    }
}
