//! Work batch lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a work batch. Transitions only move forward:
/// `Usable -> Merged -> Completed` (or `Usable -> Completed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// Items may be added.
    Usable,
    /// Other batches have been folded into this one; no further adds.
    Merged,
    /// Completion delivered (or batch disposed); storage released.
    Completed,
}

impl BatchState {
    /// Whether moving to `next` respects the one-way ordering.
    pub fn can_transition_to(self, next: BatchState) -> bool {
        self.rank() <= next.rank()
    }

    fn rank(self) -> u8 {
        match self {
            BatchState::Usable => 0,
            BatchState::Merged => 1,
            BatchState::Completed => 2,
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchState::Usable => "usable",
            BatchState::Merged => "merged",
            BatchState::Completed => "completed",
        };
        f.write_str(s)
    }
}
