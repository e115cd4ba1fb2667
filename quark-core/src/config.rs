//! Runtime configuration.
//!
//! A [`StateConfig`] is fixed when a [`Registry`](crate::state::Registry) is
//! built and shared by every selector registered on it. It derives
//! `Deserialize` so hosts can load it from whatever format they already use.

use serde::{Deserialize, Serialize};

/// Default bound on nested updates of a single selector.
pub const DEFAULT_MAX_UPDATE_DEPTH: usize = 100;

/// What a selector does with a dependency change that arrives while another
/// thread is already recomputing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalescePolicy {
    /// Drop the trigger. The in-flight evaluation may or may not observe the
    /// new value; it is guaranteed to be picked up on the next trigger.
    #[default]
    Drop,
    /// Remember the trigger and have the thread holding the update lock run
    /// one more evaluation before releasing it.
    Rerun,
}

/// Configuration shared by all cells of one registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Nested re-entries of one selector tolerated before the propagation is
    /// aborted with [`StateError::CycleDetected`](crate::StateError::CycleDetected).
    pub max_update_depth: usize,
    /// Handling of triggers that race an in-flight evaluation.
    pub coalesce: CoalescePolicy,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            max_update_depth: DEFAULT_MAX_UPDATE_DEPTH,
            coalesce: CoalescePolicy::Drop,
        }
    }
}

impl StateConfig {
    /// Set how deep a selector may re-enter its own update before it reports a cycle.
    pub fn with_max_update_depth(mut self, depth: usize) -> Self {
        self.max_update_depth = depth;
        self
    }

    /// Set what happens to updates that arrive while a selector is busy.
    pub fn with_coalesce(mut self, policy: CoalescePolicy) -> Self {
        self.coalesce = policy;
        self
    }
}
