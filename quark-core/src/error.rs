//! Error types for the state runtime.
//!
//! Structural mistakes (registering a key twice with different kinds,
//! resetting a derived value, a dependency cycle) surface as [`StateError`]
//! from the call that caused them. Runtime failures inside the notification
//! chain (a panicking listener, a failed recomputation) never do: they are
//! logged through `tracing` and the graph keeps running.

use std::fmt;

use thiserror::Error;

/// Which kind of cell lives under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellKind {
    /// An independently settable cell.
    Atom,
    /// A derived cell.
    Selector,
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellKind::Atom => f.write_str("atom"),
            CellKind::Selector => f.write_str("selector"),
        }
    }
}

/// Errors reported by the registry and its cells.
#[derive(Error, Debug)]
pub enum StateError {
    /// The key is already registered as the other kind of cell.
    #[error("key '{key}' is already registered as {existing}")]
    KeyKindConflict { key: String, existing: CellKind },

    /// Selectors are recomputed, never assigned.
    #[error("selector '{key}' cannot be reset directly")]
    ResetOnDerived { key: String },

    /// A write targeted a selector key.
    #[error("selector '{key}' is derived and cannot be written")]
    SetOnDerived { key: String },

    /// No cell is registered under the key.
    #[error("no state registered under key '{key}'")]
    UnknownKey { key: String },

    /// Propagation re-entered a selector more times than the configured bound.
    #[error(
        "circular dependency detected in selector '{key}' after {depth} nested updates \
         (dependencies: {dependencies:?})"
    )]
    CycleDetected {
        key: String,
        depth: usize,
        dependencies: Vec<String>,
    },

    /// The compute function of a selector failed.
    #[error("selector '{key}' failed to compute")]
    Compute {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// A value could not be converted to or from structured data.
    #[error("value conversion failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StateError {
    /// True for errors that must abort the whole propagation chain.
    pub fn is_cycle(&self) -> bool {
        matches!(self, StateError::CycleDetected { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = StateError> = std::result::Result<T, E>;
