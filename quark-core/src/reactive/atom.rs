//! Atom Implementation
//!
//! An Atom is the independently settable reactive cell. It holds a value and
//! an ordered list of listeners.
//!
//! # How Atoms Work
//!
//! 1. A write is compared against the stored value with
//!    [`deep_equal`](crate::value::deep_equal). Equal writes are dropped
//!    without notifying anyone.
//!
//! 2. On change the value is replaced and every listener runs inline on the
//!    writing thread, in registration order. Dependent selectors are among
//!    those listeners, so the whole synchronous part of the graph has settled
//!    by the time `set` returns.
//!
//! 3. A listener that panics is logged and skipped; the remaining listeners
//!    still run.

use std::fmt;
use std::sync::Arc;

use super::cell::{CellCore, Observable};
use super::sink::{Sink, SinkBinding, WriteBack};
use crate::error::Result;
use crate::value::Value;

/// A reactive cell holding a [`Value`].
///
/// # Example
///
/// ```rust,ignore
/// let count = Atom::new("count", 0);
///
/// count.listen(callback(|v| println!("count = {v}")), false);
///
/// // Notifies listeners
/// count.set(5)?;
///
/// // Equal value: nothing happens
/// count.set(5)?;
/// ```
pub struct Atom {
    core: CellCore,
}

impl Atom {
    /// Create a free-standing atom. Registries create theirs through
    /// [`Registry::atom`](crate::state::Registry::atom).
    pub fn new(key: &str, value: impl Into<Value>) -> Arc<Self> {
        Arc::new(Self {
            core: CellCore::new(key, value.into()),
        })
    }

    /// Set a new value and notify listeners if it differs from the current
    /// one.
    ///
    /// Returns whether the value changed. Fails only when propagation hits a
    /// dependency cycle.
    pub fn set(&self, value: impl Into<Value>) -> Result<bool> {
        self.core.set(value.into())
    }

    /// Update the value using a function of the current one.
    pub fn update<F>(&self, f: F) -> Result<bool>
    where
        F: FnOnce(&Value) -> Value,
    {
        let next = f(&self.core.get());
        self.core.set(next)
    }

    /// Bind `property` of `sink` to this atom in both directions.
    ///
    /// State changes are pushed into the sink like [`Observable::bind`]. The
    /// returned [`WriteBack`] must be invoked by the sink's change-event hook
    /// for edits to flow back into the atom.
    pub fn bind_two_way(
        self: &Arc<Self>,
        sink: Arc<dyn Sink>,
        property: &str,
        auto_flush: bool,
    ) -> WriteBack {
        self.core.bind(SinkBinding::new(sink, property, auto_flush));
        WriteBack::new(self)
    }
}

impl Observable for Atom {
    fn core(&self) -> &CellCore {
        &self.core
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("key", &self.core.key())
            .field("value", &self.core.get())
            .field("listener_count", &self.core.listener_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
