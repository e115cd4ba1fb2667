//! Sink bindings.
//!
//! A [`Sink`] is an external observable target, typically a widget owned by a
//! UI layer, that a cell's value is projected onto. The runtime only needs two
//! things from it: assigning a named property and an optional flush. Two-way
//! bindings additionally hand the sink a [`WriteBack`] which it calls from its
//! own change-event hook.

use std::fmt;
use std::sync::{Arc, Weak};

use super::atom::Atom;
use super::cell::Observable;
use crate::error::{Result, StateError};
use crate::value::Value;

/// An external target a cell can be bound to.
///
/// Implementations must make `set_property` and `flush` idempotent: the same
/// value may be written more than once.
pub trait Sink: Send + Sync {
    /// Assign `value` to the property called `property`.
    fn set_property(&self, property: &str, value: &Value);

    /// Refresh the sink after a property write.
    fn flush(&self) {}
}

pub(crate) fn sink_addr<S: ?Sized>(sink: &Arc<S>) -> *const () {
    Arc::as_ptr(sink) as *const ()
}

/// A listener that mirrors a cell into one property of a sink.
#[derive(Clone)]
pub(crate) struct SinkBinding {
    sink: Arc<dyn Sink>,
    property: Arc<str>,
    auto_flush: bool,
}

impl SinkBinding {
    pub(crate) fn new(sink: Arc<dyn Sink>, property: &str, auto_flush: bool) -> Self {
        Self {
            sink,
            property: Arc::from(property),
            auto_flush,
        }
    }

    pub(crate) fn apply(&self, value: &Value) {
        self.sink.set_property(&self.property, value);
        if self.auto_flush {
            self.sink.flush();
        }
    }

    /// Bindings are keyed by sink identity plus property, never by the
    /// listener closure.
    pub(crate) fn same_target(&self, other: &SinkBinding) -> bool {
        self.targets(sink_addr(&other.sink)) && self.property == other.property
    }

    pub(crate) fn targets(&self, addr: *const ()) -> bool {
        std::ptr::eq(sink_addr(&self.sink), addr)
    }
}

/// The sink→state half of a two-way binding.
///
/// The binding layer calls [`WriteBack::write`] whenever the sink reports a
/// user edit. The handle only points at the atom it was created for: once that
/// atom is deleted or its registry cleared, writes fail with
/// [`StateError::UnknownKey`] instead of reaching a newer atom under the same
/// key.
#[derive(Clone)]
pub struct WriteBack {
    key: Arc<str>,
    atom: Weak<Atom>,
}

impl WriteBack {
    pub(crate) fn new(atom: &Arc<Atom>) -> Self {
        Self {
            key: Arc::from(atom.key()),
            atom: Arc::downgrade(atom),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Push a value edited in the sink back into the atom.
    ///
    /// Returns whether the atom's value changed.
    pub fn write(&self, value: impl Into<Value>) -> Result<bool> {
        match self.atom.upgrade() {
            Some(atom) if !atom.is_detached() => atom.set(value),
            _ => Err(StateError::UnknownKey {
                key: self.key.to_string(),
            }),
        }
    }
}

impl fmt::Debug for WriteBack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBack")
            .field("key", &self.key)
            .field("live", &(self.atom.strong_count() > 0))
            .finish()
    }
}
