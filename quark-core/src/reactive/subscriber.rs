//! Listener types for the reactive system.
//!
//! A listener is anything a cell notifies after its value changes: a user
//! callback, a sink binding, or a dependent selector. Every registration gets
//! a [`SubscriberId`]; dependent selectors reuse their own id so a selector
//! is subscribed to a given cell at most once.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tracing::warn;

use super::selector::Selector;
use super::sink::SinkBinding;
use crate::value::Value;

/// Unique identifier for a listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// A user callback invoked with the new value of a cell.
///
/// Identity is the `Arc` allocation: registering a clone of the same `Arc`
/// twice is a no-op, registering two separately allocated closures is not.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Wrap a closure as a [`Callback`].
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    Arc::new(f)
}

pub(crate) fn same_callback(a: &Callback, b: &Callback) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[derive(Clone)]
pub(crate) enum Listener {
    Callback(Callback),
    Sink(SinkBinding),
    Dependent(Weak<Selector>),
}

#[derive(Clone)]
pub(crate) struct ListenerEntry {
    pub(crate) id: SubscriberId,
    pub(crate) listener: Listener,
}

impl ListenerEntry {
    /// Whether registering `other` would duplicate this entry.
    pub(crate) fn duplicates(&self, other: &ListenerEntry) -> bool {
        match (&self.listener, &other.listener) {
            (Listener::Callback(a), Listener::Callback(b)) => same_callback(a, b),
            (Listener::Sink(a), Listener::Sink(b)) => a.same_target(b),
            (Listener::Dependent(_), Listener::Dependent(_)) => self.id == other.id,
            _ => false,
        }
    }
}

/// Run one listener, containing any panic it raises.
///
/// A failing listener is reported and otherwise ignored so the rest of the
/// notification loop still runs.
pub(crate) fn isolate<F: FnOnce()>(key: &str, id: SubscriberId, f: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            warn!(
                target: "quark::listener",
                key,
                subscriber = id.raw(),
                panic = %panic_message(payload.as_ref()),
                "listener failed during notification"
            );
            false
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
