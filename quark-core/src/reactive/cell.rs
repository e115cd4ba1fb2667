//! Cell core shared by atoms and selectors.
//!
//! [`CellCore`] owns a value, the ordered listener list, and the equality
//! gate. Atoms write through it directly; selectors write through it after a
//! recomputation. Listener lists are copied out before notifying so no lock is
//! held while listener code runs, which lets listeners read or write any cell,
//! including the one notifying them.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{trace, warn};

use super::atom::Atom;
use super::selector::Selector;
use super::sink::{sink_addr, Sink, SinkBinding};
use super::subscriber::{isolate, same_callback, Callback, Listener, ListenerEntry, SubscriberId};
use crate::error::{CellKind, Result};
use crate::value::{deep_equal, Value};

/// Value, listeners and equality gate of a single cell.
pub struct CellCore {
    key: String,
    value: RwLock<Value>,
    listeners: Mutex<Vec<ListenerEntry>>,
    detached: AtomicBool,
}

impl CellCore {
    pub(crate) fn new(key: &str, value: Value) -> Self {
        Self {
            key: key.to_owned(),
            value: RwLock::new(value),
            listeners: Mutex::new(Vec::new()),
            detached: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self) -> Value {
        self.value.read().clone()
    }

    /// Equality-gated write.
    ///
    /// Returns `Ok(false)` for no-op writes and for detached cells. On change
    /// the listeners run inline, in registration order. Only a cycle reported
    /// by a dependent selector is returned as an error.
    pub(crate) fn set(&self, value: Value) -> Result<bool> {
        if !self.replace(value.clone()) {
            return Ok(false);
        }
        self.notify(&value)?;
        Ok(true)
    }

    /// The gate half of [`CellCore::set`]: store `value` if it differs from
    /// the current one, without notifying. Runs no user code, so callers may
    /// hold their own locks across it.
    pub(crate) fn replace(&self, value: Value) -> bool {
        if self.is_detached() {
            trace!(key = %self.key, "write to detached cell ignored");
            return false;
        }

        let mut current = self.value.write();
        if deep_equal(&current, &value) {
            return false;
        }
        *current = value;
        true
    }

    /// Run every listener with `value`, in registration order.
    pub(crate) fn notify(&self, value: &Value) -> Result<()> {
        let listeners = self.listeners.lock().clone();
        trace!(key = %self.key, listeners = listeners.len(), "notifying");

        let mut dead = false;
        for entry in &listeners {
            match &entry.listener {
                Listener::Callback(callback) => {
                    isolate(&self.key, entry.id, || callback(value));
                }
                Listener::Sink(binding) => {
                    isolate(&self.key, entry.id, || binding.apply(value));
                }
                Listener::Dependent(selector) => {
                    let Some(selector) = selector.upgrade() else {
                        dead = true;
                        continue;
                    };
                    if let Err(err) = selector.on_dependency_changed() {
                        if err.is_cycle() {
                            return Err(err);
                        }
                        warn!(
                            key = %self.key,
                            dependent = selector.key(),
                            error = %err,
                            "dependent selector failed to update"
                        );
                    }
                }
            }
        }

        if dead {
            self.listeners.lock().retain(|entry| match &entry.listener {
                Listener::Dependent(selector) => selector.strong_count() > 0,
                _ => true,
            });
        }
        Ok(())
    }

    /// Append a listener unless an equivalent one is already registered.
    ///
    /// Returns the id of the registration that ends up in the list and whether
    /// it was newly added.
    fn insert(&self, entry: ListenerEntry) -> (SubscriberId, bool) {
        let mut listeners = self.listeners.lock();
        if let Some(existing) = listeners.iter().find(|e| e.duplicates(&entry)) {
            return (existing.id, false);
        }
        let id = entry.id;
        listeners.push(entry);
        (id, true)
    }

    pub(crate) fn listen(&self, callback: Callback, run_immediately: bool) -> SubscriberId {
        let entry = ListenerEntry {
            id: SubscriberId::new(),
            listener: Listener::Callback(callback.clone()),
        };
        let (id, added) = self.insert(entry);
        if added && run_immediately {
            let value = self.get();
            isolate(&self.key, id, || callback(&value));
        }
        id
    }

    pub(crate) fn bind(&self, binding: SinkBinding) -> SubscriberId {
        let entry = ListenerEntry {
            id: SubscriberId::new(),
            listener: Listener::Sink(binding.clone()),
        };
        let (id, added) = self.insert(entry);
        if added {
            let value = self.get();
            isolate(&self.key, id, || binding.apply(&value));
        }
        id
    }

    pub(crate) fn add_dependent(&self, id: SubscriberId, selector: Weak<Selector>) -> bool {
        self.insert(ListenerEntry {
            id,
            listener: Listener::Dependent(selector),
        })
        .1
    }

    pub(crate) fn unlisten(&self, callback: &Callback) -> bool {
        self.remove_where(|listener| match listener {
            Listener::Callback(existing) => same_callback(existing, callback),
            _ => false,
        }) > 0
    }

    pub(crate) fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    pub(crate) fn unbind(&self, sink: *const ()) -> usize {
        self.remove_where(|listener| match listener {
            Listener::Sink(binding) => binding.targets(sink),
            _ => false,
        })
    }

    fn remove_where<F: Fn(&Listener) -> bool>(&self, matches: F) -> usize {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|entry| !matches(&entry.listener));
        before - listeners.len()
    }

    pub(crate) fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }

    /// Cut the cell loose from its registry. Later writes are ignored.
    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.clear_listeners();
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl fmt::Debug for CellCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellCore")
            .field("key", &self.key)
            .field("value", &*self.value.read())
            .field("listener_count", &self.listener_count())
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// Operations shared by atoms and selectors.
pub trait Observable {
    #[doc(hidden)]
    fn core(&self) -> &CellCore;

    fn key(&self) -> &str {
        self.core().key()
    }

    /// Current value. Never triggers a computation.
    fn get(&self) -> Value {
        self.core().get()
    }

    /// Register `callback`, optionally invoking it right away with the
    /// current value. Registering the same callback twice is a no-op that
    /// returns the existing id.
    fn listen(&self, callback: Callback, run_immediately: bool) -> SubscriberId {
        self.core().listen(callback, run_immediately)
    }

    fn unlisten(&self, callback: &Callback) -> bool {
        self.core().unlisten(callback)
    }

    fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.core().unsubscribe(id)
    }

    /// Mirror the value into `property` of `sink`, flushing after each write
    /// when `auto_flush` is set. The sink is updated immediately. Binding the
    /// same sink and property again is a no-op.
    fn bind(&self, sink: Arc<dyn Sink>, property: &str, auto_flush: bool) -> SubscriberId {
        self.core()
            .bind(SinkBinding::new(sink, property, auto_flush))
    }

    /// Remove every binding to `sink`, whatever the property.
    fn unbind<S: ?Sized>(&self, sink: &Arc<S>) -> usize
    where
        Self: Sized,
    {
        self.core().unbind(sink_addr(sink))
    }

    fn clear_listeners(&self) {
        self.core().clear_listeners();
    }

    fn has_listeners(&self) -> bool {
        self.listener_count() > 0
    }

    fn listener_count(&self) -> usize {
        self.core().listener_count()
    }

    fn is_detached(&self) -> bool {
        self.core().is_detached()
    }
}

/// A registry entry: each key holds exactly one kind of cell.
#[derive(Clone, Debug)]
pub enum Cell {
    Atom(Arc<Atom>),
    Selector(Arc<Selector>),
}

impl Cell {
    pub fn kind(&self) -> CellKind {
        match self {
            Cell::Atom(_) => CellKind::Atom,
            Cell::Selector(_) => CellKind::Selector,
        }
    }

    pub fn core(&self) -> &CellCore {
        match self {
            Cell::Atom(atom) => atom.core(),
            Cell::Selector(selector) => selector.core(),
        }
    }

    pub fn value(&self) -> Value {
        self.core().get()
    }

    pub(crate) fn detach(&self) {
        match self {
            Cell::Atom(atom) => atom.core().detach(),
            Cell::Selector(selector) => selector.detach(),
        }
    }
}
