//! Registry
//!
//! The registry is the keyed namespace cells live in. It owns one map from
//! key to [`Cell`], so a key is either an atom or a selector, never both, and
//! every key-based operation dispatches through that map.
//!
//! A [`Registry`] is a cheap handle: clones share the same cells. Create one
//! per logical session and pass it to whatever needs it.
//!
//! # Locking
//!
//! The map sits behind a single `RwLock` that is only held for lookups and
//! insertions. Cell operations (writes, notifications, compute functions) run
//! after the lock has been released, so a compute function or listener can
//! freely call back into the registry.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::StateConfig;
use crate::error::{CellKind, Result, StateError};
use crate::reactive::{
    async_compute, sync_compute, Atom, Callback, Cell, ComputeFn, Getter, Observable, Resolver,
    Selector, Sink, SubscriberId, WriteBack,
};
use crate::value::Value;

struct RegistryInner {
    cells: RwLock<IndexMap<String, Cell>>,
    config: StateConfig,
}

impl Resolver for RegistryInner {
    fn resolve(&self, key: &str) -> Option<Cell> {
        self.cells.read().get(key).cloned()
    }
}

/// Keyed store of atoms and selectors.
///
/// # Example
///
/// ```rust,ignore
/// let registry = Registry::new();
/// registry.atom("first", "John")?;
/// registry.atom("last", "Doe")?;
///
/// registry.add_selector("full", |get| {
///     Ok(format!("{} {}", get.get("first")?, get.get("last")?).into())
/// })?;
///
/// registry.set("first", "Jane")?;
/// assert_eq!(registry.get("full")?, Value::from("Jane Doe"));
/// ```
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// An empty registry with the default configuration.
    pub fn new() -> Self {
        Self::with_config(StateConfig::default())
    }

    /// An empty registry whose selectors use `config`.
    pub fn with_config(config: StateConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                cells: RwLock::new(IndexMap::new()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &StateConfig {
        &self.inner.config
    }

    fn resolver(&self) -> Weak<dyn Resolver> {
        let resolver: Arc<dyn Resolver> = self.inner.clone();
        Arc::downgrade(&resolver)
    }

    /// A getter over this registry that records nothing.
    pub fn getter(&self) -> Getter {
        Getter::untracked(self.resolver())
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Get the atom under `key`, creating it with `default` if the key is
    /// free.
    pub fn atom(&self, key: &str, default: impl Into<Value>) -> Result<Arc<Atom>> {
        self.atom_entry(key, default.into()).map(|(atom, _)| atom)
    }

    /// Like [`Registry::atom`], also reporting whether the atom was created.
    fn atom_entry(&self, key: &str, default: Value) -> Result<(Arc<Atom>, bool)> {
        if let Some(cell) = self.cell(key) {
            return Self::expect_atom(key, cell).map(|atom| (atom, false));
        }

        let mut cells = self.inner.cells.write();
        if let Some(cell) = cells.get(key) {
            return Self::expect_atom(key, cell.clone()).map(|atom| (atom, false));
        }
        let atom = Atom::new(key, default);
        cells.insert(key.to_owned(), Cell::Atom(atom.clone()));
        debug!(key, "atom registered");
        Ok((atom, true))
    }

    fn expect_atom(key: &str, cell: Cell) -> Result<Arc<Atom>> {
        match cell {
            Cell::Atom(atom) => Ok(atom),
            Cell::Selector(_) => Err(StateError::KeyKindConflict {
                key: key.to_owned(),
                existing: CellKind::Selector,
            }),
        }
    }

    /// Register a synchronous selector, or return the one already under `key`.
    ///
    /// The compute function runs once right away. If that first run fails the
    /// selector is not registered and the error is returned.
    pub fn add_selector<F>(&self, key: &str, compute: F) -> Result<Arc<Selector>>
    where
        F: Fn(&Getter) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register_selector(key, sync_compute(compute))
    }

    /// Register an asynchronous selector, or return the one already under
    /// `key`. Its value is [`Value::Unresolved`] until the first evaluation
    /// lands.
    pub fn add_async_selector<F, Fut>(&self, key: &str, compute: F) -> Result<Arc<Selector>>
    where
        F: Fn(Getter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register_selector(key, async_compute(compute))
    }

    /// Start building a selector under `key`.
    pub fn selector<'a>(&'a self, key: &'a str) -> SelectorBuilder<'a> {
        SelectorBuilder { registry: self, key }
    }

    /// Register a selector from an already erased compute function.
    pub fn register_selector(&self, key: &str, compute: ComputeFn) -> Result<Arc<Selector>> {
        if let Some(cell) = self.cell(key) {
            return Self::expect_selector(key, cell);
        }

        // The initial evaluation reads the registry, so it runs unlocked.
        let selector = Selector::new(key, compute, self.resolver(), self.inner.config.clone())?;

        let mut cells = self.inner.cells.write();
        if let Some(cell) = cells.get(key) {
            debug!(key, "lost selector registration race");
            selector.detach();
            return Self::expect_selector(key, cell.clone());
        }
        cells.insert(key.to_owned(), Cell::Selector(selector.clone()));
        debug!(key, dependencies = ?selector.dependencies(), "selector registered");
        Ok(selector)
    }

    fn expect_selector(key: &str, cell: Cell) -> Result<Arc<Selector>> {
        match cell {
            Cell::Selector(selector) => Ok(selector),
            Cell::Atom(_) => Err(StateError::KeyKindConflict {
                key: key.to_owned(),
                existing: CellKind::Atom,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// The atom or selector registered under `key`.
    pub fn cell(&self, key: &str) -> Option<Cell> {
        self.inner.resolve(key)
    }

    fn require(&self, key: &str) -> Result<Cell> {
        self.cell(key).ok_or_else(|| StateError::UnknownKey {
            key: key.to_owned(),
        })
    }

    pub fn atom_handle(&self, key: &str) -> Option<Arc<Atom>> {
        match self.cell(key)? {
            Cell::Atom(atom) => Some(atom),
            Cell::Selector(_) => None,
        }
    }

    pub fn selector_handle(&self, key: &str) -> Option<Arc<Selector>> {
        match self.cell(key)? {
            Cell::Selector(selector) => Some(selector),
            Cell::Atom(_) => None,
        }
    }

    /// Whether any cell is registered under `key`.
    pub fn has(&self, key: &str) -> bool {
        self.inner.cells.read().contains_key(key)
    }

    /// Registered keys, in registration order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.cells.read().keys().cloned().collect()
    }

    /// Number of registered cells.
    pub fn len(&self) -> usize {
        self.inner.cells.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.cells.read().is_empty()
    }

    /// Keys a selector currently depends on. Atoms have none.
    pub fn dependencies(&self, key: &str) -> Result<Vec<String>> {
        match self.require(key)? {
            Cell::Atom(_) => Ok(Vec::new()),
            Cell::Selector(selector) => Ok(selector.dependencies()),
        }
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    /// Current value under `key`. Never creates a cell and never triggers a
    /// computation.
    pub fn get(&self, key: &str) -> Result<Value> {
        self.require(key).map(|cell| cell.value())
    }

    /// Read and deserialize structured data.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.get(key)?.deserialize()
    }

    /// Write an atom, creating it if `key` is free.
    ///
    /// Returns whether the stored value changed. Fails for selector keys and
    /// when propagation runs into a dependency cycle.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        match self.cell(key) {
            Some(Cell::Atom(atom)) => atom.set(value),
            Some(Cell::Selector(_)) => Err(StateError::SetOnDerived {
                key: key.to_owned(),
            }),
            None => {
                let (atom, created) = self.atom_entry(key, value.clone())?;
                if created {
                    Ok(true)
                } else {
                    atom.set(value)
                }
            }
        }
    }

    /// Write an existing atom.
    pub fn reset(&self, key: &str, value: impl Into<Value>) -> Result<bool> {
        match self.require(key)? {
            Cell::Atom(atom) => atom.set(value),
            Cell::Selector(_) => Err(StateError::ResetOnDerived {
                key: key.to_owned(),
            }),
        }
    }

    /// Force a selector to recompute. A no-op for atoms and unknown keys.
    pub fn invalidate(&self, key: &str) -> Result<()> {
        match self.cell(key) {
            Some(Cell::Selector(selector)) => selector.recompute(),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Call `callback` whenever the value under `key` changes.
    pub fn listen(&self, key: &str, callback: Callback, run_immediately: bool) -> Result<SubscriberId> {
        Ok(self.require(key)?.core().listen(callback, run_immediately))
    }

    /// Register several listeners at once. Stops at the first unknown key;
    /// the listeners registered before it stay registered.
    pub fn listen_multiple<'k, I>(&self, listeners: I) -> Result<Vec<SubscriberId>>
    where
        I: IntoIterator<Item = (&'k str, Callback)>,
    {
        listeners
            .into_iter()
            .map(|(key, callback)| self.listen(key, callback, false))
            .collect()
    }

    /// Remove `callback` from `key`. Returns false if it was not registered.
    pub fn unlisten(&self, key: &str, callback: &Callback) -> bool {
        self.cell(key)
            .map_or(false, |cell| cell.core().unlisten(callback))
    }

    pub fn unsubscribe(&self, key: &str, id: SubscriberId) -> bool {
        self.cell(key).map_or(false, |cell| cell.core().unsubscribe(id))
    }

    /// One-way binding of `key` to `property` of `sink`. The sink receives
    /// the current value immediately and every change after it.
    pub fn bind(
        &self,
        key: &str,
        sink: Arc<dyn Sink>,
        property: &str,
        auto_flush: bool,
    ) -> Result<SubscriberId> {
        let id = match self.require(key)? {
            Cell::Atom(atom) => atom.bind(sink, property, auto_flush),
            Cell::Selector(selector) => selector.bind(sink, property, auto_flush),
        };
        Ok(id)
    }

    /// Two-way binding of an atom to `property` of `sink`.
    pub fn bind_two_way(
        &self,
        key: &str,
        sink: Arc<dyn Sink>,
        property: &str,
        auto_flush: bool,
    ) -> Result<WriteBack> {
        match self.require(key)? {
            Cell::Atom(atom) => Ok(atom.bind_two_way(sink, property, auto_flush)),
            Cell::Selector(_) => Err(StateError::SetOnDerived {
                key: key.to_owned(),
            }),
        }
    }

    /// Remove every binding of `sink` from `key`.
    pub fn unbind<S: ?Sized>(&self, key: &str, sink: &Arc<S>) -> usize {
        match self.cell(key) {
            Some(Cell::Atom(atom)) => atom.unbind(sink),
            Some(Cell::Selector(selector)) => selector.unbind(sink),
            None => 0,
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Remove `key` without notifying anyone. The removed cell is detached:
    /// handles to it keep their last value but ignore writes and late async
    /// results.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.inner.cells.write().shift_remove(key);
        match removed {
            Some(cell) => {
                cell.detach();
                debug!(key, kind = %cell.kind(), "cell deleted");
                true
            }
            None => false,
        }
    }

    /// Drop every cell and every listener.
    pub fn clear(&self) {
        let cells = std::mem::take(&mut *self.inner.cells.write());
        for cell in cells.values() {
            cell.detach();
        }
        debug!(count = cells.len(), "registry cleared");
    }

    // ------------------------------------------------------------------
    // Async
    // ------------------------------------------------------------------

    /// Wait until the selector under `key` has no evaluation in flight.
    /// Returns immediately for atoms and unknown keys.
    pub async fn settle(&self, key: &str) {
        if let Some(selector) = self.selector_handle(key) {
            selector.settle().await;
        }
    }

    /// Wait until no selector in the registry has an evaluation in flight.
    pub async fn settle_all(&self) {
        let selectors: Vec<Arc<Selector>> = self
            .inner
            .cells
            .read()
            .values()
            .filter_map(|cell| match cell {
                Cell::Selector(selector) => Some(selector.clone()),
                Cell::Atom(_) => None,
            })
            .collect();
        for selector in selectors {
            selector.settle().await;
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("keys", &self.keys())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Builder returned by [`Registry::selector`].
pub struct SelectorBuilder<'a> {
    registry: &'a Registry,
    key: &'a str,
}

impl SelectorBuilder<'_> {
    pub fn compute<F>(self, compute: F) -> Result<Arc<Selector>>
    where
        F: Fn(&Getter) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.registry.add_selector(self.key, compute)
    }

    pub fn compute_async<F, Fut>(self, compute: F) -> Result<Arc<Selector>>
    where
        F: Fn(Getter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.registry.add_async_selector(self.key, compute)
    }
}
