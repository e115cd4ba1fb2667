//! Selector Implementation
//!
//! A Selector is a derived cell. Its value is produced by a compute function
//! that reads other cells through a [`Getter`], and it is recomputed whenever
//! one of those cells changes.
//!
//! # How Selectors Work
//!
//! 1. On creation the compute function runs once with a tracking getter. The
//!    keys it reads become the selector's dependencies and the values it saw
//!    become the memoization snapshot. The selector then subscribes to every
//!    dependency.
//!
//! 2. When a dependency notifies, the selector compares every dependency's
//!    current value with the snapshot. If nothing moved, it stops there.
//!
//! 3. Otherwise it recomputes, again through a tracking getter, so keys read
//!    only on some branches are picked up the first time they are read.
//!
//! 4. The result goes through the same equality gate as an atom write, and a
//!    changed value notifies the selector's own listeners.
//!
//! Async compute functions return a future instead of a value. The future is
//! spawned (see [`runtime`](super::runtime)) and its result is applied when it
//! lands. Until the first one lands the value is [`Value::Unresolved`].
//!
//! # Re-entrancy and Cycles
//!
//! Every update takes the selector's private update lock without blocking.
//! The lock is re-entrant: a propagation that loops back into the same
//! selector on the same thread is let through and counted. Once the count
//! passes [`StateConfig::max_update_depth`] the propagation is aborted with
//! [`StateError::CycleDetected`]. Graphs whose loops converge stop on their own
//! at the equality gate; the bound only catches loops that never settle.
//!
//! A trigger arriving from another thread while the lock is held is coalesced
//! according to [`CoalescePolicy`].

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use futures_util::future::{BoxFuture, FutureExt};
use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

use super::cell::{CellCore, Observable};
use super::context::UpdateContext;
use super::getter::{Getter, Reads, Resolver};
use super::runtime;
use super::subscriber::{panic_message, SubscriberId};
use crate::config::{CoalescePolicy, StateConfig};
use crate::error::{Result, StateError};
use crate::value::{deep_equal, Value};

/// What a compute function produced.
pub enum Computation {
    /// A value available right away, or the reason there is none.
    Ready(anyhow::Result<Value>),
    /// A value that will be available once the future resolves.
    Pending(BoxFuture<'static, anyhow::Result<Value>>),
}

impl Computation {
    /// A result that is already available.
    pub fn ready(value: impl Into<Value>) -> Self {
        Computation::Ready(Ok(value.into()))
    }

    /// A result that resolves when `future` completes.
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Computation::Pending(future.boxed())
    }
}

impl fmt::Debug for Computation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Computation::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            Computation::Pending(_) => f.write_str("Pending"),
        }
    }
}

/// A selector's compute function in its erased form.
pub type ComputeFn = Arc<dyn Fn(Getter) -> Computation + Send + Sync>;

/// Erase a synchronous compute function.
pub fn sync_compute<F>(compute: F) -> ComputeFn
where
    F: Fn(&Getter) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Arc::new(move |getter: Getter| Computation::Ready(compute(&getter)))
}

/// Erase an asynchronous compute function.
pub fn async_compute<F, Fut>(compute: F) -> ComputeFn
where
    F: Fn(Getter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |getter: Getter| Computation::Pending(compute(getter).boxed()))
}

/// Dependency bookkeeping, guarded by one mutex that is never held while
/// user code runs.
#[derive(Default)]
struct Tracking {
    /// Keys read during the newest applied evaluation.
    dependencies: IndexSet<String>,
    /// Last-seen value of each dependency.
    cached_deps: IndexMap<String, Value>,
    /// Epoch of the newest evaluation whose result was applied.
    applied_epoch: u64,
    /// Set when the stored value changed and listeners have not seen it yet.
    unannounced: bool,
}

impl Tracking {
    fn record(&mut self, reads: Reads) {
        self.dependencies.clear();
        for (key, value) in reads.into_entries() {
            self.dependencies.insert(key.clone());
            self.cached_deps.insert(key, value);
        }
        let dependencies = &self.dependencies;
        self.cached_deps.retain(|key, _| dependencies.contains(key));
    }
}

struct DepthGuard<'a> {
    depth: &'a AtomicUsize,
    level: usize,
}

impl<'a> DepthGuard<'a> {
    fn enter(depth: &'a AtomicUsize) -> Self {
        let level = depth.fetch_add(1, Ordering::SeqCst) + 1;
        Self { depth, level }
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A derived, dependency-tracked cell.
pub struct Selector {
    id: SubscriberId,
    core: CellCore,
    compute: ComputeFn,
    resolver: Weak<dyn Resolver>,
    config: StateConfig,
    this: Weak<Selector>,
    tracking: Mutex<Tracking>,
    update_lock: ReentrantMutex<()>,
    update_depth: AtomicUsize,
    rerun_pending: AtomicBool,
    next_epoch: AtomicU64,
    evaluations: AtomicU64,
    in_flight: watch::Sender<usize>,
}

impl Selector {
    /// Create a selector and run its initial evaluation.
    ///
    /// A synchronous compute function that fails here fails the constructor.
    /// An asynchronous one is only scheduled; its failure is logged when it
    /// resolves.
    pub fn new(
        key: &str,
        compute: ComputeFn,
        resolver: Weak<dyn Resolver>,
        config: StateConfig,
    ) -> Result<Arc<Self>> {
        let (in_flight, _) = watch::channel(0);
        let selector = Arc::new_cyclic(|this| Self {
            id: SubscriberId::new(),
            core: CellCore::new(key, Value::Unresolved),
            compute,
            resolver,
            config,
            this: this.clone(),
            tracking: Mutex::new(Tracking::default()),
            update_lock: ReentrantMutex::new(()),
            update_depth: AtomicUsize::new(0),
            rerun_pending: AtomicBool::new(false),
            next_epoch: AtomicU64::new(1),
            evaluations: AtomicU64::new(0),
            in_flight,
        });

        debug!(key, "initial selector evaluation");
        selector.evaluate(true)?;
        Ok(selector)
    }

    /// Identity this selector uses when subscribing to its dependencies.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Keys read during the newest applied evaluation, in first-read order.
    pub fn dependencies(&self) -> Vec<String> {
        self.tracking.lock().dependencies.iter().cloned().collect()
    }

    /// Number of evaluations that produced a value, the initial one included.
    pub fn evaluation_count(&self) -> u64 {
        self.evaluations.load(Ordering::SeqCst)
    }

    /// False until the first evaluation of an async selector lands.
    pub fn is_resolved(&self) -> bool {
        !self.core.get().is_unresolved()
    }

    /// Wait until no async evaluation of this selector is in flight.
    pub async fn settle(&self) {
        let mut in_flight = self.in_flight.subscribe();
        // The sender lives in `self`, so this only errors if `self` is gone.
        let _ = in_flight.wait_for(|count| *count == 0).await;
    }

    /// React to a change in one of the dependencies.
    ///
    /// Returns an error only when the propagation is circular.
    pub fn on_dependency_changed(&self) -> Result<()> {
        self.update(false)
    }

    /// Recompute regardless of the memoization snapshot.
    ///
    /// Used when inputs changed through a channel the graph cannot observe.
    pub fn recompute(&self) -> Result<()> {
        self.tracking.lock().cached_deps.clear();
        self.update(true)
    }

    pub(crate) fn detach(&self) {
        self.core.detach();
    }

    fn update(&self, mut force: bool) -> Result<()> {
        if self.core.is_detached() {
            return Ok(());
        }
        loop {
            {
                let Some(_lock) = self.try_acquire() else {
                    return Ok(());
                };
                self.rerun_pending.store(false, Ordering::SeqCst);

                let depth = DepthGuard::enter(&self.update_depth);
                if depth.level > self.config.max_update_depth {
                    let dependencies = self.dependencies();
                    error!(
                        key = self.key(),
                        depth = depth.level,
                        path = ?UpdateContext::path(),
                        ?dependencies,
                        "circular dependency detected; aborting propagation"
                    );
                    return Err(StateError::CycleDetected {
                        key: self.key().to_owned(),
                        depth: depth.level,
                        dependencies,
                    });
                }

                let _ctx = UpdateContext::enter(self.id, self.key());
                self.refresh(force)?;
            }

            if self.config.coalesce != CoalescePolicy::Rerun
                || !self.rerun_pending.load(Ordering::SeqCst)
            {
                return Ok(());
            }
            trace!(key = self.key(), "running coalesced update");
            force = false;
        }
    }

    fn try_acquire(&self) -> Option<ReentrantMutexGuard<'_, ()>> {
        if let Some(guard) = self.update_lock.try_lock() {
            return Some(guard);
        }
        match self.config.coalesce {
            CoalescePolicy::Drop => {
                trace!(key = self.key(), "update in flight; trigger coalesced");
                None
            }
            CoalescePolicy::Rerun => {
                self.rerun_pending.store(true, Ordering::SeqCst);
                // The holder may have released the lock before seeing the flag.
                self.update_lock.try_lock()
            }
        }
    }

    /// Memoization check followed, if needed, by a recomputation.
    fn refresh(&self, force: bool) -> Result<()> {
        let (changed, snapshot) = self.dependency_snapshot();
        if !changed && !force {
            trace!(key = self.key(), "dependencies unchanged; skipping recomputation");
            return Ok(());
        }

        self.tracking.lock().cached_deps = snapshot;
        self.evaluate(false)
    }

    /// Current value of every dependency, and whether any differs from the
    /// snapshot. A dependency that no longer resolves counts as changed.
    fn dependency_snapshot(&self) -> (bool, IndexMap<String, Value>) {
        let dependencies = self.dependencies();
        let resolver = self.resolver.upgrade();

        let mut missing = false;
        let mut snapshot = IndexMap::with_capacity(dependencies.len());
        for key in dependencies {
            match resolver.as_ref().and_then(|resolver| resolver.resolve(&key)) {
                Some(cell) => {
                    snapshot.insert(key, cell.value());
                }
                None => missing = true,
            }
        }

        let tracking = self.tracking.lock();
        let changed = missing
            || snapshot.iter().any(|(key, value)| {
                tracking
                    .cached_deps
                    .get(key)
                    .map_or(true, |cached| !deep_equal(value, cached))
            });
        (changed, snapshot)
    }

    fn evaluate(&self, initial: bool) -> Result<()> {
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        let getter = Getter::tracking(self.resolver.clone());
        debug!(key = self.key(), epoch, "evaluating selector");

        let computation = panic::catch_unwind(AssertUnwindSafe(|| (self.compute)(getter.clone())))
            .unwrap_or_else(|payload| {
                Computation::Ready(Err(anyhow!(
                    "compute function panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });

        match computation {
            Computation::Ready(Ok(value)) => {
                self.evaluations.fetch_add(1, Ordering::SeqCst);
                self.apply(epoch, getter.take_reads(), value)
            }
            Computation::Ready(Err(source)) if initial => Err(StateError::Compute {
                key: self.key().to_owned(),
                source,
            }),
            Computation::Ready(Err(source)) => {
                let message = format!("{source:#}");
                error!(
                    key = self.key(),
                    error = %message,
                    "selector computation failed; keeping last value"
                );
                Ok(())
            }
            Computation::Pending(future) => {
                self.spawn(epoch, getter, future, initial);
                Ok(())
            }
        }
    }

    fn spawn(
        &self,
        epoch: u64,
        getter: Getter,
        future: BoxFuture<'static, anyhow::Result<Value>>,
        initial: bool,
    ) {
        let this = self.this.clone();
        self.in_flight.send_modify(|count| *count += 1);

        let task = async move {
            let result = AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(anyhow!(
                        "compute future panicked: {}",
                        panic_message(payload.as_ref())
                    ))
                });
            if let Some(selector) = this.upgrade() {
                selector.resolve(epoch, getter, result, initial);
            }
        };

        if let Err(err) = runtime::spawn_evaluation(task) {
            error!(key = self.key(), error = %err, "could not schedule async evaluation");
            self.in_flight.send_modify(|count| *count = count.saturating_sub(1));
        }
    }

    fn resolve(&self, epoch: u64, getter: Getter, result: anyhow::Result<Value>, initial: bool) {
        match result {
            Ok(value) => {
                self.evaluations.fetch_add(1, Ordering::SeqCst);
                if let Err(err) = self.apply(epoch, getter.take_reads(), value) {
                    error!(key = self.key(), error = %err, "propagating async result failed");
                }
                if initial {
                    self.catch_up();
                }
            }
            Err(source) => {
                let message = format!("{source:#}");
                error!(
                    key = self.key(),
                    epoch,
                    error = %message,
                    "async selector computation failed; keeping last value"
                );
            }
        }
        self.in_flight.send_modify(|count| *count = count.saturating_sub(1));
    }

    /// After the first async resolution, pick up writes that landed before
    /// the subscriptions existed.
    fn catch_up(&self) {
        if self.core.is_detached() {
            return;
        }
        let (changed, _) = self.dependency_snapshot();
        if changed {
            debug!(key = self.key(), "dependencies moved before first resolution");
            if let Err(err) = self.on_dependency_changed() {
                error!(key = self.key(), error = %err, "catch-up recomputation failed");
            }
        }
    }

    /// Record the evaluation's reads, subscribe to them, and publish the
    /// value. Results older than the newest applied one are dropped.
    ///
    /// The epoch check and the value swap happen under the tracking lock, so
    /// overlapping async resolutions can never leave an older result stored.
    /// Listeners run after the lock is released and always see the newest
    /// stored value; a change is announced once, by whichever resolution gets
    /// there first.
    fn apply(&self, epoch: u64, reads: Reads, value: Value) -> Result<()> {
        if self.core.is_detached() {
            trace!(key = self.key(), epoch, "selector detached; dropping result");
            return Ok(());
        }

        {
            let mut tracking = self.tracking.lock();
            if epoch < tracking.applied_epoch {
                debug!(
                    key = self.key(),
                    epoch,
                    newest = tracking.applied_epoch,
                    "discarding stale evaluation"
                );
                return Ok(());
            }
            tracking.applied_epoch = epoch;
            tracking.record(reads);
            if self.core.replace(value) {
                tracking.unannounced = true;
            }
        }

        self.subscribe();

        let pending = {
            let mut tracking = self.tracking.lock();
            std::mem::take(&mut tracking.unannounced).then(|| self.core.get())
        };
        match pending {
            Some(value) => self.core.notify(&value),
            None => Ok(()),
        }
    }

    /// Install this selector on every dependency. Listener lists deduplicate
    /// by selector id, so repeating this after each evaluation only adds the
    /// newly discovered keys.
    fn subscribe(&self) {
        let Some(resolver) = self.resolver.upgrade() else {
            return;
        };
        for key in self.dependencies() {
            match resolver.resolve(&key) {
                Some(cell) => {
                    if cell.core().add_dependent(self.id, self.this.clone()) {
                        trace!(key = self.key(), dependency = %key, "subscribed");
                    }
                }
                None => warn!(
                    key = self.key(),
                    dependency = %key,
                    "dependency vanished before it could be subscribed"
                ),
            }
        }
    }
}

impl Observable for Selector {
    fn core(&self) -> &CellCore {
        &self.core
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("key", &self.core.key())
            .field("value", &self.core.get())
            .field("dependencies", &self.dependencies())
            .field("evaluations", &self.evaluation_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
