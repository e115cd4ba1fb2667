//! Reactive Primitives
//!
//! This module implements the cells a registry is made of: atoms, selectors,
//! and the listener machinery that connects them.
//!
//! # Concepts
//!
//! ## Atoms
//!
//! An Atom is a container for independently settable state. Writing an equal
//! value does nothing; writing a different one notifies every listener in
//! registration order.
//!
//! ## Selectors
//!
//! A Selector is a derived value. Its compute function reads other cells
//! through a [`Getter`], which records each key it is asked for. Those keys
//! become the selector's dependencies, and the selector recomputes only when
//! one of their values actually moved. Compute functions may also be async.
//!
//! ## Listeners and Sinks
//!
//! Listeners are user callbacks, sink bindings, or dependent selectors. A
//! [`Sink`] is an external target such as a widget: binding projects a cell's
//! value onto one of its properties, and a two-way binding also hands back a
//! [`WriteBack`] for edits made in the sink.
//!
//! # Implementation Notes
//!
//! Dependency tracking is explicit. There is no global "currently running
//! computation" slot; every evaluation owns its getter and its read log, so
//! evaluations on different threads never see each other's reads. The
//! thread-local [`UpdateContext`] only records the chain of selectors being
//! updated, for diagnostics.

mod atom;
mod cell;
mod context;
mod getter;
mod runtime;
mod selector;
mod sink;
mod subscriber;

pub use atom::Atom;
pub use cell::{Cell, CellCore, Observable};
pub use context::UpdateContext;
pub use getter::{Getter, Resolver};
pub use runtime::{spawn_evaluation, Placement};
pub use selector::{async_compute, sync_compute, ComputeFn, Computation, Selector};
pub use sink::{Sink, WriteBack};
pub use subscriber::{callback, Callback, SubscriberId};
