//! Keyed state.
//!
//! [`Registry`] is the entry point most code uses: it creates atoms and
//! selectors under string keys and dispatches reads, writes, listeners and
//! bindings to them. [`Action`] and [`AsyncAction`] package business logic
//! that runs against a registry.

mod action;
mod registry;

pub use action::{Action, AsyncAction};
pub use registry::{Registry, SelectorBuilder};
