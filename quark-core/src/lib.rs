//! Quark Core
//!
//! This crate provides a small reactive-state runtime. It implements:
//!
//! - Atoms: named, independently settable cells
//! - Selectors: named derived cells with automatic dependency discovery,
//!   memoized recomputation and optional async resolution
//! - A keyed registry that owns both and dispatches by key
//! - Listener and sink bindings, one-way and two-way
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `value`: the dynamic [`Value`] type and the [`deep_equal`] oracle that
//!   gates every write
//! - `reactive`: cells, listeners, dependency tracking and async evaluation
//! - `state`: the [`Registry`] and actions
//! - `config` / `error`: [`StateConfig`] and [`StateError`]
//!
//! The library logs through `tracing` and never installs a subscriber.
//!
//! # Example
//!
//! ```rust,ignore
//! use quark_core::{Registry, Value};
//! use quark_core::reactive::callback;
//!
//! let registry = Registry::new();
//! registry.atom("first", "John")?;
//! registry.atom("last", "Doe")?;
//!
//! registry.add_selector("full", |get| {
//!     Ok(format!("{} {}", get.get("first")?, get.get("last")?).into())
//! })?;
//!
//! registry.listen("full", callback(|v| println!("full = {v}")), false)?;
//!
//! // Recomputes "full" and prints "full = Jane Doe"
//! registry.set("first", "Jane")?;
//! ```

pub mod config;
pub mod error;
pub mod reactive;
pub mod state;
pub mod value;

pub use config::{CoalescePolicy, StateConfig};
pub use error::{CellKind, Result, StateError};
pub use state::{Action, AsyncAction, Registry};
pub use value::{deep_equal, SharedValue, Value};
