//! Actions.
//!
//! An action is a named piece of business logic that reads and writes a
//! registry through its public operations only. Keeping it as a value lets UI
//! code hand the same handler to several triggers.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};

use super::Registry;

/// A synchronous handler over a registry.
///
/// ```rust,ignore
/// let increment = Action::new(|registry: &Registry, by: i64| {
///     let count = registry.get("count")?.as_i64().unwrap_or(0);
///     registry.set("count", count + by)
/// });
/// increment.run(&registry, 2)?;
/// ```
pub struct Action<A, R = ()> {
    handler: Arc<dyn Fn(&Registry, A) -> R + Send + Sync>,
}

impl<A, R> Action<A, R> {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Registry, A) -> R + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
        }
    }

    pub fn run(&self, registry: &Registry, args: A) -> R {
        (self.handler)(registry, args)
    }
}

impl<A, R> Clone for Action<A, R> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

impl<A, R> fmt::Debug for Action<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action").finish_non_exhaustive()
    }
}

/// An asynchronous handler over a registry.
///
/// The handler receives its own registry handle so the returned future can
/// outlive the caller's borrow.
pub struct AsyncAction<A, R = ()> {
    handler: Arc<dyn Fn(Registry, A) -> BoxFuture<'static, R> + Send + Sync>,
}

impl<A, R> AsyncAction<A, R> {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Registry, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |registry, args| handler(registry, args).boxed()),
        }
    }

    pub async fn run(&self, registry: &Registry, args: A) -> R {
        (self.handler)(registry.clone(), args).await
    }
}

impl<A, R> Clone for AsyncAction<A, R> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

impl<A, R> fmt::Debug for AsyncAction<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncAction").finish_non_exhaustive()
    }
}
