//! Update Context
//!
//! The update context tracks which selectors are currently recomputing on
//! this thread, outermost first. It is pure bookkeeping: dependency discovery
//! goes through the explicit [`Getter`](super::Getter), and the cycle bound is
//! enforced per selector. The path is what gets logged when propagation turns
//! out to be circular, so the report shows how the write travelled.
//!
//! # Implementation
//!
//! A thread-local stack. Entering pushes the selector, dropping the guard pops
//! it, so the stack stays balanced even when a propagation aborts early with an
//! error.

use std::cell::RefCell;

use super::SubscriberId;

thread_local! {
    static UPDATE_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Clone)]
struct ContextEntry {
    subscriber_id: SubscriberId,
    key: String,
}

/// Guard that pops the context when dropped.
pub struct UpdateContext {
    subscriber_id: SubscriberId,
}

impl UpdateContext {
    /// Mark the selector identified by `subscriber_id` as updating on this
    /// thread until the returned guard is dropped.
    pub fn enter(subscriber_id: SubscriberId, key: &str) -> Self {
        UPDATE_STACK.with(|stack| {
            stack.borrow_mut().push(ContextEntry {
                subscriber_id,
                key: key.to_owned(),
            });
        });

        Self { subscriber_id }
    }

    /// Keys of the selectors currently updating, outermost first.
    pub fn path() -> Vec<String> {
        UPDATE_STACK.with(|stack| stack.borrow().iter().map(|entry| entry.key.clone()).collect())
    }
}

impl Drop for UpdateContext {
    fn drop(&mut self) {
        UPDATE_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            if let Some(entry) = popped {
                debug_assert_eq!(
                    entry.subscriber_id, self.subscriber_id,
                    "UpdateContext mismatch: expected {:?}, got {:?}",
                    self.subscriber_id, entry.subscriber_id
                );
            }
        });
    }
}
