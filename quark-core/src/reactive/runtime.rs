//! Async Evaluation Runtime
//!
//! Async selectors hand their pending computation to this module. It does not
//! own an executor; it borrows whatever the host provides.
//!
//! # How It Works
//!
//! 1. If the calling thread is inside a tokio runtime, the task is spawned on
//!    that runtime.
//!
//! 2. Otherwise a current-thread runtime is built and driven to completion on
//!    a dedicated background thread, so plain synchronous hosts can still use
//!    async selectors.
//!
//! Completion re-enters the selector's equality-gated write on whichever
//! thread ran the task.

use std::future::Future;
use std::io;
use std::thread;

use tokio::runtime::{Builder, Handle};
use tracing::trace;

/// Where an async evaluation ended up running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Spawned on the ambient tokio runtime.
    Ambient,
    /// Running on a dedicated thread with its own runtime.
    Background,
}

/// Run `task` to completion on the ambient runtime or a background thread.
///
/// Fails only when no ambient runtime exists and neither a runtime nor a
/// thread could be created; `task` is dropped unpolled in that case.
pub fn spawn_evaluation<F>(task: F) -> io::Result<Placement>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        trace!("spawning evaluation on ambient runtime");
        handle.spawn(task);
        return Ok(Placement::Ambient);
    }

    let runtime = Builder::new_current_thread().enable_all().build()?;
    thread::Builder::new()
        .name("quark-evaluation".to_owned())
        .spawn(move || runtime.block_on(task))?;
    trace!("spawned evaluation on background thread");
    Ok(Placement::Background)
}
