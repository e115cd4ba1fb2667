//! Tracking getter.
//!
//! Selectors discover their dependencies by recording what their compute
//! function reads. Instead of a global "currently running computation" slot,
//! every evaluation gets its own [`Getter`] carrying its own read log, so
//! concurrent evaluations of different selectors (or overlapping async
//! evaluations of the same one) never see each other's reads.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use smallvec::SmallVec;

use super::cell::Cell;
use crate::error::{Result, StateError};
use crate::value::Value;

/// Looks up cells by key. Implemented by the registry.
pub trait Resolver: Send + Sync {
    fn resolve(&self, key: &str) -> Option<Cell>;
}

/// Keys read during one evaluation, in first-read order, with the value seen
/// on the latest read.
#[derive(Debug, Default, Clone)]
pub(crate) struct Reads {
    entries: SmallVec<[(String, Value); 4]>,
}

impl Reads {
    fn record(&mut self, key: &str, value: &Value) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, seen)) => *seen = value.clone(),
            None => self.entries.push((key.to_owned(), value.clone())),
        }
    }

    pub(crate) fn into_entries(self) -> impl Iterator<Item = (String, Value)> {
        self.entries.into_iter()
    }
}

/// Read access to a registry from inside a selector's compute function.
///
/// Cloning a getter shares its read log, so an async compute function can
/// move clones into spawned work and still have every read attributed to the
/// evaluation that created it.
#[derive(Clone)]
pub struct Getter {
    resolver: Weak<dyn Resolver>,
    reads: Option<Arc<Mutex<Reads>>>,
}

impl Getter {
    /// A getter that records every key it is asked for.
    pub(crate) fn tracking(resolver: Weak<dyn Resolver>) -> Self {
        Self {
            resolver,
            reads: Some(Arc::new(Mutex::new(Reads::default()))),
        }
    }

    /// A getter that reads without recording.
    pub fn untracked(resolver: Weak<dyn Resolver>) -> Self {
        Self {
            resolver,
            reads: None,
        }
    }

    /// Read the value stored under `key`, recording the dependency.
    pub fn get(&self, key: &str) -> Result<Value> {
        let value = self.lookup(key)?;
        if let Some(reads) = &self.reads {
            reads.lock().record(key, &value);
        }
        Ok(value)
    }

    /// Read without recording a dependency.
    pub fn get_untracked(&self, key: &str) -> Result<Value> {
        self.lookup(key)
    }

    /// Read and deserialize structured data.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.get(key)?.deserialize()
    }

    fn lookup(&self, key: &str) -> Result<Value> {
        self.resolver
            .upgrade()
            .and_then(|resolver| resolver.resolve(key))
            .map(|cell| cell.value())
            .ok_or_else(|| StateError::UnknownKey {
                key: key.to_owned(),
            })
    }

    /// Take the reads recorded so far, leaving the log empty.
    pub(crate) fn take_reads(&self) -> Reads {
        self.reads
            .as_ref()
            .map(|reads| std::mem::take(&mut *reads.lock()))
            .unwrap_or_default()
    }
}

impl fmt::Debug for Getter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Getter")
            .field("tracking", &self.reads.is_some())
            .field("live", &(self.resolver.strong_count() > 0))
            .finish()
    }
}
