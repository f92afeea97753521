//! Immutable point-in-time copies handed to readers.
//!
//! A snapshot owns its data and exposes it read-only, so it can be moved
//! across threads or serialized across a process boundary without aliasing
//! the store's state.

use std::ops::Deref;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    value: Arc<T>,
    taken_at_ms: i64,
}

impl<T> Snapshot<T> {
    pub fn new(value: T, taken_at_ms: i64) -> Self {
        Self {
            value: Arc::new(value),
            taken_at_ms,
        }
    }

    /// Epoch milliseconds when the value was read from the store.
    pub fn taken_at_ms(&self) -> i64 {
        self.taken_at_ms
    }

    pub fn get(&self) -> &T {
        &self.value
    }
}

impl<T: Clone> Snapshot<T> {
    /// Returns an owned copy of the captured value.
    pub fn into_inner(self) -> T {
        Arc::try_unwrap(self.value).unwrap_or_else(|shared| (*shared).clone())
    }
}

impl<T> Deref for Snapshot<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}
