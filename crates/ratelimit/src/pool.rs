//! Bounded free-list of reusable heap objects.
//!
//! Objects are zeroed through [`Recycle`] before they go back on the list so
//! nothing from a previous use leaks into the next one. The pool is owned by
//! whoever constructs it; there is no process-wide instance.

use std::sync::Mutex;

use tracing::trace;

/// Objects that can be cleared for reuse.
pub trait Recycle {
    /// Reset every field to its zero value.
    fn recycle(&mut self);
}

/// A bounded pool of boxed `T`.
pub struct Pool<T> {
    free: Mutex<Vec<Box<T>>>,
    capacity: usize,
}

impl<T: Default + Recycle> Pool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Take an idle object, or allocate a fresh one when the pool is empty.
    pub fn get(&self) -> Box<T> {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.pop().unwrap_or_default()
    }

    /// Zero `item` and keep it for later; dropped when the pool is full.
    pub fn put(&self, mut item: Box<T>) {
        item.recycle();
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.capacity {
            free.push(item);
        } else {
            trace!("pool: at capacity, dropping recycled object");
        }
    }

    /// Number of idle objects waiting for reuse.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl<T: Default + Recycle> Default for Pool<T> {
    fn default() -> Self {
        Self::new(64)
    }
}
