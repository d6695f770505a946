//! Nestable state transactions with a single flush.
//!
//! Shared mutable state (the installed-application registry, the build
//! queue bookkeeping) is wrapped in a `StateStore`. Readers and writers
//! take a transaction guard; guards nest, writes mark the store dirty,
//! and the flush callback runs exactly once — when the outermost guard
//! closes and something was written.

use std::sync::{Arc, Mutex};

use tracing::debug;

struct Inner<T> {
    data: T,
    depth: u32,
    dirty: bool,
}

type FlushFn<T> = dyn Fn(&T) + Send + Sync;

pub struct StateStore<T> {
    inner: Arc<Mutex<Inner<T>>>,
    flush: Arc<FlushFn<T>>,
}

impl<T> Clone for StateStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            flush: self.flush.clone(),
        }
    }
}

impl<T> StateStore<T> {
    pub fn new(data: T, flush: impl Fn(&T) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                data,
                depth: 0,
                dirty: false,
            })),
            flush: Arc::new(flush),
        }
    }

    /// Open a transaction scope. Scopes nest freely; only the outermost
    /// close may flush.
    pub fn begin(&self) -> StateTxn<'_, T> {
        self.inner.lock().unwrap().depth += 1;
        StateTxn { store: self }
    }
}

/// Transaction guard. Reads and writes go through this handle so the
/// pending-write accounting can't be bypassed.
pub struct StateTxn<'a, T> {
    store: &'a StateStore<T>,
}

impl<T> StateTxn<'_, T> {
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let inner = self.store.inner.lock().unwrap();
        f(&inner.data)
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut inner = self.store.inner.lock().unwrap();
        inner.dirty = true;
        f(&mut inner.data)
    }
}

impl<T> Drop for StateTxn<'_, T> {
    fn drop(&mut self) {
        let mut inner = self.store.inner.lock().unwrap();
        inner.depth -= 1;
        if inner.depth == 0 && inner.dirty {
            inner.dirty = false;
            debug!("flushing state on outermost transaction close");
            (self.store.flush)(&inner.data);
        }
    }
}
