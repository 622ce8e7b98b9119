//! Bounded pool of reusable client handles.
//!
//! Used for RADIUS clients so each exchange does not allocate and configure
//! a fresh client. Handles are moved out on [`get`](ClientPool::get) and
//! moved back on [`put`](ClientPool::put), so a handle is never both pooled
//! and checked out. Returns beyond `max_size` are dropped.

use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
pub struct ClientPool<T> {
    clients: Mutex<Vec<T>>,
    max_size: usize,
}

impl<T> ClientPool<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            clients: Mutex::new(Vec::with_capacity(max_size)),
            max_size,
        }
    }

    /// Takes the most recently returned handle, or builds one with `create`.
    pub fn get_or_else<F: FnOnce() -> T>(&self, create: F) -> T {
        let pooled = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        pooled.unwrap_or_else(create)
    }

    /// Returns a handle. Silently dropped when the pool is full.
    pub fn put(&self, client: T) {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if clients.len() < self.max_size {
            clients.push(client);
        }
    }

    pub fn len(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl<T: Default> ClientPool<T> {
    /// Takes a pooled handle or creates a default one.
    pub fn get(&self) -> T {
        self.get_or_else(T::default)
    }
}
