//! Lock-scoped collections and the manager's operation lock.
//!
//! Every access to a [`ReadWriteList`] or [`ReadWriteMap`] happens inside a
//! closure, so a guard can never be held across a call into plugin code.
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// An ordered list behind a read/write lock.
pub struct ReadWriteList<T> {
    inner: RwLock<Vec<T>>,
}

impl<T> ReadWriteList<T> {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Vec::new()) }
    }

    pub fn from_vec(items: Vec<T>) -> Self {
        Self { inner: RwLock::new(items) }
    }

    /// Run `f` with shared access to the elements.
    pub fn read_operation<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        let guard = self.inner.read();
        f(&guard)
    }

    /// Run `f` with exclusive access to the underlying vector.
    pub fn write_operation<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
        let mut guard = self.inner.write();
        f(&mut guard)
    }

    pub fn push(&self, item: T) {
        self.inner.write().push(item);
    }

    pub fn extend(&self, items: impl IntoIterator<Item = T>) {
        self.inner.write().extend(items);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    /// Visit every element in order under a single read scope.
    pub fn iterate(&self, mut f: impl FnMut(&T)) {
        let guard = self.inner.read();
        for item in guard.iter() {
            f(item);
        }
    }

    pub fn any(&self, mut predicate: impl FnMut(&T) -> bool) -> bool {
        self.inner.read().iter().any(|item| predicate(item))
    }

    pub fn position(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<usize> {
        self.inner.read().iter().position(|item| predicate(item))
    }

    /// Keep only the elements matching `predicate`, returning how many were removed.
    pub fn retain(&self, predicate: impl FnMut(&T) -> bool) -> usize {
        let mut guard = self.inner.write();
        let before = guard.len();
        guard.retain(predicate);
        before - guard.len()
    }
}

impl<T: Clone> ReadWriteList<T> {
    /// First element matching `predicate`, cloned out of the lock.
    pub fn filter_first(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        self.inner.read().iter().find(|item| predicate(item)).cloned()
    }

    pub fn filter(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        self.inner
            .read()
            .iter()
            .filter(|item| predicate(item))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.inner.read().clone()
    }
}

impl<T> Default for ReadWriteList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for ReadWriteList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.inner.read().iter()).finish()
    }
}

/// A hash map behind a read/write lock.
pub struct ReadWriteMap<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K: Eq + Hash, V> ReadWriteMap<K, V> {
    pub fn new() -> Self {
        Self { inner: RwLock::new(HashMap::new()) }
    }

    pub fn read_operation<R>(&self, f: impl FnOnce(&HashMap<K, V>) -> R) -> R {
        let guard = self.inner.read();
        f(&guard)
    }

    pub fn write_operation<R>(&self, f: impl FnOnce(&mut HashMap<K, V>) -> R) -> R {
        let mut guard = self.inner.write();
        f(&mut guard)
    }

    /// Insert `value`, returning the value previously stored under `key`.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner.write().insert(key, value)
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.write().remove(key)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

impl<K: Eq + Hash + Clone, V: Clone> ReadWriteMap<K, V> {
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.read().keys().cloned().collect()
    }

    /// Return the value under `key`, computing and storing it when absent.
    ///
    /// `compute` runs without any lock held, so it may call back into code
    /// that reads this map. If another value was stored while `compute` ran,
    /// the stored value wins and the computed one is dropped.
    pub fn compute_if_absent<E>(
        &self,
        key: K,
        compute: impl FnOnce(&K) -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(existing) = self.inner.read().get(&key) {
            return Ok(existing.clone());
        }
        let value = compute(&key)?;
        let mut guard = self.inner.write();
        Ok(guard.entry(key).or_insert(value).clone())
    }
}

impl<K: Eq + Hash, V> Default for ReadWriteMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for ReadWriteMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.inner.read().iter()).finish()
    }
}

/// Coarse lock serializing mutating operations.
///
/// The exclusive side is re-entrant for the thread that holds it. Shared
/// holders from other threads wait for the exclusive holder to finish; the
/// owning thread passes straight through, so plugin callbacks can query the
/// manager while a load or unload is in progress.
#[derive(Default)]
pub struct OperationLock {
    gate: RwLock<()>,
    owner: Mutex<Option<(ThreadId, usize)>>,
}

/// Guard for an exclusive hold of an [`OperationLock`].
#[must_use = "the lock is released when the guard is dropped"]
pub struct OperationGuard<'a> {
    lock: &'a OperationLock,
    _gate: Option<RwLockWriteGuard<'a, ()>>,
}

/// Guard for a shared hold of an [`OperationLock`].
#[must_use = "the lock is released when the guard is dropped"]
pub struct SharedGuard<'a> {
    _gate: Option<RwLockReadGuard<'a, ()>>,
}

impl OperationLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclusive(&self) -> OperationGuard<'_> {
        let me = thread::current().id();
        {
            let mut owner = self.owner.lock();
            if let Some((id, depth)) = owner.as_mut() {
                if *id == me {
                    *depth += 1;
                    return OperationGuard { lock: self, _gate: None };
                }
            }
        }
        let gate = self.gate.write();
        *self.owner.lock() = Some((me, 1));
        OperationGuard { lock: self, _gate: Some(gate) }
    }

    pub fn shared(&self) -> SharedGuard<'_> {
        if self.is_held_by_current_thread() {
            return SharedGuard { _gate: None };
        }
        SharedGuard { _gate: Some(self.gate.read_recursive()) }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        let me = thread::current().id();
        matches!(*self.owner.lock(), Some((id, _)) if id == me)
    }

    /// Nesting depth of the exclusive hold on the current thread (0 when not held).
    pub fn depth(&self) -> usize {
        let me = thread::current().id();
        match *self.owner.lock() {
            Some((id, depth)) if id == me => depth,
            _ => 0,
        }
    }
}

impl fmt::Debug for OperationLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationLock")
            .field("owner", &*self.owner.lock())
            .finish()
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        let mut owner = self.lock.owner.lock();
        if let Some((_, depth)) = owner.as_mut() {
            *depth -= 1;
            if *depth == 0 {
                *owner = None;
            }
        }
        // The gate itself is released after this body, once ownership is cleared.
    }
}
