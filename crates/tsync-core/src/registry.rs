//! Concurrent versioned registry.
//!
//! A key → value map behind a read/write lock, with a version counter that
//! goes up by exactly one on every mutating call. Observers compare versions
//! to learn "did anything change since I last looked" without diffing.
//!
//! Used for the discovered-peers table and the connections table, both of
//! which are written by the engine's I/O tasks and read by callers.
//!
//! # Traversal
//!
//! Unsorted traversal ([`Registry::all`], [`Registry::keys`],
//! [`Registry::values`]) holds the read lock for the whole walk and releases
//! it as soon as the callback returns [`ControlFlow::Break`] or the map is
//! exhausted. Mutating the same registry from inside the callback deadlocks:
//! collect the keys first and mutate after the walk, e.g. with one
//! [`Registry::delete`] or [`Registry::multi_set`] call.
//!
//! Sorted traversal ([`Registry::keys_sorted`], [`Registry::all_sorted`],
//! [`Registry::natural_sort`]) copies the keys under a brief read lock, sorts
//! without it, then reads each value lazily. Keys deleted in between are
//! skipped; keys added after the copy are not seen. Mutating during a sorted
//! walk is allowed.

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::ops::ControlFlow;
use std::vec;

use parking_lot::RwLock;

struct Inner<K, V> {
    map: HashMap<K, V>,
    version: u64,
}

impl<K, V> Inner<K, V> {
    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

/// Thread-safe map with a monotonically increasing version.
pub struct Registry<K, V> {
    inner: RwLock<Inner<K, V>>,
}

impl<K, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner {
                map: HashMap::new(),
                version: 0,
            }),
        }
    }
}

impl<K, V> fmt::Debug for Registry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Registry")
            .field("len", &inner.map.len())
            .field("version", &inner.version)
            .finish()
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version. Equal across reads with no mutation in between.
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Insert or overwrite one entry. Returns the new version.
    pub fn set(&self, key: K, value: V) -> u64 {
        let mut inner = self.inner.write();
        inner.map.insert(key, value);
        inner.bump()
    }

    /// Insert or overwrite many entries under one write section and one bump.
    pub fn multi_set<I>(&self, entries: I) -> u64
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut inner = self.inner.write();
        inner.map.extend(entries);
        inner.bump()
    }

    /// Like `set`, but hands back the value it overwrote.
    pub fn replace(&self, key: K, value: V) -> (Option<V>, u64) {
        let mut inner = self.inner.write();
        let old = inner.map.insert(key, value);
        (old, inner.bump())
    }

    /// Replace the value for `key` with whatever `f` returns, atomically.
    ///
    /// `f` sees the current value; returning `None` leaves the entry (and the
    /// version) untouched. Returns the new version when a write happened.
    pub fn update<F>(&self, key: &K, f: F) -> Option<u64>
    where
        F: FnOnce(&V) -> Option<V>,
    {
        let mut inner = self.inner.write();
        let next = f(inner.map.get(key)?)?;
        inner.map.insert(key.clone(), next);
        Some(inner.bump())
    }

    /// Snapshot read of one value.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.inner.read().map.get(key).cloned()
    }

    /// Remove zero or more keys with a single version bump.
    /// Absent keys are ignored.
    pub fn delete<I>(&self, keys: I) -> u64
    where
        I: IntoIterator,
        I::Item: Borrow<K>,
    {
        let mut inner = self.inner.write();
        for key in keys {
            let key: &K = key.borrow();
            inner.map.remove(key);
        }
        inner.bump()
    }

    /// Remove one key and hand back its value, if it was present.
    /// Bumps the version either way, like [`Registry::delete`].
    pub fn remove(&self, key: &K) -> (Option<V>, u64) {
        let mut inner = self.inner.write();
        let value = inner.map.remove(key);
        (value, inner.bump())
    }

    pub fn has<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.inner.read().map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().map.is_empty()
    }

    /// Drop every entry. Returns the new version.
    pub fn clear(&self) -> u64 {
        let mut inner = self.inner.write();
        inner.map.clear();
        inner.bump()
    }

    /// Walk every entry under the read lock.
    ///
    /// Return `ControlFlow::Break(())` from `f` to stop early; the lock is
    /// released before this returns. Do not mutate this registry from `f`.
    pub fn all<F>(&self, mut f: F) -> ControlFlow<()>
    where
        F: FnMut(&K, &V) -> ControlFlow<()>,
    {
        let inner = self.inner.read();
        for (k, v) in inner.map.iter() {
            f(k, v)?;
        }
        ControlFlow::Continue(())
    }

    /// Walk every key under the read lock. Same rules as [`Registry::all`].
    pub fn keys<F>(&self, mut f: F) -> ControlFlow<()>
    where
        F: FnMut(&K) -> ControlFlow<()>,
    {
        self.all(|k, _| f(k))
    }

    /// Walk every value under the read lock. Same rules as [`Registry::all`].
    pub fn values<F>(&self, mut f: F) -> ControlFlow<()>
    where
        F: FnMut(&V) -> ControlFlow<()>,
    {
        self.all(|_, v| f(v))
    }

    /// Copy of every entry, taken under one read section.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        let inner = self.inner.read();
        inner
            .map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn key_snapshot(&self) -> Vec<K> {
        self.inner.read().map.keys().cloned().collect()
    }

    /// Keys as of now, sorted by `cmp` outside the lock.
    pub fn keys_sorted<F>(&self, mut cmp: F) -> vec::IntoIter<K>
    where
        F: FnMut(&K, &K) -> Ordering,
    {
        let mut keys = self.key_snapshot();
        keys.sort_by(|a, b| cmp(a, b));
        keys.into_iter()
    }

    /// Entries in `cmp` order. Values are read lazily as the iterator advances;
    /// entries deleted since the key snapshot are skipped.
    pub fn all_sorted<F>(&self, cmp: F) -> SortedIter<'_, K, V>
    where
        F: FnMut(&K, &K) -> Ordering,
    {
        SortedIter {
            registry: self,
            keys: self.keys_sorted(cmp),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone + Ord,
    V: Clone,
{
    /// Entries in the natural order of `K`. Same consistency as
    /// [`Registry::all_sorted`].
    pub fn natural_sort(&self) -> SortedIter<'_, K, V> {
        self.all_sorted(Ord::cmp)
    }
}

/// Iterator returned by the sorted traversals. Dropping it ends the walk.
pub struct SortedIter<'a, K, V> {
    registry: &'a Registry<K, V>,
    keys: vec::IntoIter<K>,
}

impl<K, V> Iterator for SortedIter<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        for key in self.keys.by_ref() {
            if let Some(value) = self.registry.get(&key) {
                return Some((key, value));
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.keys.len()))
    }
}
