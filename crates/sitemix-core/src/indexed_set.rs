// SPDX-License-Identifier: Apache-2.0
//! A set container with O(1) insertion, removal, and uniform random choice,
//! plus named secondary indices derived from keying functions.
//!
//! The positional trick: elements live in a dense vector paired with an
//! element→position map. Removal swap-pops the last element into the vacated
//! slot, so positions are not stable across modifications but every
//! operation stays O(1).
//!
//! Secondary indices bucket elements by the keys a [`Property`] produces.
//! Buckets are themselves `IndexedSet`s (without further indices), so
//! uniform random choice *within a bucket* is also O(1) — the mixture's
//! per-complex embedding selection depends on this.
//!
//! Integrity contract: elements must not be mutated in place in ways that
//! change their property keys while they are in the set. Where such a
//! mutation is unavoidable (an embedding migrating between complex buckets),
//! the element is removed, mutated, and re-added.

use std::fmt;
use std::hash::Hash;

use rand::Rng;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Errors from [`IndexedSet`] operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexedSetError {
    /// `add` was called with an element already present.
    #[error("element already present in indexed set")]
    Duplicate,
    /// `remove` was called with an element not present.
    #[error("element not present in indexed set")]
    Missing,
    /// `create_index` was called with a name already registered.
    #[error("index already registered: {0}")]
    DuplicateIndex(&'static str),
    /// A uniqueness-typed property produced a key whose bucket was occupied.
    #[error("uniqueness violated on index: {0}")]
    UniquenessViolation(&'static str),
}

type KeysFn<T, K> = Box<dyn Fn(&T, &mut Vec<K>)>;

/// A keying function for a secondary index: single-valued ([`Property::new`])
/// or set-valued ([`Property::set`]), optionally marked unique.
///
/// A unique property asserts that no two elements in the set ever share a
/// key; looking such a key up yields at most one element.
pub struct Property<T, K> {
    keys: KeysFn<T, K>,
    unique: bool,
}

impl<T, K> Property<T, K> {
    /// A single-valued property: each element contributes exactly one key.
    pub fn new(f: impl Fn(&T) -> K + 'static) -> Self {
        Self {
            keys: Box::new(move |item, out| out.push(f(item))),
            unique: false,
        }
    }

    /// A set-valued property: each element contributes zero or more keys.
    pub fn set(f: impl Fn(&T) -> Vec<K> + 'static) -> Self {
        Self {
            keys: Box::new(move |item, out| out.extend(f(item))),
            unique: false,
        }
    }

    /// Marks the property unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

struct PropertyIndex<T, K> {
    name: &'static str,
    property: Property<T, K>,
    buckets: FxHashMap<K, IndexedSet<T, K>>,
}

/// Set with O(1) add/remove/uniform-random-choice and named secondary
/// indices.
///
/// `T` is the element type; `K` is the key type shared by every index
/// registered on this set (use an enum when one set needs differently-typed
/// keys).
pub struct IndexedSet<T, K> {
    items: Vec<T>,
    positions: FxHashMap<T, usize>,
    indices: Vec<PropertyIndex<T, K>>,
    scratch: Vec<K>,
}

impl<T, K> Default for IndexedSet<T, K>
where
    T: Clone + Eq + Hash,
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, K> IndexedSet<T, K>
where
    T: Clone + Eq + Hash,
    K: Clone + Eq + Hash,
{
    /// Creates an empty set with no indices.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            positions: FxHashMap::default(),
            indices: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if the set holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, item: &T) -> bool {
        self.positions.contains_key(item)
    }

    /// Iterates the elements in internal (position) order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// The element at internal position `i`.
    ///
    /// Positions are not stable across `add`/`remove`.
    #[must_use]
    pub fn at(&self, i: usize) -> Option<&T> {
        self.items.get(i)
    }

    /// Uniformly random element, or `None` if the set is empty.
    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&T> {
        if self.items.is_empty() {
            None
        } else {
            self.items.get(rng.gen_range(0..self.items.len()))
        }
    }

    /// Inserts `item`.
    ///
    /// Fails if the element is already present or if a unique index already
    /// holds an element with one of its keys; on failure the set is
    /// unchanged.
    pub fn add(&mut self, item: T) -> Result<(), IndexedSetError> {
        if self.contains(&item) {
            return Err(IndexedSetError::Duplicate);
        }
        // Validate uniqueness constraints up front so failure cannot leave a
        // partially indexed element behind.
        for index in &self.indices {
            if !index.property.unique {
                continue;
            }
            let mut keys = Vec::new();
            (index.property.keys)(&item, &mut keys);
            for key in &keys {
                if index.buckets.get(key).is_some_and(|b| !b.is_empty()) {
                    return Err(IndexedSetError::UniquenessViolation(index.name));
                }
            }
        }
        for i in 0..self.indices.len() {
            let mut keys = std::mem::take(&mut self.scratch);
            keys.clear();
            (self.indices[i].property.keys)(&item, &mut keys);
            dedupe(&mut keys);
            for key in keys.drain(..) {
                self.indices[i]
                    .buckets
                    .entry(key)
                    .or_insert_with(IndexedSet::new)
                    .insert_raw(item.clone());
            }
            self.scratch = keys;
        }
        self.insert_raw(item);
        Ok(())
    }

    /// Removes `item`. Fails if it is not present.
    pub fn remove(&mut self, item: &T) -> Result<(), IndexedSetError> {
        if !self.contains(item) {
            return Err(IndexedSetError::Missing);
        }
        for i in 0..self.indices.len() {
            let mut keys = std::mem::take(&mut self.scratch);
            keys.clear();
            (self.indices[i].property.keys)(item, &mut keys);
            dedupe(&mut keys);
            for key in keys.drain(..) {
                let emptied = match self.indices[i].buckets.get_mut(&key) {
                    Some(bucket) => {
                        bucket.remove_raw(item);
                        bucket.is_empty()
                    }
                    None => {
                        debug_assert!(false, "indexed element missing from its bucket");
                        false
                    }
                };
                if emptied {
                    self.indices[i].buckets.remove(&key);
                }
            }
            self.scratch = keys;
        }
        self.remove_raw(item);
        Ok(())
    }

    /// Registers a named secondary index, keying every element already
    /// present.
    pub fn create_index(
        &mut self,
        name: &'static str,
        property: Property<T, K>,
    ) -> Result<(), IndexedSetError> {
        if self.indices.iter().any(|ix| ix.name == name) {
            return Err(IndexedSetError::DuplicateIndex(name));
        }
        let mut buckets: FxHashMap<K, IndexedSet<T, K>> = FxHashMap::default();
        let mut keys = Vec::new();
        for item in &self.items {
            keys.clear();
            (property.keys)(item, &mut keys);
            dedupe(&mut keys);
            for key in keys.drain(..) {
                let bucket = buckets.entry(key).or_insert_with(IndexedSet::new);
                if property.unique && !bucket.is_empty() {
                    return Err(IndexedSetError::UniquenessViolation(name));
                }
                bucket.insert_raw(item.clone());
            }
        }
        self.indices.push(PropertyIndex {
            name,
            property,
            buckets,
        });
        Ok(())
    }

    /// The bucket of elements keyed by `key` under the index `name`, or
    /// `None` if the bucket is empty.
    ///
    /// An unknown index name is a programming error; it trips a debug
    /// assertion and reads as an empty bucket in release.
    #[must_use]
    pub fn lookup(&self, name: &str, key: &K) -> Option<&IndexedSet<T, K>> {
        let Some(index) = self.indices.iter().find(|ix| ix.name == name) else {
            debug_assert!(false, "unknown index: {name}");
            return None;
        };
        index.buckets.get(key)
    }

    /// The single element keyed by `key` under the unique index `name`.
    #[must_use]
    pub fn lookup_unique(&self, name: &str, key: &K) -> Option<&T> {
        let bucket = self.lookup(name, key)?;
        debug_assert!(bucket.len() == 1, "unique index {name} holds {} elements", bucket.len());
        bucket.at(0)
    }

    fn insert_raw(&mut self, item: T) {
        self.positions.insert(item.clone(), self.items.len());
        self.items.push(item);
    }

    fn remove_raw(&mut self, item: &T) {
        let Some(pos) = self.positions.remove(item) else {
            debug_assert!(false, "remove_raw on absent element");
            return;
        };
        let last = self.items.len() - 1;
        self.items.swap(pos, last);
        self.items.pop();
        if pos != last {
            if let Some(moved) = self.items.get(pos) {
                self.positions.insert(moved.clone(), pos);
            }
        }
    }
}

impl<'a, T, K> IntoIterator for &'a IndexedSet<T, K>
where
    T: Clone + Eq + Hash,
    K: Clone + Eq + Hash,
{
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T, K> fmt::Debug for IndexedSet<T, K>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexedSet")
            .field("items", &self.items)
            .field("indices", &self.indices.len())
            .finish_non_exhaustive()
    }
}

fn dedupe<K: PartialEq>(keys: &mut Vec<K>) {
    let mut i = 0;
    while i < keys.len() {
        if keys[..i].contains(&keys[i]) {
            keys.swap_remove(i);
        } else {
            i += 1;
        }
    }
}
