//! Map with registered reverse indexes
//!
//! Reverse indexes are recomputed for an entry under the same write lock that
//! updates the entry, so a lookup never sees a key the forward map lost.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

type IndexFn<V> = Box<dyn Fn(&V) -> Vec<String> + Send + Sync>;

/// Reverse index from derived values to map keys
pub struct ReverseMapIndex<K, V> {
    extract: IndexFn<V>,
    entries: BTreeMap<String, BTreeSet<K>>,
}

impl<K, V> Debug for ReverseMapIndex<K, V>
where
    K: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseMapIndex")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl<K: Ord + Clone, V> ReverseMapIndex<K, V> {
    /// Index keyed by the values `extract` derives from each entry
    pub fn new(extract: impl Fn(&V) -> Vec<String> + Send + Sync + 'static) -> Self {
        Self {
            extract: Box::new(extract),
            entries: BTreeMap::new(),
        }
    }

    fn add(&mut self, key: &K, value: &V) {
        for indexed in (self.extract)(value) {
            self.entries.entry(indexed).or_default().insert(key.clone());
        }
    }

    fn remove(&mut self, key: &K, value: &V) {
        for indexed in (self.extract)(value) {
            if let Some(keys) = self.entries.get_mut(&indexed) {
                keys.remove(key);
                if keys.is_empty() {
                    self.entries.remove(&indexed);
                }
            }
        }
    }
}

#[derive(Debug)]
struct State<K, V> {
    entries: BTreeMap<K, V>,
    indexes: BTreeMap<String, ReverseMapIndex<K, V>>,
}

/// Thread-safe map with named reverse indexes
#[derive(Debug)]
pub struct IndexingMap<K, V> {
    state: RwLock<State<K, V>>,
}

impl<K: Ord + Clone + Debug, V: Debug> Default for IndexingMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone + Debug, V: Debug> IndexingMap<K, V> {
    /// Empty map without indexes
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                entries: BTreeMap::new(),
                indexes: BTreeMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State<K, V>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State<K, V>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `index` under `name`, indexing the existing entries.
    pub fn register_index(&self, name: &str, mut index: ReverseMapIndex<K, V>) {
        let mut state = self.write();
        for (key, value) in &state.entries {
            index.add(key, value);
        }
        state.indexes.insert(name.to_string(), index);
    }

    /// Insert or replace the entry of `key`, returning the previous value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let mut state = self.write();
        let State { entries, indexes } = &mut *state;
        let previous = entries.remove(&key);
        for index in indexes.values_mut() {
            if let Some(previous) = &previous {
                index.remove(&key, previous);
            }
            index.add(&key, &value);
        }
        entries.insert(key, value);
        previous
    }

    /// Remove the entry of `key`
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut state = self.write();
        let State { entries, indexes } = &mut *state;
        let previous = entries.remove(key)?;
        for index in indexes.values_mut() {
            index.remove(key, &previous);
        }
        Some(previous)
    }

    /// Whether `key` is present
    pub fn contains_key(&self, key: &K) -> bool {
        self.read().entries.contains_key(key)
    }

    /// Keys whose entries derive `value` in the index `name`
    pub fn lookup(&self, name: &str, value: &str) -> Vec<K> {
        self.read()
            .indexes
            .get(name)
            .and_then(|index| index.entries.get(value))
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Ord + Clone + Debug, V: Clone + Debug> IndexingMap<K, V> {
    /// Copy of the entry of `key`
    pub fn get(&self, key: &K) -> Option<V> {
        self.read().entries.get(key).cloned()
    }
}
