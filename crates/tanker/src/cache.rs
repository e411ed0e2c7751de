//! Foreign-key lookup cache.

use std::collections::HashMap;
use std::hash::Hash;

use crate::value::Value;

/// Upper bound of one cache generation.
pub const LRU_SIZE: usize = 10_000;

/// Rows fetched per batch while resolving foreign keys.
pub const LRU_PAGE_SIZE: usize = 100;

/// Two-generation approximation of a least-recently-used map.
///
/// Inserts go to `recent`; when `recent` outgrows the bound it becomes the
/// `least_recent` generation and a fresh map takes its place, evicting the
/// previous old generation wholesale. Hits in the old generation are copied
/// forward. Everything is O(1), no linked list.
#[derive(Debug)]
pub struct Lru<K, V> {
    size: usize,
    recent: HashMap<K, V>,
    least_recent: HashMap<K, V>,
}

impl<K: Eq + Hash + Clone, V: Clone> Lru<K, V> {
    pub fn new(init: HashMap<K, V>) -> Self {
        Self::with_size(init, LRU_SIZE)
    }

    pub fn with_size(init: HashMap<K, V>, size: usize) -> Self {
        Lru {
            size,
            recent: init,
            least_recent: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: K, value: V) {
        self.recent.insert(key, value);
        self.vacuum();
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        if let Some(v) = self.recent.get(key) {
            return Some(v.clone());
        }
        if let Some(v) = self.least_recent.get(key) {
            let v = v.clone();
            self.recent.insert(key.clone(), v.clone());
            return Some(v);
        }
        None
    }

    pub fn contains(&mut self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.recent.len() + self.least_recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn vacuum(&mut self) {
        if self.recent.len() > self.size {
            self.least_recent = std::mem::take(&mut self.recent);
        }
    }
}

/// Cache entries are scoped per (remote table, field signature).
pub(crate) type FkKey = (String, Vec<String>);

/// Key-tuple → id map for one foreign-key signature. Starts as a plain
/// map seeded from the newest rows; promoted to an [`Lru`] once the seed
/// page fills up.
#[derive(Debug)]
pub(crate) enum FkMap {
    Plain(HashMap<Vec<Value>, i64>),
    Lru(Lru<Vec<Value>, i64>),
}

impl FkMap {
    pub(crate) fn get(&mut self, key: &Vec<Value>) -> Option<i64> {
        match self {
            FkMap::Plain(map) => map.get(key).copied(),
            FkMap::Lru(lru) => lru.get(key),
        }
    }

    pub(crate) fn contains(&mut self, key: &Vec<Value>) -> bool {
        self.get(key).is_some()
    }

    pub(crate) fn set(&mut self, key: Vec<Value>, value: i64) {
        match self {
            FkMap::Plain(map) => {
                map.insert(key, value);
            }
            FkMap::Lru(lru) => lru.set(key, value),
        }
    }
}
