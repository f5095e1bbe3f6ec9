//! Fixed-capacity LRU cache backed by a slab of doubly linked nodes.
//!
//! The cache keeps the most-recently-used entry at the head of the list and
//! reuses the least-recently-used node in place when an insert displaces it.
//! Callers that need to clean up the entry about to be displaced can inspect
//! it beforehand with [`LruCache::will_be_kicked_out`].

use std::collections::HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Entry<K, V> {
    prev: usize,
    next: usize,
    data: Option<(K, V)>,
}

/// Bounded cache evicting the least-recently-used entry on overflow.
#[derive(Debug)]
pub struct LruCache<K, V> {
    entries: Vec<Entry<K, V>>,
    map: HashMap<K, usize>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    capacity: usize,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create a cache holding at most `capacity` entries (minimum one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Vec::new(),
            map: HashMap::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity,
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize { self.map.len() }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    /// Maximum number of entries.
    #[must_use]
    pub const fn capacity(&self) -> usize { self.capacity }

    /// Whether `key` is present, without promoting it.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool { self.map.contains_key(key) }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let entry = &self.entries[idx];
            (entry.prev, entry.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.entries[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.entries[next].prev = prev;
        }
        self.entries[idx].prev = NIL;
        self.entries[idx].next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        self.entries[idx].prev = NIL;
        self.entries[idx].next = self.head;
        if self.head != NIL {
            self.entries[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    /// Insert or update an entry, promoting it to most-recently-used.
    ///
    /// Returns the displaced entry when the cache was full and a new key was
    /// inserted; the freed node is reused in place.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&idx) = self.map.get(&key) {
            if let Some(data) = self.entries[idx].data.as_mut() {
                data.1 = value;
            }
            self.detach(idx);
            self.push_front(idx);
            return None;
        }

        if self.map.len() >= self.capacity {
            let idx = self.tail;
            self.detach(idx);
            let displaced = self.entries[idx].data.replace((key.clone(), value));
            if let Some((old_key, _)) = displaced.as_ref() {
                self.map.remove(old_key);
            }
            self.map.insert(key, idx);
            self.push_front(idx);
            return displaced;
        }

        let idx = if let Some(idx) = self.free.pop() {
            self.entries[idx].data = Some((key.clone(), value));
            idx
        } else {
            self.entries.push(Entry {
                prev: NIL,
                next: NIL,
                data: Some((key.clone(), value)),
            });
            self.entries.len() - 1
        };
        self.map.insert(key, idx);
        self.push_front(idx);
        None
    }

    /// Look up an entry, promoting it to most-recently-used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.detach(idx);
        self.push_front(idx);
        self.entries[idx].data.as_ref().map(|(_, v)| v)
    }

    /// Look up an entry without changing its position.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.entries[idx].data.as_ref().map(|(_, v)| v)
    }

    /// Remove an entry, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.map.remove(key)?;
        self.detach(idx);
        self.free.push(idx);
        self.entries[idx].data.take().map(|(_, v)| v)
    }

    /// Remove and return the least-recently-used entry.
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        if self.tail == NIL {
            return None;
        }
        let idx = self.tail;
        self.detach(idx);
        self.free.push(idx);
        let (key, value) = self.entries[idx].data.take()?;
        self.map.remove(&key);
        Some((key, value))
    }

    /// The entry the next insert of a fresh key would displace, if any.
    #[must_use]
    pub fn will_be_kicked_out(&self) -> Option<(&K, &V)> {
        if self.map.len() < self.capacity || self.tail == NIL {
            return None;
        }
        self.entries[self.tail].data.as_ref().map(|(k, v)| (k, v))
    }

    /// Iterate entries from least- to most-recently-used.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            cache: self,
            idx: self.tail,
        }
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.map.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }
}

/// Iterator over cache entries, least-recently-used first.
#[derive(Debug)]
pub struct Iter<'a, K, V> {
    cache: &'a LruCache<K, V>,
    idx: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.idx != NIL {
            let entry = &self.cache.entries[self.idx];
            self.idx = entry.prev;
            if let Some((k, v)) = entry.data.as_ref() {
                return Some((k, v));
            }
        }
        None
    }
}

impl<'a, K, V> IntoIterator for &'a LruCache<K, V>
where
    K: Hash + Eq + Clone,
{
    type IntoIter = Iter<'a, K, V>;
    type Item = (&'a K, &'a V);

    fn into_iter(self) -> Self::IntoIter { self.iter() }
}
