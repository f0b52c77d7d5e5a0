//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::collections::BTreeMap;

/// A (Key, Value) cache that keeps the largest keys (by Ord trait) up to the size limit specified,
/// dropping the smallest key on insert if full.
#[derive(Debug, Clone)]
pub struct KeySortedCache<K, V> {
    limit: usize,
    value_by_key: BTreeMap<K, V>,
}

impl<K: Ord, V> KeySortedCache<K, V> {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            value_by_key: BTreeMap::new(),
        }
    }

    /// Inserts the value, returning the entry evicted to stay within the limit, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        self.value_by_key.insert(key, value);
        if self.value_by_key.len() > self.limit {
            self.value_by_key.pop_first()
        } else {
            None
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.value_by_key.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.value_by_key.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.value_by_key.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> + '_ {
        self.value_by_key.iter_mut()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.value_by_key.remove(key)
    }

    /// Drops every entry whose key is strictly less than `key`.
    pub fn remove_below(&mut self, key: K) {
        self.value_by_key = self.value_by_key.split_off(&key);
    }

    pub fn len(&self) -> usize {
        self.value_by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value_by_key.is_empty()
    }

    pub fn clear(&mut self) {
        self.value_by_key.clear()
    }

    pub fn retain(&mut self, f: impl FnMut(&K, &mut V) -> bool) {
        self.value_by_key.retain(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_buffer() {
        let mut buffer = KeySortedCache::new(2);
        assert!(buffer.is_empty());
        assert_eq!(None, buffer.insert(1, "A"));
        assert_eq!(None, buffer.insert(2, "B"));
        assert_eq!(2, buffer.len());

        assert_eq!(
            vec![(&1, &"A"), (&2, &"B")],
            buffer.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn overfill_evicts_smallest() {
        let mut buffer = KeySortedCache::new(2);
        buffer.insert(2, "B");
        buffer.insert(3, "C");
        assert_eq!(Some((1, "A")), buffer.insert(1, "A"));

        assert_eq!(
            vec![(&2, &"B"), (&3, &"C")],
            buffer.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn remove_below() {
        let mut buffer = KeySortedCache::new(10);
        for key in 1..=5 {
            buffer.insert(key, key * 10);
        }
        buffer.remove_below(3);
        assert_eq!(vec![3, 4, 5], buffer.iter().map(|(k, _)| *k).collect::<Vec<_>>());

        buffer.remove_below(100);
        assert!(buffer.is_empty());
    }

    #[test]
    fn remove_returns_value() {
        let mut buffer = KeySortedCache::new(10);
        buffer.insert(7u64, "seven");
        assert!(buffer.contains_key(&7));
        assert_eq!(Some("seven"), buffer.remove(&7));
        assert_eq!(None, buffer.remove(&7));
    }
}
