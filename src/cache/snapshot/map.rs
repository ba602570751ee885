//! Persistent hash trie with structural sharing.
//!
//! Cloning a `PersistentMap` is O(1). Mutating a clone copies only the nodes
//! on the path from the root to the touched leaf (`Arc::make_mut`), so every
//! other subtree stays shared with the map it was cloned from. A write costs
//! O(log32 n) node copies regardless of how large the map is.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::cache::keys::hash_value;

const BITS: u32 = 5;
const FANOUT: usize = 1 << BITS;
const MASK: u64 = (FANOUT as u64) - 1;
const LEAF_CAPACITY: usize = 8;
// Deepest shift that still has hash bits left to branch on.
const MAX_SHIFT: u32 = 60;

#[derive(Clone)]
struct Entry<K, V> {
    hash: u64,
    key: K,
    value: V,
}

#[derive(Clone)]
enum Node<K, V> {
    Branch(Vec<Option<Arc<Node<K, V>>>>),
    Leaf(Vec<Entry<K, V>>),
}

fn index(hash: u64, shift: u32) -> usize {
    ((hash >> shift) & MASK) as usize
}

/// Immutable-by-clone hash map used for generation indexes.
pub struct PersistentMap<K, V> {
    root: Option<Arc<Node<K, V>>>,
    len: usize,
}

impl<K, V> Clone for PersistentMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            len: self.len,
        }
    }
}

impl<K, V> Default for PersistentMap<K, V> {
    fn default() -> Self {
        Self { root: None, len: 0 }
    }
}

impl<K, V> fmt::Debug for PersistentMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentMap")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl<K, V> PersistentMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let hash = hash_value(key);
        let mut node = self.root.as_deref()?;
        let mut shift = 0;
        loop {
            match node {
                Node::Branch(children) => {
                    node = children[index(hash, shift)].as_deref()?;
                    shift += BITS;
                }
                Node::Leaf(entries) => {
                    return entries
                        .iter()
                        .find(|e| e.hash == hash && e.key == *key)
                        .map(|e| &e.value);
                }
            }
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace a value, returning the previous one.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let entry = Entry {
            hash: hash_value(&key),
            key,
            value,
        };
        let previous = match self.root.as_mut() {
            None => {
                self.root = Some(Arc::new(Node::Leaf(vec![entry])));
                None
            }
            Some(root) => insert_into(root, entry, 0),
        };
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Remove a key, returning its value. Absent keys copy nothing.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        if !self.contains_key(key) {
            return None;
        }
        let hash = hash_value(key);
        let root = self.root.as_mut()?;
        let (removed, now_empty) = remove_from(root, hash, key, 0);
        if now_empty {
            self.root = None;
        }
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            stack: self.root.as_deref().into_iter().collect(),
            leaf: Default::default(),
        }
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, v)| v)
    }
}

impl<K, V> FromIterator<(K, V)> for PersistentMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

fn insert_into<K, V>(node: &mut Arc<Node<K, V>>, entry: Entry<K, V>, shift: u32) -> Option<V>
where
    K: Eq + Clone,
    V: Clone,
{
    let inner = Arc::make_mut(node);
    match inner {
        Node::Branch(children) => match &mut children[index(entry.hash, shift)] {
            Some(child) => insert_into(child, entry, shift + BITS),
            slot @ None => {
                *slot = Some(Arc::new(Node::Leaf(vec![entry])));
                None
            }
        },
        Node::Leaf(entries) => {
            if let Some(existing) = entries
                .iter_mut()
                .find(|e| e.hash == entry.hash && e.key == entry.key)
            {
                return Some(std::mem::replace(&mut existing.value, entry.value));
            }
            entries.push(entry);
            if entries.len() > LEAF_CAPACITY && shift <= MAX_SHIFT {
                let full = std::mem::take(entries);
                *inner = split(full, shift);
            }
            None
        }
    }
}

fn split<K, V>(entries: Vec<Entry<K, V>>, shift: u32) -> Node<K, V> {
    let mut buckets: Vec<Vec<Entry<K, V>>> = (0..FANOUT).map(|_| Vec::new()).collect();
    for entry in entries {
        buckets[index(entry.hash, shift)].push(entry);
    }
    let child_shift = shift + BITS;
    let children = buckets
        .into_iter()
        .map(|bucket| {
            if bucket.is_empty() {
                None
            } else if bucket.len() > LEAF_CAPACITY && child_shift <= MAX_SHIFT {
                Some(Arc::new(split(bucket, child_shift)))
            } else {
                Some(Arc::new(Node::Leaf(bucket)))
            }
        })
        .collect();
    Node::Branch(children)
}

/// Returns the removed value and whether `node` is now empty.
fn remove_from<K, V>(
    node: &mut Arc<Node<K, V>>,
    hash: u64,
    key: &K,
    shift: u32,
) -> (Option<V>, bool)
where
    K: Eq + Clone,
    V: Clone,
{
    match Arc::make_mut(node) {
        Node::Branch(children) => {
            let slot = &mut children[index(hash, shift)];
            let Some(child) = slot.as_mut() else {
                return (None, false);
            };
            let (removed, child_empty) = remove_from(child, hash, key, shift + BITS);
            if child_empty {
                *slot = None;
            }
            (removed, children.iter().all(Option::is_none))
        }
        Node::Leaf(entries) => {
            let removed = entries
                .iter()
                .position(|e| e.hash == hash && e.key == *key)
                .map(|pos| entries.swap_remove(pos).value);
            (removed, entries.is_empty())
        }
    }
}

/// Depth-first iterator over a `PersistentMap`.
pub struct Iter<'a, K, V> {
    stack: Vec<&'a Node<K, V>>,
    leaf: std::slice::Iter<'a, Entry<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.leaf.next() {
                return Some((&entry.key, &entry.value));
            }
            match self.stack.pop()? {
                Node::Leaf(entries) => self.leaf = entries.iter(),
                Node::Branch(children) => self
                    .stack
                    .extend(children.iter().rev().filter_map(|c| c.as_deref())),
            }
        }
    }
}

#[cfg(test)]
impl<K, V> PersistentMap<K, V> {
    /// Count of top-level subtrees that are the same allocation in both maps.
    fn shared_root_children(&self, other: &Self) -> usize {
        match (self.root.as_deref(), other.root.as_deref()) {
            (Some(Node::Branch(a)), Some(Node::Branch(b))) => a
                .iter()
                .zip(b.iter())
                .filter(|(x, y)| match (x, y) {
                    (Some(x), Some(y)) => Arc::ptr_eq(x, y),
                    _ => false,
                })
                .count(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn insert_get_and_replace() {
        let mut map = PersistentMap::new();
        assert!(map.is_empty());
        assert_eq!(map.insert(1, "one"), None);
        assert_eq!(map.insert(2, "two"), None);
        assert_eq!(map.insert(1, "uno"), Some("one"));

        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&1), Some(&"uno"));
        assert_eq!(map.get(&3), None);
    }

    #[test]
    fn many_keys_survive_splits() {
        let map: PersistentMap<i32, i32> = (0..10_000).map(|i| (i, i * 2)).collect();
        assert_eq!(map.len(), 10_000);
        for i in 0..10_000 {
            assert_eq!(map.get(&i), Some(&(i * 2)), "key {i}");
        }
        assert_eq!(map.iter().count(), 10_000);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut map: PersistentMap<i32, i32> = (0..100).map(|i| (i, i)).collect();
        assert_eq!(map.remove(&42), Some(42));
        assert_eq!(map.remove(&42), None);
        assert_eq!(map.len(), 99);
        assert!(!map.contains_key(&42));
    }

    #[test]
    fn removing_everything_empties_the_map() {
        let mut map: PersistentMap<i32, i32> = (0..500).map(|i| (i, i)).collect();
        for i in 0..500 {
            map.remove(&i);
        }
        assert!(map.is_empty());
        assert_eq!(map.iter().count(), 0);
        map.insert(7, 7);
        assert_eq!(map.get(&7), Some(&7));
    }

    #[test]
    fn clones_are_isolated() {
        let original: PersistentMap<i32, String> =
            (0..1_000).map(|i| (i, format!("v{i}"))).collect();
        let mut next = original.clone();
        next.insert(5, "changed".to_string());
        next.remove(&6);
        next.insert(5_000, "new".to_string());

        assert_eq!(original.get(&5).map(String::as_str), Some("v5"));
        assert_eq!(original.get(&6).map(String::as_str), Some("v6"));
        assert!(original.get(&5_000).is_none());
        assert_eq!(original.len(), 1_000);

        assert_eq!(next.get(&5).map(String::as_str), Some("changed"));
        assert!(next.get(&6).is_none());
        assert_eq!(next.len(), 1_000);
    }

    #[test]
    fn single_write_shares_untouched_subtrees() {
        let original: PersistentMap<i32, i32> = (0..10_000).map(|i| (i, i)).collect();
        let mut next = original.clone();
        next.insert(1, -1);

        // Exactly one top-level subtree was copied.
        assert_eq!(next.shared_root_children(&original), FANOUT - 1);
    }

    #[test]
    fn iteration_matches_std_map() {
        let mut map = PersistentMap::new();
        let mut expected = HashMap::new();
        for i in 0..2_000 {
            let key = (i * 7919) % 3_001;
            map.insert(key, i);
            expected.insert(key, i);
        }
        for key in (0..3_001).step_by(3) {
            map.remove(&key);
            expected.remove(&key);
        }

        let collected: HashMap<i32, i32> = map.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(collected, expected);
        assert_eq!(map.len(), expected.len());
    }
}
