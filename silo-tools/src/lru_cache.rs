//! Least recently used (LRU) cache.
//!
//! A `HashMap` gives O(1) access by key; a doubly linked list over slab
//! indices tracks the access order without unsafe pointer juggling.

use std::collections::HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

struct Node<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

/// LRU cache with a fixed capacity. Inserting beyond the capacity evicts
/// the least recently used entry.
pub struct LruCache<K, V> {
    map: HashMap<K, usize>,
    slab: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    capacity: usize,
}

impl<K: Clone + Eq + Hash, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            map: HashMap::with_capacity(capacity),
            slab: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.slab.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Insert or update an entry, marking it most recently used. Returns
    /// true if the key was already present.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        if let Some(&idx) = self.map.get(&key) {
            self.slab[idx].as_mut().unwrap().value = value;
            self.promote(idx);
            return true;
        }

        if self.map.len() >= self.capacity {
            self.evict_tail();
        }

        let node = Node {
            key: key.clone(),
            value,
            prev: NIL,
            next: self.head,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slab[idx] = Some(node);
                idx
            }
            None => {
                self.slab.push(Some(node));
                self.slab.len() - 1
            }
        };

        if self.head != NIL {
            self.slab[self.head].as_mut().unwrap().prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }

        self.map.insert(key, idx);
        false
    }

    /// Get a value, marking it most recently used.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let idx = *self.map.get(key)?;
        self.promote(idx);
        Some(&mut self.slab[idx].as_mut().unwrap().value)
    }

    /// Look up without touching the access order.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        Some(&self.slab[idx].as_ref().unwrap().value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.map.remove(key)?;
        self.unlink(idx);
        let node = self.slab[idx].take().unwrap();
        self.free.push(idx);
        Some(node.value)
    }

    fn evict_tail(&mut self) {
        if self.tail == NIL {
            return;
        }
        let idx = self.tail;
        self.unlink(idx);
        let node = self.slab[idx].take().unwrap();
        self.free.push(idx);
        self.map.remove(&node.key);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.slab[idx].as_ref().unwrap();
            (node.prev, node.next)
        };
        if prev != NIL {
            self.slab[prev].as_mut().unwrap().next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slab[next].as_mut().unwrap().prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn promote(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.unlink(idx);
        {
            let node = self.slab[idx].as_mut().unwrap();
            node.prev = NIL;
            node.next = self.head;
        }
        if self.head != NIL {
            self.slab[self.head].as_mut().unwrap().prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn eviction_follows_access_order() {
        let mut cache = LruCache::new(3);
        cache.insert(1, "one");
        cache.insert(2, "two");
        cache.insert(3, "three");

        // touch 1, making 2 the least recently used
        assert_eq!(cache.get_mut(&1), Some(&mut "one"));

        cache.insert(4, "four");
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&2));
        assert!(cache.contains(&1));
        assert!(cache.contains(&3));
        assert!(cache.contains(&4));
    }

    #[test]
    fn insert_updates_existing() {
        let mut cache = LruCache::new(2);
        assert!(!cache.insert(1, "a"));
        assert!(cache.insert(1, "b"));
        assert_eq!(cache.peek(&1), Some(&"b"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn remove_and_reuse_slots() {
        let mut cache = LruCache::new(2);
        cache.insert(1, 10);
        cache.insert(2, 20);
        assert_eq!(cache.remove(&1), Some(10));
        assert!(cache.is_empty() == false);
        cache.insert(3, 30);
        cache.insert(4, 40);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&2));
    }
}
