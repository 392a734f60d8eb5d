use std::collections::BTreeMap;

use hashbrown::HashMap;
use parking_lot::RwLock;

/// Primary index of one table: row key to an engine-defined entry.
///
/// The entry type is small and `Copy`; engines keep pointers-to-metadata in
/// it, never owned state, so the index can hand out copies under a short
/// shard lock.
pub trait Index<T: Copy>: Send + Sync {
    /// `false` when the key is already present.
    fn insert(&self, row: u64, entry: T) -> bool;

    fn get(&self, row: u64) -> Option<T>;

    /// `false` when the key was absent.
    fn remove(&self, row: u64) -> bool;

    fn for_each(&self, f: &mut dyn FnMut(u64, &T));
}

const SHARD_COUNT: usize = 64;

/// Sharded hash map index.
pub struct HashIndex<T> {
    shards: Box<[RwLock<HashMap<u64, T>>]>,
}

impl<T> HashIndex<T> {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect();
        Self { shards }
    }

    fn shard(&self, row: u64) -> &RwLock<HashMap<u64, T>> {
        // Rows are often sequential; fold the high bits in so neighbouring
        // keys spread over shards.
        let h = row ^ (row >> 7);
        &self.shards[(h as usize) % SHARD_COUNT]
    }
}

impl<T> Default for HashIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Send + Sync> Index<T> for HashIndex<T> {
    fn insert(&self, row: u64, entry: T) -> bool {
        let mut shard = self.shard(row).write();
        match shard.entry(row) {
            hashbrown::hash_map::Entry::Occupied(_) => false,
            hashbrown::hash_map::Entry::Vacant(e) => {
                e.insert(entry);
                true
            }
        }
    }

    fn get(&self, row: u64) -> Option<T> {
        self.shard(row).read().get(&row).copied()
    }

    fn remove(&self, row: u64) -> bool {
        self.shard(row).write().remove(&row).is_some()
    }

    fn for_each(&self, f: &mut dyn FnMut(u64, &T)) {
        for shard in self.shards.iter() {
            for (k, v) in shard.read().iter() {
                f(*k, v);
            }
        }
    }
}

/// Ordered index variant backed by a single `BTreeMap`.
pub struct BTreeIndex<T> {
    map: RwLock<BTreeMap<u64, T>>,
}

impl<T> BTreeIndex<T> {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T> Default for BTreeIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Send + Sync> Index<T> for BTreeIndex<T> {
    fn insert(&self, row: u64, entry: T) -> bool {
        let mut map = self.map.write();
        match map.entry(row) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(entry);
                true
            }
        }
    }

    fn get(&self, row: u64) -> Option<T> {
        self.map.read().get(&row).copied()
    }

    fn remove(&self, row: u64) -> bool {
        self.map.write().remove(&row).is_some()
    }

    fn for_each(&self, f: &mut dyn FnMut(u64, &T)) {
        for (k, v) in self.map.read().iter() {
            f(*k, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(index: &dyn Index<u32>) {
        assert!(index.insert(1, 10));
        assert!(!index.insert(1, 11), "duplicate insert must be refused");
        assert_eq!(index.get(1), Some(10));
        assert!(index.remove(1));
        assert!(!index.remove(1));
        assert_eq!(index.get(1), None);
    }

    #[test]
    fn hash_index_basics() {
        exercise(&HashIndex::new());
    }

    #[test]
    fn btree_index_basics() {
        exercise(&BTreeIndex::new());
    }

    #[test]
    fn for_each_sees_all_entries() {
        let index = HashIndex::new();
        for row in 0..100u64 {
            index.insert(row, row as u32);
        }
        let mut n = 0;
        index.for_each(&mut |row, v| {
            assert_eq!(row as u32, *v);
            n += 1;
        });
        assert_eq!(n, 100);
    }
}
