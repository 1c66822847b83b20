//! Fixed-capacity tables with the same failure modes as the kernel maps.

use std::hash::Hash;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tuner_ebpf_common::engine::{PerCpuSlot, PerCpuTable, Table};

/// Hash table that refuses new keys once `capacity` keys are stored.
pub struct BoundedTable<K, V> {
    map: DashMap<K, V>,
    len: AtomicUsize,
    capacity: usize,
}

impl<K: Eq + Hash + Copy, V: Copy> BoundedTable<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: DashMap::with_capacity(capacity),
            len: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.map.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    pub fn keys(&self) -> Vec<K> {
        self.map.iter().map(|e| *e.key()).collect()
    }

    /// Claims one slot of capacity; false when full.
    fn reserve_slot(&self) -> bool {
        let prev = self.len.fetch_add(1, Ordering::AcqRel);
        if prev >= self.capacity {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }
}

impl<K: Eq + Hash + Copy, V: Copy> Table<K, V> for BoundedTable<K, V> {
    fn lookup(&self, key: &K) -> Option<V> {
        self.map.get(key).map(|v| *v)
    }

    fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    fn upsert(&self, key: &K, value: &V) -> bool {
        match self.map.entry(*key) {
            Entry::Occupied(mut slot) => {
                *slot.get_mut() = *value;
                true
            }
            Entry::Vacant(slot) => {
                if !self.reserve_slot() {
                    return false;
                }
                slot.insert(*value);
                true
            }
        }
    }

    fn insert_new(&self, key: &K, value: &V) -> bool {
        match self.map.entry(*key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                if !self.reserve_slot() {
                    return false;
                }
                slot.insert(*value);
                true
            }
        }
    }

    fn modify<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> bool {
        match self.map.get_mut(key) {
            Some(mut value) => {
                f(&mut *value);
                true
            }
            None => false,
        }
    }

    fn remove(&self, key: &K) -> bool {
        if self.map.remove(key).is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }
}

/// Hash table that evicts the least-recently-touched key to make room.
///
/// Recency is an access stamp, so eviction is approximate under concurrent
/// inserts: the table may briefly hold a few keys over capacity.
pub struct LruTable<K, V> {
    map: DashMap<K, (V, u64)>,
    len: AtomicUsize,
    capacity: usize,
    clock: AtomicU64,
}

impl<K: Eq + Hash + Copy, V: Copy> LruTable<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: DashMap::with_capacity(capacity),
            len: AtomicUsize::new(0),
            capacity,
            clock: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.map.iter().map(|e| (*e.key(), e.value().0)).collect()
    }

    /// Reads a value without refreshing its recency.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.map.get(key).map(|slot| slot.0)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn evict_coldest(&self) -> bool {
        let coldest = self
            .map
            .iter()
            .min_by_key(|e| e.value().1)
            .map(|e| *e.key());
        match coldest {
            Some(key) => {
                self.remove(&key);
                true
            }
            None => false,
        }
    }

    fn make_room(&self) {
        while self.len() >= self.capacity {
            if !self.evict_coldest() {
                break;
            }
        }
    }

    fn store(&self, key: &K, value: &V, overwrite: bool) -> bool {
        let stamp = self.tick();
        if let Some(mut slot) = self.map.get_mut(key) {
            if overwrite {
                *slot = (*value, stamp);
            }
            return overwrite;
        }
        self.make_room();
        match self.map.entry(*key) {
            Entry::Occupied(mut slot) => {
                if overwrite {
                    *slot.get_mut() = (*value, stamp);
                }
                overwrite
            }
            Entry::Vacant(slot) => {
                self.len.fetch_add(1, Ordering::AcqRel);
                slot.insert((*value, stamp));
                true
            }
        }
    }
}

impl<K: Eq + Hash + Copy, V: Copy> Table<K, V> for LruTable<K, V> {
    fn lookup(&self, key: &K) -> Option<V> {
        let stamp = self.tick();
        self.map.get_mut(key).map(|mut slot| {
            slot.1 = stamp;
            slot.0
        })
    }

    fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    fn upsert(&self, key: &K, value: &V) -> bool {
        self.store(key, value, true)
    }

    fn insert_new(&self, key: &K, value: &V) -> bool {
        self.store(key, value, false)
    }

    fn modify<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> bool {
        let stamp = self.tick();
        match self.map.get_mut(key) {
            Some(mut slot) => {
                slot.1 = stamp;
                f(&mut slot.0);
                true
            }
            None => false,
        }
    }

    fn remove(&self, key: &K) -> bool {
        if self.map.remove(key).is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }
}

/// One value per CPU, zero-initialised like a per-CPU array slot.
pub struct PerCpuCell<V> {
    parts: Box<[Mutex<V>]>,
}

impl<V: Copy + Default> PerCpuCell<V> {
    pub fn new(cpus: u32) -> Self {
        Self {
            parts: (0..cpus.max(1)).map(|_| Mutex::new(V::default())).collect(),
        }
    }

    pub fn cpus(&self) -> u32 {
        self.parts.len() as u32
    }

    /// Copies every partition in CPU order.
    pub fn values(&self) -> Vec<V> {
        self.parts.iter().map(|p| *lock(p)).collect()
    }

    /// Copies every partition, then resets it to the default value.
    pub fn take_all(&self) -> Vec<V> {
        self.parts
            .iter()
            .map(|p| std::mem::take(&mut *lock(p)))
            .collect()
    }
}

impl<V: Copy + Default> PerCpuSlot<V> for PerCpuCell<V> {
    fn modify_local<F: FnOnce(&mut V)>(&self, cpu: u32, f: F) -> bool {
        match self.parts.get(cpu as usize) {
            Some(part) => {
                f(&mut *lock(part));
                true
            }
            None => false,
        }
    }
}

/// Keyed table with an independent partition per CPU.
pub struct PerCpuHashTable<K, V> {
    parts: Box<[BoundedTable<K, V>]>,
}

impl<K: Eq + Hash + Copy, V: Copy> PerCpuHashTable<K, V> {
    pub fn new(cpus: u32, capacity: usize) -> Self {
        Self {
            parts: (0..cpus.max(1)).map(|_| BoundedTable::new(capacity)).collect(),
        }
    }

    /// The key's value on each CPU; `None` where the CPU never saw it.
    pub fn per_cpu(&self, key: &K) -> Vec<Option<V>> {
        self.parts.iter().map(|p| p.lookup(key)).collect()
    }
}

impl<K: Eq + Hash + Copy, V: Copy> PerCpuTable<K, V> for PerCpuHashTable<K, V> {
    fn modify_local<F: FnOnce(&mut V)>(&self, cpu: u32, key: &K, f: F) -> bool {
        match self.parts.get(cpu as usize) {
            Some(part) => part.modify(key, f),
            None => false,
        }
    }

    fn insert_local(&self, cpu: u32, key: &K, value: &V) -> bool {
        match self.parts.get(cpu as usize) {
            Some(part) => part.upsert(key, value),
            None => false,
        }
    }
}

/// A poisoned partition still holds plain data; keep using it.
fn lock<V>(m: &Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_table_refuses_new_keys_but_updates_existing() {
        let t: BoundedTable<u32, u64> = BoundedTable::new(2);
        assert_eq!(t.capacity(), 2);
        assert!(t.upsert(&1, &10));
        assert!(t.upsert(&2, &20));
        assert!(!t.upsert(&3, &30));
        assert!(!t.insert_new(&3, &30));
        assert!(t.upsert(&1, &11));
        assert_eq!(t.lookup(&1), Some(11));
        assert_eq!(t.len(), 2);

        assert!(t.remove(&2));
        assert!(t.insert_new(&3, &30));
        assert!(!t.insert_new(&3, &31));
        assert_eq!(t.lookup(&3), Some(30));
    }

    #[test]
    fn lru_evicts_least_recently_touched() {
        let t: LruTable<u32, u64> = LruTable::new(2);
        t.upsert(&1, &1);
        t.upsert(&2, &2);
        // touch 1 so 2 becomes the coldest
        t.modify(&1, |v| *v += 1);
        assert!(t.upsert(&3, &3));
        assert_eq!(t.len(), 2);
        assert!(t.contains(&1));
        assert!(!t.contains(&2));
        assert!(t.contains(&3));
    }

    #[test]
    fn lru_peek_leaves_recency_alone() {
        let t: LruTable<u32, u64> = LruTable::new(2);
        t.upsert(&1, &10);
        t.upsert(&2, &20);
        assert_eq!(t.peek(&1), Some(10));
        assert_eq!(t.peek(&9), None);
        // 1 is still the coldest
        t.upsert(&3, &30);
        assert!(!t.contains(&1));
        assert!(t.contains(&2));
    }

    #[test]
    fn per_cpu_cell_partitions_and_resets() {
        let cell: PerCpuCell<u64> = PerCpuCell::new(2);
        cell.modify_local(0, |v| *v += 3);
        cell.modify_local(1, |v| *v += 4);
        assert!(!cell.modify_local(2, |v| *v += 1));
        assert_eq!(cell.take_all(), vec![3, 4]);
        assert_eq!(cell.values(), vec![0, 0]);
    }

    #[test]
    fn per_cpu_table_keeps_partitions_apart() {
        let t: PerCpuHashTable<u32, u64> = PerCpuHashTable::new(3, 8);
        t.insert_local(0, &7, &1);
        t.insert_local(2, &7, &5);
        assert_eq!(t.per_cpu(&7), vec![Some(1), None, Some(5)]);
    }
}
