// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::collections::HashMap;
use std::ops::{Index, IndexMut};
use std::slice::SliceIndex;

/// Number of L2 tables kept in memory per image.
pub const L2_CACHE_SIZE: usize = 16;

#[derive(Clone, Debug)]
/// Represents a fixed-length vector fully resident in memory, such as the L1 table.
pub struct VecCache<T: 'static + Copy + Default> {
    vec: Box<[T]>,
}

impl<T: 'static + Copy + Default> VecCache<T> {
    /// Creates a `VecCache` from the passed in `vec`.
    pub fn from_vec(vec: Vec<T>) -> VecCache<T> {
        VecCache {
            vec: vec.into_boxed_slice(),
        }
    }

    pub fn get<I>(&self, index: I) -> Option<&<I as SliceIndex<[T]>>::Output>
    where
        I: SliceIndex<[T]>,
    {
        self.vec.get(index)
    }

    /// Gets a reference to the underlying vector.
    pub fn get_values(&self) -> &[T] {
        &self.vec
    }

    /// Gets a mutable reference to the underlying vector.
    pub fn get_values_mut(&mut self) -> &mut [T] {
        &mut self.vec
    }

    /// Returns the number of elements in the vector.
    pub fn len(&self) -> usize {
        self.vec.len()
    }
}

impl<T: 'static + Copy + Default> Index<usize> for VecCache<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        self.vec.index(index)
    }
}

impl<T: 'static + Copy + Default> IndexMut<usize> for VecCache<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        self.vec.index_mut(index)
    }
}

/// A fixed number of equally sized tables, each tagged with the file offset it was loaded
/// from. Every hit bumps the slot's counter; a miss replaces the slot with the lowest
/// counter. When a counter saturates all counters are halved.
#[derive(Clone, Debug)]
pub struct SlotCache<T: 'static + Copy + Default> {
    tables: Vec<Box<[T]>>,
    offsets: Vec<Option<u64>>,
    counts: Vec<u32>,
    slots: HashMap<u64, usize>,
}

impl<T: 'static + Copy + Default> SlotCache<T> {
    /// Creates a cache of `capacity` empty slots holding `table_len` elements each.
    pub fn new(capacity: usize, table_len: usize) -> Self {
        SlotCache {
            tables: (0..capacity)
                .map(|_| vec![T::default(); table_len].into_boxed_slice())
                .collect(),
            offsets: vec![None; capacity],
            counts: vec![0; capacity],
            slots: HashMap::with_capacity(capacity),
        }
    }

    /// Returns the slot holding the table loaded from `offset`, counting the hit.
    pub fn lookup(&mut self, offset: u64) -> Option<usize> {
        let slot = *self.slots.get(&offset)?;
        self.counts[slot] += 1;
        if self.counts[slot] == u32::MAX {
            for count in self.counts.iter_mut() {
                *count >>= 1;
            }
        }
        Some(slot)
    }

    // Least used slot, the lowest index wins a tie.
    fn victim(&self) -> usize {
        let mut min_index = 0;
        let mut min_count = u32::MAX;
        for (i, &count) in self.counts.iter().enumerate() {
            if count < min_count {
                min_count = count;
                min_index = i;
            }
        }
        min_index
    }

    /// Evicts the least used slot and fills it with the table stored at `offset`. `fill`
    /// receives the slot's storage; if it fails the slot is left empty.
    pub fn insert_with<E, F>(&mut self, offset: u64, fill: F) -> Result<usize, E>
    where
        F: FnOnce(&mut [T]) -> Result<(), E>,
    {
        self.invalidate(offset);
        let slot = self.victim();
        if let Some(old) = self.offsets[slot].take() {
            self.slots.remove(&old);
        }
        self.counts[slot] = 0;
        fill(&mut self.tables[slot])?;
        self.offsets[slot] = Some(offset);
        self.counts[slot] = 1;
        self.slots.insert(offset, slot);
        Ok(slot)
    }

    pub fn table(&self, slot: usize) -> &[T] {
        &self.tables[slot]
    }

    /// Returns the cached table loaded from `offset` without counting a hit.
    pub fn get_mut(&mut self, offset: u64) -> Option<&mut [T]> {
        let slot = *self.slots.get(&offset)?;
        Some(&mut self.tables[slot])
    }

    #[cfg(test)]
    fn contains(&self, offset: u64) -> bool {
        self.slots.contains_key(&offset)
    }

    /// Drops the table loaded from `offset`, if cached.
    pub fn invalidate(&mut self, offset: u64) {
        if let Some(slot) = self.slots.remove(&offset) {
            self.offsets[slot] = None;
            self.counts[slot] = 0;
        }
    }

    /// Empties every slot.
    pub fn reset(&mut self) {
        for table in self.tables.iter_mut() {
            table.fill(T::default());
        }
        self.offsets.fill(None);
        self.counts.fill(0);
        self.slots.clear();
    }

    #[cfg(test)]
    fn counts(&self) -> &[u32] {
        &self.counts
    }

    #[cfg(test)]
    fn set_count(&mut self, slot: usize, count: u32) {
        self.counts[slot] = count;
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;

    fn fill_with(value: u64) -> impl FnOnce(&mut [u64]) -> Result<(), Infallible> {
        move |table| {
            table.fill(value);
            Ok(())
        }
    }

    #[test]
    fn evicts_least_used() {
        let mut cache: SlotCache<u64> = SlotCache::new(2, 4);
        let a = cache.insert_with(0x1000, fill_with(1)).unwrap();
        let b = cache.insert_with(0x2000, fill_with(2)).unwrap();
        assert_ne!(a, b);

        // 0x1000 is used more, so 0x2000 goes.
        assert_eq!(cache.lookup(0x1000), Some(a));
        let c = cache.insert_with(0x3000, fill_with(3)).unwrap();
        assert_eq!(c, b);
        assert!(cache.contains(0x1000));
        assert!(!cache.contains(0x2000));
        assert_eq!(cache.table(c), &[3, 3, 3, 3]);
        assert_eq!(cache.lookup(0x2000), None);
    }

    #[test]
    fn ties_evict_lowest_slot() {
        let mut cache: SlotCache<u64> = SlotCache::new(3, 1);
        for offset in [0x1000, 0x2000, 0x3000] {
            cache.insert_with(offset, fill_with(offset)).unwrap();
        }
        let slot = cache.insert_with(0x4000, fill_with(4)).unwrap();
        assert_eq!(slot, 0);
        assert!(!cache.contains(0x1000));
    }

    #[test]
    fn counters_halve_on_saturation() {
        let mut cache: SlotCache<u64> = SlotCache::new(2, 1);
        let a = cache.insert_with(0x1000, fill_with(0)).unwrap();
        let b = cache.insert_with(0x2000, fill_with(0)).unwrap();
        cache.set_count(a, u32::MAX - 1);
        cache.set_count(b, 10);
        cache.lookup(0x1000).unwrap();
        assert_eq!(cache.counts()[a], u32::MAX >> 1);
        assert_eq!(cache.counts()[b], 5);
    }

    #[test]
    fn failed_fill_leaves_slot_empty() {
        let mut cache: SlotCache<u64> = SlotCache::new(1, 1);
        cache.insert_with(0x1000, fill_with(7)).unwrap();
        let res: Result<usize, &str> = cache.insert_with(0x2000, |_| Err("read failed"));
        assert!(res.is_err());
        assert!(!cache.contains(0x1000));
        assert!(!cache.contains(0x2000));
    }

    #[test]
    fn get_mut_updates_in_place() {
        let mut cache: SlotCache<u64> = SlotCache::new(2, 2);
        let slot = cache.insert_with(0x1000, fill_with(0)).unwrap();
        cache.get_mut(0x1000).unwrap()[1] = 9;
        assert_eq!(cache.table(slot), &[0, 9]);
        assert_eq!(cache.counts()[slot], 1);
        cache.reset();
        assert!(cache.get_mut(0x1000).is_none());
        assert_eq!(cache.table(slot), &[0, 0]);
    }
}
