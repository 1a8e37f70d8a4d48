//! In-memory allocation indexes
//!
//! - [`FreeBlockIndex`] groups free block records by length. Length 0 holds
//!   unused block-table slots; every other key holds free extents.
//! - [`StringSlots`] tracks occupied string-table slots and recycles freed ones.
//!
//! Both are rebuilt from the on-disk tables on load and carry no state of
//! their own that is not derivable from those tables.

pub mod extent;

use crate::core::record::{BlockRecord, StringRecord};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Free block records keyed by length
#[derive(Debug, Clone, Default)]
pub struct FreeBlockIndex {
    by_length: BTreeMap<u64, BTreeSet<usize>>,
}

impl FreeBlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, length: u64, block_index: usize) {
        self.by_length.entry(length).or_default().insert(block_index);
    }

    pub fn remove(&mut self, length: u64, block_index: usize) -> bool {
        let Some(indices) = self.by_length.get_mut(&length) else {
            return false;
        };

        let removed = indices.remove(&block_index);
        if indices.is_empty() {
            self.by_length.remove(&length);
        }
        removed
    }

    pub fn contains(&self, length: u64, block_index: usize) -> bool {
        self.by_length
            .get(&length)
            .is_some_and(|indices| indices.contains(&block_index))
    }

    /// Take the lowest-numbered unused block-table slot
    pub fn take_empty_slot(&mut self) -> Option<usize> {
        let index = *self.by_length.get(&0)?.iter().next()?;
        self.remove(0, index);
        Some(index)
    }

    /// Smallest free extent of at least `length` bytes
    ///
    /// Among extents of that smallest length the one with the lowest cluster
    /// index wins. Returns `(extent length, block index)`.
    pub fn find_sufficient(&self, length: u64, blocks: &[BlockRecord]) -> Option<(u64, usize)> {
        let (&found, indices) = self
            .by_length
            .range(length.max(1)..)
            .find(|(_, indices)| !indices.is_empty())?;

        indices
            .iter()
            .copied()
            .min_by_key(|&index| blocks[index].cluster_index)
            .map(|index| (found, index))
    }

    /// Free extents (length > 0) as `(length, block index)` pairs
    pub fn extents(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        self.by_length
            .range(1..)
            .flat_map(|(&length, indices)| indices.iter().map(move |&index| (length, index)))
    }

    pub fn extent_count(&self) -> usize {
        self.by_length.range(1..).map(|(_, indices)| indices.len()).sum()
    }

    pub fn empty_slot_count(&self) -> usize {
        self.by_length.get(&0).map_or(0, BTreeSet::len)
    }

    /// Total bytes held by free extents
    pub fn free_bytes(&self) -> u64 {
        self.by_length
            .range(1..)
            .map(|(&length, indices)| length * indices.len() as u64)
            .sum()
    }
}

/// String-table slot bookkeeping
///
/// New names take a recycled slot first (oldest freed first), then the next
/// never-used slot below the capacity.
#[derive(Debug, Clone)]
pub struct StringSlots {
    occupied: BTreeMap<u32, StringRecord>,
    recycled: VecDeque<u32>,
    next_unused: u32,
    capacity: u32,
}

impl StringSlots {
    pub fn new(capacity: u32) -> Self {
        StringSlots {
            occupied: BTreeMap::new(),
            recycled: VecDeque::new(),
            next_unused: 0,
            capacity,
        }
    }

    /// Rebuild from the slots referenced by the block table
    ///
    /// Holes below the highest occupied slot become recyclable.
    pub fn rebuild(capacity: u32, occupied: BTreeMap<u32, StringRecord>) -> Self {
        let next_unused = occupied.keys().next_back().map_or(0, |&last| last + 1);
        let recycled = (0..next_unused)
            .filter(|index| !occupied.contains_key(index))
            .collect();

        StringSlots {
            occupied,
            recycled,
            next_unused,
            capacity,
        }
    }

    /// Reserve a slot for `record`, `None` when the table is full
    pub fn allocate(&mut self, record: StringRecord) -> Option<u32> {
        let index = match self.recycled.pop_front() {
            Some(index) => index,
            None if self.next_unused < self.capacity => {
                self.next_unused += 1;
                self.next_unused - 1
            }
            None => return None,
        };

        self.occupied.insert(index, record);
        Some(index)
    }

    /// Overwrite an occupied slot in place
    pub fn replace(&mut self, index: u32, record: StringRecord) {
        self.occupied.insert(index, record);
    }

    /// Vacate a slot and queue it for reuse
    pub fn release(&mut self, index: u32) -> Option<StringRecord> {
        let record = self.occupied.remove(&index)?;
        self.recycled.push_back(index);
        Some(record)
    }

    pub fn get(&self, index: u32) -> Option<&StringRecord> {
        self.occupied.get(&index)
    }

    pub fn len(&self) -> usize {
        self.occupied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied.is_empty()
    }

    pub fn recycled_count(&self) -> usize {
        self.recycled.len()
    }
}
