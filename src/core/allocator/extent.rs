//! Cluster extents
//!
//! A contiguous run of data-region clusters, used to reason about
//! adjacency when free block records are merged.

use crate::core::header::CLUSTER_SIZE;
use crate::core::record::BlockRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// First cluster
    pub start: u64,
    /// Number of clusters
    pub length: u64,
}

impl Extent {
    pub fn new(start: u64, length: u64) -> Self {
        Extent { start, length }
    }

    pub fn of(block: &BlockRecord) -> Self {
        Extent::new(block.cluster_index as u64, block.cluster_count())
    }

    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// `self` ends exactly where `other` begins
    pub fn precedes(&self, other: &Extent) -> bool {
        self.end() == other.start
    }

    pub fn is_adjacent(&self, other: &Extent) -> bool {
        self.precedes(other) || other.precedes(self)
    }

    pub fn overlaps(&self, other: &Extent) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// `other` lies wholly inside `self`
    pub fn covers(&self, other: &Extent) -> bool {
        self.start <= other.start && other.end() <= self.end()
    }

    /// Coalesce two adjacent extents
    pub fn coalesce(&self, other: &Extent) -> Option<Extent> {
        if !self.is_adjacent(other) {
            return None;
        }

        let start = self.start.min(other.start);
        Some(Extent::new(start, self.end().max(other.end()) - start))
    }

    pub fn byte_length(&self) -> u64 {
        self.length * CLUSTER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_adjacency() {
        let e1 = Extent::new(10, 10);
        let e2 = Extent::new(20, 10);
        let e3 = Extent::new(30, 10);

        assert!(e1.precedes(&e2));
        assert!(!e2.precedes(&e1));
        assert!(e1.is_adjacent(&e2));
        assert!(e2.is_adjacent(&e1));
        assert!(!e1.is_adjacent(&e3));
    }

    #[test]
    fn test_extent_coalesce() {
        let e1 = Extent::new(10, 10);
        let e2 = Extent::new(20, 10);

        assert_eq!(e2.coalesce(&e1), Some(Extent::new(10, 20)));
        assert_eq!(e1.coalesce(&Extent::new(25, 1)), None);
    }

    #[test]
    fn test_extent_of_block() {
        let extent = Extent::of(&BlockRecord::used(0, 3, 5000));
        assert_eq!(extent, Extent::new(3, 2));
        assert_eq!(extent.byte_length(), 8192);
        assert!(extent.overlaps(&Extent::new(4, 1)));
        assert!(!extent.overlaps(&Extent::new(5, 1)));
        assert!(extent.covers(&Extent::new(4, 1)));
        assert!(!extent.covers(&Extent::new(4, 2)));
    }
}
