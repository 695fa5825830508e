//! Free-space management for the record area of a container.
//!
//! Vacated record ranges are kept as `(offset, length)` blocks, measured in
//! records. Blocks never overlap; adjacent blocks are merged on release.
//! Allocation is best fit: the smallest block that can hold the request,
//! lowest offset first among equals.

use std::collections::{BTreeMap, BTreeSet};

use crate::errors::{BoxResult, BoxTreeError};

/// A vacated range of the record area
pub type FreeBlock = (u64, u64);

/// Free blocks indexed by offset and by size
#[derive(Debug, Clone, Default)]
pub struct FreeSpaceMap {
    by_offset: BTreeMap<u64, u64>,
    by_size: BTreeSet<(u64, u64)>,
}

impl FreeSpaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted blocks, merging any adjacent ones
    pub fn from_blocks(blocks: &[FreeBlock]) -> BoxResult<Self> {
        let mut map = Self::new();
        for &(offset, length) in blocks {
            map.release(offset, length)?;
        }
        Ok(map)
    }

    /// Return a range to the free pool.
    ///
    /// Fails when the range overlaps a block that is already free, which
    /// means the same range was released twice.
    pub fn release(&mut self, offset: u64, length: u64) -> BoxResult<()> {
        if length == 0 {
            return Ok(());
        }
        let end = offset + length;

        let before = self
            .by_offset
            .range(..=offset)
            .next_back()
            .map(|(&o, &l)| (o, l));
        let after = self
            .by_offset
            .range(offset..)
            .next()
            .map(|(&o, &l)| (o, l));

        if let Some((o, l)) = before {
            if o + l > offset {
                return Err(overlap(offset, length, o, l));
            }
        }
        if let Some((o, l)) = after {
            if o < end {
                return Err(overlap(offset, length, o, l));
            }
        }

        let mut start = offset;
        let mut stop = end;
        if let Some((o, l)) = before {
            if o + l == offset {
                self.remove(o, l);
                start = o;
            }
        }
        if let Some((o, l)) = after {
            if o == end {
                self.remove(o, l);
                stop = o + l;
            }
        }
        self.insert(start, stop - start);
        Ok(())
    }

    /// Take `length` records from the smallest block that fits
    pub fn allocate(&mut self, length: u64) -> Option<u64> {
        if length == 0 {
            return None;
        }
        let (size, offset) = *self.by_size.range((length, 0)..).next()?;
        self.remove(offset, size);
        if size > length {
            self.insert(offset + length, size - length);
        }
        Some(offset)
    }

    /// All blocks ordered by offset
    pub fn blocks(&self) -> Vec<FreeBlock> {
        self.by_offset.iter().map(|(&o, &l)| (o, l)).collect()
    }

    /// Total free records
    pub fn total_free(&self) -> u64 {
        self.by_offset.values().sum()
    }

    pub fn len(&self) -> usize {
        self.by_offset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_offset.is_empty()
    }

    /// Whether any free block overlaps `[offset, offset + length)`
    pub fn overlaps(&self, offset: u64, length: u64) -> bool {
        if length == 0 {
            return false;
        }
        let end = offset + length;
        if let Some((&o, &l)) = self.by_offset.range(..end).next_back() {
            return o + l > offset;
        }
        false
    }

    fn insert(&mut self, offset: u64, length: u64) {
        self.by_offset.insert(offset, length);
        self.by_size.insert((length, offset));
    }

    fn remove(&mut self, offset: u64, length: u64) {
        self.by_offset.remove(&offset);
        self.by_size.remove(&(length, offset));
    }
}

fn overlap(offset: u64, length: u64, o: u64, l: u64) -> BoxTreeError {
    BoxTreeError::InvalidOperation(format!(
        "free range ({}, {}) overlaps free block ({}, {})",
        offset, length, o, l
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_merges_neighbours() {
        let mut map = FreeSpaceMap::new();
        map.release(10, 5).unwrap();
        map.release(20, 5).unwrap();
        assert_eq!(map.len(), 2);

        map.release(15, 5).unwrap();
        assert_eq!(map.blocks(), vec![(10, 15)]);
        assert_eq!(map.total_free(), 15);
    }

    #[test]
    fn test_release_rejects_overlap() {
        let mut map = FreeSpaceMap::new();
        map.release(10, 10).unwrap();
        assert!(map.release(15, 2).is_err());
        assert!(map.release(5, 6).is_err());
        assert!(map.release(19, 5).is_err());
        assert!(map.release(20, 5).is_ok());
    }

    #[test]
    fn test_allocate_best_fit() {
        let mut map = FreeSpaceMap::new();
        map.release(0, 100).unwrap();
        map.release(200, 10).unwrap();
        map.release(300, 30).unwrap();

        assert_eq!(map.allocate(8), Some(200));
        assert_eq!(map.blocks(), vec![(0, 100), (208, 2), (300, 30)]);

        assert_eq!(map.allocate(30), Some(300));
        assert_eq!(map.allocate(50), Some(0));
        assert_eq!(map.blocks(), vec![(50, 50), (208, 2)]);
        assert_eq!(map.allocate(51), None);
        assert_eq!(map.allocate(0), None);
    }

    #[test]
    fn test_allocate_prefers_lowest_offset_among_equal_sizes() {
        let mut map = FreeSpaceMap::new();
        map.release(50, 4).unwrap();
        map.release(10, 4).unwrap();
        assert_eq!(map.allocate(4), Some(10));
    }

    #[test]
    fn test_from_blocks_and_overlaps() {
        let map = FreeSpaceMap::from_blocks(&[(0, 5), (5, 5), (20, 1)]).unwrap();
        assert_eq!(map.blocks(), vec![(0, 10), (20, 1)]);
        assert!(map.overlaps(9, 3));
        assert!(!map.overlaps(10, 10));
        assert!(map.overlaps(15, 6));
        assert!(!map.overlaps(0, 0));
        assert!(FreeSpaceMap::from_blocks(&[(0, 5), (3, 5)]).is_err());
    }
}
