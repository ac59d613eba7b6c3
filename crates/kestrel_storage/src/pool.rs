//! Bucket maps: block lookup by free-slot count.
//!
//! The table keeps two of these, one for each pending-snapshot set. Blocks
//! are keyed by quantized free count so best-fit allocation is a scan over at
//! most `BUCKET_COUNT` buckets, and ordered id sets inside each bucket give
//! the deterministic creation-order tie-break.

use std::collections::BTreeSet;

use kestrel_common::types::BlockId;

use crate::block::BUCKET_COUNT;

#[derive(Debug)]
pub struct BucketMap {
    buckets: Vec<BTreeSet<BlockId>>,
}

impl Default for BucketMap {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketMap {
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKET_COUNT).map(|_| BTreeSet::new()).collect(),
        }
    }

    pub fn insert(&mut self, id: BlockId, bucket: usize) {
        debug_assert!(bucket < BUCKET_COUNT);
        self.buckets[bucket].insert(id);
    }

    pub fn remove(&mut self, id: BlockId, bucket: usize) -> bool {
        debug_assert!(bucket < BUCKET_COUNT);
        self.buckets[bucket].remove(&id)
    }

    /// Move a block between buckets after its free count changed.
    pub fn rebucket(&mut self, id: BlockId, old_bucket: usize, new_bucket: usize) {
        if old_bucket == new_bucket {
            return;
        }
        let removed = self.remove(id, old_bucket);
        debug_assert!(removed, "rebucket of untracked block {id}");
        self.insert(id, new_bucket);
    }

    /// The fullest block that still has room: lowest non-full bucket, lowest
    /// id within it. Bucket 0 (full blocks) is skipped.
    pub fn best_fit(&self) -> Option<BlockId> {
        self.buckets[1..]
            .iter()
            .find_map(|b| b.iter().next().copied())
    }

    /// `best_fit` that never returns `excluded` — used by compaction so a
    /// drain candidate cannot be chosen as its own target.
    pub fn best_fit_excluding(&self, excluded: BlockId) -> Option<BlockId> {
        self.buckets[1..]
            .iter()
            .find_map(|b| b.iter().find(|&&id| id != excluded).copied())
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    #[cfg(debug_assertions)]
    pub fn contains(&self, id: BlockId) -> bool {
        self.buckets.iter().any(|b| b.contains(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_fit_prefers_fullest_bucket() {
        let mut m = BucketMap::new();
        m.insert(BlockId(1), 5); // emptier
        m.insert(BlockId(2), 2); // fuller
        assert_eq!(m.best_fit(), Some(BlockId(2)));
    }

    #[test]
    fn test_best_fit_skips_full_blocks() {
        let mut m = BucketMap::new();
        m.insert(BlockId(1), 0);
        assert_eq!(m.best_fit(), None);
        m.insert(BlockId(2), 3);
        assert_eq!(m.best_fit(), Some(BlockId(2)));
    }

    #[test]
    fn test_tie_break_is_creation_order() {
        let mut m = BucketMap::new();
        m.insert(BlockId(9), 4);
        m.insert(BlockId(3), 4);
        assert_eq!(m.best_fit(), Some(BlockId(3)));
    }

    #[test]
    fn test_rebucket_moves_block() {
        let mut m = BucketMap::new();
        m.insert(BlockId(1), 3);
        m.rebucket(BlockId(1), 3, 7);
        assert_eq!(m.len(), 1);
        assert_eq!(m.best_fit(), Some(BlockId(1)));
        assert!(m.remove(BlockId(1), 7));
    }

    #[test]
    fn test_best_fit_excluding() {
        let mut m = BucketMap::new();
        m.insert(BlockId(1), 2);
        m.insert(BlockId(2), 5);
        assert_eq!(m.best_fit_excluding(BlockId(1)), Some(BlockId(2)));
        assert_eq!(m.best_fit_excluding(BlockId(2)), Some(BlockId(1)));
        m.remove(BlockId(2), 5);
        assert_eq!(m.best_fit_excluding(BlockId(1)), None);
    }
}
