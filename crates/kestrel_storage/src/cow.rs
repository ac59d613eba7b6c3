//! Copy-on-write snapshot iteration.
//!
//! The iterator walks the block set frozen at snapshot activation in
//! (block order, slot order) and yields each tuple's pre-image exactly once.
//! Pre-images of mutated slots live in a side buffer keyed by tuple address:
//! the table stashes a slot's bytes here (and sets the slot's dirty bit) the
//! first time an unstreamed slot in a pending block is updated or deleted.
//! Later mutations of the same slot find the dirty bit set and do not
//! restash, so the activation-time image wins.
//!
//! Yield rule per slot:
//! 1. stash entry present            → the stashed pre-image,
//! 2. slot live, active, not dirty   → the live bytes,
//! 3. otherwise                      → skip (free slot, or a tuple inserted
//!    after activation, which the insert path marked dirty).

use std::collections::{BTreeMap, HashMap};

use kestrel_common::types::{BlockId, TupleAddress};

use crate::table::PersistentTable;

/// A block captured at snapshot activation: its id and the bound of slots
/// that had ever been used at that point.
#[derive(Debug, Clone, Copy)]
pub struct FrozenBlock {
    pub id: BlockId,
    pub used_bound: u32,
}

/// One step of snapshot iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowStep {
    /// A tuple to emit. `stashed` selects the pre-image source.
    Tuple { addr: TupleAddress, stashed: bool },
    /// The iterator left a block; the caller releases it from the pending
    /// set and this iterator's stash entries for it are dropped.
    BlockDone(BlockId),
    Finished,
}

pub struct CowIterator {
    frozen: Vec<FrozenBlock>,
    /// Block id → position in `frozen`, for streamed-position checks.
    order: HashMap<BlockId, usize>,
    /// Index of the block currently being walked.
    current: usize,
    /// Next slot to visit within the current block.
    cursor: u32,
    stash: BTreeMap<TupleAddress, Vec<u8>>,
    finished: bool,
}

impl CowIterator {
    pub fn new(frozen: Vec<FrozenBlock>) -> Self {
        let order = frozen
            .iter()
            .enumerate()
            .map(|(i, fb)| (fb.id, i))
            .collect();
        Self {
            frozen,
            order,
            current: 0,
            cursor: 0,
            stash: BTreeMap::new(),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Advance to the next tuple, block boundary, or the end.
    pub fn next_step(&mut self, table: &PersistentTable) -> CowStep {
        loop {
            if self.finished {
                return CowStep::Finished;
            }
            if self.current >= self.frozen.len() {
                self.finished = true;
                return CowStep::Finished;
            }
            let fb = self.frozen[self.current];
            if self.cursor >= fb.used_bound {
                self.current += 1;
                self.cursor = 0;
                return CowStep::BlockDone(fb.id);
            }
            let slot = self.cursor;
            self.cursor += 1;
            let addr = TupleAddress::new(fb.id, slot);
            if self.stash.contains_key(&addr) {
                return CowStep::Tuple { addr, stashed: true };
            }
            if let Some(block) = table.block(fb.id) {
                if block.is_slot_active(slot) && !block.is_slot_dirty(slot) {
                    return CowStep::Tuple {
                        addr,
                        stashed: false,
                    };
                }
            }
        }
    }

    /// Step back over the tuple just returned, so the next call revisits it.
    /// Used when the output buffer cannot take the row.
    pub fn retreat(&mut self) {
        debug_assert!(self.cursor > 0, "retreat without a preceding tuple step");
        self.cursor -= 1;
    }

    /// True when the iterator has already emitted (or passed) this address.
    pub fn already_streamed(&self, addr: TupleAddress) -> bool {
        match self.order.get(&addr.block) {
            // Not part of the frozen set: nothing is owed for it.
            None => true,
            Some(&i) => {
                i < self.current || (i == self.current && addr.slot < self.cursor)
            }
        }
    }

    /// Record a pre-image for a slot about to be mutated. Returns `true` when
    /// the image was stashed (the caller then sets the slot's dirty bit).
    /// `dirty` carries the slot's current dirty flag: a set flag means the
    /// first pre-image was already captured, or the tuple postdates the
    /// snapshot — either way there is nothing to preserve.
    pub fn note_mutation(
        &mut self,
        addr: TupleAddress,
        pre_image: &[u8],
        in_pending_block: bool,
        dirty: bool,
    ) -> bool {
        if self.finished || !in_pending_block || dirty || self.already_streamed(addr) {
            return false;
        }
        self.stash
            .entry(addr)
            .or_insert_with(|| pre_image.to_vec());
        true
    }

    /// Pre-image bytes stashed for an address.
    pub fn stashed_bytes(&self, addr: TupleAddress) -> Option<&[u8]> {
        self.stash.get(&addr).map(Vec::as_slice)
    }

    /// Drop stash entries belonging to a block the iterator has left.
    pub fn drop_stash_for(&mut self, block: BlockId) {
        let from = TupleAddress::new(block, 0);
        let to = TupleAddress::new(block, u32::MAX);
        let keys: Vec<TupleAddress> = self.stash.range(from..=to).map(|(k, _)| *k).collect();
        for k in keys {
            self.stash.remove(&k);
        }
    }

    /// Blocks not yet fully streamed, in order. Used by cancellation to
    /// transfer the remaining pending blocks back.
    pub fn remaining_blocks(&self) -> Vec<BlockId> {
        self.frozen[self.current.min(self.frozen.len())..]
            .iter()
            .map(|fb| fb.id)
            .collect()
    }

    pub fn stash_len(&self) -> usize {
        self.stash.len()
    }
}
