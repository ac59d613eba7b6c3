//! Elastic rebalance support: resilient scanner, hash-ordered tuple index,
//! and the stream context that builds the index incrementally.
//!
//! Unlike a snapshot, an elastic stream freezes nothing: mutation and
//! compaction continue while the scanner walks the table, and movement
//! notifications keep the index addresses current. The scanner's guarantees
//! are deliberately loose — every tuple present at scan start is either
//! yielded, deleted, updated away, or relocated by compaction; and nothing is
//! yielded that was not present at start, inserted, or updated in.

use std::collections::BTreeSet;

use kestrel_common::types::{BlockId, TupleAddress};

use crate::predicate::PredicateList;
use crate::table::PersistentTable;

/// Sorted index of `(partition hash, tuple address)` pairs, ordered by hash
/// then address. The rebalancer walks a hash range of this index to stream
/// tuples out of the partition.
#[derive(Debug, Default)]
pub struct ElasticIndex {
    entries: BTreeSet<(i64, TupleAddress)>,
}

impl ElasticIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the entry was already present.
    pub fn insert(&mut self, hash: i64, addr: TupleAddress) -> bool {
        self.entries.insert((hash, addr))
    }

    /// Returns `true` if the entry existed.
    pub fn erase(&mut self, hash: i64, addr: TupleAddress) -> bool {
        self.entries.remove(&(hash, addr))
    }

    pub fn has(&self, hash: i64, addr: TupleAddress) -> bool {
        self.entries.contains(&(hash, addr))
    }

    /// Rewrite an entry's address after compaction moved the tuple.
    /// Returns `true` when an entry was rewritten.
    pub fn move_entry(&mut self, hash: i64, old: TupleAddress, new: TupleAddress) -> bool {
        if self.entries.remove(&(hash, old)) {
            self.entries.insert((hash, new));
            true
        } else {
            false
        }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in hash order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, TupleAddress)> + '_ {
        self.entries.iter().copied()
    }

    /// Entries whose hash falls in `[start, end)`.
    pub fn range(&self, start: i64, end: i64) -> impl Iterator<Item = (i64, TupleAddress)> + '_ {
        let lo = (start, TupleAddress::new(BlockId(0), 0));
        let hi = (end, TupleAddress::new(BlockId(0), 0));
        self.entries.range(lo..hi).copied()
    }
}

/// Forward table traversal that survives concurrent mutation and compaction.
///
/// The position is a weak `(block id, slot index)` pair: before every step
/// the block id is revalidated against the live block map, and a block that
/// was compacted away is simply skipped — its surviving tuples were relocated
/// and are accounted for by movement notifications. Completed blocks are
/// remembered so moved-in tuples are not yielded twice.
#[derive(Debug, Default)]
pub struct ElasticScanner {
    current: Option<BlockId>,
    cursor: u32,
    visited: BTreeSet<BlockId>,
    yielded: u64,
}

impl ElasticScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Yield the next live tuple, or `None` when every live block has been
    /// walked. Blocks created during the scan are walked too; their tuples
    /// are recent inserts, which the soundness contract permits.
    pub fn next(&mut self, table: &PersistentTable) -> Option<TupleAddress> {
        loop {
            let cur = match self.current {
                Some(id) if table.block(id).is_some() => id,
                Some(id) => {
                    // Compacted away under us; anything unvisited in it was
                    // relocated and reported through movement notifications.
                    self.visited.insert(id);
                    self.current = None;
                    self.cursor = 0;
                    continue;
                }
                None => match table.block_ids().find(|id| !self.visited.contains(id)) {
                    Some(id) => {
                        self.current = Some(id);
                        self.cursor = 0;
                        id
                    }
                    None => return None,
                },
            };
            let block = table.block(cur).expect("revalidated above");
            while self.cursor < block.next_free_index() {
                let slot = self.cursor;
                self.cursor += 1;
                if block.is_slot_active(slot) {
                    self.yielded += 1;
                    return Some(TupleAddress::new(cur, slot));
                }
            }
            self.visited.insert(cur);
            self.current = None;
            self.cursor = 0;
        }
    }

    /// Forget a released block. Ids are never reused, so this only bounds the
    /// visited set's memory.
    pub fn forget_block(&mut self, id: BlockId) {
        if self.current != Some(id) {
            self.visited.remove(&id);
        }
    }

    pub fn yielded_count(&self) -> u64 {
        self.yielded
    }
}

/// Stream context for `StreamType::ElasticIndex`: builds the elastic index
/// at a bounded rate and keeps it exact under mutation notifications.
pub struct ElasticContext {
    predicates: PredicateList,
    index: ElasticIndex,
    scanner: ElasticScanner,
    tuples_per_call: usize,
    build_complete: bool,
}

impl ElasticContext {
    pub fn new(predicates: PredicateList, tuples_per_call: usize) -> Self {
        Self {
            predicates,
            index: ElasticIndex::new(),
            scanner: ElasticScanner::new(),
            tuples_per_call: tuples_per_call.max(1),
            build_complete: false,
        }
    }

    pub fn index(&self) -> &ElasticIndex {
        &self.index
    }

    pub fn is_build_complete(&self) -> bool {
        self.build_complete
    }

    pub fn set_tuples_per_call(&mut self, n: usize) {
        self.tuples_per_call = n.max(1);
    }

    /// One bounded unit of index building. Returns the (estimated) number of
    /// tuples still to visit; `0` exactly when the build is complete. Elastic
    /// streaming writes nothing to the output buffers.
    pub fn handle_stream_more(&mut self, table: &PersistentTable) -> i64 {
        if self.build_complete {
            return 0;
        }
        for _ in 0..self.tuples_per_call {
            match self.scanner.next(table) {
                Some(addr) => {
                    let tuple = table.tuple_ref(addr).expect("scanner yields live slots");
                    let hash = tuple.partition_hash();
                    if self.predicates.matches_hash(hash) {
                        self.index.insert(hash, addr);
                    }
                }
                None => {
                    self.build_complete = true;
                    tracing::info!(
                        entries = self.index.size(),
                        visited = self.scanner.yielded_count(),
                        "elastic index build complete"
                    );
                    return 0;
                }
            }
        }
        (table.active_tuple_count() as i64 - self.scanner.yielded_count() as i64).max(1)
    }

    // ── Mutation notifications ──

    pub fn notify_tuple_insert(&mut self, addr: TupleAddress, hash: i64) {
        if self.predicates.matches_hash(hash) {
            self.index.insert(hash, addr);
        }
    }

    pub fn notify_tuple_update(&mut self, addr: TupleAddress, old_hash: i64, new_hash: i64) {
        if old_hash == new_hash {
            return;
        }
        self.index.erase(old_hash, addr);
        if self.predicates.matches_hash(new_hash) {
            self.index.insert(new_hash, addr);
        }
    }

    pub fn notify_tuple_delete(&mut self, addr: TupleAddress, hash: i64) {
        self.index.erase(hash, addr);
    }

    pub fn notify_tuple_movement(&mut self, src: TupleAddress, dst: TupleAddress, hash: i64) {
        if !self.index.move_entry(hash, src, dst) && self.predicates.matches_hash(hash) {
            // The tuple was not indexed yet (scan has not reached it); index
            // it now under its new address so the scan missing it is harmless.
            self.index.insert(hash, dst);
        }
    }

    pub fn notify_block_compacted_away(&mut self, id: BlockId) {
        self.scanner.forget_block(id);
    }
}
