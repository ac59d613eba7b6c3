//! Persistent row table: block-backed storage with snapshot and elastic
//! streaming.
//!
//! The engine is single-threaded per partition. Mutations, streaming, and
//! compaction all run on the caller's thread and interleave only at the
//! `stream_more` suspension point, so the table needs no internal locking.
//!
//! Block bookkeeping: every block sits in exactly one of two sets —
//! `pending` (a snapshot still owes output for tuples that were in the block
//! at activation) and `not_pending`. Snapshot activation swaps the two sets
//! wholesale, freezing the current blocks; the COW iterator transfers blocks
//! back one at a time as it finishes them. Each set has a bucket map keyed by
//! free-slot count for best-fit allocation, and compaction only ever drains
//! not-pending blocks.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use kestrel_common::config::StorageConfig;
use kestrel_common::corruption;
use kestrel_common::error::{StorageError, StorageResult};
use kestrel_common::types::{BlockId, PartitionId, StreamType, TableId, TupleAddress};

use crate::block::Block;
use crate::cow::FrozenBlock;
use crate::elastic::{ElasticContext, ElasticIndex};
use crate::output::TupleOutputStreamProcessor;
use crate::pool::BucketMap;
use crate::predicate::PredicateList;
use crate::serializer::{DefaultTupleSerializer, TupleSerializer};
use crate::streamer::{SnapshotContext, StreamContext, TableStreamer};
use crate::tuple::{partition_hash_of, set_dirty, Datum, TupleRef, TupleSchema};
use crate::undo::{UndoAction, UndoLog};

pub struct PersistentTable {
    name: String,
    table_id: TableId,
    partition_id: PartitionId,
    schema: TupleSchema,
    config: StorageConfig,
    /// Slots per block, derived from the block size target and tuple width.
    block_capacity: usize,

    /// All live blocks, ordered by creation (ids are monotonic).
    blocks: BTreeMap<BlockId, Block>,
    next_block_id: u64,

    pending: BTreeSet<BlockId>,
    not_pending: BTreeSet<BlockId>,
    pending_buckets: BucketMap,
    not_pending_buckets: BucketMap,

    /// Primary key → tuple address. Kept current across compaction moves.
    pk_index: HashMap<i64, TupleAddress>,
    active_count: usize,

    streamer: TableStreamer,
    undo: UndoLog,
}

impl PersistentTable {
    pub fn new(
        name: impl Into<String>,
        table_id: TableId,
        partition_id: PartitionId,
        schema: TupleSchema,
        config: StorageConfig,
    ) -> StorageResult<Self> {
        config.validate()?;
        if schema.has_inline_strings() && !config.allow_inline_strings {
            return Err(StorageError::SchemaMismatch(
                "inline string columns require allow_inline_strings".into(),
            ));
        }
        let target = config.effective_block_target_bytes();
        let block_capacity = target / schema.tuple_width();
        if block_capacity == 0 {
            return Err(StorageError::SchemaMismatch(format!(
                "tuple width {} exceeds block allocation target {}",
                schema.tuple_width(),
                target
            )));
        }
        Ok(Self {
            name: name.into(),
            table_id,
            partition_id,
            schema,
            config,
            block_capacity,
            blocks: BTreeMap::new(),
            next_block_id: 0,
            pending: BTreeSet::new(),
            not_pending: BTreeSet::new(),
            pending_buckets: BucketMap::new(),
            not_pending_buckets: BucketMap::new(),
            pk_index: HashMap::new(),
            active_count: 0,
            streamer: TableStreamer::new(),
            undo: UndoLog::new(),
        })
    }

    // ── Introspection ──

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn schema(&self) -> &TupleSchema {
        &self.schema
    }

    pub fn block_capacity(&self) -> usize {
        self.block_capacity
    }

    pub fn active_tuple_count(&self) -> usize {
        self.active_count
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks_pending_snapshot_count(&self) -> usize {
        self.pending.len()
    }

    pub fn blocks_not_pending_snapshot_count(&self) -> usize {
        self.not_pending.len()
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(&id)
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.keys().copied()
    }

    /// Address of the live tuple with the given primary key.
    pub fn lookup_key(&self, key: i64) -> Option<TupleAddress> {
        self.pk_index.get(&key).copied()
    }

    /// View of a live tuple.
    pub fn tuple_ref(&self, addr: TupleAddress) -> Option<TupleRef<'_>> {
        let block = self.blocks.get(&addr.block)?;
        if addr.slot >= block.next_free_index() || !block.is_slot_active(addr.slot) {
            return None;
        }
        Some(TupleRef::new(&self.schema, block.slot(addr.slot)))
    }

    pub fn read_row(&self, addr: TupleAddress) -> Option<Vec<Datum>> {
        self.tuple_ref(addr)
            .map(|t| self.schema.decode_row(t.bytes))
    }

    /// Ordered scan of live tuple addresses: block creation order, then slot
    /// order within each block.
    pub fn iter(&self) -> TableIterator<'_> {
        TableIterator {
            blocks: self.blocks.iter(),
            current: None,
            slot: 0,
        }
    }

    /// True when any ever-used slot still carries the dirty flag.
    pub fn has_dirty_tuples(&self) -> bool {
        self.blocks.values().any(|b| {
            (0..b.next_free_index()).any(|s| b.is_slot_active(s) && b.is_slot_dirty(s))
        })
    }

    // ── Row mutation ──

    /// Insert a row. Fails with `ConstraintViolation` on a duplicate primary
    /// key, with no side effects. Under an active snapshot the new tuple
    /// belongs to the post-snapshot generation and is never streamed.
    pub fn insert_tuple(&mut self, row: &[Datum]) -> StorageResult<TupleAddress> {
        self.schema.check_row(row)?;
        let key = self.schema.key_of(row)?;
        if self.pk_index.contains_key(&key) {
            return Err(StorageError::ConstraintViolation(format!(
                "duplicate primary key {key}"
            )));
        }
        let (addr, in_pending) = self.allocate_slot();
        let hash = partition_hash_of(&row[self.schema.partition_column()]);
        self.streamer.notify_tuple_insert(addr, hash);
        {
            let block = self.blocks.get_mut(&addr.block).expect("freshly allocated");
            let slot = block.slot_mut(addr.slot);
            self.schema.encode_row(row, slot);
            slot[0] = crate::tuple::FLAG_ACTIVE;
            // Tuples born into a snapshot-frozen block postdate the snapshot;
            // the dirty bit tells the COW iterator to skip them.
            if in_pending {
                set_dirty(slot, true);
            }
        }
        self.pk_index.insert(key, addr);
        self.active_count += 1;
        self.undo.record(UndoAction::InsertRow { key });
        Ok(addr)
    }

    /// Overwrite a row in place. If a snapshot still owes this slot its
    /// activation-time image, the pre-image is stashed with the snapshot
    /// context before the bytes change, and the slot is marked dirty.
    pub fn update_tuple(&mut self, addr: TupleAddress, new_row: &[Datum]) -> StorageResult<()> {
        self.schema.check_row(new_row)?;
        let (pre_image, old_key, old_hash, in_pending, dirty) = self.capture_slot(addr)?;
        let new_key = self.schema.key_of(new_row)?;
        if new_key != old_key && self.pk_index.contains_key(&new_key) {
            return Err(StorageError::ConstraintViolation(format!(
                "duplicate primary key {new_key}"
            )));
        }
        let new_hash = partition_hash_of(&new_row[self.schema.partition_column()]);
        let stashed = self.streamer.notify_tuple_update(
            addr, &pre_image, old_hash, new_hash, in_pending, dirty,
        );
        self.undo.record(UndoAction::UpdateRow {
            key: new_key,
            old_row: self.schema.decode_row(&pre_image),
        });
        {
            let block = self.blocks.get_mut(&addr.block).expect("captured above");
            let slot = block.slot_mut(addr.slot);
            self.schema.encode_row(new_row, slot);
            if stashed {
                set_dirty(slot, true);
            }
        }
        if new_key != old_key {
            self.pk_index.remove(&old_key);
            self.pk_index.insert(new_key, addr);
        }
        Ok(())
    }

    /// Delete a row. The pre-image is preserved for any snapshot that has not
    /// yet streamed the slot; the slot is reclaimed to its block's free list.
    pub fn delete_tuple(&mut self, addr: TupleAddress) -> StorageResult<()> {
        let mut streamer = std::mem::take(&mut self.streamer);
        let result = self.delete_tuple_routed(addr, &mut streamer);
        self.streamer = streamer;
        result
    }

    /// Delete with notifications routed through a detached streamer — the
    /// form used from inside `stream_more`, where the table's own streamer
    /// slot is empty.
    pub(crate) fn delete_tuple_routed(
        &mut self,
        addr: TupleAddress,
        streamer: &mut TableStreamer,
    ) -> StorageResult<()> {
        let (pre_image, key, hash, in_pending, dirty) = self.capture_slot(addr)?;
        streamer.notify_tuple_delete(addr, &pre_image, hash, in_pending, dirty);
        self.undo.record(UndoAction::DeleteRow {
            row: self.schema.decode_row(&pre_image),
        });
        self.pk_index.remove(&key);
        self.active_count -= 1;
        self.free_slot_at(addr, streamer);
        Ok(())
    }

    /// Delete every row. Under an active snapshot each unstreamed pre-image
    /// is preserved first, so the snapshot proceeds against the frozen images
    /// while the live table empties. `force` also releases now-empty blocks
    /// that no snapshot holds (the default behavior here — the flag exists
    /// for call-site compatibility with truncation paths).
    pub fn delete_all_tuples(&mut self, _force: bool) -> StorageResult<()> {
        let addrs: Vec<TupleAddress> = self.iter().collect();
        let count = addrs.len();
        for addr in addrs {
            self.delete_tuple(addr)?;
        }
        if count > 0 {
            tracing::info!(table = %self.name, deleted = count, "all tuples deleted");
        }
        Ok(())
    }

    /// Pre-mutation capture of a slot: full byte image, key, partition hash,
    /// pending-set membership, and dirty flag.
    fn capture_slot(
        &self,
        addr: TupleAddress,
    ) -> StorageResult<(Vec<u8>, i64, i64, bool, bool)> {
        let block = self
            .blocks
            .get(&addr.block)
            .ok_or(StorageError::TupleNotFound(addr))?;
        if addr.slot >= block.next_free_index() || !block.is_slot_active(addr.slot) {
            return Err(StorageError::TupleNotFound(addr));
        }
        let bytes = block.slot(addr.slot);
        let tuple = TupleRef::new(&self.schema, bytes);
        Ok((
            bytes.to_vec(),
            tuple.key(),
            tuple.partition_hash(),
            self.pending.contains(&addr.block),
            tuple.is_dirty(),
        ))
    }

    // ── Slot and block management ──

    /// Best-fit allocation: the fullest non-full block in the not-pending
    /// set, then any block with room, then a fresh block. Ties break by
    /// block creation order.
    fn allocate_slot(&mut self) -> (TupleAddress, bool) {
        if let Some(id) = self.not_pending_buckets.best_fit() {
            return (self.alloc_in(id, false), false);
        }
        if let Some(id) = self.pending_buckets.best_fit() {
            return (self.alloc_in(id, true), true);
        }
        let id = self.new_block();
        (self.alloc_in(id, false), false)
    }

    fn alloc_in(&mut self, id: BlockId, in_pending: bool) -> TupleAddress {
        let block = self.blocks.get_mut(&id).expect("allocation target exists");
        let old = block.bucket();
        let slot = block.allocate().expect("best-fit block has room");
        let new = block.bucket();
        let map = if in_pending {
            &mut self.pending_buckets
        } else {
            &mut self.not_pending_buckets
        };
        map.rebucket(id, old, new);
        TupleAddress::new(id, slot)
    }

    fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.next_block_id);
        self.next_block_id += 1;
        let block = Block::new(id, self.schema.tuple_width(), self.block_capacity);
        let bucket = block.bucket();
        self.blocks.insert(id, block);
        self.not_pending.insert(id);
        self.not_pending_buckets.insert(id, bucket);
        tracing::debug!(table = %self.name, block = %id, capacity = self.block_capacity, "allocated block");
        id
    }

    fn free_slot_at(&mut self, addr: TupleAddress, streamer: &mut TableStreamer) {
        let in_pending = self.pending.contains(&addr.block);
        let (empty, old, new) = {
            let block = self.blocks.get_mut(&addr.block).expect("freeing in live block");
            let old = block.bucket();
            block.free(addr.slot);
            (block.is_empty(), old, block.bucket())
        };
        if in_pending {
            // Snapshot still references the block; it stays resident (even
            // empty) until the COW iterator passes it.
            self.pending_buckets.rebucket(addr.block, old, new);
        } else {
            self.not_pending_buckets.rebucket(addr.block, old, new);
            if empty {
                self.release_block_routed(addr.block, streamer);
            }
        }
    }

    fn release_block_routed(&mut self, id: BlockId, streamer: &mut TableStreamer) {
        if let Some(block) = self.blocks.remove(&id) {
            debug_assert!(block.is_empty());
            self.not_pending.remove(&id);
            self.not_pending_buckets.remove(id, block.bucket());
            streamer.notify_block_compacted_away(id);
            tracing::debug!(table = %self.name, block = %id, "released empty block");
        }
    }

    /// The COW iterator finished a block: transfer it back from the pending
    /// set, clear surviving dirty bits, and drop it entirely if it emptied
    /// while frozen. Idempotent.
    pub(crate) fn snapshot_block_done(&mut self, id: BlockId) {
        if !self.pending.remove(&id) {
            return;
        }
        if let Some(block) = self.blocks.get_mut(&id) {
            block.clear_all_dirty();
            let bucket = block.bucket();
            self.pending_buckets.remove(id, bucket);
            if block.is_empty() {
                self.blocks.remove(&id);
                tracing::debug!(table = %self.name, block = %id, "released block after snapshot");
            } else {
                self.not_pending.insert(id);
                self.not_pending_buckets.insert(id, bucket);
            }
        }
    }

    // ── Compaction ──

    /// Drain sparse blocks into denser ones until no block crosses the
    /// configured free-count threshold. Pending-snapshot blocks are frozen in
    /// place and are neither drained nor used as targets. Every move updates
    /// the primary key index and fires a movement notification on every
    /// active stream context.
    ///
    /// Returns the post-move addresses of relocated tuples so rebalance
    /// bookkeeping can account for them.
    pub fn do_forced_compaction(&mut self) -> StorageResult<Vec<TupleAddress>> {
        let mut streamer = std::mem::take(&mut self.streamer);
        let result = self.compaction_routed(&mut streamer);
        self.streamer = streamer;
        result
    }

    fn compaction_routed(
        &mut self,
        streamer: &mut TableStreamer,
    ) -> StorageResult<Vec<TupleAddress>> {
        let threshold = ((self.block_capacity as f64 * self.config.compaction_threshold_ratio)
            .ceil() as usize)
            .max(1);
        let mut moved: Vec<TupleAddress> = Vec::new();
        'outer: loop {
            // Drain candidate: the emptiest not-pending block at or above the
            // threshold that still holds tuples; ties go to the oldest block.
            let candidate = self
                .not_pending
                .iter()
                .filter_map(|id| self.blocks.get(id))
                .filter(|b| b.free_count() >= threshold && b.used_count() > 0)
                .max_by(|a, b| {
                    a.free_count()
                        .cmp(&b.free_count())
                        .then(b.id().cmp(&a.id()))
                })
                .map(|b| b.id());
            let Some(lo) = candidate else { break };

            for slot in self.blocks[&lo].active_slots() {
                let Some(dst_id) = self.not_pending_buckets.best_fit_excluding(lo) else {
                    break 'outer;
                };
                if self.blocks[&dst_id].free_count() >= self.blocks[&lo].free_count() {
                    // No denser block to absorb the tuples.
                    break 'outer;
                }
                let src = TupleAddress::new(lo, slot);
                let bytes = self.blocks[&lo].slot(slot).to_vec();
                let dst = self.alloc_in(dst_id, false);
                self.blocks
                    .get_mut(&dst_id)
                    .expect("target exists")
                    .slot_mut(dst.slot)
                    .copy_from_slice(&bytes);
                let tuple = TupleRef::new(&self.schema, &bytes);
                let (key, hash) = (tuple.key(), tuple.partition_hash());
                self.pk_index.insert(key, dst);
                streamer.notify_tuple_movement(src, dst, hash);
                {
                    let block = self.blocks.get_mut(&lo).expect("draining live block");
                    let old = block.bucket();
                    block.free(slot);
                    let new = block.bucket();
                    self.not_pending_buckets.rebucket(lo, old, new);
                }
                moved.push(dst);
            }
            if self.blocks[&lo].is_empty() {
                self.release_block_routed(lo, streamer);
            } else {
                break;
            }
        }
        if !moved.is_empty() {
            tracing::info!(table = %self.name, moved = moved.len(), "forced compaction relocated tuples");
        }
        Ok(moved)
    }

    // ── Streaming ──

    /// Activate a stream of the given type with the default serializer.
    pub fn activate_stream(
        &mut self,
        stream_type: StreamType,
        predicate_strings: &[String],
    ) -> StorageResult<()> {
        self.activate_stream_with_serializer(
            stream_type,
            predicate_strings,
            Box::new(DefaultTupleSerializer),
        )
    }

    /// Activate a stream. For `Snapshot` this swaps the pending/not-pending
    /// block sets and bucket maps, freezing the current blocks against
    /// compaction. `ElasticIndex` freezes nothing — compaction stays legal
    /// and the movement notifications keep the index coherent.
    pub fn activate_stream_with_serializer(
        &mut self,
        stream_type: StreamType,
        predicate_strings: &[String],
        serializer: Box<dyn TupleSerializer>,
    ) -> StorageResult<()> {
        if self.streamer.has_stream_type(stream_type) {
            return Err(StorageError::StreamAlreadyActive(stream_type));
        }
        let predicates = PredicateList::parse(predicate_strings)?;
        match stream_type {
            StreamType::Snapshot => {
                std::mem::swap(&mut self.pending, &mut self.not_pending);
                std::mem::swap(&mut self.pending_buckets, &mut self.not_pending_buckets);
                let frozen: Vec<FrozenBlock> = self
                    .pending
                    .iter()
                    .map(|id| FrozenBlock {
                        id: *id,
                        used_bound: self.blocks[id].next_free_index(),
                    })
                    .collect();
                let total = self.active_count as u64;
                tracing::info!(
                    table = %self.name,
                    tuples = total,
                    blocks = frozen.len(),
                    predicates = predicates.len(),
                    "snapshot stream activated"
                );
                self.streamer.add_stream(
                    stream_type,
                    StreamContext::Snapshot(SnapshotContext::new(
                        self.partition_id,
                        predicates,
                        frozen,
                        total,
                        serializer,
                    )),
                );
            }
            StreamType::ElasticIndex => {
                tracing::info!(table = %self.name, "elastic index stream activated");
                self.streamer.add_stream(
                    stream_type,
                    StreamContext::Elastic(ElasticContext::new(
                        predicates,
                        self.config.tuples_per_call,
                    )),
                );
            }
            StreamType::Recovery => {
                return Err(StorageError::UnsupportedStreamType(stream_type));
            }
        }
        Ok(())
    }

    /// Drive every active stream context once. Returns the number of tuples
    /// still owed across contexts, `0` when all streaming is done. A stream
    /// error aborts the snapshot: its context is discarded and its blocks are
    /// transferred back, leaving the partition usable.
    pub fn stream_more(
        &mut self,
        outputs: &mut TupleOutputStreamProcessor,
    ) -> StorageResult<i64> {
        let mut streamer = std::mem::take(&mut self.streamer);
        let result = streamer.stream_more(self, outputs);
        self.streamer = streamer;
        match result {
            Ok(remaining) => Ok(remaining),
            Err(e) => {
                let _ = self.deactivate_stream(StreamType::Snapshot);
                Err(e)
            }
        }
    }

    /// Cancel a stream. Idempotent: deactivating an absent type is a no-op.
    /// A cancelled snapshot transfers its remaining pending blocks back and
    /// clears their dirty flags.
    pub fn deactivate_stream(&mut self, stream_type: StreamType) -> StorageResult<()> {
        match self.streamer.remove_stream(stream_type) {
            None => Ok(()),
            Some(StreamContext::Snapshot(ctx)) => {
                for id in ctx.cow().remaining_blocks() {
                    self.snapshot_block_done(id);
                }
                tracing::info!(table = %self.name, "snapshot stream deactivated");
                Ok(())
            }
            Some(StreamContext::Elastic(_)) => {
                tracing::info!(table = %self.name, "elastic index stream deactivated");
                Ok(())
            }
        }
    }

    /// The elastic index built by an active `ElasticIndex` stream.
    pub fn elastic_index(&self) -> Option<&ElasticIndex> {
        self.streamer.elastic_context().map(ElasticContext::index)
    }

    pub fn elastic_build_complete(&self) -> bool {
        self.streamer
            .elastic_context()
            .map(ElasticContext::is_build_complete)
            .unwrap_or(false)
    }

    /// Adjust the elastic build throttle. Returns `false` when no elastic
    /// stream is active.
    pub fn set_elastic_tuples_per_call(&mut self, n: usize) -> bool {
        match self.streamer.elastic_context_mut() {
            Some(ctx) => {
                ctx.set_tuples_per_call(n);
                true
            }
            None => false,
        }
    }

    /// Frozen view of the current block list, as a snapshot activation would
    /// capture it.
    pub fn freeze_block_list(&self) -> Vec<FrozenBlock> {
        self.blocks
            .values()
            .map(|b| FrozenBlock {
                id: b.id(),
                used_bound: b.next_free_index(),
            })
            .collect()
    }

    // ── Undo ──

    /// Open the undo quantum for `token`; subsequent mutations record their
    /// inverses into it.
    pub fn set_undo_token(&mut self, token: i64) {
        self.undo.set_token(token);
    }

    /// Roll back every quantum at or after `token` by replaying inverse
    /// actions through the normal mutation paths (so snapshots and indexes
    /// observe the rollback like any other mutation).
    pub fn undo_to_token(&mut self, token: i64) -> StorageResult<()> {
        let actions = self.undo.take_from(token);
        self.undo.set_recording(false);
        let mut result = Ok(());
        for action in actions {
            if let Err(e) = self.apply_undo(action) {
                result = Err(e);
                break;
            }
        }
        self.undo.set_recording(true);
        result
    }

    /// Make every quantum at or below `token` permanent.
    pub fn release_undo_token(&mut self, token: i64) {
        self.undo.release_through(token);
    }

    fn apply_undo(&mut self, action: UndoAction) -> StorageResult<()> {
        match action {
            UndoAction::InsertRow { key } => match self.lookup_key(key) {
                Some(addr) => self.delete_tuple(addr),
                None => Err(corruption!(
                    "E-UNDO-001",
                    "undo of insert: key {} not in table",
                    key
                )),
            },
            UndoAction::DeleteRow { row } => self.insert_tuple(&row).map(|_| ()),
            UndoAction::UpdateRow { key, old_row } => match self.lookup_key(key) {
                Some(addr) => self.update_tuple(addr, &old_row),
                None => Err(corruption!(
                    "E-UNDO-002",
                    "undo of update: key {} not in table",
                    key
                )),
            },
        }
    }
}

/// Ordered iterator over live tuple addresses.
pub struct TableIterator<'a> {
    blocks: std::collections::btree_map::Iter<'a, BlockId, Block>,
    current: Option<&'a Block>,
    slot: u32,
}

impl<'a> Iterator for TableIterator<'a> {
    type Item = TupleAddress;

    fn next(&mut self) -> Option<TupleAddress> {
        loop {
            let block = match self.current {
                Some(b) => b,
                None => {
                    let (_, b) = self.blocks.next()?;
                    self.current = Some(b);
                    self.slot = 0;
                    b
                }
            };
            while self.slot < block.next_free_index() {
                let slot = self.slot;
                self.slot += 1;
                if block.is_slot_active(slot) {
                    return Some(TupleAddress::new(block.id(), slot));
                }
            }
            self.current = None;
        }
    }
}
