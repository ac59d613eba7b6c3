//! Table streamer: multiplexes the active stream contexts of one table.
//!
//! A table holds at most one context per stream type. Contexts are a closed
//! sum type rather than trait objects — the table iterates a small vector and
//! dispatches by variant. Mutation notifications fan out to every context
//! before the physical mutation is applied, so a snapshot can stash
//! pre-images and the elastic index never lags.

use kestrel_common::error::{StorageError, StorageResult};
use kestrel_common::types::{BlockId, PartitionId, StreamType, TupleAddress};
use kestrel_common::corruption;

use crate::cow::{CowIterator, CowStep, FrozenBlock};
use crate::elastic::ElasticContext;
use crate::output::TupleOutputStreamProcessor;
use crate::predicate::PredicateList;
use crate::serializer::TupleSerializer;
use crate::table::PersistentTable;
use crate::tuple::TupleRef;

/// Snapshot stream context: drives a [`CowIterator`] over the frozen block
/// set and fans matching rows out to the positional output buffers.
pub struct SnapshotContext {
    partition_id: PartitionId,
    predicates: PredicateList,
    serializer: Box<dyn TupleSerializer>,
    cow: CowIterator,
    /// Active tuples owed at activation.
    total: u64,
    /// Tuples emitted or dropped-by-predicate so far.
    visited: u64,
    scratch: Vec<u8>,
    finished: bool,
}

impl SnapshotContext {
    pub fn new(
        partition_id: PartitionId,
        predicates: PredicateList,
        frozen: Vec<FrozenBlock>,
        total: u64,
        serializer: Box<dyn TupleSerializer>,
    ) -> Self {
        Self {
            partition_id,
            predicates,
            serializer,
            cow: CowIterator::new(frozen),
            total,
            visited: 0,
            scratch: Vec::new(),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn cow(&self) -> &CowIterator {
        &self.cow
    }

    pub fn cow_mut(&mut self) -> &mut CowIterator {
        &mut self.cow
    }

    /// Stream until every output that matters is full or the snapshot is
    /// exhausted. Rows matched by predicate `i` go to output `i`; a row
    /// matching nothing is dropped but still counted. Returns the number of
    /// tuples still owed.
    pub fn handle_stream_more(
        &mut self,
        table: &mut PersistentTable,
        outputs: &mut TupleOutputStreamProcessor,
        deletes: &mut Vec<TupleAddress>,
    ) -> StorageResult<i64> {
        if self.finished {
            return Ok(0);
        }
        let expected = self.predicates.output_count();
        if outputs.stream_count() != expected {
            return Err(StorageError::OutputStreamCountMismatch {
                expected,
                got: outputs.stream_count(),
            });
        }
        outputs.open_all(self.partition_id);

        let mut matched: Vec<usize> = Vec::new();
        loop {
            match self.cow.next_step(table) {
                CowStep::Finished => {
                    self.finished = true;
                    break;
                }
                CowStep::BlockDone(id) => {
                    table.snapshot_block_done(id);
                    self.cow.drop_stash_for(id);
                }
                CowStep::Tuple { addr, stashed } => {
                    let Self {
                        cow,
                        predicates,
                        serializer,
                        scratch,
                        visited,
                        ..
                    } = self;
                    let bytes: &[u8] = if stashed {
                        cow.stashed_bytes(addr)
                            .expect("stashed step has a stash entry")
                    } else {
                        match table.block(addr.block) {
                            Some(b) => b.slot(addr.slot),
                            None => {
                                return Err(corruption!(
                                    "E-COW-010",
                                    "live snapshot tuple in released block {}",
                                    addr
                                ))
                            }
                        }
                    };
                    let tuple = TupleRef::new(table.schema(), bytes);

                    matched.clear();
                    let mut delete_after = false;
                    if predicates.is_empty() {
                        matched.push(0);
                    } else {
                        for (i, p) in predicates.iter().enumerate() {
                            if p.eval(&tuple) == Some(true) {
                                matched.push(i);
                                if p.triggers_delete {
                                    delete_after = true;
                                }
                            }
                        }
                    }
                    if matched.is_empty() {
                        *visited += 1;
                        continue;
                    }

                    scratch.clear();
                    serializer.write_tuple(&tuple, scratch);
                    if !outputs.all_have_room(&matched, scratch.len()) {
                        cow.retreat();
                        break;
                    }
                    for &i in &matched {
                        let wrote = outputs.stream_mut(i).write_row(scratch);
                        debug_assert!(wrote, "probed output rejected row");
                    }
                    *visited += 1;
                    // Delete-after-streaming applies to the live row the
                    // stream just handed off; a stashed yield means the live
                    // row already diverged from the snapshot image.
                    if delete_after && !stashed {
                        deletes.push(addr);
                    }
                }
            }
        }
        outputs.close_all();

        if self.finished && self.cow.stash_len() != 0 {
            return Err(corruption!(
                "E-COW-011",
                "{} pre-images left in stash after snapshot end",
                self.cow.stash_len()
            ));
        }
        Ok(self.total.saturating_sub(self.visited) as i64)
    }
}

/// The closed set of stream context kinds.
pub enum StreamContext {
    Snapshot(SnapshotContext),
    Elastic(ElasticContext),
}

pub struct ActiveStream {
    pub stream_type: StreamType,
    pub context: StreamContext,
}

/// Orchestrator for all active stream contexts on one table.
#[derive(Default)]
pub struct TableStreamer {
    streams: Vec<ActiveStream>,
}

impl TableStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_stream_type(&self, ty: StreamType) -> bool {
        self.streams.iter().any(|s| s.stream_type == ty)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn add_stream(&mut self, stream_type: StreamType, context: StreamContext) {
        debug_assert!(!self.has_stream_type(stream_type));
        self.streams.push(ActiveStream {
            stream_type,
            context,
        });
    }

    pub fn remove_stream(&mut self, ty: StreamType) -> Option<StreamContext> {
        let pos = self.streams.iter().position(|s| s.stream_type == ty)?;
        Some(self.streams.remove(pos).context)
    }

    pub fn elastic_context(&self) -> Option<&ElasticContext> {
        self.streams.iter().find_map(|s| match &s.context {
            StreamContext::Elastic(ctx) => Some(ctx),
            _ => None,
        })
    }

    pub fn elastic_context_mut(&mut self) -> Option<&mut ElasticContext> {
        self.streams.iter_mut().find_map(|s| match &mut s.context {
            StreamContext::Elastic(ctx) => Some(ctx),
            _ => None,
        })
    }

    /// Drive every active context once. Returns the total number of tuples
    /// still owed across contexts, `0` when nothing remains.
    pub fn stream_more(
        &mut self,
        table: &mut PersistentTable,
        outputs: &mut TupleOutputStreamProcessor,
    ) -> StorageResult<i64> {
        let mut remaining_total: i64 = 0;
        let mut deletes: Vec<TupleAddress> = Vec::new();
        let mut snapshot_done = false;

        for stream in &mut self.streams {
            let remaining = match &mut stream.context {
                StreamContext::Snapshot(ctx) => {
                    let r = ctx.handle_stream_more(table, outputs, &mut deletes)?;
                    if ctx.is_finished() {
                        snapshot_done = true;
                    }
                    r
                }
                StreamContext::Elastic(ctx) => ctx.handle_stream_more(table),
            };
            remaining_total += remaining;
        }

        // Apply delete-after-streaming for rows handed off in this call,
        // routing notifications to the remaining contexts ourselves since
        // the streamer is detached from the table right now.
        for addr in deletes {
            table.delete_tuple_routed(addr, self)?;
        }

        if snapshot_done {
            self.streams.retain(|s| {
                !matches!(&s.context, StreamContext::Snapshot(ctx) if ctx.is_finished())
            });
            tracing::info!("snapshot stream complete");
        }
        Ok(remaining_total)
    }

    // ── Mutation notifications (delivered before the physical mutation) ──

    pub fn notify_tuple_insert(&mut self, addr: TupleAddress, hash: i64) {
        for stream in &mut self.streams {
            if let StreamContext::Elastic(ctx) = &mut stream.context {
                ctx.notify_tuple_insert(addr, hash);
            }
        }
    }

    /// Returns `true` when any snapshot stashed the pre-image; the caller
    /// then sets the slot's dirty bit.
    pub fn notify_tuple_update(
        &mut self,
        addr: TupleAddress,
        pre_image: &[u8],
        old_hash: i64,
        new_hash: i64,
        in_pending_block: bool,
        dirty: bool,
    ) -> bool {
        let mut stashed = false;
        for stream in &mut self.streams {
            match &mut stream.context {
                StreamContext::Snapshot(ctx) => {
                    stashed |= ctx
                        .cow_mut()
                        .note_mutation(addr, pre_image, in_pending_block, dirty);
                }
                StreamContext::Elastic(ctx) => {
                    ctx.notify_tuple_update(addr, old_hash, new_hash);
                }
            }
        }
        stashed
    }

    /// Returns `true` when any snapshot stashed the pre-image.
    pub fn notify_tuple_delete(
        &mut self,
        addr: TupleAddress,
        pre_image: &[u8],
        hash: i64,
        in_pending_block: bool,
        dirty: bool,
    ) -> bool {
        let mut stashed = false;
        for stream in &mut self.streams {
            match &mut stream.context {
                StreamContext::Snapshot(ctx) => {
                    stashed |= ctx
                        .cow_mut()
                        .note_mutation(addr, pre_image, in_pending_block, dirty);
                }
                StreamContext::Elastic(ctx) => ctx.notify_tuple_delete(addr, hash),
            }
        }
        stashed
    }

    /// Compaction relocated a tuple. Snapshot contexts are unaffected:
    /// compaction never drains a pending block, and tuples in non-pending
    /// blocks owe the snapshot nothing at their new address either.
    pub fn notify_tuple_movement(&mut self, src: TupleAddress, dst: TupleAddress, hash: i64) {
        for stream in &mut self.streams {
            if let StreamContext::Elastic(ctx) = &mut stream.context {
                ctx.notify_tuple_movement(src, dst, hash);
            }
        }
    }

    pub fn notify_block_compacted_away(&mut self, id: BlockId) {
        for stream in &mut self.streams {
            if let StreamContext::Elastic(ctx) = &mut stream.context {
                ctx.notify_block_compacted_away(id);
            }
        }
    }
}
