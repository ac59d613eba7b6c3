//! Identifier types shared across the storage and streaming layers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a table within a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub u32);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table:{}", self.0)
    }
}

/// Identifier of the partition an engine instance serves. Written verbatim
/// into the header of every serialized output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub i32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition:{}", self.0)
    }
}

/// Identifier of a tuple block. Ids are assigned from a per-table monotonic
/// counter and never reused, so ordering by id is creation order and a
/// released block's id stays dead forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block:{}", self.0)
    }
}

/// Stable address of a tuple slot: block id plus slot index within the block.
///
/// Tuple identity is address equality. Addresses survive every operation
/// except compaction, which relocates tuples and announces the new address
/// through movement notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TupleAddress {
    pub block: BlockId,
    pub slot: u32,
}

impl TupleAddress {
    pub fn new(block: BlockId, slot: u32) -> Self {
        Self { block, slot }
    }
}

impl fmt::Display for TupleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.block, self.slot)
    }
}

/// Kind of table stream a context serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    /// Consistent point-in-time snapshot of the table.
    Snapshot,
    /// Elastic rebalance index build over surviving tuples.
    ElasticIndex,
    /// Reserved for node recovery streaming.
    Recovery,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Snapshot => "snapshot",
            StreamType::ElasticIndex => "elastic-index",
            StreamType::Recovery => "recovery",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
