//! Per-predicate tuple output buffers.
//!
//! Each output stream frames rows for one predicate:
//!
//! ```text
//! [ int32 partition_id ][ int32 row_count ]
//!   repeat row_count times: [ int32 tuple_length_bytes ][ tuple bytes ]
//! [ int32 terminator = 0 ]
//! ```
//!
//! All integers big-endian; `tuple_length_bytes` excludes its own prefix. The
//! row count is a placeholder until `close` patches it. Writers must probe
//! `has_room_for` before writing a row — a row is written whole or not at
//! all, and a shortfall is back-pressure, not an error.

use bytes::BufMut;
use kestrel_common::types::PartitionId;

const HEADER_BYTES: usize = 8;
const ROW_COUNT_OFFSET: usize = 4;
const LENGTH_PREFIX_BYTES: usize = 4;
const TERMINATOR_BYTES: usize = 4;

pub struct TupleOutputStream {
    buf: Vec<u8>,
    capacity: usize,
    row_count: u32,
    opened: bool,
    closed: bool,
}

impl TupleOutputStream {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(
            capacity >= HEADER_BYTES + TERMINATOR_BYTES,
            "buffer cannot hold even an empty frame"
        );
        Self {
            buf: Vec::with_capacity(capacity.min(1 << 20)),
            capacity,
            row_count: 0,
            opened: false,
            closed: false,
        }
    }

    /// Write the frame header. Idempotent within one streaming call.
    pub fn open(&mut self, partition_id: PartitionId) {
        if self.opened {
            return;
        }
        self.opened = true;
        self.buf.put_i32(partition_id.0);
        self.buf.put_i32(0); // row count, patched on close
    }

    /// True when a row of `row_len` bytes fits, leaving room for the
    /// terminator the frame still owes.
    pub fn has_room_for(&self, row_len: usize) -> bool {
        self.buf.len() + LENGTH_PREFIX_BYTES + row_len + TERMINATOR_BYTES <= self.capacity
    }

    /// Append one length-prefixed row. Returns `false` (writing nothing)
    /// when the row does not fit.
    pub fn write_row(&mut self, row: &[u8]) -> bool {
        debug_assert!(self.opened && !self.closed);
        if !self.has_room_for(row.len()) {
            return false;
        }
        self.buf.put_i32(row.len() as i32);
        self.buf.put_slice(row);
        self.row_count += 1;
        true
    }

    /// Patch the row count and write the terminator.
    pub fn close(&mut self) {
        if !self.opened || self.closed {
            return;
        }
        self.closed = true;
        let count = (self.row_count as i32).to_be_bytes();
        self.buf[ROW_COUNT_OFFSET..ROW_COUNT_OFFSET + 4].copy_from_slice(&count);
        self.buf.put_i32(0);
    }

    /// Bytes written so far. Zero when the stream was never opened.
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Positional collection of output streams: rows matched by predicate `i` go
/// to stream `i`, which exists even when it receives nothing.
#[derive(Default)]
pub struct TupleOutputStreamProcessor {
    streams: Vec<TupleOutputStream>,
}

impl TupleOutputStreamProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// One stream — the common single-predicate snapshot shape.
    pub fn single(capacity: usize) -> Self {
        let mut p = Self::new();
        p.add(capacity);
        p
    }

    /// `count` streams of `capacity` bytes each.
    pub fn with_streams(count: usize, capacity: usize) -> Self {
        let mut p = Self::new();
        for _ in 0..count {
            p.add(capacity);
        }
        p
    }

    pub fn add(&mut self, capacity: usize) {
        self.streams.push(TupleOutputStream::new(capacity));
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream(&self, i: usize) -> &TupleOutputStream {
        &self.streams[i]
    }

    pub fn stream_mut(&mut self, i: usize) -> &mut TupleOutputStream {
        &mut self.streams[i]
    }

    pub fn open_all(&mut self, partition_id: PartitionId) {
        for s in &mut self.streams {
            s.open(partition_id);
        }
    }

    pub fn close_all(&mut self) {
        for s in &mut self.streams {
            s.close();
        }
    }

    /// True when every stream listed can take a row of `row_len` bytes.
    pub fn all_have_room(&self, indexes: &[usize], row_len: usize) -> bool {
        indexes.iter().all(|&i| self.streams[i].has_room_for(row_len))
    }

    /// Current byte positions of every stream, reported back to the caller
    /// when a streaming call yields.
    pub fn positions(&self) -> Vec<usize> {
        self.streams.iter().map(|s| s.position()).collect()
    }
}
