//! Fixed-width tuple slot layout.
//!
//! A slot is `tuple_width` bytes: one flags byte followed by column storage.
//! Flag bit 0 is `active` (the slot holds a logically present row), bit 1 is
//! `dirty` (the slot was mutated, or inserted, while its block was pending a
//! snapshot). Column data is fixed-width per the schema; inline strings are
//! length-byte-prefixed within a fixed-capacity region.

use kestrel_common::error::{StorageError, StorageResult};
use xxhash_rust::xxh3::xxh3_64;

pub const FLAG_ACTIVE: u8 = 0x01;
pub const FLAG_DIRTY: u8 = 0x02;

/// Column storage types supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int32,
    Int64,
    /// Variable-width string inlined into the tuple with a fixed capacity.
    /// Requires the `allow_inline_strings` configuration option.
    InlineString { max_len: u8 },
}

impl ColumnType {
    /// Bytes this column occupies inside a tuple slot.
    pub fn storage_size(&self) -> usize {
        match self {
            ColumnType::Int32 => 4,
            ColumnType::Int64 => 8,
            ColumnType::InlineString { max_len } => 1 + *max_len as usize,
        }
    }

    pub fn is_inline_string(&self) -> bool {
        matches!(self, ColumnType::InlineString { .. })
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datum {
    Int32(i32),
    Int64(i64),
    Str(String),
}

impl Datum {
    /// Widen integer datums to `i64` for predicate arithmetic. `None` for
    /// non-numeric values.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int32(v) => Some(*v as i64),
            Datum::Int64(v) => Some(*v),
            Datum::Str(_) => None,
        }
    }
}

/// The fixed 64-bit partition hash, agreed with the rebalance plane.
///
/// Integers are widened to `i64` before hashing so 32- and 64-bit partition
/// columns holding the same value hash identically. The result is masked into
/// the non-negative range so rebalance hash ranges can be expressed as
/// `[start, end)` over `0..=i64::MAX`.
pub fn partition_hash_of(datum: &Datum) -> i64 {
    let h = match datum {
        Datum::Int32(v) => xxh3_64(&(*v as i64).to_le_bytes()),
        Datum::Int64(v) => xxh3_64(&v.to_le_bytes()),
        Datum::Str(s) => xxh3_64(s.as_bytes()),
    };
    (h & i64::MAX as u64) as i64
}

/// Schema of a fixed-width tuple: column types, the primary key column, and
/// the partition column.
#[derive(Debug, Clone)]
pub struct TupleSchema {
    columns: Vec<ColumnType>,
    /// Byte offset of each column within a slot (flags byte included).
    offsets: Vec<usize>,
    tuple_width: usize,
    key_column: usize,
    partition_column: usize,
}

impl TupleSchema {
    pub fn new(
        columns: Vec<ColumnType>,
        key_column: usize,
        partition_column: usize,
    ) -> StorageResult<Self> {
        if columns.is_empty() {
            return Err(StorageError::SchemaMismatch("schema has no columns".into()));
        }
        if key_column >= columns.len() || partition_column >= columns.len() {
            return Err(StorageError::SchemaMismatch(format!(
                "key column {} / partition column {} out of range for {} columns",
                key_column,
                partition_column,
                columns.len()
            )));
        }
        if columns[key_column].is_inline_string() {
            return Err(StorageError::SchemaMismatch(
                "primary key column must be an integer type".into(),
            ));
        }
        let mut offsets = Vec::with_capacity(columns.len());
        let mut off = 1usize;
        for col in &columns {
            offsets.push(off);
            off += col.storage_size();
        }
        Ok(Self {
            columns,
            offsets,
            tuple_width: off,
            key_column,
            partition_column,
        })
    }

    /// Slot width in bytes, flags byte included.
    pub fn tuple_width(&self) -> usize {
        self.tuple_width
    }

    pub fn columns(&self) -> &[ColumnType] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn key_column(&self) -> usize {
        self.key_column
    }

    pub fn partition_column(&self) -> usize {
        self.partition_column
    }

    pub fn has_inline_strings(&self) -> bool {
        self.columns.iter().any(|c| c.is_inline_string())
    }

    /// Validate a row against this schema. Must pass before `encode_row`.
    pub fn check_row(&self, row: &[Datum]) -> StorageResult<()> {
        if row.len() != self.columns.len() {
            return Err(StorageError::SchemaMismatch(format!(
                "row has {} values, schema has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        for (i, (datum, col)) in row.iter().zip(&self.columns).enumerate() {
            let ok = match (datum, col) {
                (Datum::Int32(_), ColumnType::Int32) => true,
                (Datum::Int64(_), ColumnType::Int64) => true,
                (Datum::Str(s), ColumnType::InlineString { max_len }) => {
                    s.len() <= *max_len as usize
                }
                _ => false,
            };
            if !ok {
                return Err(StorageError::SchemaMismatch(format!(
                    "column {} value {:?} does not fit {:?}",
                    i, datum, col
                )));
            }
        }
        Ok(())
    }

    /// Extract the primary key as `i64` from a row.
    pub fn key_of(&self, row: &[Datum]) -> StorageResult<i64> {
        row.get(self.key_column)
            .and_then(Datum::as_i64)
            .ok_or_else(|| StorageError::SchemaMismatch("non-integer primary key value".into()))
    }

    /// Write a row's column bytes into a slot. Flags are left untouched.
    /// The row must have passed `check_row`.
    pub fn encode_row(&self, row: &[Datum], slot: &mut [u8]) {
        debug_assert_eq!(slot.len(), self.tuple_width);
        debug_assert_eq!(row.len(), self.columns.len());
        for (i, datum) in row.iter().enumerate() {
            let off = self.offsets[i];
            match (datum, &self.columns[i]) {
                (Datum::Int32(v), ColumnType::Int32) => {
                    slot[off..off + 4].copy_from_slice(&v.to_le_bytes());
                }
                (Datum::Int64(v), ColumnType::Int64) => {
                    slot[off..off + 8].copy_from_slice(&v.to_le_bytes());
                }
                (Datum::Str(s), ColumnType::InlineString { max_len }) => {
                    let cap = *max_len as usize;
                    slot[off] = s.len() as u8;
                    slot[off + 1..off + 1 + s.len()].copy_from_slice(s.as_bytes());
                    for b in &mut slot[off + 1 + s.len()..off + 1 + cap] {
                        *b = 0;
                    }
                }
                _ => debug_assert!(false, "encode_row called with unchecked row"),
            }
        }
    }

    /// Decode one column from a slot.
    pub fn decode_column(&self, slot: &[u8], column: usize) -> Datum {
        let off = self.offsets[column];
        match &self.columns[column] {
            ColumnType::Int32 => {
                Datum::Int32(i32::from_le_bytes(slot[off..off + 4].try_into().unwrap()))
            }
            ColumnType::Int64 => {
                Datum::Int64(i64::from_le_bytes(slot[off..off + 8].try_into().unwrap()))
            }
            ColumnType::InlineString { .. } => {
                let len = slot[off] as usize;
                Datum::Str(String::from_utf8_lossy(&slot[off + 1..off + 1 + len]).into_owned())
            }
        }
    }

    /// Decode every column of a slot.
    pub fn decode_row(&self, slot: &[u8]) -> Vec<Datum> {
        (0..self.columns.len())
            .map(|i| self.decode_column(slot, i))
            .collect()
    }
}

/// Borrowed view of one tuple slot.
#[derive(Clone, Copy)]
pub struct TupleRef<'a> {
    pub schema: &'a TupleSchema,
    pub bytes: &'a [u8],
}

impl<'a> TupleRef<'a> {
    pub fn new(schema: &'a TupleSchema, bytes: &'a [u8]) -> Self {
        debug_assert_eq!(bytes.len(), schema.tuple_width());
        Self { schema, bytes }
    }

    pub fn is_active(&self) -> bool {
        self.bytes[0] & FLAG_ACTIVE != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.bytes[0] & FLAG_DIRTY != 0
    }

    pub fn get(&self, column: usize) -> Datum {
        self.schema.decode_column(self.bytes, column)
    }

    /// Primary key value.
    pub fn key(&self) -> i64 {
        self.get(self.schema.key_column())
            .as_i64()
            .expect("key column is integer by schema construction")
    }

    /// Partition hash of this tuple's partition column value.
    pub fn partition_hash(&self) -> i64 {
        partition_hash_of(&self.get(self.schema.partition_column()))
    }
}

/// Set or clear the `active` flag bit of a slot.
pub fn set_active(slot: &mut [u8], on: bool) {
    if on {
        slot[0] |= FLAG_ACTIVE;
    } else {
        slot[0] &= !FLAG_ACTIVE;
    }
}

/// Set or clear the `dirty` flag bit of a slot.
pub fn set_dirty(slot: &mut [u8], on: bool) {
    if on {
        slot[0] |= FLAG_DIRTY;
    } else {
        slot[0] &= !FLAG_DIRTY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TupleSchema {
        TupleSchema::new(
            vec![
                ColumnType::Int32,
                ColumnType::Int32,
                ColumnType::Int64,
                ColumnType::Int64,
            ],
            0,
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_tuple_flags_round_trip() {
        let schema = schema();
        let mut slot = vec![0u8; schema.tuple_width()];

        set_active(&mut slot, false);
        set_dirty(&mut slot, true);
        let t = TupleRef::new(&schema, &slot);
        assert!(!t.is_active());
        assert!(t.is_dirty());

        set_active(&mut slot, true);
        let t = TupleRef::new(&schema, &slot);
        assert!(t.is_dirty());
        assert!(t.is_active());

        set_dirty(&mut slot, false);
        let t = TupleRef::new(&schema, &slot);
        assert!(t.is_active());
        assert!(!t.is_dirty());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let schema = schema();
        let row = vec![
            Datum::Int32(7),
            Datum::Int32(-3),
            Datum::Int64(1 << 40),
            Datum::Int64(i64::MIN),
        ];
        schema.check_row(&row).unwrap();
        let mut slot = vec![0u8; schema.tuple_width()];
        set_active(&mut slot, true);
        schema.encode_row(&row, &mut slot);
        assert_eq!(schema.decode_row(&slot), row);
        // Flags byte survives column writes.
        assert!(TupleRef::new(&schema, &slot).is_active());
    }

    #[test]
    fn test_tuple_width_includes_flags_byte() {
        let schema = schema();
        assert_eq!(schema.tuple_width(), 1 + 4 + 4 + 8 + 8);
    }

    #[test]
    fn test_check_row_rejects_type_mismatch() {
        let schema = schema();
        let row = vec![
            Datum::Int64(7),
            Datum::Int32(0),
            Datum::Int64(0),
            Datum::Int64(0),
        ];
        assert!(schema.check_row(&row).is_err());
    }

    #[test]
    fn test_inline_string_storage() {
        let schema = TupleSchema::new(
            vec![ColumnType::Int32, ColumnType::InlineString { max_len: 8 }],
            0,
            0,
        )
        .unwrap();
        let row = vec![Datum::Int32(1), Datum::Str("abc".into())];
        schema.check_row(&row).unwrap();
        let mut slot = vec![0u8; schema.tuple_width()];
        schema.encode_row(&row, &mut slot);
        assert_eq!(schema.decode_column(&slot, 1), Datum::Str("abc".into()));

        let too_long = vec![Datum::Str("way too long!".into()); 1];
        let bad = vec![Datum::Int32(1), too_long[0].clone()];
        assert!(schema.check_row(&bad).is_err());
    }

    #[test]
    fn test_partition_hash_is_non_negative_and_width_agnostic() {
        for v in [-5i64, 0, 1, 42, i64::MAX] {
            assert!(partition_hash_of(&Datum::Int64(v)) >= 0);
        }
        assert_eq!(
            partition_hash_of(&Datum::Int32(42)),
            partition_hash_of(&Datum::Int64(42))
        );
    }

    #[test]
    fn test_key_of_uses_key_column() {
        let schema = TupleSchema::new(vec![ColumnType::Int64, ColumnType::Int32], 1, 0).unwrap();
        let row = vec![Datum::Int64(99), Datum::Int32(5)];
        assert_eq!(schema.key_of(&row).unwrap(), 5);
    }
}
