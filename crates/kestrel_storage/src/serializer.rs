//! Tuple wire serialization.
//!
//! The streaming subsystem consumes serialization as a service behind the
//! [`TupleSerializer`] trait; the default implementation writes column values
//! big-endian in schema order, strings as a 4-byte length prefix plus bytes.

use bytes::BufMut;

use crate::tuple::{ColumnType, Datum, TupleRef};

pub trait TupleSerializer {
    /// Serialized size of one tuple under this serializer.
    fn serialized_size(&self, tuple: &TupleRef<'_>) -> usize;

    /// Append the serialized tuple to `out`.
    fn write_tuple(&self, tuple: &TupleRef<'_>, out: &mut Vec<u8>);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTupleSerializer;

impl TupleSerializer for DefaultTupleSerializer {
    fn serialized_size(&self, tuple: &TupleRef<'_>) -> usize {
        tuple
            .schema
            .columns()
            .iter()
            .enumerate()
            .map(|(i, col)| match col {
                ColumnType::Int32 => 4,
                ColumnType::Int64 => 8,
                ColumnType::InlineString { .. } => match tuple.get(i) {
                    Datum::Str(s) => 4 + s.len(),
                    _ => 4,
                },
            })
            .sum()
    }

    fn write_tuple(&self, tuple: &TupleRef<'_>, out: &mut Vec<u8>) {
        for i in 0..tuple.schema.column_count() {
            match tuple.get(i) {
                Datum::Int32(v) => out.put_i32(v),
                Datum::Int64(v) => out.put_i64(v),
                Datum::Str(s) => {
                    out.put_u32(s.len() as u32);
                    out.put_slice(s.as_bytes());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::{ColumnType, TupleSchema};

    #[test]
    fn test_default_serializer_is_big_endian_in_schema_order() {
        let schema =
            TupleSchema::new(vec![ColumnType::Int32, ColumnType::Int64], 0, 0).unwrap();
        let mut slot = vec![0u8; schema.tuple_width()];
        schema.encode_row(&[Datum::Int32(0x0102_0304), Datum::Int64(-1)], &mut slot);

        let ser = DefaultTupleSerializer;
        let tuple = TupleRef::new(&schema, &slot);
        let mut out = Vec::new();
        ser.write_tuple(&tuple, &mut out);

        assert_eq!(out.len(), ser.serialized_size(&tuple));
        assert_eq!(&out[..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&out[4..], &[0xff; 8]);
    }

    #[test]
    fn test_string_columns_are_length_prefixed() {
        let schema = TupleSchema::new(
            vec![ColumnType::Int32, ColumnType::InlineString { max_len: 16 }],
            0,
            0,
        )
        .unwrap();
        let mut slot = vec![0u8; schema.tuple_width()];
        schema.encode_row(&[Datum::Int32(1), Datum::Str("hi".into())], &mut slot);

        let ser = DefaultTupleSerializer;
        let tuple = TupleRef::new(&schema, &slot);
        let mut out = Vec::new();
        ser.write_tuple(&tuple, &mut out);
        assert_eq!(out.len(), 4 + 4 + 2);
        assert_eq!(&out[4..8], &[0, 0, 0, 2]);
        assert_eq!(&out[8..], b"hi");
    }
}
