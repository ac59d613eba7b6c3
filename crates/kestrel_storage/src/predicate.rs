//! Stream predicate parsing and evaluation.
//!
//! Activation predicates arrive as JSON strings:
//! `{ "triggersDelete": bool, "predicateExpression": <tree> }`.
//! The tree is either a `HASH_RANGE` node matching on the partition hash, or
//! a comparison tree over `VALUE_TUPLE` / `VALUE_CONSTANT` leaves with the
//! arithmetic operators the planner emits for partition-modulus predicates.
//! Evaluation is pure over a tuple view and returns `true | false | null`
//! (`Option<bool>`, `None` for null).

use kestrel_common::error::{StorageError, StorageResult};
use serde_json::Value;

use crate::tuple::{partition_hash_of, TupleRef};

/// A half-open hash range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashRange {
    pub start: i64,
    pub end: i64,
}

impl HashRange {
    pub fn contains(&self, hash: i64) -> bool {
        self.start <= hash && hash < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Plus,
    Minus,
    Multiply,
    Divide,
}

/// Scalar expression node.
#[derive(Debug, Clone)]
pub enum ExprNode {
    TupleColumn { column: usize },
    Constant(i64),
    Arith {
        op: ArithOp,
        left: Box<ExprNode>,
        right: Box<ExprNode>,
    },
}

impl ExprNode {
    /// Evaluate to `i64`; `None` is SQL null (non-numeric column value or
    /// division by zero).
    fn eval(&self, tuple: &TupleRef<'_>) -> Option<i64> {
        match self {
            ExprNode::TupleColumn { column } => tuple.get(*column).as_i64(),
            ExprNode::Constant(v) => Some(*v),
            ExprNode::Arith { op, left, right } => {
                let l = left.eval(tuple)?;
                let r = right.eval(tuple)?;
                match op {
                    ArithOp::Plus => Some(l.wrapping_add(r)),
                    ArithOp::Minus => Some(l.wrapping_sub(r)),
                    ArithOp::Multiply => Some(l.wrapping_mul(r)),
                    ArithOp::Divide => {
                        if r == 0 {
                            None
                        } else {
                            Some(l.wrapping_div(r))
                        }
                    }
                }
            }
        }
    }
}

/// Root predicate expression.
#[derive(Debug, Clone)]
pub enum PredicateExpr {
    /// Matches when the hash of the designated column falls in any range.
    HashRange {
        hash_column: usize,
        ranges: Vec<HashRange>,
    },
    /// `left == right` over scalar expressions.
    CompareEqual { left: ExprNode, right: ExprNode },
}

/// One activation predicate: expression plus delete-after-streaming flag.
#[derive(Debug, Clone)]
pub struct StreamPredicate {
    pub expr: PredicateExpr,
    pub triggers_delete: bool,
}

impl StreamPredicate {
    /// Three-valued evaluation over a tuple view.
    pub fn eval(&self, tuple: &TupleRef<'_>) -> Option<bool> {
        match &self.expr {
            PredicateExpr::HashRange { hash_column, ranges } => {
                let hash = partition_hash_of(&tuple.get(*hash_column));
                Some(ranges.iter().any(|r| r.contains(hash)))
            }
            PredicateExpr::CompareEqual { left, right } => {
                Some(left.eval(tuple)? == right.eval(tuple)?)
            }
        }
    }

    /// Hash-only match, for maintaining the elastic index from mutation
    /// notifications where only the partition hash is at hand. Non-hash
    /// predicates answer `true` conservatively; extraction re-evaluates the
    /// full expression per tuple.
    pub fn matches_hash(&self, hash: i64) -> bool {
        match &self.expr {
            PredicateExpr::HashRange { ranges, .. } => ranges.iter().any(|r| r.contains(hash)),
            PredicateExpr::CompareEqual { .. } => true,
        }
    }
}

/// Positional list of stream predicates. An empty list means "match
/// everything into output 0".
#[derive(Debug, Clone, Default)]
pub struct PredicateList {
    predicates: Vec<StreamPredicate>,
}

impl PredicateList {
    /// Parse a batch of predicate JSON strings.
    pub fn parse(strings: &[String]) -> StorageResult<Self> {
        let predicates = strings
            .iter()
            .map(|s| parse_predicate(s))
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(Self { predicates })
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamPredicate> {
        self.predicates.iter()
    }

    pub fn get(&self, i: usize) -> &StreamPredicate {
        &self.predicates[i]
    }

    /// Number of positional output streams this list expects.
    pub fn output_count(&self) -> usize {
        self.predicates.len().max(1)
    }

    /// Hash-only match against any predicate (see
    /// [`StreamPredicate::matches_hash`]). An empty list matches everything.
    pub fn matches_hash(&self, hash: i64) -> bool {
        self.predicates.is_empty() || self.predicates.iter().any(|p| p.matches_hash(hash))
    }

    /// Full evaluation against any predicate; empty list matches everything.
    pub fn matches_tuple(&self, tuple: &TupleRef<'_>) -> bool {
        self.predicates.is_empty()
            || self.predicates.iter().any(|p| p.eval(tuple) == Some(true))
    }
}

fn parse_err(msg: impl Into<String>) -> StorageError {
    StorageError::PredicateParse(msg.into())
}

fn parse_predicate(s: &str) -> StorageResult<StreamPredicate> {
    let v: Value = serde_json::from_str(s).map_err(|e| parse_err(e.to_string()))?;
    let triggers_delete = v
        .get("triggersDelete")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let expr_json = v
        .get("predicateExpression")
        .ok_or_else(|| parse_err("missing predicateExpression"))?;
    let expr = parse_root(expr_json)?;
    Ok(StreamPredicate {
        expr,
        triggers_delete,
    })
}

fn node_type(v: &Value) -> StorageResult<&str> {
    v.get("TYPE")
        .and_then(Value::as_str)
        .ok_or_else(|| parse_err("expression node missing TYPE"))
}

fn parse_root(v: &Value) -> StorageResult<PredicateExpr> {
    match node_type(v)? {
        "HASH_RANGE" => {
            let hash_column = v
                .get("HASH_COLUMN")
                .and_then(Value::as_u64)
                .ok_or_else(|| parse_err("HASH_RANGE missing HASH_COLUMN"))?
                as usize;
            let ranges = v
                .get("RANGES")
                .and_then(Value::as_array)
                .ok_or_else(|| parse_err("HASH_RANGE missing RANGES"))?
                .iter()
                .map(|r| {
                    let start = r
                        .get("RANGE_START")
                        .and_then(Value::as_i64)
                        .ok_or_else(|| parse_err("range missing RANGE_START"))?;
                    let end = r
                        .get("RANGE_END")
                        .and_then(Value::as_i64)
                        .ok_or_else(|| parse_err("range missing RANGE_END"))?;
                    Ok(HashRange { start, end })
                })
                .collect::<StorageResult<Vec<_>>>()?;
            Ok(PredicateExpr::HashRange { hash_column, ranges })
        }
        "COMPARE_EQUAL" => {
            let left = parse_node(
                v.get("LEFT")
                    .ok_or_else(|| parse_err("COMPARE_EQUAL missing LEFT"))?,
            )?;
            let right = parse_node(
                v.get("RIGHT")
                    .ok_or_else(|| parse_err("COMPARE_EQUAL missing RIGHT"))?,
            )?;
            Ok(PredicateExpr::CompareEqual { left, right })
        }
        other => Err(parse_err(format!("unsupported predicate TYPE {other:?}"))),
    }
}

fn parse_node(v: &Value) -> StorageResult<ExprNode> {
    let ty = node_type(v)?;
    let arith = match ty {
        "OPERATOR_PLUS" => Some(ArithOp::Plus),
        "OPERATOR_MINUS" => Some(ArithOp::Minus),
        "OPERATOR_MULTIPLY" => Some(ArithOp::Multiply),
        "OPERATOR_DIVIDE" => Some(ArithOp::Divide),
        _ => None,
    };
    if let Some(op) = arith {
        let left = parse_node(v.get("LEFT").ok_or_else(|| parse_err("operator missing LEFT"))?)?;
        let right = parse_node(
            v.get("RIGHT")
                .ok_or_else(|| parse_err("operator missing RIGHT"))?,
        )?;
        return Ok(ExprNode::Arith {
            op,
            left: Box::new(left),
            right: Box::new(right),
        });
    }
    match ty {
        "VALUE_TUPLE" => {
            let column = v
                .get("COLUMN_IDX")
                .and_then(Value::as_u64)
                .ok_or_else(|| parse_err("VALUE_TUPLE missing COLUMN_IDX"))?
                as usize;
            Ok(ExprNode::TupleColumn { column })
        }
        "VALUE_CONSTANT" => {
            let value = v
                .get("VALUE")
                .and_then(Value::as_i64)
                .ok_or_else(|| parse_err("VALUE_CONSTANT missing VALUE"))?;
            Ok(ExprNode::Constant(value))
        }
        other => Err(parse_err(format!("unsupported expression TYPE {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::{ColumnType, Datum, TupleSchema};

    fn schema() -> TupleSchema {
        TupleSchema::new(vec![ColumnType::Int32, ColumnType::Int32], 0, 0).unwrap()
    }

    fn slot_for(schema: &TupleSchema, pk: i32, val: i32) -> Vec<u8> {
        let mut slot = vec![0u8; schema.tuple_width()];
        schema.encode_row(&[Datum::Int32(pk), Datum::Int32(val)], &mut slot);
        slot
    }

    /// The modulus workaround shape the planner emits:
    /// `col - (col / n) * n == part`.
    fn modulus_predicate(column: usize, n: i64, part: i64, triggers_delete: bool) -> String {
        let col = format!(
            r#"{{"TYPE":"VALUE_TUPLE","COLUMN_IDX":{column}}}"#
        );
        let expr = format!(
            r#"{{"TYPE":"COMPARE_EQUAL",
                 "LEFT":{{"TYPE":"OPERATOR_MINUS","LEFT":{col},
                          "RIGHT":{{"TYPE":"OPERATOR_MULTIPLY",
                                    "LEFT":{{"TYPE":"OPERATOR_DIVIDE","LEFT":{col},
                                             "RIGHT":{{"TYPE":"VALUE_CONSTANT","VALUE":{n}}}}},
                                    "RIGHT":{{"TYPE":"VALUE_CONSTANT","VALUE":{n}}}}}}},
                 "RIGHT":{{"TYPE":"VALUE_CONSTANT","VALUE":{part}}}}}"#
        );
        format!(r#"{{"triggersDelete":{triggers_delete},"predicateExpression":{expr}}}"#)
    }

    #[test]
    fn test_parse_and_eval_modulus_predicate() {
        let list = PredicateList::parse(&[modulus_predicate(0, 7, 3, false)]).unwrap();
        assert_eq!(list.len(), 1);
        assert!(!list.get(0).triggers_delete);

        let schema = schema();
        let hit = slot_for(&schema, 10, 0); // 10 % 7 == 3
        let miss = slot_for(&schema, 11, 0);
        assert_eq!(
            list.get(0).eval(&TupleRef::new(&schema, &hit)),
            Some(true)
        );
        assert_eq!(
            list.get(0).eval(&TupleRef::new(&schema, &miss)),
            Some(false)
        );
    }

    #[test]
    fn test_triggers_delete_flag_parsed() {
        let list = PredicateList::parse(&[modulus_predicate(0, 2, 0, true)]).unwrap();
        assert!(list.get(0).triggers_delete);
    }

    #[test]
    fn test_parse_hash_range() {
        let s = r#"{"triggersDelete":false,
                    "predicateExpression":{"TYPE":"HASH_RANGE","HASH_COLUMN":0,
                      "RANGES":[{"RANGE_START":0,"RANGE_END":9223372036854775807}]}}"#;
        let list = PredicateList::parse(&[s.to_string()]).unwrap();
        let schema = schema();
        let slot = slot_for(&schema, 12345, 0);
        // Hashes are masked non-negative, so the full range matches everything.
        assert_eq!(
            list.get(0).eval(&TupleRef::new(&schema, &slot)),
            Some(true)
        );
        assert!(list.matches_hash(42));
        assert!(!list.get(0).matches_hash(-1));
    }

    #[test]
    fn test_hash_range_boundaries_half_open() {
        let p = StreamPredicate {
            expr: PredicateExpr::HashRange {
                hash_column: 0,
                ranges: vec![HashRange { start: 10, end: 20 }],
            },
            triggers_delete: false,
        };
        assert!(p.matches_hash(10));
        assert!(p.matches_hash(19));
        assert!(!p.matches_hash(20));
        assert!(!p.matches_hash(9));
    }

    #[test]
    fn test_division_by_zero_is_null() {
        let list = PredicateList::parse(&[modulus_predicate(0, 0, 0, false)]).unwrap();
        let schema = schema();
        let slot = slot_for(&schema, 5, 0);
        assert_eq!(list.get(0).eval(&TupleRef::new(&schema, &slot)), None);
        // Null never matches.
        assert!(!list.matches_tuple(&TupleRef::new(&schema, &slot)));
    }

    #[test]
    fn test_malformed_json_rejected() {
        let err = PredicateList::parse(&["{not json".to_string()]).unwrap_err();
        assert!(matches!(err, StorageError::PredicateParse(_)));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let s = r#"{"triggersDelete":false,
                    "predicateExpression":{"TYPE":"COMPARE_LIKE"}}"#;
        let err = PredicateList::parse(&[s.to_string()]).unwrap_err();
        assert!(matches!(err, StorageError::PredicateParse(_)));
    }

    #[test]
    fn test_empty_list_matches_everything() {
        let list = PredicateList::parse(&[]).unwrap();
        assert!(list.is_empty());
        assert_eq!(list.output_count(), 1);
        assert!(list.matches_hash(123));
        let schema = schema();
        let slot = slot_for(&schema, 1, 2);
        assert!(list.matches_tuple(&TupleRef::new(&schema, &slot)));
    }
}
