//! Row and datum model shared by every processor and stream.
//!
//! A [`Row`] is an ordered sequence of [`Datum`] cells whose length and column
//! types are fixed per stream by the producer's output types. Ordering between
//! datums is the total order used by merge joins and ordered streams.

use std::cmp::Ordering;
use std::fmt;

use arrow_schema::DataType;
use serde::{Deserialize, Serialize};

/// Column type of a stream's output column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Bool,
    Int,
    Float,
    String,
    Bytes,
}

impl ColumnType {
    /// Arrow data type used when rows are columnarized for the network.
    pub fn arrow_type(self) -> DataType {
        match self {
            ColumnType::Bool => DataType::Boolean,
            ColumnType::Int => DataType::Int64,
            ColumnType::Float => DataType::Float64,
            ColumnType::String => DataType::Utf8,
            ColumnType::Bytes => DataType::Binary,
        }
    }

    /// Inverse of [`ColumnType::arrow_type`].
    pub fn from_arrow(dt: &DataType) -> Option<Self> {
        match dt {
            DataType::Boolean => Some(ColumnType::Bool),
            DataType::Int64 => Some(ColumnType::Int),
            DataType::Float64 => Some(ColumnType::Float),
            DataType::Utf8 => Some(ColumnType::String),
            DataType::Binary => Some(ColumnType::Bytes),
            _ => None,
        }
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Approximate in-memory footprint, used for byte-budget accounting.
    pub fn size_bytes(&self) -> usize {
        let inline = std::mem::size_of::<Datum>();
        match self {
            Datum::String(s) => inline + s.len(),
            Datum::Bytes(b) => inline + b.len(),
            _ => inline,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Bool(_) => 1,
            Datum::Int(_) | Datum::Float(_) => 2,
            Datum::String(_) => 3,
            Datum::Bytes(_) => 4,
        }
    }

    /// Total order over datums: NULL sorts first, numerics compare by value
    /// across int/float, otherwise values of different types order by type.
    pub fn total_cmp(&self, other: &Datum) -> Ordering {
        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Bool(a), Datum::Bool(b)) => a.cmp(b),
            (Datum::Int(a), Datum::Int(b)) => a.cmp(b),
            (Datum::Float(a), Datum::Float(b)) => a.total_cmp(b),
            (Datum::Int(a), Datum::Float(b)) => (*a as f64).total_cmp(b),
            (Datum::Float(a), Datum::Int(b)) => a.total_cmp(&(*b as f64)),
            (Datum::String(a), Datum::String(b)) => a.cmp(b),
            (Datum::Bytes(a), Datum::Bytes(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Bool(v) => write!(f, "{v}"),
            Datum::Int(v) => write!(f, "{v}"),
            Datum::Float(v) => write!(f, "{v}"),
            Datum::String(v) => write!(f, "'{v}'"),
            Datum::Bytes(v) => write!(f, "b'{}'", v.len()),
        }
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int(v)
    }
}

impl From<bool> for Datum {
    fn from(v: bool) -> Self {
        Datum::Bool(v)
    }
}

impl From<f64> for Datum {
    fn from(v: f64) -> Self {
        Datum::Float(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::String(v.to_string())
    }
}

/// One row of a stream.
pub type Row = Vec<Datum>;

/// Approximate footprint of a row.
pub fn row_size_bytes(row: &[Datum]) -> usize {
    row.iter().map(Datum::size_bytes).sum()
}

/// Sort direction of an ordering column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Asc,
    Desc,
}

/// One column of a stream ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnOrdering {
    pub col_idx: usize,
    pub direction: Direction,
}

impl ColumnOrdering {
    pub fn asc(col_idx: usize) -> Self {
        Self {
            col_idx,
            direction: Direction::Asc,
        }
    }

    pub fn desc(col_idx: usize) -> Self {
        Self {
            col_idx,
            direction: Direction::Desc,
        }
    }
}

/// Compare the ordering columns of two rows from the same stream.
pub fn compare_rows(ordering: &[ColumnOrdering], a: &[Datum], b: &[Datum]) -> Ordering {
    compare_rows_across(ordering, a, ordering, b)
}

/// Compare the ordering columns of rows from two streams whose orderings have
/// the same length and directions.
pub fn compare_rows_across(
    left_ordering: &[ColumnOrdering],
    left: &[Datum],
    right_ordering: &[ColumnOrdering],
    right: &[Datum],
) -> Ordering {
    for (l, r) in left_ordering.iter().zip(right_ordering) {
        let mut ord = left[l.col_idx].total_cmp(&right[r.col_idx]);
        if l.direction == Direction::Desc {
            ord = ord.reverse();
        }
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nulls_sort_first_and_numerics_mix() {
        assert_eq!(Datum::Null.total_cmp(&Datum::Int(-5)), Ordering::Less);
        assert_eq!(Datum::Int(2).total_cmp(&Datum::Float(1.5)), Ordering::Greater);
        assert_eq!(Datum::Float(2.0).total_cmp(&Datum::Int(2)), Ordering::Equal);
        assert_eq!(
            Datum::from("a").total_cmp(&Datum::from("b")),
            Ordering::Less
        );
    }

    #[test]
    fn compare_rows_honors_direction() {
        let a = vec![Datum::Int(1), Datum::from("x")];
        let b = vec![Datum::Int(1), Datum::from("y")];
        let asc = [ColumnOrdering::asc(0), ColumnOrdering::asc(1)];
        let desc = [ColumnOrdering::asc(0), ColumnOrdering::desc(1)];
        assert_eq!(compare_rows(&asc, &a, &b), Ordering::Less);
        assert_eq!(compare_rows(&desc, &a, &b), Ordering::Greater);
    }

    #[test]
    fn arrow_type_mapping_is_reversible() {
        for t in [
            ColumnType::Bool,
            ColumnType::Int,
            ColumnType::Float,
            ColumnType::String,
            ColumnType::Bytes,
        ] {
            assert_eq!(ColumnType::from_arrow(&t.arrow_type()), Some(t));
        }
    }
}
