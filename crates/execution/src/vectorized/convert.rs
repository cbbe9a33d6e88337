//! Conversion between rows and Arrow record batches.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, BinaryBuilder, BooleanArray, BooleanBuilder, Float64Array,
    Float64Builder, Int64Array, Int64Builder, StringArray, StringBuilder,
};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow_schema::{Field, Schema, SchemaRef};
use rowflow_common::{Result, RowflowError};

use crate::row::{ColumnType, Datum, Row};

/// Schema with one nullable column per type, named `c0`, `c1`, ...
pub fn schema_for(types: &[ColumnType]) -> SchemaRef {
    let fields: Vec<Field> = types
        .iter()
        .enumerate()
        .map(|(i, t)| Field::new(format!("c{i}"), t.arrow_type(), true))
        .collect();
    Arc::new(Schema::new(fields))
}

/// Column types of `schema`, failing on types rows cannot carry.
pub fn types_for(schema: &Schema) -> Result<Vec<ColumnType>> {
    schema
        .fields()
        .iter()
        .map(|f| {
            ColumnType::from_arrow(f.data_type()).ok_or_else(|| {
                RowflowError::Unsupported(format!(
                    "column {} has unsupported type {}",
                    f.name(),
                    f.data_type()
                ))
            })
        })
        .collect()
}

fn mismatch(col: usize, want: ColumnType, got: &Datum) -> RowflowError {
    RowflowError::Execution(format!(
        "column {col}: expected {want:?} value, got {got}"
    ))
}

/// Columnarize `rows` according to `schema`.
pub fn rows_to_batch(schema: &SchemaRef, rows: &[Row]) -> Result<RecordBatch> {
    let types = types_for(schema)?;
    if let Some(bad) = rows.iter().find(|r| r.len() != types.len()) {
        return Err(RowflowError::Execution(format!(
            "row has {} columns, schema has {}",
            bad.len(),
            types.len()
        )));
    }
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(types.len());
    for (col, ty) in types.iter().enumerate() {
        let array: ArrayRef = match ty {
            ColumnType::Bool => {
                let mut b = BooleanBuilder::with_capacity(rows.len());
                for row in rows {
                    match &row[col] {
                        Datum::Null => b.append_null(),
                        Datum::Bool(v) => b.append_value(*v),
                        other => return Err(mismatch(col, *ty, other)),
                    }
                }
                Arc::new(b.finish())
            }
            ColumnType::Int => {
                let mut b = Int64Builder::with_capacity(rows.len());
                for row in rows {
                    match &row[col] {
                        Datum::Null => b.append_null(),
                        Datum::Int(v) => b.append_value(*v),
                        other => return Err(mismatch(col, *ty, other)),
                    }
                }
                Arc::new(b.finish())
            }
            ColumnType::Float => {
                let mut b = Float64Builder::with_capacity(rows.len());
                for row in rows {
                    match &row[col] {
                        Datum::Null => b.append_null(),
                        Datum::Float(v) => b.append_value(*v),
                        Datum::Int(v) => b.append_value(*v as f64),
                        other => return Err(mismatch(col, *ty, other)),
                    }
                }
                Arc::new(b.finish())
            }
            ColumnType::String => {
                let mut b = StringBuilder::new();
                for row in rows {
                    match &row[col] {
                        Datum::Null => b.append_null(),
                        Datum::String(v) => b.append_value(v),
                        other => return Err(mismatch(col, *ty, other)),
                    }
                }
                Arc::new(b.finish())
            }
            ColumnType::Bytes => {
                let mut b = BinaryBuilder::new();
                for row in rows {
                    match &row[col] {
                        Datum::Null => b.append_null(),
                        Datum::Bytes(v) => b.append_value(v),
                        other => return Err(mismatch(col, *ty, other)),
                    }
                }
                Arc::new(b.finish())
            }
        };
        columns.push(array);
    }
    let options = RecordBatchOptions::new().with_row_count(Some(rows.len()));
    RecordBatch::try_new_with_options(Arc::clone(schema), columns, &options)
        .map_err(|e| RowflowError::Execution(format!("building record batch failed: {e}")))
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, col: usize) -> Result<&'a T> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        RowflowError::Execution(format!(
            "column {col}: unexpected array type {}",
            array.data_type()
        ))
    })
}

/// Materialize every row of `batch`.
pub fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<Row>> {
    let types = types_for(batch.schema().as_ref())?;
    let mut rows: Vec<Row> = (0..batch.num_rows())
        .map(|_| Vec::with_capacity(types.len()))
        .collect();
    for (col, ty) in types.iter().enumerate() {
        let array = batch.column(col);
        macro_rules! fill {
            ($arr:ty, $variant:expr) => {{
                let a = downcast::<$arr>(array, col)?;
                let to_datum = $variant;
                for (i, row) in rows.iter_mut().enumerate() {
                    row.push(if a.is_null(i) {
                        Datum::Null
                    } else {
                        to_datum(a.value(i))
                    });
                }
            }};
        }
        match ty {
            ColumnType::Bool => fill!(BooleanArray, Datum::Bool),
            ColumnType::Int => fill!(Int64Array, Datum::Int),
            ColumnType::Float => fill!(Float64Array, Datum::Float),
            ColumnType::String => fill!(StringArray, |v: &str| Datum::String(v.to_string())),
            ColumnType::Bytes => fill!(BinaryArray, |v: &[u8]| Datum::Bytes(v.to_vec())),
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_survive_columnarization_with_nulls() {
        let types = [
            ColumnType::Int,
            ColumnType::String,
            ColumnType::Bool,
            ColumnType::Float,
            ColumnType::Bytes,
        ];
        let schema = schema_for(&types);
        let rows = vec![
            vec![
                Datum::Int(1),
                Datum::from("a"),
                Datum::Bool(true),
                Datum::Float(0.5),
                Datum::Bytes(vec![1, 2]),
            ],
            vec![Datum::Null, Datum::Null, Datum::Null, Datum::Null, Datum::Null],
        ];
        let batch = rows_to_batch(&schema, &rows).expect("batch");
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch_to_rows(&batch).expect("rows"), rows);
    }

    #[test]
    fn zero_column_rows_keep_their_count() {
        let schema = schema_for(&[]);
        let batch = rows_to_batch(&schema, &[vec![], vec![], vec![]]).expect("batch");
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch_to_rows(&batch).expect("rows").len(), 3);
    }

    #[test]
    fn type_mismatch_is_reported() {
        let schema = schema_for(&[ColumnType::Int]);
        let err = rows_to_batch(&schema, &[vec![Datum::from("x")]]).expect_err("mismatch");
        assert!(matches!(err, RowflowError::Execution(_)));
    }
}
