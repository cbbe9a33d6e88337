//! Output post-processing shared by every processor: filter, projection or
//! render expressions, offset and limit.

use rowflow_common::{Result, RowflowError};
use serde::{Deserialize, Serialize};

use crate::expr::Expr;
use crate::row::{ColumnType, Row};

/// Post-processing applied to a processor's core output.
///
/// `projection` and `render_exprs` are mutually exclusive. A `limit` of zero
/// means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostProcessSpec {
    pub filter: Option<Expr>,
    pub projection: Option<Vec<usize>>,
    pub render_exprs: Option<Vec<Expr>>,
    pub offset: u64,
    pub limit: u64,
}

impl PostProcessSpec {
    pub fn with_projection(mut self, cols: Vec<usize>) -> Self {
        self.projection = Some(cols);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }
}

/// Stateful application of a [`PostProcessSpec`] to a row stream.
#[derive(Debug)]
pub struct ProcOutputHelper {
    spec: PostProcessSpec,
    output_types: Vec<ColumnType>,
    row_idx: u64,
    max_row_idx: u64,
}

impl ProcOutputHelper {
    /// Validate `spec` against the core's output types.
    pub fn new(spec: PostProcessSpec, core_types: &[ColumnType]) -> Result<Self> {
        let output_types = match (&spec.projection, &spec.render_exprs) {
            (Some(_), Some(_)) => {
                return Err(RowflowError::Planning(
                    "post-processing has both projection and render expressions".to_string(),
                ))
            }
            (Some(cols), None) => cols
                .iter()
                .map(|&c| {
                    core_types.get(c).copied().ok_or_else(|| {
                        RowflowError::Planning(format!(
                            "projection column {c} out of range for {} columns",
                            core_types.len()
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            (None, Some(exprs)) => exprs
                .iter()
                .map(|e| e.output_type(core_types))
                .collect::<Result<Vec<_>>>()?,
            (None, None) => core_types.to_vec(),
        };
        if let Some(filter) = &spec.filter {
            filter.output_type(core_types)?;
        }
        let max_row_idx = if spec.limit == 0 {
            u64::MAX
        } else {
            spec.offset.saturating_add(spec.limit)
        };
        Ok(Self {
            spec,
            output_types,
            row_idx: 0,
            max_row_idx,
        })
    }

    pub fn output_types(&self) -> &[ColumnType] {
        &self.output_types
    }

    /// Apply post-processing to one core row.
    ///
    /// Returns the output row (if any) and whether more rows are wanted. The
    /// row that reaches the limit is returned together with `false`.
    pub fn process_row(&mut self, row: Row) -> Result<(Option<Row>, bool)> {
        if self.row_idx >= self.max_row_idx {
            return Ok((None, false));
        }
        if let Some(filter) = &self.spec.filter {
            if !filter.eval_filter(&row)? {
                return Ok((None, true));
            }
        }
        self.row_idx += 1;
        if self.row_idx <= self.spec.offset {
            return Ok((None, true));
        }
        let out = if let Some(exprs) = &self.spec.render_exprs {
            exprs
                .iter()
                .map(|e| e.eval(&row))
                .collect::<Result<Row>>()?
        } else if let Some(cols) = &self.spec.projection {
            cols.iter().map(|&c| row[c].clone()).collect()
        } else {
            row
        };
        Ok((Some(out), self.row_idx < self.max_row_idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::BinaryOp;
    use crate::row::Datum;

    fn rows(n: i64) -> Vec<Row> {
        (0..n).map(|i| vec![Datum::Int(i), Datum::Int(i * 10)]).collect()
    }

    #[test]
    fn filter_offset_limit_and_projection() {
        let spec = PostProcessSpec {
            filter: Some(Expr::binary(Expr::col(0), BinaryOp::NotEq, Expr::lit(1))),
            projection: Some(vec![1]),
            offset: 1,
            limit: 2,
            ..Default::default()
        };
        let mut h =
            ProcOutputHelper::new(spec, &[ColumnType::Int, ColumnType::Int]).expect("helper");
        assert_eq!(h.output_types(), &[ColumnType::Int]);

        let mut out = Vec::new();
        for row in rows(6) {
            let (row, more) = h.process_row(row).expect("process");
            if let Some(r) = row {
                out.push(r);
            }
            if !more {
                break;
            }
        }
        // 0 skipped by offset, 1 filtered, 2 and 3 emitted.
        assert_eq!(out, vec![vec![Datum::Int(20)], vec![Datum::Int(30)]]);
    }

    #[test]
    fn render_types_and_invalid_specs() {
        let spec = PostProcessSpec {
            render_exprs: Some(vec![Expr::binary(Expr::col(0), BinaryOp::Lt, Expr::col(1))]),
            ..Default::default()
        };
        let h = ProcOutputHelper::new(spec, &[ColumnType::Int, ColumnType::Int]).expect("helper");
        assert_eq!(h.output_types(), &[ColumnType::Bool]);

        let bad = PostProcessSpec::default().with_projection(vec![4]);
        assert!(ProcOutputHelper::new(bad, &[ColumnType::Int]).is_err());
    }
}
