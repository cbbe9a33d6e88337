//! Scalar expressions evaluated against single rows.
//!
//! Input contract:
//! - column references are positional indexes into the evaluated row;
//! - operand types are checked at evaluation time.
//!
//! Output contract:
//! - NULL operands propagate to NULL, except `AND`/`OR` which follow
//!   three-valued logic and `IS NULL`.

use std::cmp::Ordering;

use rowflow_common::{Result, RowflowError};
use serde::{Deserialize, Serialize};

use crate::row::{ColumnType, Datum};

/// Binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Plus,
    Minus,
    Multiply,
    Divide,
}

impl BinaryOp {
    fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }
}

/// Expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Positional reference into the input row.
    ColumnRef(usize),
    Literal(Datum),
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    IsNull(Box<Expr>),
}

impl Expr {
    pub fn col(idx: usize) -> Self {
        Expr::ColumnRef(idx)
    }

    pub fn lit(v: impl Into<Datum>) -> Self {
        Expr::Literal(v.into())
    }

    pub fn binary(left: Expr, op: BinaryOp, right: Expr) -> Self {
        Expr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// Evaluate against `row`.
    pub fn eval(&self, row: &[Datum]) -> Result<Datum> {
        match self {
            Expr::ColumnRef(idx) => row.get(*idx).cloned().ok_or_else(|| {
                RowflowError::Execution(format!(
                    "column reference @{} out of range for row of width {}",
                    idx + 1,
                    row.len()
                ))
            }),
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Not(inner) => match inner.eval(row)? {
                Datum::Null => Ok(Datum::Null),
                Datum::Bool(b) => Ok(Datum::Bool(!b)),
                other => Err(type_error("NOT", &other)),
            },
            Expr::IsNull(inner) => Ok(Datum::Bool(inner.eval(row)?.is_null())),
            Expr::Binary { left, op, right } => {
                let l = left.eval(row)?;
                match op {
                    BinaryOp::And => eval_and(l, || right.eval(row)),
                    BinaryOp::Or => eval_or(l, || right.eval(row)),
                    _ => eval_binary(*op, l, right.eval(row)?),
                }
            }
        }
    }

    /// Evaluate as a filter: only `TRUE` passes.
    pub fn eval_filter(&self, row: &[Datum]) -> Result<bool> {
        match self.eval(row)? {
            Datum::Bool(b) => Ok(b),
            Datum::Null => Ok(false),
            other => Err(type_error("filter", &other)),
        }
    }

    /// Static result type given the types of the input row.
    pub fn output_type(&self, input: &[ColumnType]) -> Result<ColumnType> {
        match self {
            Expr::ColumnRef(idx) => input.get(*idx).copied().ok_or_else(|| {
                RowflowError::Planning(format!(
                    "column reference @{} out of range for {} input columns",
                    idx + 1,
                    input.len()
                ))
            }),
            Expr::Literal(v) => Ok(match v {
                Datum::Bool(_) | Datum::Null => ColumnType::Bool,
                Datum::Int(_) => ColumnType::Int,
                Datum::Float(_) => ColumnType::Float,
                Datum::String(_) => ColumnType::String,
                Datum::Bytes(_) => ColumnType::Bytes,
            }),
            Expr::Not(_) | Expr::IsNull(_) => Ok(ColumnType::Bool),
            Expr::Binary { left, op, right } => {
                if op.is_comparison() || matches!(op, BinaryOp::And | BinaryOp::Or) {
                    return Ok(ColumnType::Bool);
                }
                let l = left.output_type(input)?;
                let r = right.output_type(input)?;
                match (l, r) {
                    (ColumnType::Int, ColumnType::Int) => Ok(ColumnType::Int),
                    (ColumnType::Int | ColumnType::Float, ColumnType::Int | ColumnType::Float) => {
                        Ok(ColumnType::Float)
                    }
                    _ => Err(RowflowError::Planning(format!(
                        "unsupported operand types for {op:?}: {l:?}, {r:?}"
                    ))),
                }
            }
        }
    }
}

fn type_error(what: &str, v: &Datum) -> RowflowError {
    RowflowError::Execution(format!("unsupported operand for {what}: {v}"))
}

fn as_bool(what: &str, v: &Datum) -> Result<Option<bool>> {
    match v {
        Datum::Null => Ok(None),
        Datum::Bool(b) => Ok(Some(*b)),
        other => Err(type_error(what, other)),
    }
}

fn eval_and(l: Datum, right: impl FnOnce() -> Result<Datum>) -> Result<Datum> {
    let l = as_bool("AND", &l)?;
    if l == Some(false) {
        return Ok(Datum::Bool(false));
    }
    let r = as_bool("AND", &right()?)?;
    Ok(match (l, r) {
        (_, Some(false)) => Datum::Bool(false),
        (Some(true), Some(true)) => Datum::Bool(true),
        _ => Datum::Null,
    })
}

fn eval_or(l: Datum, right: impl FnOnce() -> Result<Datum>) -> Result<Datum> {
    let l = as_bool("OR", &l)?;
    if l == Some(true) {
        return Ok(Datum::Bool(true));
    }
    let r = as_bool("OR", &right()?)?;
    Ok(match (l, r) {
        (_, Some(true)) => Datum::Bool(true),
        (Some(false), Some(false)) => Datum::Bool(false),
        _ => Datum::Null,
    })
}

fn eval_binary(op: BinaryOp, l: Datum, r: Datum) -> Result<Datum> {
    if l.is_null() || r.is_null() {
        return Ok(Datum::Null);
    }
    if op.is_comparison() {
        let comparable = matches!(
            (&l, &r),
            (Datum::Bool(_), Datum::Bool(_))
                | (Datum::Int(_) | Datum::Float(_), Datum::Int(_) | Datum::Float(_))
                | (Datum::String(_), Datum::String(_))
                | (Datum::Bytes(_), Datum::Bytes(_))
        );
        if !comparable {
            return Err(RowflowError::Execution(format!(
                "cannot compare {l} with {r}"
            )));
        }
        let ord = l.total_cmp(&r);
        let out = match op {
            BinaryOp::Eq => ord == Ordering::Equal,
            BinaryOp::NotEq => ord != Ordering::Equal,
            BinaryOp::Lt => ord == Ordering::Less,
            BinaryOp::LtEq => ord != Ordering::Greater,
            BinaryOp::Gt => ord == Ordering::Greater,
            _ => ord != Ordering::Less,
        };
        return Ok(Datum::Bool(out));
    }
    match (l, r) {
        (Datum::Int(a), Datum::Int(b)) => int_arith(op, a, b),
        (Datum::Int(a), Datum::Float(b)) => float_arith(op, a as f64, b),
        (Datum::Float(a), Datum::Int(b)) => float_arith(op, a, b as f64),
        (Datum::Float(a), Datum::Float(b)) => float_arith(op, a, b),
        (l, r) => Err(RowflowError::Execution(format!(
            "unsupported operands for {op:?}: {l}, {r}"
        ))),
    }
}

fn int_arith(op: BinaryOp, a: i64, b: i64) -> Result<Datum> {
    let out = match op {
        BinaryOp::Plus => a.checked_add(b),
        BinaryOp::Minus => a.checked_sub(b),
        BinaryOp::Multiply => a.checked_mul(b),
        BinaryOp::Divide => {
            if b == 0 {
                return Err(RowflowError::Execution("division by zero".to_string()));
            }
            a.checked_div(b)
        }
        _ => return Err(RowflowError::Internal(format!("{op:?} is not arithmetic"))),
    };
    out.map(Datum::Int)
        .ok_or_else(|| RowflowError::Execution("integer out of range".to_string()))
}

fn float_arith(op: BinaryOp, a: f64, b: f64) -> Result<Datum> {
    let out = match op {
        BinaryOp::Plus => a + b,
        BinaryOp::Minus => a - b,
        BinaryOp::Multiply => a * b,
        BinaryOp::Divide => {
            if b == 0.0 {
                return Err(RowflowError::Execution("division by zero".to_string()));
            }
            a / b
        }
        _ => return Err(RowflowError::Internal(format!("{op:?} is not arithmetic"))),
    };
    Ok(Datum::Float(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparisons_and_three_valued_logic() {
        let row = vec![Datum::Int(3), Datum::Null, Datum::Float(2.5)];
        let gt = Expr::binary(Expr::col(0), BinaryOp::Gt, Expr::col(2));
        assert_eq!(gt.eval(&row).expect("eval"), Datum::Bool(true));

        let null_cmp = Expr::binary(Expr::col(1), BinaryOp::Eq, Expr::lit(1));
        assert_eq!(null_cmp.eval(&row).expect("eval"), Datum::Null);
        assert!(!null_cmp.eval_filter(&row).expect("filter"));

        let and = Expr::binary(null_cmp.clone(), BinaryOp::And, Expr::lit(false));
        assert_eq!(and.eval(&row).expect("eval"), Datum::Bool(false));
        let or = Expr::binary(null_cmp, BinaryOp::Or, Expr::lit(true));
        assert_eq!(or.eval(&row).expect("eval"), Datum::Bool(true));
    }

    #[test]
    fn arithmetic_errors_are_execution_errors() {
        let row = vec![Datum::Int(1), Datum::Int(0)];
        let div = Expr::binary(Expr::col(0), BinaryOp::Divide, Expr::col(1));
        assert!(matches!(div.eval(&row), Err(RowflowError::Execution(_))));

        let mismatch = Expr::binary(Expr::lit("a"), BinaryOp::Lt, Expr::lit(1));
        assert!(matches!(mismatch.eval(&row), Err(RowflowError::Execution(_))));

        let oob = Expr::col(5);
        assert!(oob.eval(&row).is_err());
    }

    #[test]
    fn output_types_follow_operands() {
        let types = [ColumnType::Int, ColumnType::Float];
        let sum = Expr::binary(Expr::col(0), BinaryOp::Plus, Expr::col(0));
        assert_eq!(sum.output_type(&types).expect("type"), ColumnType::Int);
        let mixed = Expr::binary(Expr::col(0), BinaryOp::Multiply, Expr::col(1));
        assert_eq!(mixed.output_type(&types).expect("type"), ColumnType::Float);
        assert!(Expr::col(2).output_type(&types).is_err());
    }
}
