//! Serializable processor specifications sent with a flow.

use serde::{Deserialize, Serialize};

use crate::expr::Expr;
use crate::row::{ColumnOrdering, ColumnType, Row};

/// Join variants supported by the merge joiner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    LeftSemi,
    LeftAnti,
    IntersectAll,
    ExceptAll,
}

impl JoinType {
    pub const ALL: [JoinType; 8] = [
        JoinType::Inner,
        JoinType::LeftOuter,
        JoinType::RightOuter,
        JoinType::FullOuter,
        JoinType::LeftSemi,
        JoinType::LeftAnti,
        JoinType::IntersectAll,
        JoinType::ExceptAll,
    ];

    /// Left rows without a match are emitted (padded with NULLs when the
    /// output includes right columns).
    pub fn emits_unmatched_left(self) -> bool {
        matches!(
            self,
            JoinType::LeftOuter | JoinType::FullOuter | JoinType::LeftAnti | JoinType::ExceptAll
        )
    }

    /// Right rows without a match are emitted, padded with NULLs.
    pub fn emits_unmatched_right(self) -> bool {
        matches!(self, JoinType::RightOuter | JoinType::FullOuter)
    }

    /// INTERSECT ALL / EXCEPT ALL.
    pub fn is_set_op(self) -> bool {
        matches!(self, JoinType::IntersectAll | JoinType::ExceptAll)
    }

    /// Whether output rows carry the right side's columns.
    pub fn includes_right_columns(self) -> bool {
        !matches!(
            self,
            JoinType::LeftSemi | JoinType::LeftAnti | JoinType::IntersectAll | JoinType::ExceptAll
        )
    }
}

/// Emits a fixed set of rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuesSpec {
    pub types: Vec<ColumnType>,
    pub rows: Vec<Row>,
}

/// Merge join over two inputs ordered on the equality columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeJoinerSpec {
    pub left_ordering: Vec<ColumnOrdering>,
    pub right_ordering: Vec<ColumnOrdering>,
    pub join_type: JoinType,
    /// Extra join condition over the concatenated left and right row.
    #[serde(default)]
    pub on_expr: Option<Expr>,
    /// NULL keys match each other (set-operation semantics).
    #[serde(default)]
    pub null_equality: bool,
}

/// A set-returning generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SetGenerator {
    /// `generate_series(start, stop[, step])` over integers.
    GenerateSeries {
        start: Expr,
        stop: Expr,
        step: Option<Expr>,
    },
}

/// One column-producing entry of a project-set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProjectSetExpr {
    /// Evaluated once per input row; NULL in the following generated rows.
    Scalar(Expr),
    Generator(SetGenerator),
}

/// Expands each input row with generated columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSetSpec {
    pub exprs: Vec<ProjectSetExpr>,
}

/// Core of a processor, keyed by operator kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProcessorCoreUnion {
    Values(ValuesSpec),
    Noop,
    MergeJoiner(MergeJoinerSpec),
    ProjectSet(ProjectSetSpec),
}

impl ProcessorCoreUnion {
    /// Number of inputs the core consumes.
    pub fn num_inputs(&self) -> usize {
        match self {
            ProcessorCoreUnion::Values(_) => 0,
            ProcessorCoreUnion::Noop | ProcessorCoreUnion::ProjectSet(_) => 1,
            ProcessorCoreUnion::MergeJoiner(_) => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProcessorCoreUnion::Values(_) => "values",
            ProcessorCoreUnion::Noop => "noop",
            ProcessorCoreUnion::MergeJoiner(_) => "merge joiner",
            ProcessorCoreUnion::ProjectSet(_) => "projectSet",
        }
    }
}
