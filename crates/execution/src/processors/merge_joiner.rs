//! Merge join over two inputs sharing an ordering on their equality columns.
//!
//! Output preserves that ordering. Only the current equal-key run of each
//! side is buffered, never the full inputs.

use std::collections::HashSet;
use std::sync::Arc;

use rowflow_common::{BytesMonitor, ProcessorId, Result, RowflowError};

use crate::context::{CancelChecker, FlowCtx};
use crate::expr::Expr;
use crate::metadata::{ProducerMetadata, SpanRecord};
use crate::post_process::PostProcessSpec;
use crate::processor::{ProcState, ProcStateOpts, ProcessorBase, TrailingMetaCallback};
use crate::processors::stream_merger::{MergedBatch, StreamMerger};
use crate::row::{ColumnType, Datum, Row};
use crate::spec::{JoinType, MergeJoinerSpec};
use crate::stream::{RowSource, SourceItem};

const MERGE_JOINER_PROC_NAME: &str = "merge joiner";

/// Which side of the join an unmatched row comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinSide {
    Left,
    Right,
}

pub struct MergeJoiner {
    base: ProcessorBase,
    join_type: JoinType,
    on_expr: Option<Expr>,
    left_width: usize,
    right_width: usize,
    merger: StreamMerger,
    cancel_checker: CancelChecker,
    left_rows: Vec<Row>,
    right_rows: Vec<Row>,
    left_idx: usize,
    right_idx: usize,
    emit_unmatched_right: bool,
    matched_right: HashSet<usize>,
    matched_right_count: usize,
}

impl MergeJoiner {
    pub fn new(
        flow_ctx: &FlowCtx,
        processor_id: ProcessorId,
        spec: &MergeJoinerSpec,
        left: Box<dyn RowSource>,
        right: Box<dyn RowSource>,
        post: PostProcessSpec,
    ) -> Result<Self> {
        if spec.left_ordering.len() != spec.right_ordering.len()
            || spec
                .left_ordering
                .iter()
                .zip(&spec.right_ordering)
                .any(|(l, r)| l.direction != r.direction)
        {
            return Err(RowflowError::Planning(
                "unmatched column orderings".to_string(),
            ));
        }
        let left_types = left.output_types().to_vec();
        let right_types = right.output_types().to_vec();
        for (ordering, types) in [
            (&spec.left_ordering, &left_types),
            (&spec.right_ordering, &right_types),
        ] {
            if let Some(bad) = ordering.iter().find(|o| o.col_idx >= types.len()) {
                return Err(RowflowError::Planning(format!(
                    "ordering column {} out of range for {} input columns",
                    bad.col_idx,
                    types.len()
                )));
            }
        }

        let mut combined = left_types.clone();
        combined.extend_from_slice(&right_types);
        if let Some(on) = &spec.on_expr {
            on.output_type(&combined)?;
        }
        let core_types: Vec<ColumnType> = if spec.join_type.includes_right_columns() {
            combined
        } else {
            left_types.clone()
        };

        let monitor = BytesMonitor::new(
            "mergejoiner-mem",
            flow_ctx.config.merge_join_mem_budget_bytes,
        );
        let merger = StreamMerger::new(
            spec.left_ordering.clone(),
            spec.right_ordering.clone(),
            spec.null_equality,
            Arc::clone(&monitor),
        )?;
        let trailing_meta_callback = flow_ctx.trace_enabled.then(|| {
            Box::new(move || {
                vec![ProducerMetadata::TraceData(vec![SpanRecord {
                    operation: MERGE_JOINER_PROC_NAME.to_string(),
                    duration_micros: 0,
                    tags: vec![(
                        "mergejoiner.max_memory".to_string(),
                        monitor.maximum_bytes().to_string(),
                    )],
                }])]
            }) as TrailingMetaCallback
        });

        let base = ProcessorBase::new(
            MERGE_JOINER_PROC_NAME,
            flow_ctx.clone(),
            processor_id,
            post,
            &core_types,
            ProcStateOpts {
                inputs_to_drain: vec![left, right],
                trailing_meta_callback,
            },
        )?;

        Ok(Self {
            base,
            join_type: spec.join_type,
            on_expr: spec.on_expr.clone(),
            left_width: left_types.len(),
            right_width: right_types.len(),
            merger,
            cancel_checker: flow_ctx.cancel_checker(),
            left_rows: Vec::new(),
            right_rows: Vec::new(),
            left_idx: 0,
            right_idx: 0,
            emit_unmatched_right: false,
            matched_right: HashSet::new(),
            matched_right_count: 0,
        })
    }

    pub fn state(&self) -> ProcState {
        self.base.state()
    }

    /// Bytes currently buffered by the merger's runs.
    pub fn buffered_bytes(&self) -> usize {
        self.merger.monitor().allocated_bytes()
    }

    /// Join a left and right row, or `None` if the ON condition rejects them.
    fn render(&self, lrow: &[Datum], rrow: &[Datum]) -> Result<Option<Row>> {
        let mut combined = Vec::with_capacity(lrow.len() + rrow.len());
        combined.extend_from_slice(lrow);
        combined.extend_from_slice(rrow);
        if let Some(on) = &self.on_expr {
            if !on.eval_filter(&combined)? {
                return Ok(None);
            }
        }
        if !self.join_type.includes_right_columns() {
            combined.truncate(self.left_width);
        }
        Ok(Some(combined))
    }

    fn render_unmatched_row(&self, row: &[Datum], side: JoinSide) -> Row {
        match side {
            JoinSide::Left => {
                let mut out = row.to_vec();
                if self.join_type.includes_right_columns() {
                    out.extend(std::iter::repeat(Datum::Null).take(self.right_width));
                }
                out
            }
            JoinSide::Right => {
                let mut out = vec![Datum::Null; self.left_width];
                out.extend_from_slice(row);
                out
            }
        }
    }

    /// Restartable cursor over the current pair of runs. Returns the next
    /// core row, metadata, or `None` once both inputs are exhausted.
    fn next_row(&mut self) -> Option<SourceItem> {
        loop {
            while self.left_idx < self.left_rows.len() {
                while self.right_idx < self.right_rows.len() {
                    let ridx = self.right_idx;
                    self.right_idx += 1;
                    let rendered =
                        match self.render(&self.left_rows[self.left_idx], &self.right_rows[ridx]) {
                            Ok(r) => r,
                            Err(err) => return Some(SourceItem::Meta(ProducerMetadata::Err(err))),
                        };
                    let Some(rendered) = rendered else {
                        continue;
                    };
                    self.matched_right_count += 1;
                    if matches!(self.join_type, JoinType::LeftAnti | JoinType::ExceptAll) {
                        break;
                    }
                    if self.emit_unmatched_right {
                        self.matched_right.insert(ridx);
                    }
                    if matches!(self.join_type, JoinType::LeftSemi | JoinType::IntersectAll) {
                        // One match is enough.
                        self.right_idx = self.right_rows.len();
                    }
                    return Some(SourceItem::Row(rendered));
                }

                if let Err(err) = self.cancel_checker.check() {
                    return Some(SourceItem::Meta(ProducerMetadata::Err(err)));
                }

                let lidx = self.left_idx;
                self.left_idx += 1;
                self.right_idx = 0;
                // Right rows matched by earlier left rows are consumed.
                if self.join_type.is_set_op() {
                    self.right_idx = self.left_idx;
                }

                if self.matched_right_count == 0 && self.join_type.emits_unmatched_left() {
                    let row = self.render_unmatched_row(&self.left_rows[lidx], JoinSide::Left);
                    return Some(SourceItem::Row(row));
                }
                self.matched_right_count = 0;
            }

            if self.emit_unmatched_right {
                while self.right_idx < self.right_rows.len() {
                    let ridx = self.right_idx;
                    self.right_idx += 1;
                    if self.matched_right.contains(&ridx) {
                        continue;
                    }
                    let row = self.render_unmatched_row(&self.right_rows[ridx], JoinSide::Right);
                    return Some(SourceItem::Row(row));
                }
                self.matched_right.clear();
                self.emit_unmatched_right = false;
            }

            match self.merger.next_batch(&mut self.base.inputs) {
                MergedBatch::Meta(meta) => return Some(SourceItem::Meta(meta)),
                MergedBatch::Done => return None,
                MergedBatch::Batches { left, right } => {
                    self.left_rows = left;
                    self.right_rows = right;
                }
            }
            self.emit_unmatched_right = self.join_type.emits_unmatched_right();
            self.left_idx = 0;
            self.right_idx = 0;
        }
    }

    fn close(&mut self) {
        self.base.internal_close();
        self.left_rows = Vec::new();
        self.right_rows = Vec::new();
        self.matched_right.clear();
        self.merger.close();
    }
}

impl RowSource for MergeJoiner {
    fn output_types(&self) -> &[ColumnType] {
        self.base.output_types()
    }

    fn start(&mut self, ctx: &FlowCtx) {
        self.base.start(ctx);
    }

    fn next(&mut self) -> Option<SourceItem> {
        while self.base.state() == ProcState::Running {
            match self.next_row() {
                Some(SourceItem::Meta(meta)) => {
                    if meta.is_err() {
                        self.base.move_to_draining(None);
                    }
                    return Some(SourceItem::Meta(meta));
                }
                None => {
                    self.base.move_to_draining(None);
                    break;
                }
                Some(SourceItem::Row(row)) => {
                    if let Some(out) = self.base.process_row_helper(row) {
                        return Some(SourceItem::Row(out));
                    }
                }
            }
        }
        let meta = self.base.drain_helper();
        if self.base.state() == ProcState::Exhausted {
            self.close();
        }
        meta.map(SourceItem::Meta)
    }

    fn consumer_done(&mut self) {
        self.base.consumer_done();
    }

    fn consumer_closed(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[path = "merge_joiner_tests.rs"]
mod tests;
