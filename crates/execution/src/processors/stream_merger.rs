//! Aligns two ordered row sources into batches of equal-key rows.

use std::cmp::Ordering;
use std::sync::Arc;

use rowflow_common::{BoundAccount, BytesMonitor, RowflowError};

use crate::metadata::ProducerMetadata;
use crate::row::{compare_rows, row_size_bytes, ColumnOrdering, Datum, Direction, Row};
use crate::stream::{RowSource, SourceItem};

/// One step of a [`StreamMerger`].
#[derive(Debug, PartialEq)]
pub enum MergedBatch {
    /// Equal-key runs from each side. A side whose current run does not match
    /// the other side's key is empty.
    Batches { left: Vec<Row>, right: Vec<Row> },
    /// Metadata from either input.
    Meta(ProducerMetadata),
    /// Both inputs are exhausted.
    Done,
}

/// Groups consecutive rows of one ordered source sharing a key.
#[derive(Debug)]
struct GroupAccumulator {
    ordering: Vec<ColumnOrdering>,
    cur_group: Vec<Row>,
    leftover: Option<Row>,
    src_consumed: bool,
    account: BoundAccount,
}

impl GroupAccumulator {
    fn new(ordering: Vec<ColumnOrdering>, account: BoundAccount) -> Self {
        Self {
            ordering,
            cur_group: Vec::new(),
            leftover: None,
            src_consumed: false,
            account,
        }
    }

    /// Next run of equal-key rows, `Ok(None)` once the source is exhausted.
    ///
    /// Metadata interrupts accumulation; the partial run is kept and
    /// completed on the following call.
    fn next_group(
        &mut self,
        src: &mut dyn RowSource,
    ) -> Result<Option<Vec<Row>>, ProducerMetadata> {
        if self.src_consumed {
            return Ok(None);
        }
        if let Some(row) = self.leftover.take() {
            self.cur_group.push(row);
        }
        loop {
            let row = match src.next() {
                Some(SourceItem::Meta(meta)) => return Err(meta),
                Some(SourceItem::Row(row)) => row,
                None => {
                    self.src_consumed = true;
                    if self.cur_group.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(std::mem::take(&mut self.cur_group)));
                }
            };
            self.account
                .grow(row_size_bytes(&row))
                .map_err(ProducerMetadata::Err)?;
            let Some(first) = self.cur_group.first() else {
                self.cur_group.push(row);
                continue;
            };
            match compare_rows(&self.ordering, first, &row) {
                Ordering::Equal => self.cur_group.push(row),
                Ordering::Greater => {
                    return Err(ProducerMetadata::Err(RowflowError::Execution(format!(
                        "detected badly ordered input: {} > {}, but expected '<'",
                        render_key(&self.ordering, first),
                        render_key(&self.ordering, &row),
                    ))))
                }
                Ordering::Less => {
                    let group = std::mem::take(&mut self.cur_group);
                    // Only the leftover row stays buffered.
                    let leftover_size = row_size_bytes(&row);
                    self.account.clear();
                    self.account
                        .grow(leftover_size)
                        .map_err(ProducerMetadata::Err)?;
                    self.leftover = Some(row);
                    return Ok(Some(group));
                }
            }
        }
    }

    fn close(&mut self) {
        self.cur_group = Vec::new();
        self.leftover = None;
        self.src_consumed = true;
        self.account.clear();
    }
}

fn render_key(ordering: &[ColumnOrdering], row: &[Datum]) -> String {
    let cells: Vec<String> = ordering
        .iter()
        .map(|o| row[o.col_idx].to_string())
        .collect();
    format!("({})", cells.join(", "))
}

/// Produces aligned batches from a left and a right source ordered on
/// compatible key columns.
#[derive(Debug)]
pub struct StreamMerger {
    left: GroupAccumulator,
    right: GroupAccumulator,
    left_group: Option<Vec<Row>>,
    right_group: Option<Vec<Row>>,
    null_equality: bool,
    monitor: Arc<BytesMonitor>,
}

impl StreamMerger {
    /// Orderings must have the same length and directions.
    pub fn new(
        left_ordering: Vec<ColumnOrdering>,
        right_ordering: Vec<ColumnOrdering>,
        null_equality: bool,
        monitor: Arc<BytesMonitor>,
    ) -> rowflow_common::Result<Self> {
        if left_ordering.len() != right_ordering.len() {
            return Err(RowflowError::Planning(
                "ordering lengths do not match".to_string(),
            ));
        }
        let left = GroupAccumulator::new(left_ordering, monitor.make_account());
        let right = GroupAccumulator::new(right_ordering, monitor.make_account());
        Ok(Self {
            left,
            right,
            left_group: None,
            right_group: None,
            null_equality,
            monitor,
        })
    }

    /// Monitor backing both sides' reservations.
    pub fn monitor(&self) -> &Arc<BytesMonitor> {
        &self.monitor
    }

    /// Pull the next aligned pair of runs from `inputs` (`[left, right]`).
    pub fn next_batch(&mut self, inputs: &mut [Box<dyn RowSource>]) -> MergedBatch {
        let [left_src, right_src] = inputs else {
            return MergedBatch::Meta(ProducerMetadata::Err(RowflowError::Internal(format!(
                "stream merger needs 2 inputs, got {}",
                inputs.len()
            ))));
        };
        if self.left_group.is_none() {
            match self.left.next_group(left_src.as_mut()) {
                Ok(group) => self.left_group = group,
                Err(meta) => return MergedBatch::Meta(meta),
            }
        }
        if self.right_group.is_none() {
            match self.right.next_group(right_src.as_mut()) {
                Ok(group) => self.right_group = group,
                Err(meta) => return MergedBatch::Meta(meta),
            }
        }
        let cmp = match (&self.left_group, &self.right_group) {
            (None, None) => return MergedBatch::Done,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(l), Some(r)) => self.compare_for_merge(&l[0], &r[0]),
        };
        let left = if cmp != Ordering::Greater {
            self.left_group.take().unwrap_or_default()
        } else {
            Vec::new()
        };
        let right = if cmp != Ordering::Less {
            self.right_group.take().unwrap_or_default()
        } else {
            Vec::new()
        };
        MergedBatch::Batches { left, right }
    }

    /// Release every buffered run. Further calls to `next_batch` report
    /// `Done`.
    pub fn close(&mut self) {
        self.left_group = None;
        self.right_group = None;
        self.left.close();
        self.right.close();
    }

    /// Compare a left and a right row on the key columns. NULL keys never
    /// compare equal unless `null_equality` is set.
    fn compare_for_merge(&self, l: &[Datum], r: &[Datum]) -> Ordering {
        for (lo, ro) in self.left.ordering.iter().zip(&self.right.ordering) {
            let (ld, rd) = (&l[lo.col_idx], &r[ro.col_idx]);
            if ld.is_null() && rd.is_null() {
                if !self.null_equality {
                    return Ordering::Less;
                }
                continue;
            }
            let mut ord = ld.total_cmp(rd);
            if lo.direction == Direction::Desc {
                ord = ord.reverse();
            }
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::ColumnType;
    use crate::row_buffer::RowBuffer;

    fn source(keys: &[Option<i64>]) -> Box<dyn RowSource> {
        let rows = keys
            .iter()
            .map(|k| vec![k.map(Datum::Int).unwrap_or(Datum::Null)])
            .collect();
        Box::new(RowBuffer::from_rows(vec![ColumnType::Int], rows))
    }

    fn keys(rows: &[Row]) -> Vec<Datum> {
        rows.iter().map(|r| r[0].clone()).collect()
    }

    fn merger(null_equality: bool, budget: usize) -> StreamMerger {
        StreamMerger::new(
            vec![ColumnOrdering::asc(0)],
            vec![ColumnOrdering::asc(0)],
            null_equality,
            BytesMonitor::new("mergejoiner-mem", budget),
        )
        .expect("merger")
    }

    #[test]
    fn aligns_equal_key_runs() {
        let mut inputs = vec![
            source(&[Some(1), Some(1), Some(3)]),
            source(&[Some(1), Some(2), Some(3), Some(3)]),
        ];
        let mut m = merger(false, usize::MAX);
        let mut steps = Vec::new();
        loop {
            match m.next_batch(&mut inputs) {
                MergedBatch::Batches { left, right } => steps.push((keys(&left), keys(&right))),
                MergedBatch::Done => break,
                MergedBatch::Meta(meta) => panic!("unexpected metadata {meta}"),
            }
        }
        assert_eq!(
            steps,
            vec![
                (vec![Datum::Int(1), Datum::Int(1)], vec![Datum::Int(1)]),
                (vec![], vec![Datum::Int(2)]),
                (vec![Datum::Int(3)], vec![Datum::Int(3), Datum::Int(3)]),
            ]
        );
        assert_eq!(m.next_batch(&mut inputs), MergedBatch::Done);
    }

    #[test]
    fn null_keys_match_only_with_null_equality() {
        let run = |null_equality| {
            let mut inputs = vec![source(&[None]), source(&[None])];
            let mut m = merger(null_equality, usize::MAX);
            match m.next_batch(&mut inputs) {
                MergedBatch::Batches { left, right } => (left.len(), right.len()),
                other => panic!("unexpected {other:?}"),
            }
        };
        assert_eq!(run(false), (1, 0));
        assert_eq!(run(true), (1, 1));
    }

    #[test]
    fn badly_ordered_input_is_an_error() {
        let mut inputs = vec![source(&[Some(2), Some(1)]), source(&[Some(1)])];
        let mut m = merger(false, usize::MAX);
        match m.next_batch(&mut inputs) {
            MergedBatch::Meta(meta) => {
                assert!(meta.err().expect("err").to_string().contains("badly ordered"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn over_budget_run_yields_resource_exhausted() {
        let mut inputs = vec![source(&[Some(1), Some(1), Some(1)]), source(&[Some(1)])];
        let row_size = row_size_bytes(&[Datum::Int(1)]);
        let mut m = merger(false, row_size * 2);
        match m.next_batch(&mut inputs) {
            MergedBatch::Meta(ProducerMetadata::Err(RowflowError::ResourceExhausted { .. })) => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
