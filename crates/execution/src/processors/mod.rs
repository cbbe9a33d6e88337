//! Row processors and the factory building them from specs.

mod merge_joiner;
mod noop;
mod project_set;
mod stream_merger;
mod values;

pub use merge_joiner::MergeJoiner;
pub use noop::Noop;
pub use project_set::ProjectSet;
pub use stream_merger::{MergedBatch, StreamMerger};
pub use values::Values;

use rowflow_common::{ProcessorId, Result, RowflowError};

use crate::context::FlowCtx;
use crate::post_process::PostProcessSpec;
use crate::spec::ProcessorCoreUnion;
use crate::stream::RowSource;

/// Build the processor described by `core` over `inputs`.
///
/// `inputs` must match [`ProcessorCoreUnion::num_inputs`]; for a merge joiner
/// they are `[left, right]`.
pub fn new_processor(
    flow_ctx: &FlowCtx,
    processor_id: ProcessorId,
    core: &ProcessorCoreUnion,
    post: &PostProcessSpec,
    inputs: Vec<Box<dyn RowSource>>,
) -> Result<Box<dyn RowSource>> {
    if inputs.len() != core.num_inputs() {
        return Err(RowflowError::Planning(format!(
            "{} processor {processor_id} expects {} inputs, got {}",
            core.name(),
            core.num_inputs(),
            inputs.len()
        )));
    }
    let post = post.clone();
    let mut inputs = inputs.into_iter();
    let mut take_input = || {
        inputs
            .next()
            .ok_or_else(|| RowflowError::Internal("missing processor input".to_string()))
    };
    let proc: Box<dyn RowSource> = match core {
        ProcessorCoreUnion::Values(spec) => {
            Box::new(Values::new(flow_ctx, processor_id, spec, post)?)
        }
        ProcessorCoreUnion::Noop => {
            Box::new(Noop::new(flow_ctx, processor_id, take_input()?, post)?)
        }
        ProcessorCoreUnion::MergeJoiner(spec) => {
            let left = take_input()?;
            let right = take_input()?;
            Box::new(MergeJoiner::new(flow_ctx, processor_id, spec, left, right, post)?)
        }
        ProcessorCoreUnion::ProjectSet(spec) => Box::new(ProjectSet::new(
            flow_ctx,
            processor_id,
            spec,
            take_input()?,
            post,
        )?),
    };
    Ok(proc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ProducerMetadata;
    use crate::row::{ColumnOrdering, ColumnType, Datum};
    use crate::row_buffer::RowBuffer;
    use crate::spec::{JoinType, MergeJoinerSpec, ValuesSpec};
    use crate::stream::{run_processor, ConsumerStatus, SourceItem};

    fn values(keys: &[i64]) -> ProcessorCoreUnion {
        ProcessorCoreUnion::Values(ValuesSpec {
            types: vec![ColumnType::Int],
            rows: keys.iter().map(|k| vec![Datum::Int(*k)]).collect(),
        })
    }

    #[test]
    fn factory_builds_a_pipeline() {
        let ctx = FlowCtx::for_tests();
        let post = PostProcessSpec::default();
        let left =
            new_processor(&ctx, ProcessorId(0), &values(&[1, 2, 3]), &post, vec![]).expect("left");
        let right =
            new_processor(&ctx, ProcessorId(1), &values(&[2, 3, 4]), &post, vec![]).expect("right");
        let join = ProcessorCoreUnion::MergeJoiner(MergeJoinerSpec {
            left_ordering: vec![ColumnOrdering::asc(0)],
            right_ordering: vec![ColumnOrdering::asc(0)],
            join_type: JoinType::Inner,
            on_expr: None,
            null_equality: false,
        });
        let joined = new_processor(
            &ctx,
            ProcessorId(2),
            &join,
            &PostProcessSpec::default().with_projection(vec![0]),
            vec![left, right],
        )
        .expect("join");
        let mut noop = new_processor(
            &ctx,
            ProcessorId(3),
            &ProcessorCoreUnion::Noop,
            &post,
            vec![joined],
        )
        .expect("noop");
        assert_eq!(noop.output_types(), &[ColumnType::Int]);

        let out = RowBuffer::new(vec![ColumnType::Int]);
        run_processor(&ctx, noop.as_mut(), &out);
        assert_eq!(out.rows(), vec![vec![Datum::Int(2)], vec![Datum::Int(3)]]);
        assert!(out.metadata().is_empty());
        assert!(out.producer_done_called());
    }

    #[test]
    fn factory_rejects_wrong_input_count() {
        let ctx = FlowCtx::for_tests();
        let err = new_processor(
            &ctx,
            ProcessorId(7),
            &ProcessorCoreUnion::Noop,
            &PostProcessSpec::default(),
            vec![],
        )
        .err()
        .expect("must fail");
        assert!(err.to_string().contains("expects 1 inputs"));
    }

    #[test]
    fn closed_consumer_stops_values_early() {
        let ctx = FlowCtx::for_tests();
        let mut src = new_processor(
            &ctx,
            ProcessorId(0),
            &values(&[1, 2, 3]),
            &PostProcessSpec::default(),
            vec![],
        )
        .expect("values");
        let out = RowBuffer::new(vec![ColumnType::Int]).with_on_push(|_| {});
        out.set_status(ConsumerStatus::ConsumerClosed);
        run_processor(&ctx, src.as_mut(), &out);
        assert_eq!(out.items().len(), 1);
        assert!(src.next().is_none());
    }

    #[test]
    fn noop_forwards_input_errors_then_drains() {
        let ctx = FlowCtx::for_tests();
        let input = RowBuffer::with_items(
            vec![ColumnType::Int],
            vec![
                SourceItem::Row(vec![Datum::Int(1)]),
                SourceItem::Meta(ProducerMetadata::Err(RowflowError::Execution("bad".into()))),
                SourceItem::Row(vec![Datum::Int(2)]),
                SourceItem::Meta(ProducerMetadata::RowsAffected(1)),
            ],
        );
        let mut noop = new_processor(
            &ctx,
            ProcessorId(0),
            &ProcessorCoreUnion::Noop,
            &PostProcessSpec::default(),
            vec![Box::new(input)],
        )
        .expect("noop");
        noop.start(&ctx);
        let items: Vec<_> = std::iter::from_fn(|| noop.next()).collect();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], SourceItem::Row(vec![Datum::Int(1)]));
        assert!(matches!(&items[1], SourceItem::Meta(m) if m.is_err()));
        assert_eq!(items[2], SourceItem::Meta(ProducerMetadata::RowsAffected(1)));
    }
}
