//! Adapts a columnar [`Operator`] back into a row processor.

use std::collections::VecDeque;
use std::sync::Arc;

use rowflow_common::{ProcessorId, Result};

use crate::context::FlowCtx;
use crate::metadata::MetadataSource;
use crate::post_process::PostProcessSpec;
use crate::processor::{ProcState, ProcStateOpts, ProcessorBase};
use crate::row::{ColumnType, Row};
use crate::stream::{RowSource, SourceItem};

use super::{batch_to_rows, catch_vectorized_runtime_error, types_for, Operator};

const MATERIALIZER_PROC_NAME: &str = "materializer";

/// Row processor reading batches from a vectorized operator.
///
/// A vectorized error moves the processor to draining with that error. The
/// registered metadata sources are drained as trailing metadata.
pub struct Materializer {
    base: ProcessorBase,
    input: Box<dyn Operator>,
    pending: VecDeque<Row>,
}

impl Materializer {
    pub fn new(
        flow_ctx: &FlowCtx,
        processor_id: ProcessorId,
        input: Box<dyn Operator>,
        metadata_sources: Vec<Arc<dyn MetadataSource>>,
        post: PostProcessSpec,
    ) -> Result<Self> {
        let types = types_for(input.schema().as_ref())?;
        let base = ProcessorBase::new(
            MATERIALIZER_PROC_NAME,
            flow_ctx.clone(),
            processor_id,
            post,
            &types,
            ProcStateOpts {
                inputs_to_drain: Vec::new(),
                trailing_meta_callback: Some(Box::new(move || {
                    metadata_sources
                        .iter()
                        .flat_map(|src| src.drain_meta())
                        .collect()
                })),
            },
        )?;
        Ok(Self {
            base,
            input,
            pending: VecDeque::new(),
        })
    }

    pub fn state(&self) -> ProcState {
        self.base.state()
    }

    /// Refill `pending` from the operator. Returns false once it is exhausted.
    fn fill(&mut self) -> Result<bool> {
        let input = &mut self.input;
        let batch = catch_vectorized_runtime_error(|| input.next())?;
        if batch.num_rows() == 0 {
            return Ok(false);
        }
        self.pending.extend(batch_to_rows(&batch)?);
        Ok(true)
    }
}

impl RowSource for Materializer {
    fn output_types(&self) -> &[ColumnType] {
        self.base.output_types()
    }

    fn start(&mut self, ctx: &FlowCtx) {
        self.base.start(ctx);
        let input = &mut self.input;
        if let Err(err) = catch_vectorized_runtime_error(|| input.init()) {
            self.base.move_to_draining(Some(err));
        }
    }

    fn next(&mut self) -> Option<SourceItem> {
        while self.base.state() == ProcState::Running {
            let row = match self.pending.pop_front() {
                Some(row) => row,
                None => {
                    match self.fill() {
                        Ok(true) => {}
                        Ok(false) => self.base.move_to_draining(None),
                        Err(err) => self.base.move_to_draining(Some(err)),
                    }
                    continue;
                }
            };
            if let Some(out) = self.base.process_row_helper(row) {
                return Some(SourceItem::Row(out));
            }
        }
        self.pending.clear();
        self.base.drain_helper().map(SourceItem::Meta)
    }

    fn consumer_done(&mut self) {
        self.base.consumer_done();
    }

    fn consumer_closed(&mut self) {
        self.base.internal_close();
    }
}

#[cfg(test)]
mod tests {
    use rowflow_common::RowflowError;

    use super::*;
    use crate::metadata::{CallbackMetadataSource, ProducerMetadata};
    use crate::row::Datum;
    use crate::row_buffer::RowBuffer;
    use crate::vectorized::{rows_to_batch, schema_for, BatchBuffer, Columnarizer, ErrorEmitter};

    fn collect(m: &mut Materializer) -> (Vec<Row>, Vec<ProducerMetadata>) {
        let mut rows = Vec::new();
        let mut metas = Vec::new();
        while let Some(item) = m.next() {
            match item {
                SourceItem::Row(r) => rows.push(r),
                SourceItem::Meta(meta) => metas.push(meta),
            }
        }
        (rows, metas)
    }

    #[test]
    fn columnarize_then_materialize_keeps_rows_and_metadata() {
        let ctx = FlowCtx::for_tests();
        let input = RowBuffer::with_items(
            vec![ColumnType::Int, ColumnType::String],
            vec![
                SourceItem::Row(vec![Datum::Int(1), Datum::from("a")]),
                SourceItem::Meta(ProducerMetadata::RowsAffected(2)),
                SourceItem::Row(vec![Datum::Int(2), Datum::Null]),
            ],
        );
        let col = Columnarizer::new(&ctx, Box::new(input));
        let sources = vec![col.metadata_source()];
        let mut m = Materializer::new(
            &ctx,
            ProcessorId(1),
            Box::new(col),
            sources,
            PostProcessSpec::default(),
        )
        .expect("materializer");
        m.start(&ctx);
        let (rows, metas) = collect(&mut m);
        assert_eq!(
            rows,
            vec![vec![Datum::Int(1), Datum::from("a")], vec![Datum::Int(2), Datum::Null]]
        );
        assert_eq!(metas, vec![ProducerMetadata::RowsAffected(2)]);
        assert_eq!(m.state(), ProcState::Exhausted);
    }

    #[test]
    fn vectorized_error_is_emitted_once_before_trailing_metadata() {
        let ctx = FlowCtx::for_tests();
        let schema = schema_for(&[ColumnType::Int]);
        let mut buf = BatchBuffer::new(schema.clone());
        buf.add(rows_to_batch(&schema, &[vec![Datum::Int(1)]]).expect("batch"));
        let sources: Vec<Arc<dyn MetadataSource>> = vec![Arc::new(CallbackMetadataSource::new(|| {
            vec![ProducerMetadata::Other("stats".into())]
        }))];
        let mut m = Materializer::new(
            &ctx,
            ProcessorId(1),
            Box::new(ErrorEmitter::new(Box::new(buf))),
            sources,
            PostProcessSpec::default(),
        )
        .expect("materializer");
        m.start(&ctx);
        let (rows, metas) = collect(&mut m);
        assert!(rows.is_empty());
        assert_eq!(metas.len(), 2);
        let err = metas[0].err().expect("error first");
        assert!(matches!(err, RowflowError::Internal(_)));
        assert_eq!(metas[1], ProducerMetadata::Other("stats".into()));
    }
}
