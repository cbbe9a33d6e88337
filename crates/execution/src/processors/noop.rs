use rowflow_common::{ProcessorId, Result};

use crate::context::FlowCtx;
use crate::post_process::PostProcessSpec;
use crate::processor::{ProcState, ProcStateOpts, ProcessorBase};
use crate::row::ColumnType;
use crate::stream::{RowSource, SourceItem};

/// Passes its single input through, applying only post-processing.
pub struct Noop {
    base: ProcessorBase,
}

impl Noop {
    pub fn new(
        flow_ctx: &FlowCtx,
        processor_id: ProcessorId,
        input: Box<dyn RowSource>,
        post: PostProcessSpec,
    ) -> Result<Self> {
        let types = input.output_types().to_vec();
        let base = ProcessorBase::new(
            "noop",
            flow_ctx.clone(),
            processor_id,
            post,
            &types,
            ProcStateOpts {
                inputs_to_drain: vec![input],
                trailing_meta_callback: None,
            },
        )?;
        Ok(Self { base })
    }
}

impl RowSource for Noop {
    fn output_types(&self) -> &[ColumnType] {
        self.base.output_types()
    }

    fn start(&mut self, ctx: &FlowCtx) {
        self.base.start(ctx);
    }

    fn next(&mut self) -> Option<SourceItem> {
        while self.base.state() == ProcState::Running {
            match self.base.inputs[0].next() {
                None => {
                    self.base.move_to_draining(None);
                    break;
                }
                Some(SourceItem::Meta(meta)) => {
                    if meta.is_err() {
                        self.base.move_to_draining(None);
                    }
                    return Some(SourceItem::Meta(meta));
                }
                Some(SourceItem::Row(row)) => {
                    if let Some(out) = self.base.process_row_helper(row) {
                        return Some(SourceItem::Row(out));
                    }
                }
            }
        }
        self.base.drain_helper().map(SourceItem::Meta)
    }

    fn consumer_done(&mut self) {
        self.base.consumer_done();
    }

    fn consumer_closed(&mut self) {
        self.base.internal_close();
    }
}
