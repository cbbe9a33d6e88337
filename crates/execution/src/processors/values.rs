use std::collections::VecDeque;

use rowflow_common::{ProcessorId, Result, RowflowError};

use crate::context::FlowCtx;
use crate::post_process::PostProcessSpec;
use crate::processor::{ProcState, ProcStateOpts, ProcessorBase};
use crate::row::{ColumnType, Row};
use crate::spec::ValuesSpec;
use crate::stream::{RowSource, SourceItem};

/// Emits a fixed list of rows.
pub struct Values {
    base: ProcessorBase,
    rows: VecDeque<Row>,
}

impl Values {
    pub fn new(
        flow_ctx: &FlowCtx,
        processor_id: ProcessorId,
        spec: &ValuesSpec,
        post: PostProcessSpec,
    ) -> Result<Self> {
        if let Some(bad) = spec.rows.iter().find(|r| r.len() != spec.types.len()) {
            return Err(RowflowError::Planning(format!(
                "values row has {} columns, expected {}",
                bad.len(),
                spec.types.len()
            )));
        }
        let base = ProcessorBase::new(
            "values",
            flow_ctx.clone(),
            processor_id,
            post,
            &spec.types,
            ProcStateOpts::default(),
        )?;
        Ok(Self {
            base,
            rows: spec.rows.iter().cloned().collect(),
        })
    }
}

impl RowSource for Values {
    fn output_types(&self) -> &[ColumnType] {
        self.base.output_types()
    }

    fn start(&mut self, ctx: &FlowCtx) {
        self.base.start(ctx);
    }

    fn next(&mut self) -> Option<SourceItem> {
        while self.base.state() == ProcState::Running {
            let Some(row) = self.rows.pop_front() else {
                self.base.move_to_draining(None);
                break;
            };
            if let Some(out) = self.base.process_row_helper(row) {
                return Some(SourceItem::Row(out));
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
