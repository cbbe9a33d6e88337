//! Expands every input row with columns produced by set-returning generators
//! and scalar expressions.

use rowflow_common::{ProcessorId, Result, RowflowError};

use crate::context::{CancelChecker, FlowCtx};
use crate::expr::Expr;
use crate::metadata::ProducerMetadata;
use crate::post_process::PostProcessSpec;
use crate::processor::{ProcState, ProcStateOpts, ProcessorBase};
use crate::row::{ColumnType, Datum, Row};
use crate::spec::{ProjectSetExpr, ProjectSetSpec, SetGenerator};
use crate::stream::{RowSource, SourceItem};

const PROJECT_SET_PROC_NAME: &str = "projectSet";

/// Running `generate_series` instance.
#[derive(Debug)]
struct SeriesGen {
    next: i64,
    stop: i64,
    step: i64,
    finished: bool,
}

impl SeriesGen {
    fn start(spec: &SetGenerator, row: &[Datum]) -> Result<Self> {
        let SetGenerator::GenerateSeries { start, stop, step } = spec;
        let args = [
            Some(start.eval(row)?),
            Some(stop.eval(row)?),
            step.as_ref().map(|s| s.eval(row)).transpose()?,
        ];
        let mut ints = [0_i64, 0, 1];
        for (slot, arg) in ints.iter_mut().zip(args) {
            match arg {
                None => {}
                // NULL arguments produce an empty series.
                Some(Datum::Null) => return Ok(Self::empty()),
                Some(Datum::Int(v)) => *slot = v,
                Some(other) => {
                    return Err(RowflowError::Execution(format!(
                        "generate_series: unsupported argument {other}"
                    )))
                }
            }
        }
        if ints[2] == 0 {
            return Err(RowflowError::Execution(
                "generate_series: step cannot be 0".to_string(),
            ));
        }
        Ok(Self {
            next: ints[0],
            stop: ints[1],
            step: ints[2],
            finished: false,
        })
    }

    fn empty() -> Self {
        Self {
            next: 0,
            stop: 0,
            step: 1,
            finished: true,
        }
    }

    fn next_value(&mut self) -> Option<i64> {
        if self.finished {
            return None;
        }
        let past_end = if self.step > 0 {
            self.next > self.stop
        } else {
            self.next < self.stop
        };
        if past_end {
            self.finished = true;
            return None;
        }
        let v = self.next;
        match self.next.checked_add(self.step) {
            Some(n) => self.next = n,
            None => self.finished = true,
        }
        Some(v)
    }
}

pub struct ProjectSet {
    base: ProcessorBase,
    exprs: Vec<ProjectSetExpr>,
    input_width: usize,
    input_row_ready: bool,
    row_buffer: Row,
    gens: Vec<Option<SeriesGen>>,
    done: Vec<bool>,
    cancel_checker: CancelChecker,
}

impl ProjectSet {
    pub fn new(
        flow_ctx: &FlowCtx,
        processor_id: ProcessorId,
        spec: &ProjectSetSpec,
        input: Box<dyn RowSource>,
        post: PostProcessSpec,
    ) -> Result<Self> {
        let input_types = input.output_types().to_vec();
        let mut output_types = input_types.clone();
        for expr in &spec.exprs {
            let ty = match expr {
                ProjectSetExpr::Scalar(e) => e.output_type(&input_types)?,
                ProjectSetExpr::Generator(SetGenerator::GenerateSeries { start, stop, step }) => {
                    for arg in [Some(start), Some(stop), step.as_ref()].into_iter().flatten() {
                        arg.output_type(&input_types)?;
                    }
                    ColumnType::Int
                }
            };
            output_types.push(ty);
        }
        let base = ProcessorBase::new(
            PROJECT_SET_PROC_NAME,
            flow_ctx.clone(),
            processor_id,
            post,
            &output_types,
            ProcStateOpts {
                inputs_to_drain: vec![input],
                trailing_meta_callback: None,
            },
        )?;
        let n = spec.exprs.len();
        Ok(Self {
            base,
            exprs: spec.exprs.clone(),
            input_width: input_types.len(),
            input_row_ready: false,
            row_buffer: vec![Datum::Null; output_types.len()],
            gens: (0..n).map(|_| None).collect(),
            done: vec![false; n],
            cancel_checker: flow_ctx.cancel_checker(),
        })
    }

    pub fn state(&self) -> ProcState {
        self.base.state()
    }

    /// Pull the next input row and start a round of generators for it.
    fn next_input_row(&mut self) -> Result<Option<SourceItem>> {
        let row = match self.base.inputs[0].next() {
            Some(SourceItem::Row(row)) => row,
            other => return Ok(other),
        };
        for (i, expr) in self.exprs.iter().enumerate() {
            if let ProjectSetExpr::Generator(g) = expr {
                self.gens[i] = Some(SeriesGen::start(g, &row)?);
            }
            self.done[i] = false;
        }
        Ok(Some(SourceItem::Row(row)))
    }

    /// Fill the generated columns of the row buffer. Returns whether any
    /// expression produced a new value.
    fn next_generator_values(&mut self) -> Result<bool> {
        let mut new_val = false;
        let mut col = self.input_width;
        for (i, expr) in self.exprs.iter().enumerate() {
            match expr {
                ProjectSetExpr::Generator(_) => {
                    if !self.done[i] {
                        match self.gens[i].as_mut().and_then(SeriesGen::next_value) {
                            Some(v) => {
                                self.row_buffer[col] = Datum::Int(v);
                                new_val = true;
                            }
                            None => {
                                self.done[i] = true;
                                self.row_buffer[col] = Datum::Null;
                            }
                        }
                    }
                }
                ProjectSetExpr::Scalar(e) => {
                    if !self.done[i] {
                        self.row_buffer[col] = e.eval(&self.row_buffer[..self.input_width])?;
                        new_val = true;
                        self.done[i] = true;
                    } else {
                        self.row_buffer[col] = Datum::Null;
                    }
                }
            }
            col += 1;
        }
        Ok(new_val)
    }
}

impl RowSource for ProjectSet {
    fn output_types(&self) -> &[ColumnType] {
        self.base.output_types()
    }

    fn start(&mut self, ctx: &FlowCtx) {
        self.base.start(ctx);
    }

    fn next(&mut self) -> Option<SourceItem> {
        while self.base.state() == ProcState::Running {
            if let Err(err) = self.cancel_checker.check() {
                self.base.move_to_draining(Some(err));
                break;
            }

            if !self.input_row_ready {
                match self.next_input_row() {
                    Err(err) => {
                        self.base.move_to_draining(Some(err));
                        break;
                    }
                    Ok(None) => {
                        self.base.move_to_draining(None);
                        break;
                    }
                    Ok(Some(SourceItem::Meta(meta))) => {
                        if meta.is_err() {
                            self.base.move_to_draining(None);
                        }
                        return Some(SourceItem::Meta(meta));
                    }
                    Ok(Some(SourceItem::Row(row))) => {
                        self.row_buffer[..self.input_width].clone_from_slice(&row);
                        self.input_row_ready = true;
                    }
                }
            }

            match self.next_generator_values() {
                Err(err) => {
                    self.base.move_to_draining(Some(err));
                    break;
                }
                Ok(true) => {
                    if let Some(out) = self.base.process_row_helper(self.row_buffer.clone()) {
                        return Some(SourceItem::Row(out));
                    }
                }
                Ok(false) => self.input_row_ready = false,
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
