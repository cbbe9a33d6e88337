//! Lifecycle state machine shared by every row processor.
//!
//! A processor embeds a [`ProcessorBase`] and implements `next` as:
//!
//! ```text
//! while base.state() == Running {
//!     produce a core row or metadata
//!     metadata with an error -> move_to_draining(None), return it
//!     no more rows           -> move_to_draining(None)
//!     row                    -> process_row_helper(row), return it if kept
//! }
//! return base.drain_helper()
//! ```
//!
//! State transitions: `Running -> Draining -> TrailingMeta -> Exhausted`.
//! Draining pulls every input to exhaustion, discarding rows and forwarding
//! their metadata. TrailingMeta emits the processor's own accumulated metadata
//! (its error first). Exhausted is terminal and idempotent.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use rowflow_common::{global_metrics, ProcessorId, RowflowError};
use tracing::debug;

use crate::context::FlowCtx;
use crate::metadata::{ProducerMetadata, SpanRecord};
use crate::post_process::{PostProcessSpec, ProcOutputHelper};
use crate::row::{ColumnType, Row};
use crate::stream::{RowSource, SourceItem};

/// Processor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Producing rows.
    Running,
    /// Draining inputs for their metadata.
    Draining,
    /// Emitting own accumulated metadata.
    TrailingMeta,
    /// Terminal; `next` returns `None` forever.
    Exhausted,
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcState::Running => "running",
            ProcState::Draining => "draining",
            ProcState::TrailingMeta => "trailing meta",
            ProcState::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

/// Callback producing extra metadata when a processor enters TrailingMeta.
pub type TrailingMetaCallback = Box<dyn FnMut() -> Vec<ProducerMetadata> + Send>;

/// Construction options for [`ProcessorBase`].
#[derive(Default)]
pub struct ProcStateOpts {
    /// Inputs drained, in order, when the processor moves to draining.
    pub inputs_to_drain: Vec<Box<dyn RowSource>>,
    /// Runs exactly once, on entering TrailingMeta.
    pub trailing_meta_callback: Option<TrailingMetaCallback>,
}

/// Shared processor state: lifecycle, inputs, output post-processing and
/// trailing metadata.
pub struct ProcessorBase {
    name: &'static str,
    processor_id: ProcessorId,
    flow_ctx: FlowCtx,
    state: ProcState,
    out: ProcOutputHelper,
    /// Inputs owned by this processor, drained in order.
    pub inputs: Vec<Box<dyn RowSource>>,
    drain_idx: usize,
    trailing_meta: VecDeque<ProducerMetadata>,
    trailing_meta_callback: Option<TrailingMetaCallback>,
    started_at: Option<Instant>,
    rows_out: u64,
    meta_out: u64,
}

impl ProcessorBase {
    /// Set up the base for a processor whose core produces `core_types` rows.
    pub fn new(
        name: &'static str,
        flow_ctx: FlowCtx,
        processor_id: ProcessorId,
        post: PostProcessSpec,
        core_types: &[ColumnType],
        opts: ProcStateOpts,
    ) -> rowflow_common::Result<Self> {
        let out = ProcOutputHelper::new(post, core_types)?;
        Ok(Self {
            name,
            processor_id,
            flow_ctx,
            state: ProcState::Running,
            out,
            inputs: opts.inputs_to_drain,
            drain_idx: 0,
            trailing_meta: VecDeque::new(),
            trailing_meta_callback: opts.trailing_meta_callback,
            started_at: None,
            rows_out: 0,
            meta_out: 0,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ProcState {
        self.state
    }

    pub fn flow_ctx(&self) -> &FlowCtx {
        &self.flow_ctx
    }

    /// Output types after post-processing.
    pub fn output_types(&self) -> &[ColumnType] {
        self.out.output_types()
    }

    /// Start every input.
    pub fn start(&mut self, ctx: &FlowCtx) {
        self.started_at = Some(Instant::now());
        for input in &mut self.inputs {
            input.start(ctx);
        }
    }

    /// Queue `meta` to be emitted once draining finishes.
    pub fn append_trailing_meta(&mut self, meta: ProducerMetadata) {
        self.trailing_meta.push_back(meta);
    }

    /// Stop producing rows. `err`, if any, becomes the first trailing
    /// metadata record. Has no effect outside `Running`.
    pub fn move_to_draining(&mut self, err: Option<RowflowError>) {
        if self.state != ProcState::Running {
            if let Some(err) = err {
                debug!(
                    processor = self.name,
                    state = %self.state,
                    error = %err,
                    "ignoring error reported after processor stopped running"
                );
            }
            return;
        }
        if let Some(err) = err {
            self.trailing_meta.push_back(ProducerMetadata::Err(err));
        }
        if self.inputs.is_empty() {
            self.move_to_trailing_meta();
            return;
        }
        debug!(
            flow_id = %self.flow_ctx.flow_id,
            processor = self.name,
            processor_id = %self.processor_id,
            "processor draining inputs"
        );
        self.state = ProcState::Draining;
        for input in &mut self.inputs {
            input.consumer_done();
        }
    }

    /// Produce the next metadata record while not running, or `None` once
    /// everything was emitted (the processor is then Exhausted).
    pub fn drain_helper(&mut self) -> Option<ProducerMetadata> {
        if self.state == ProcState::Running {
            // Callers only reach here after leaving Running.
            self.move_to_draining(Some(RowflowError::Internal(format!(
                "{}: drain helper called while running",
                self.name
            ))));
        }
        if let Some(meta) = self.pop_trailing_meta() {
            return Some(meta);
        }
        match self.state {
            ProcState::Draining => {}
            ProcState::TrailingMeta => {
                self.internal_close();
                return None;
            }
            _ => return None,
        }
        while self.drain_idx < self.inputs.len() {
            match self.inputs[self.drain_idx].next() {
                None => self.drain_idx += 1,
                Some(SourceItem::Row(_)) => {}
                Some(SourceItem::Meta(meta)) => {
                    self.meta_out += 1;
                    return Some(meta);
                }
            }
        }
        self.move_to_trailing_meta();
        if let Some(meta) = self.pop_trailing_meta() {
            return Some(meta);
        }
        self.internal_close();
        None
    }

    /// Apply post-processing to a core row. Errors and a reached limit move
    /// the processor to draining.
    pub fn process_row_helper(&mut self, row: Row) -> Option<Row> {
        match self.out.process_row(row) {
            Ok((out, more)) => {
                if !more {
                    self.move_to_draining(None);
                }
                if out.is_some() {
                    self.rows_out += 1;
                }
                out
            }
            Err(err) => {
                self.move_to_draining(Some(err));
                None
            }
        }
    }

    /// Move to Exhausted and close inputs that were not fully drained.
    /// Returns whether this call performed the close.
    pub fn internal_close(&mut self) -> bool {
        if self.state == ProcState::Exhausted {
            return false;
        }
        self.state = ProcState::Exhausted;
        for input in self.inputs.iter_mut().skip(self.drain_idx) {
            input.consumer_closed();
        }
        self.drain_idx = self.inputs.len();
        global_metrics().record_processor_output(self.name, self.rows_out, self.meta_out);
        debug!(
            flow_id = %self.flow_ctx.flow_id,
            processor = self.name,
            processor_id = %self.processor_id,
            rows_out = self.rows_out,
            "processor closed"
        );
        true
    }

    /// Consumer-requested drain.
    pub fn consumer_done(&mut self) {
        self.move_to_draining(None);
    }

    /// Consumer-requested close.
    pub fn consumer_closed(&mut self) {
        self.internal_close();
    }

    fn move_to_trailing_meta(&mut self) {
        self.state = ProcState::TrailingMeta;
        if let Some(mut cb) = self.trailing_meta_callback.take() {
            self.trailing_meta.extend(cb());
        }
        if self.flow_ctx.trace_enabled {
            let duration_micros = self
                .started_at
                .map(|t| t.elapsed().as_micros() as u64)
                .unwrap_or_default();
            self.trailing_meta
                .push_back(ProducerMetadata::TraceData(vec![SpanRecord {
                    operation: self.name.to_string(),
                    duration_micros,
                    tags: vec![
                        ("processor_id".to_string(), self.processor_id.to_string()),
                        ("rows_out".to_string(), self.rows_out.to_string()),
                    ],
                }]));
        }
    }

    fn pop_trailing_meta(&mut self) -> Option<ProducerMetadata> {
        let meta = self.trailing_meta.pop_front()?;
        self.meta_out += 1;
        Some(meta)
    }
}

impl fmt::Debug for ProcessorBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorBase")
            .field("name", &self.name)
            .field("processor_id", &self.processor_id)
            .field("state", &self.state)
            .field("inputs", &self.inputs.len())
            .field("trailing_meta", &self.trailing_meta.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Datum;
    use crate::row_buffer::RowBuffer;

    fn base_with_inputs(inputs: Vec<Box<dyn RowSource>>) -> ProcessorBase {
        ProcessorBase::new(
            "test",
            FlowCtx::for_tests(),
            ProcessorId(1),
            PostProcessSpec::default(),
            &[ColumnType::Int],
            ProcStateOpts {
                inputs_to_drain: inputs,
                trailing_meta_callback: Some(Box::new(|| {
                    vec![ProducerMetadata::Other("callback".to_string())]
                })),
            },
        )
        .expect("base")
    }

    #[test]
    fn drain_order_is_own_error_then_inputs_then_callback() {
        let input = RowBuffer::with_items(
            vec![ColumnType::Int],
            vec![
                SourceItem::Row(vec![Datum::Int(1)]),
                SourceItem::Meta(ProducerMetadata::RowsAffected(7)),
                SourceItem::Row(vec![Datum::Int(2)]),
            ],
        );
        let mut base = base_with_inputs(vec![Box::new(input)]);
        base.move_to_draining(Some(RowflowError::Execution("boom".to_string())));
        assert_eq!(base.state(), ProcState::Draining);

        let mut got = Vec::new();
        while let Some(meta) = base.drain_helper() {
            got.push(meta);
        }
        assert_eq!(got.len(), 3);
        assert!(got[0].is_err());
        assert_eq!(got[1], ProducerMetadata::RowsAffected(7));
        assert_eq!(got[2], ProducerMetadata::Other("callback".to_string()));
        assert_eq!(base.state(), ProcState::Exhausted);
        for _ in 0..5 {
            assert!(base.drain_helper().is_none());
        }
    }

    #[test]
    fn draining_without_inputs_goes_straight_to_trailing_meta() {
        let mut base = base_with_inputs(Vec::new());
        base.move_to_draining(None);
        assert_eq!(base.state(), ProcState::TrailingMeta);
        assert_eq!(
            base.drain_helper(),
            Some(ProducerMetadata::Other("callback".to_string()))
        );
        assert!(base.drain_helper().is_none());
        assert_eq!(base.state(), ProcState::Exhausted);
    }

    #[test]
    fn second_move_to_draining_is_ignored() {
        let mut base = base_with_inputs(Vec::new());
        base.move_to_draining(Some(RowflowError::QueryCanceled));
        base.move_to_draining(Some(RowflowError::Execution("late".to_string())));
        let metas: Vec<_> = std::iter::from_fn(|| base.drain_helper()).collect();
        assert_eq!(metas.iter().filter(|m| m.is_err()).count(), 1);
    }
}
