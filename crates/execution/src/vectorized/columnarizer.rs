//! Adapts a row source into a columnar [`Operator`].

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use parking_lot::Mutex;

use crate::context::FlowCtx;
use crate::metadata::{MetadataSource, ProducerMetadata};
use crate::row::Row;
use crate::stream::{RowSource, SourceItem};

use super::{rows_to_batch, schema_for, vectorized_panic, Operator};

struct Shared {
    input: Box<dyn RowSource>,
    accumulated: Vec<ProducerMetadata>,
    input_done: bool,
}

/// Reads rows from its input and emits them in batches of at most
/// `outbox_batch_size_rows`.
///
/// Error metadata from the input is raised as a vectorized panic. Any other
/// metadata is held back until [`Columnarizer::metadata_source`] is drained.
pub struct Columnarizer {
    flow_ctx: FlowCtx,
    schema: SchemaRef,
    batch_size: usize,
    shared: Arc<Mutex<Shared>>,
}

impl Columnarizer {
    pub fn new(flow_ctx: &FlowCtx, input: Box<dyn RowSource>) -> Self {
        let schema = schema_for(input.output_types());
        Self {
            flow_ctx: flow_ctx.clone(),
            schema,
            batch_size: flow_ctx.config.outbox_batch_size_rows.max(1),
            shared: Arc::new(Mutex::new(Shared {
                input,
                accumulated: Vec::new(),
                input_done: false,
            })),
        }
    }

    /// Metadata held back while columnarizing, followed by whatever the input
    /// still produces once it has been asked to drain.
    pub fn metadata_source(&self) -> Arc<dyn MetadataSource> {
        Arc::new(ColumnarizerMeta {
            shared: Arc::clone(&self.shared),
        })
    }
}

impl Operator for Columnarizer {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn init(&mut self) {
        self.shared.lock().input.start(&self.flow_ctx);
    }

    fn next(&mut self) -> RecordBatch {
        let mut rows: Vec<Row> = Vec::with_capacity(self.batch_size);
        {
            let mut shared = self.shared.lock();
            while rows.len() < self.batch_size && !shared.input_done {
                match shared.input.next() {
                    None => shared.input_done = true,
                    Some(SourceItem::Row(row)) => rows.push(row),
                    Some(SourceItem::Meta(ProducerMetadata::Err(err))) => {
                        drop(shared);
                        vectorized_panic(err);
                    }
                    Some(SourceItem::Meta(meta)) => shared.accumulated.push(meta),
                }
            }
        }
        match rows_to_batch(&self.schema, &rows) {
            Ok(batch) => batch,
            Err(err) => vectorized_panic(err),
        }
    }
}

struct ColumnarizerMeta {
    shared: Arc<Mutex<Shared>>,
}

impl MetadataSource for ColumnarizerMeta {
    fn drain_meta(&self) -> Vec<ProducerMetadata> {
        let mut shared = self.shared.lock();
        let mut out = std::mem::take(&mut shared.accumulated);
        if shared.input_done {
            return out;
        }
        shared.input.consumer_done();
        while let Some(item) = shared.input.next() {
            if let SourceItem::Meta(meta) = item {
                out.push(meta);
            }
        }
        shared.input_done = true;
        out
    }
}
