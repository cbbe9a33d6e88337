//! Columnar operator contract and adapters to and from row processors.
//!
//! Vectorized operators report failures by panicking with a
//! [`VectorizedPanic`] payload (see [`vectorized_panic`]). The boundary that
//! runs them wraps the call in [`catch_vectorized_runtime_error`], which turns
//! exactly those panics back into errors and lets every other panic continue
//! unwinding.

mod columnarizer;
mod convert;
mod materializer;

pub use columnarizer::Columnarizer;
pub use convert::{batch_to_rows, rows_to_batch, schema_for, types_for};
pub use materializer::Materializer;

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use rowflow_common::{Result, RowflowError};

/// A pull-based columnar operator.
///
/// `next` returns a zero-length batch once the operator is exhausted. Errors
/// are raised with [`vectorized_panic`].
pub trait Operator: Send {
    fn schema(&self) -> SchemaRef;

    fn init(&mut self);

    fn next(&mut self) -> RecordBatch;
}

/// Panic payload marking a failure raised inside the vectorized engine.
#[derive(Debug)]
pub struct VectorizedPanic(pub RowflowError);

/// Abort the current vectorized operation with `err`.
pub fn vectorized_panic(err: RowflowError) -> ! {
    panic::panic_any(VectorizedPanic(err))
}

/// Run `f`, converting a [`VectorizedPanic`] into an error.
///
/// Uncategorized errors are annotated as unexpected internal errors. Panics
/// with any other payload are resumed.
pub fn catch_vectorized_runtime_error<T>(f: impl FnOnce() -> T) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => Ok(v),
        Err(payload) => match payload.downcast::<VectorizedPanic>() {
            Ok(p) => Err(p.0.wrap_unexpected("unexpected error from the vectorized runtime")),
            Err(other) => panic::resume_unwind(other),
        },
    }
}

/// Operator replaying queued batches. Calling `next` with nothing queued is a
/// vectorized error.
#[derive(Debug)]
pub struct BatchBuffer {
    schema: SchemaRef,
    buffer: VecDeque<RecordBatch>,
}

impl BatchBuffer {
    pub fn new(schema: SchemaRef) -> Self {
        Self {
            schema,
            buffer: VecDeque::new(),
        }
    }

    pub fn add(&mut self, batch: RecordBatch) {
        self.buffer.push_back(batch);
    }
}

impl Operator for BatchBuffer {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn init(&mut self) {}

    fn next(&mut self) -> RecordBatch {
        match self.buffer.pop_front() {
            Some(batch) => batch,
            None => vectorized_panic(RowflowError::Uncategorized(
                "panic: batch buffer is empty".to_string(),
            )),
        }
    }
}

/// Operator failing on every other call and passing its input through on the
/// remaining ones.
pub struct ErrorEmitter {
    input: Box<dyn Operator>,
    emit_batch: bool,
}

impl ErrorEmitter {
    pub fn new(input: Box<dyn Operator>) -> Self {
        Self {
            input,
            emit_batch: false,
        }
    }
}

impl Operator for ErrorEmitter {
    fn schema(&self) -> SchemaRef {
        self.input.schema()
    }

    fn init(&mut self) {
        self.input.init();
    }

    fn next(&mut self) -> RecordBatch {
        if !self.emit_batch {
            self.emit_batch = true;
            vectorized_panic(RowflowError::Uncategorized(
                "a panic from the vectorized engine".to_string(),
            ));
        }
        self.emit_batch = false;
        self.input.next()
    }
}
