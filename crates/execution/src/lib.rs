//! Row-processing primitives run inside a flow on a single node.
//!
//! Architecture role:
//! - row/datum model and orderings
//! - the processor lifecycle state machine shared by all processors
//! - the merge joiner with its stream merger, project-set and pass-through
//!   processors
//! - bounded row channels connecting processors across threads
//! - adapters between row processors and columnar (Arrow) operators
//!
//! Key modules:
//! - [`processor`]
//! - [`processors`]
//! - [`stream`]
//! - [`vectorized`]

pub mod context;
pub mod expr;
pub mod metadata;
pub mod post_process;
pub mod processor;
pub mod processors;
pub mod row;
pub mod row_buffer;
pub mod spec;
pub mod stream;
pub mod vectorized;

pub use context::{CancelChecker, FlowCtx};
pub use metadata::{CallbackMetadataSource, MetadataSource, ProducerMetadata};
pub use post_process::PostProcessSpec;
pub use processor::{ProcState, ProcStateOpts, ProcessorBase};
pub use processors::new_processor;
pub use row::{ColumnOrdering, ColumnType, Datum, Direction, Row};
pub use row_buffer::RowBuffer;
pub use spec::{JoinType, ProcessorCoreUnion};
pub use stream::{run_processor, ConsumerStatus, RowChannel, RowReceiver, RowSource, SourceItem};
