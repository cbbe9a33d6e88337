//! Out-of-band producer metadata carried alongside rows.

use std::fmt;

use parking_lot::Mutex;
use rowflow_common::RowflowError;
use serde::{Deserialize, Serialize};

/// A finished tracing span forwarded to the gateway node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub operation: String,
    pub duration_micros: u64,
    pub tags: Vec<(String, String)>,
}

/// Leaseholder information for a key range touched by a processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeInfo {
    pub range_id: u64,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub leaseholder_node: u32,
}

/// Metadata record produced alongside rows on a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProducerMetadata {
    /// A failure. Consumers drain after observing one.
    Err(RowflowError),
    TraceData(Vec<SpanRecord>),
    RangeInfo(Vec<RangeInfo>),
    RowsAffected(u64),
    Other(String),
}

impl ProducerMetadata {
    /// The carried error, if this is an error record.
    pub fn err(&self) -> Option<&RowflowError> {
        match self {
            ProducerMetadata::Err(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_err(&self) -> bool {
        matches!(self, ProducerMetadata::Err(_))
    }
}

impl From<RowflowError> for ProducerMetadata {
    fn from(err: RowflowError) -> Self {
        ProducerMetadata::Err(err)
    }
}

impl fmt::Display for ProducerMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProducerMetadata::Err(e) => write!(f, "err: {e}"),
            ProducerMetadata::TraceData(spans) => write!(f, "trace data ({} spans)", spans.len()),
            ProducerMetadata::RangeInfo(ranges) => {
                write!(f, "range info ({} ranges)", ranges.len())
            }
            ProducerMetadata::RowsAffected(n) => write!(f, "rows affected: {n}"),
            ProducerMetadata::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Something that accumulates metadata to be flushed once a stream finishes.
///
/// Outboxes drain every registered source exactly once, after the input is
/// exhausted or failed.
pub trait MetadataSource: Send + Sync {
    fn drain_meta(&self) -> Vec<ProducerMetadata>;
}

/// [`MetadataSource`] backed by a closure.
pub struct CallbackMetadataSource {
    f: Mutex<Box<dyn FnMut() -> Vec<ProducerMetadata> + Send>>,
}

impl CallbackMetadataSource {
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut() -> Vec<ProducerMetadata> + Send + 'static,
    {
        Self {
            f: Mutex::new(Box::new(f)),
        }
    }
}

impl MetadataSource for CallbackMetadataSource {
    fn drain_meta(&self) -> Vec<ProducerMetadata> {
        (self.f.lock())()
    }
}

impl fmt::Debug for CallbackMetadataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackMetadataSource").finish_non_exhaustive()
    }
}
