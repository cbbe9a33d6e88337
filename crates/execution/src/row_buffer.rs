//! Recording stream endpoint for tests and simple fixtures.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::context::FlowCtx;
use crate::metadata::ProducerMetadata;
use crate::row::{ColumnType, Row};
use crate::stream::{ConsumerStatus, RowReceiver, RowSource, SourceItem};

type PushHook = Box<dyn Fn(&SourceItem) + Send + Sync>;

/// An in-memory buffer that is both a [`RowReceiver`] recording every push
/// and a [`RowSource`] replaying its contents.
///
/// The status returned from `push` is controlled with
/// [`RowBuffer::set_status`]; all pushes are recorded regardless of it.
pub struct RowBuffer {
    types: Vec<ColumnType>,
    items: Mutex<VecDeque<SourceItem>>,
    status: AtomicU8,
    on_push: Option<PushHook>,
    producer_done: AtomicBool,
    consumer_done: AtomicBool,
    consumer_closed: AtomicBool,
}

impl RowBuffer {
    pub fn new(types: Vec<ColumnType>) -> Self {
        Self::with_items(types, Vec::new())
    }

    /// Buffer pre-filled with `items`, typically used as a source.
    pub fn with_items(types: Vec<ColumnType>, items: Vec<SourceItem>) -> Self {
        Self {
            types,
            items: Mutex::new(items.into()),
            status: AtomicU8::new(0),
            on_push: None,
            producer_done: AtomicBool::new(false),
            consumer_done: AtomicBool::new(false),
            consumer_closed: AtomicBool::new(false),
        }
    }

    /// Buffer pre-filled with plain rows.
    pub fn from_rows(types: Vec<ColumnType>, rows: Vec<Row>) -> Self {
        Self::with_items(types, rows.into_iter().map(SourceItem::Row).collect())
    }

    /// Run `hook` on every pushed item before recording it.
    pub fn with_on_push<F>(mut self, hook: F) -> Self
    where
        F: Fn(&SourceItem) + Send + Sync + 'static,
    {
        self.on_push = Some(Box::new(hook));
        self
    }

    pub fn set_status(&self, status: ConsumerStatus) {
        let v = match status {
            ConsumerStatus::NeedMoreRows => 0,
            ConsumerStatus::DrainRequested => 1,
            ConsumerStatus::ConsumerClosed => 2,
        };
        self.status.store(v, Ordering::Release);
    }

    fn status(&self) -> ConsumerStatus {
        match self.status.load(Ordering::Acquire) {
            0 => ConsumerStatus::NeedMoreRows,
            1 => ConsumerStatus::DrainRequested,
            _ => ConsumerStatus::ConsumerClosed,
        }
    }

    /// Snapshot of everything currently buffered.
    pub fn items(&self) -> Vec<SourceItem> {
        self.items.lock().iter().cloned().collect()
    }

    /// Buffered rows, ignoring metadata.
    pub fn rows(&self) -> Vec<Row> {
        self.items
            .lock()
            .iter()
            .filter_map(|item| match item {
                SourceItem::Row(r) => Some(r.clone()),
                SourceItem::Meta(_) => None,
            })
            .collect()
    }

    /// Buffered metadata, ignoring rows.
    pub fn metadata(&self) -> Vec<ProducerMetadata> {
        self.items
            .lock()
            .iter()
            .filter_map(|item| match item {
                SourceItem::Meta(m) => Some(m.clone()),
                SourceItem::Row(_) => None,
            })
            .collect()
    }

    pub fn producer_done_called(&self) -> bool {
        self.producer_done.load(Ordering::Acquire)
    }

    pub fn consumer_done_called(&self) -> bool {
        self.consumer_done.load(Ordering::Acquire)
    }

    pub fn consumer_closed_called(&self) -> bool {
        self.consumer_closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RowBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowBuffer")
            .field("types", &self.types)
            .field("buffered", &self.items.lock().len())
            .finish()
    }
}

impl RowReceiver for RowBuffer {
    fn push(&self, item: SourceItem) -> ConsumerStatus {
        if let Some(hook) = &self.on_push {
            hook(&item);
        }
        self.items.lock().push_back(item);
        self.status()
    }

    fn producer_done(&self) {
        self.producer_done.store(true, Ordering::Release);
    }
}

impl RowSource for RowBuffer {
    fn output_types(&self) -> &[ColumnType] {
        &self.types
    }

    fn start(&mut self, _ctx: &FlowCtx) {}

    fn next(&mut self) -> Option<SourceItem> {
        if self.consumer_closed_called() {
            return None;
        }
        self.items.lock().pop_front()
    }

    fn consumer_done(&mut self) {
        self.consumer_done.store(true, Ordering::Release);
    }

    fn consumer_closed(&mut self) {
        self.consumer_closed.store(true, Ordering::Release);
    }
}
