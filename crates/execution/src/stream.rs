//! Row stream endpoints and the in-process row channel.
//!
//! Every processor is a [`RowSource`] (pull side) and writes its output into a
//! [`RowReceiver`] (push side). [`run_processor`] is the driver connecting the
//! two; [`RowChannel`] is the bounded buffer used wherever a source and a
//! receiver live on different threads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::context::FlowCtx;
use crate::metadata::ProducerMetadata;
use crate::row::{ColumnType, Row};

/// One unit pulled from or pushed into a stream: a row or a metadata record.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceItem {
    Row(Row),
    Meta(ProducerMetadata),
}

impl SourceItem {
    pub fn into_meta(self) -> Option<ProducerMetadata> {
        match self {
            SourceItem::Meta(m) => Some(m),
            SourceItem::Row(_) => None,
        }
    }
}

/// What a consumer wants after a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    /// Keep pushing rows and metadata.
    NeedMoreRows,
    /// Stop producing rows; metadata is still accepted.
    DrainRequested,
    /// Stop producing anything.
    ConsumerClosed,
}

impl ConsumerStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConsumerStatus::NeedMoreRows,
            1 => ConsumerStatus::DrainRequested,
            _ => ConsumerStatus::ConsumerClosed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConsumerStatus::NeedMoreRows => 0,
            ConsumerStatus::DrainRequested => 1,
            ConsumerStatus::ConsumerClosed => 2,
        }
    }
}

/// Pull side of a row stream.
///
/// `next` returns `None` once the source is permanently exhausted and keeps
/// returning `None` afterwards.
pub trait RowSource: Send {
    /// Column types of every row this source produces.
    fn output_types(&self) -> &[ColumnType];

    /// Prepare the source (and its inputs) for `next` calls.
    fn start(&mut self, ctx: &FlowCtx);

    fn next(&mut self) -> Option<SourceItem>;

    /// The consumer needs no more rows but still wants metadata.
    fn consumer_done(&mut self);

    /// The consumer needs nothing more; release resources.
    fn consumer_closed(&mut self);
}

/// Push side of a row stream.
pub trait RowReceiver: Send + Sync {
    fn push(&self, item: SourceItem) -> ConsumerStatus;

    /// No more items will be pushed by this producer.
    fn producer_done(&self);
}

impl<T: RowSource + ?Sized> RowSource for Box<T> {
    fn output_types(&self) -> &[ColumnType] {
        (**self).output_types()
    }

    fn start(&mut self, ctx: &FlowCtx) {
        (**self).start(ctx)
    }

    fn next(&mut self) -> Option<SourceItem> {
        (**self).next()
    }

    fn consumer_done(&mut self) {
        (**self).consumer_done()
    }

    fn consumer_closed(&mut self) {
        (**self).consumer_closed()
    }
}

/// Drive `src` to completion, pushing everything into `dst`.
///
/// Honors the receiver's status: a drain request switches to forwarding only
/// metadata, a close stops immediately. `dst.producer_done()` is always called.
pub fn run_processor(ctx: &FlowCtx, src: &mut dyn RowSource, dst: &dyn RowReceiver) {
    src.start(ctx);
    while let Some(item) = src.next() {
        match dst.push(item) {
            ConsumerStatus::NeedMoreRows => {}
            ConsumerStatus::DrainRequested => {
                drain_and_forward_metadata(src, dst);
                break;
            }
            ConsumerStatus::ConsumerClosed => {
                src.consumer_closed();
                break;
            }
        }
    }
    dst.producer_done();
}

/// Ask `src` to drain and forward its remaining metadata to `dst`, discarding
/// any rows still in flight.
pub fn drain_and_forward_metadata(src: &mut dyn RowSource, dst: &dyn RowReceiver) {
    src.consumer_done();
    while let Some(item) = src.next() {
        let SourceItem::Meta(meta) = item else {
            continue;
        };
        if dst.push(SourceItem::Meta(meta)) == ConsumerStatus::ConsumerClosed {
            src.consumer_closed();
            return;
        }
    }
}

#[derive(Debug)]
struct ChannelState {
    buf: VecDeque<SourceItem>,
    senders_left: usize,
}

#[derive(Debug)]
struct ChannelInner {
    types: Vec<ColumnType>,
    capacity: usize,
    state: Mutex<ChannelState>,
    not_empty: Condvar,
    not_full: Condvar,
    status: AtomicU8,
}

/// Bounded multi-producer, single-consumer row buffer.
///
/// Clones share the same buffer: producers push through one clone while the
/// consumer reads through another. `next` blocks while the buffer is empty and
/// producers remain; `push` blocks while the buffer is full.
#[derive(Debug, Clone)]
pub struct RowChannel {
    inner: Arc<ChannelInner>,
}

impl RowChannel {
    /// Channel with `num_senders` producers, each expected to call
    /// [`RowReceiver::producer_done`] exactly once.
    pub fn new(types: Vec<ColumnType>, capacity: usize, num_senders: usize) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                types,
                capacity: capacity.max(1),
                state: Mutex::new(ChannelState {
                    buf: VecDeque::new(),
                    senders_left: num_senders,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                status: AtomicU8::new(ConsumerStatus::NeedMoreRows.as_u8()),
            }),
        }
    }

    pub fn consumer_status(&self) -> ConsumerStatus {
        ConsumerStatus::from_u8(self.inner.status.load(Ordering::Acquire))
    }

    /// Items currently buffered.
    pub fn len(&self) -> usize {
        self.inner.state.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_status(&self, status: ConsumerStatus) {
        // Closed is sticky; drain never downgrades it.
        let _ = self
            .inner
            .status
            .fetch_max(status.as_u8(), Ordering::AcqRel);
        let _guard = self.inner.state.lock();
        self.inner.not_full.notify_all();
    }
}

impl RowReceiver for RowChannel {
    fn push(&self, item: SourceItem) -> ConsumerStatus {
        let status = self.consumer_status();
        match status {
            ConsumerStatus::ConsumerClosed => return status,
            ConsumerStatus::DrainRequested if matches!(item, SourceItem::Row(_)) => return status,
            _ => {}
        }
        let mut state = self.inner.state.lock();
        while state.buf.len() >= self.inner.capacity {
            if self.consumer_status() == ConsumerStatus::ConsumerClosed {
                return ConsumerStatus::ConsumerClosed;
            }
            self.inner.not_full.wait(&mut state);
        }
        state.buf.push_back(item);
        self.inner.not_empty.notify_one();
        drop(state);
        self.consumer_status()
    }

    fn producer_done(&self) {
        let mut state = self.inner.state.lock();
        state.senders_left = state.senders_left.saturating_sub(1);
        if state.senders_left == 0 {
            self.inner.not_empty.notify_all();
        }
    }
}

impl RowSource for RowChannel {
    fn output_types(&self) -> &[ColumnType] {
        &self.inner.types
    }

    fn start(&mut self, _ctx: &FlowCtx) {}

    fn next(&mut self) -> Option<SourceItem> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(item) = state.buf.pop_front() {
                self.inner.not_full.notify_one();
                return Some(item);
            }
            if state.senders_left == 0 {
                return None;
            }
            self.inner.not_empty.wait(&mut state);
        }
    }

    fn consumer_done(&mut self) {
        self.set_status(ConsumerStatus::DrainRequested);
    }

    fn consumer_closed(&mut self) {
        self.set_status(ConsumerStatus::ConsumerClosed);
    }
}
