//! Consumer end of a remote stream for columnar operators.

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};
use rowflow_common::{global_metrics, NodeId, Result, RowflowError};
use rowflow_execution::vectorized::{vectorized_panic, Operator};
use rowflow_execution::{FlowCtx, MetadataSource, ProducerMetadata};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::inbound::InboundStreamHandler;
use crate::stream::{decode_batch, ConsumerSignal, ProducerMessage, ServerStreamRef};

struct Connected {
    stream: ServerStreamRef,
    rt: Handle,
    node_id: NodeId,
}

#[derive(Default)]
struct InboxState {
    connected: Option<Connected>,
    /// Message received with the stream header, not yet consumed.
    first_msg: Option<ProducerMessage>,
    /// Set when the stream never connects.
    timeout_err: Option<RowflowError>,
    /// Error observed while reading the stream, reported by `run_with_stream`.
    stream_err: Option<RowflowError>,
    buffered_meta: Vec<ProducerMetadata>,
    /// The producer closed the stream.
    eof: bool,
}

struct InboxInner {
    schema: SchemaRef,
    state: Mutex<InboxState>,
    stream_arrived: Condvar,
    done: watch::Sender<bool>,
}

/// Turns an inbound flow stream back into batches.
///
/// An `Inbox` is a cheap handle: one clone is handed to the flow registry as
/// the stream's [`InboundStreamHandler`], another is pulled from as an
/// [`Operator`] on a blocking thread. `next` returns a zero-length batch once
/// the stream ends; metadata received along the way is returned by
/// [`MetadataSource::drain_meta`].
#[derive(Clone)]
pub struct Inbox {
    inner: Arc<InboxInner>,
}

impl Inbox {
    pub fn new(schema: SchemaRef) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(InboxInner {
                schema,
                state: Mutex::new(InboxState::default()),
                stream_arrived: Condvar::new(),
                done,
            }),
        }
    }

    /// Hand `stream` to the consumer and wait until it is done reading.
    pub async fn run_with_stream(
        &self,
        node_id: NodeId,
        stream: ServerStreamRef,
        first_msg: ProducerMessage,
    ) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.connected.is_some() {
                return Err(RowflowError::Internal(
                    "inbox connected to a second stream".to_string(),
                ));
            }
            state.connected = Some(Connected {
                stream,
                rt: Handle::current(),
                node_id,
            });
            state.first_msg = Some(first_msg);
            self.inner.stream_arrived.notify_all();
        }
        let mut done = self.inner.done.subscribe();
        let _ = done.wait_for(|d| *d).await;
        match self.inner.state.lock().stream_err.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn finish(&self) {
        self.inner.done.send_replace(true);
    }

    /// Block until the stream connected or timed out.
    fn wait_for_stream(&self) -> Result<(ServerStreamRef, Handle, NodeId)> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(err) = &state.timeout_err {
                return Err(err.clone());
            }
            if let Some(c) = &state.connected {
                return Ok((Arc::clone(&c.stream), c.rt.clone(), c.node_id));
            }
            self.inner.stream_arrived.wait(&mut state);
        }
    }

    /// Read messages until one carries data. `Ok(None)` on end of stream.
    fn next_batch(&self) -> Result<Option<RecordBatch>> {
        let (stream, rt, node_id) = self.wait_for_stream()?;
        loop {
            let pending = self.inner.state.lock().first_msg.take();
            let msg = match pending {
                Some(msg) => msg,
                None => match rt.block_on(stream.recv()) {
                    Ok(Some(msg)) => msg,
                    Ok(None) => return Ok(None),
                    Err(err) => {
                        let err = RowflowError::Connection(format!("communication error: {err}"));
                        self.inner.state.lock().stream_err = Some(err.clone());
                        return Err(err);
                    }
                },
            };
            if !msg.metadata.is_empty() {
                self.inner.state.lock().buffered_meta.extend(msg.metadata);
            }
            if let Some(data) = &msg.data {
                let batch = decode_batch(data)
                    .map_err(|e| RowflowError::Execution(format!("decoding error: {e}")))?;
                global_metrics().record_inbox_receive(node_id, 1);
                if batch.num_rows() > 0 {
                    return Ok(Some(batch));
                }
            }
        }
    }
}

impl Operator for Inbox {
    fn schema(&self) -> SchemaRef {
        self.inner.schema.clone()
    }

    fn init(&mut self) {}

    fn next(&mut self) -> RecordBatch {
        if self.inner.state.lock().eof {
            return RecordBatch::new_empty(self.inner.schema.clone());
        }
        match self.next_batch() {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                self.inner.state.lock().eof = true;
                self.finish();
                RecordBatch::new_empty(self.inner.schema.clone())
            }
            Err(err) => {
                self.finish();
                vectorized_panic(err)
            }
        }
    }
}

impl MetadataSource for Inbox {
    /// Return the buffered metadata. If the producer is still sending, ask it
    /// to drain and collect its trailing metadata first.
    fn drain_meta(&self) -> Vec<ProducerMetadata> {
        let (mut all, eof) = {
            let mut state = self.inner.state.lock();
            (std::mem::take(&mut state.buffered_meta), state.eof)
        };
        if eof {
            self.finish();
            return all;
        }
        let (stream, rt) = match self.wait_for_stream() {
            Ok((stream, rt, _)) => (stream, rt),
            Err(err) => {
                debug!(error = %err, "inbox drained without a stream");
                self.finish();
                return all;
            }
        };

        if let Err(err) = rt.block_on(stream.send(ConsumerSignal::DrainRequest)) {
            warn!(error = %err, "inbox failed to request drain");
            self.finish();
            return all;
        }
        debug!("inbox requested drain");
        if let Some(first) = self.inner.state.lock().first_msg.take() {
            all.extend(first.metadata);
        }
        loop {
            match rt.block_on(stream.recv()) {
                Ok(Some(msg)) => all.extend(msg.metadata),
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "inbox stream failed while draining");
                    break;
                }
            }
        }
        self.inner.state.lock().eof = true;
        self.finish();
        all
    }
}

#[async_trait]
impl InboundStreamHandler for Inbox {
    async fn run(
        &self,
        flow_ctx: &FlowCtx,
        stream: ServerStreamRef,
        first_msg: ProducerMessage,
    ) -> Result<()> {
        self.run_with_stream(flow_ctx.node_id, stream, first_msg).await
    }

    fn timeout(&self, err: RowflowError) {
        let mut state = self.inner.state.lock();
        state.timeout_err = Some(err);
        self.inner.stream_arrived.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rowflow_execution::vectorized::{
        batch_to_rows, catch_vectorized_runtime_error, rows_to_batch, schema_for,
    };
    use rowflow_execution::{ColumnType, Datum};

    use super::*;
    use crate::stream::{stream_pair, FlowStreamClient};

    #[tokio::test(flavor = "multi_thread")]
    async fn batches_then_end_of_stream() {
        let schema = schema_for(&[ColumnType::Int]);
        let (server, client) = stream_pair(8);
        let inbox = Inbox::new(schema.clone());
        let handler = {
            let inbox = inbox.clone();
            tokio::spawn(async move {
                inbox
                    .run_with_stream(NodeId(1), server, ProducerMessage::default())
                    .await
            })
        };

        let batch = rows_to_batch(&schema, &[vec![Datum::Int(7)], vec![Datum::Int(8)]])
            .expect("batch");
        client
            .send(ProducerMessage::data(&batch).expect("msg"))
            .await
            .expect("send");
        client.close_send().await.expect("close");

        let mut reader = inbox.clone();
        let (rows, eof_len, meta) = tokio::task::spawn_blocking(move || {
            let rows = batch_to_rows(&reader.next()).expect("rows");
            let eof_len = reader.next().num_rows();
            (rows, eof_len, reader.drain_meta())
        })
        .await
        .expect("join");
        assert_eq!(rows, vec![vec![Datum::Int(7)], vec![Datum::Int(8)]]);
        assert_eq!(eof_len, 0);
        assert!(meta.is_empty());
        handler.await.expect("join").expect("run");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drain_meta_requests_drain_and_collects_trailing_metadata() {
        let schema = schema_for(&[ColumnType::Int]);
        let (server, client) = stream_pair(8);
        let inbox = Inbox::new(schema);
        let handler = {
            let inbox = inbox.clone();
            tokio::spawn(async move {
                inbox
                    .run_with_stream(NodeId(1), server, ProducerMessage::default())
                    .await
            })
        };

        let drainer = {
            let inbox = inbox.clone();
            tokio::task::spawn_blocking(move || inbox.drain_meta())
        };
        assert_eq!(
            client.recv().await.expect("recv"),
            Some(ConsumerSignal::DrainRequest)
        );
        client
            .send(ProducerMessage::metadata(vec![ProducerMetadata::RowsAffected(5)]))
            .await
            .expect("send");
        client.close_send().await.expect("close");

        let meta = drainer.await.expect("join");
        assert_eq!(meta, vec![ProducerMetadata::RowsAffected(5)]);
        tokio::time::timeout(Duration::from_secs(5), handler)
            .await
            .expect("handler returns")
            .expect("join")
            .expect("run");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timeout_surfaces_as_a_vectorized_error() {
        let mut inbox = Inbox::new(schema_for(&[ColumnType::Int]));
        inbox.timeout(RowflowError::Connection("no inbound stream connection".to_string()));
        let err = tokio::task::spawn_blocking(move || {
            catch_vectorized_runtime_error(|| inbox.next()).expect_err("timed out")
        })
        .await
        .expect("join");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("no inbound stream connection"));
    }
}
