//! Consumers of inbound flow streams.
//!
//! The registry hands every connected stream to an [`InboundStreamHandler`];
//! it does not care whether the consumer wants rows ([`RowInboundStreamHandler`])
//! or batches ([`crate::inbox::Inbox`]).

use std::sync::Arc;

use async_trait::async_trait;
use rowflow_common::{global_metrics, NodeId, Result, RowflowError};
use rowflow_execution::vectorized::batch_to_rows;
use rowflow_execution::{ConsumerStatus, FlowCtx, RowReceiver, SourceItem};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::stream::{decode_batch, ConsumerSignal, ProducerMessage, ServerStreamRef};

/// Consumer of one inbound stream.
#[async_trait]
pub trait InboundStreamHandler: Send + Sync {
    /// Consume `stream` until the producer closes it. `first_msg` is the
    /// header message, which may also carry data or metadata.
    async fn run(
        &self,
        flow_ctx: &FlowCtx,
        stream: ServerStreamRef,
        first_msg: ProducerMessage,
    ) -> Result<()>;

    /// The stream will never connect. Deliver `err` to the consumer and
    /// finish it. May block; callers run it off the async workers.
    fn timeout(&self, err: RowflowError);
}

/// One-shot cancellation signal shared by a flow and its stream handlers.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once [`CancelSignal::cancel`] was called.
    pub async fn canceled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }
}

/// Pushes the rows and metadata of an inbound stream into a local receiver.
///
/// Canceling the signal stops reading; the receiver then gets a
/// `QueryCanceled` error and is finished.
pub struct RowInboundStreamHandler {
    receiver: Arc<dyn RowReceiver>,
    cancel: CancelSignal,
}

impl RowInboundStreamHandler {
    pub fn new(receiver: Arc<dyn RowReceiver>, cancel: CancelSignal) -> Self {
        Self { receiver, cancel }
    }
}

#[async_trait]
impl InboundStreamHandler for RowInboundStreamHandler {
    async fn run(
        &self,
        flow_ctx: &FlowCtx,
        stream: ServerStreamRef,
        first_msg: ProducerMessage,
    ) -> Result<()> {
        let dst = Arc::clone(&self.receiver);
        let cancel = self.cancel.clone();
        let rt = Handle::current();
        let node_id = flow_ctx.node_id;
        // Pushes block on a full receiver, so the reading happens off the
        // async workers.
        tokio::task::spawn_blocking(move || {
            process_inbound_stream(&rt, node_id, &cancel, stream, first_msg, dst.as_ref())
        })
        .await
        .map_err(|e| RowflowError::Internal(format!("inbound stream reader failed: {e}")))?
    }

    fn timeout(&self, err: RowflowError) {
        self.receiver.push(SourceItem::Meta(err.into()));
        self.receiver.producer_done();
    }
}

enum MessageOutcome {
    Continue,
    ConsumerClosed,
}

fn process_inbound_stream(
    rt: &Handle,
    node_id: NodeId,
    cancel: &CancelSignal,
    stream: ServerStreamRef,
    first_msg: ProducerMessage,
    dst: &dyn RowReceiver,
) -> Result<()> {
    let finish = |err: Option<RowflowError>| {
        if let Some(err) = err {
            dst.push(SourceItem::Meta(err.into()));
        }
        dst.producer_done();
    };
    let mut draining = false;
    let mut msg = first_msg;
    loop {
        match process_producer_message(rt, node_id, &stream, dst, &mut draining, msg) {
            Ok(MessageOutcome::Continue) => {}
            Ok(MessageOutcome::ConsumerClosed) => {
                finish(None);
                return Ok(());
            }
            Err(err) => {
                finish(Some(err.clone()));
                return Err(err);
            }
        }
        let received = rt.block_on(async {
            tokio::select! {
                _ = cancel.canceled() => Err(RowflowError::QueryCanceled),
                res = stream.recv() => res.map_err(|err| {
                    RowflowError::Connection(format!("communication error: {err}"))
                }),
            }
        });
        msg = match received {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                finish(None);
                return Ok(());
            }
            Err(err) => {
                finish(Some(err.clone()));
                return Err(err);
            }
        };
    }
}

fn process_producer_message(
    rt: &Handle,
    node_id: NodeId,
    stream: &ServerStreamRef,
    dst: &dyn RowReceiver,
    draining: &mut bool,
    msg: ProducerMessage,
) -> Result<MessageOutcome> {
    let mut items = Vec::new();
    if let Some(data) = &msg.data {
        let batch = decode_batch(data)
            .map_err(|e| RowflowError::Execution(format!("decoding error: {e}")))?;
        global_metrics().record_inbox_receive(node_id, 1);
        items.extend(batch_to_rows(&batch)?.into_iter().map(SourceItem::Row));
    }
    items.extend(msg.metadata.into_iter().map(SourceItem::Meta));

    for item in items {
        match dst.push(item) {
            ConsumerStatus::NeedMoreRows => {}
            ConsumerStatus::DrainRequested => {
                if !*draining {
                    *draining = true;
                    debug!("consumer requested drain, signaling producer");
                    if let Err(err) = rt.block_on(stream.send(ConsumerSignal::DrainRequest)) {
                        error!(error = %err, "sending drain signal to producer failed");
                    }
                }
            }
            ConsumerStatus::ConsumerClosed => {
                warn!("inbound stream consumer closed early");
                return Ok(MessageOutcome::ConsumerClosed);
            }
        }
    }
    Ok(MessageOutcome::Continue)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rowflow_common::{FlowId, StreamId};
    use rowflow_execution::vectorized::{rows_to_batch, schema_for};
    use rowflow_execution::{ColumnType, Datum, ProducerMetadata, RowBuffer};

    use super::*;
    use crate::stream::{stream_pair, FlowStreamClient};

    fn data_msg(keys: &[i64]) -> ProducerMessage {
        let schema = schema_for(&[ColumnType::Int]);
        let rows: Vec<_> = keys.iter().map(|k| vec![Datum::Int(*k)]).collect();
        ProducerMessage::data(&rows_to_batch(&schema, &rows).expect("batch")).expect("msg")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rows_and_metadata_reach_the_receiver_in_order() {
        let (server, client) = stream_pair(8);
        let dst = Arc::new(RowBuffer::new(vec![ColumnType::Int]));
        let handler = RowInboundStreamHandler::new(dst.clone(), CancelSignal::new());

        let mut first = ProducerMessage::header(FlowId::new_v4(), StreamId(1));
        first.data = data_msg(&[1]).data;
        client.send(data_msg(&[2, 3])).await.expect("send");
        client
            .send(ProducerMessage::metadata(vec![ProducerMetadata::RowsAffected(3)]))
            .await
            .expect("send");
        client.close_send().await.expect("close");

        handler
            .run(&FlowCtx::for_tests(), server, first)
            .await
            .expect("run");
        assert_eq!(
            dst.rows(),
            vec![vec![Datum::Int(1)], vec![Datum::Int(2)], vec![Datum::Int(3)]]
        );
        assert_eq!(dst.metadata(), vec![ProducerMetadata::RowsAffected(3)]);
        assert!(dst.producer_done_called());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drain_request_is_sent_once() {
        let (server, client) = stream_pair(8);
        let dst = Arc::new(RowBuffer::new(vec![ColumnType::Int]));
        dst.set_status(ConsumerStatus::DrainRequested);
        let handler = RowInboundStreamHandler::new(dst.clone(), CancelSignal::new());
        client.send(data_msg(&[1])).await.expect("send");
        client.send(data_msg(&[2])).await.expect("send");
        client.close_send().await.expect("close");

        handler
            .run(&FlowCtx::for_tests(), server, ProducerMessage::default())
            .await
            .expect("run");
        assert_eq!(client.recv().await.expect("recv"), Some(ConsumerSignal::DrainRequest));
        assert_eq!(client.recv().await.expect("recv"), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_stops_waiting_on_a_silent_producer() {
        let (server, _client) = stream_pair(1);
        let dst = Arc::new(RowBuffer::new(vec![ColumnType::Int]));
        let cancel = CancelSignal::new();
        let handler = RowInboundStreamHandler::new(dst.clone(), cancel.clone());
        let ctx = FlowCtx::for_tests();
        let run = handler.run(&ctx, server, ProducerMessage::default());
        tokio::pin!(run);
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut run).await.is_err());
        cancel.cancel();
        let res = tokio::time::timeout(Duration::from_secs(5), run).await.expect("returns");
        assert_eq!(res, Err(RowflowError::QueryCanceled));
        assert_eq!(dst.metadata(), vec![ProducerMetadata::Err(RowflowError::QueryCanceled)]);
        assert!(dst.producer_done_called());
    }
}
