//! Producer end of a remote stream: pulls batches from a columnar operator and
//! writes them to a flow stream.

use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rowflow_common::{global_metrics, FlowId, NodeId, RowflowError, StreamId};
use rowflow_execution::vectorized::{catch_vectorized_runtime_error, Operator};
use rowflow_execution::{FlowCtx, MetadataSource, ProducerMetadata};
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::inbound::CancelSignal;
use crate::server::NodeDialer;
use crate::stream::{ClientStreamRef, ConsumerSignal, FlowStreamClient, ProducerMessage};

/// Callback canceling the flow that owns an outbox.
pub type CancelFn = Arc<dyn Fn() + Send + Sync>;

/// Sends the output of `input` over one flow stream.
///
/// Batches are sent until the input is exhausted, raises a vectorized error,
/// or the consumer requests a drain. A final message then carries the error
/// (if any) followed by the metadata of every registered source. Sources are
/// drained in every case, including after errors.
///
/// Once the flow's cancel signal fires, a blocked send is abandoned and a
/// `QueryCanceled` error is sent instead if the stream still has room.
pub struct Outbox {
    input: Box<dyn Operator>,
    metadata_sources: Vec<Arc<dyn MetadataSource>>,
    node_id: NodeId,
    canceled: CancelSignal,
}

impl Outbox {
    pub fn new(
        flow_ctx: &FlowCtx,
        input: Box<dyn Operator>,
        metadata_sources: Vec<Arc<dyn MetadataSource>>,
    ) -> Self {
        Self {
            input,
            metadata_sources,
            node_id: flow_ctx.node_id,
            canceled: CancelSignal::new(),
        }
    }

    /// Stop sending when `signal` is canceled.
    #[must_use]
    pub fn with_cancel_signal(mut self, signal: CancelSignal) -> Self {
        self.canceled = signal;
        self
    }

    /// Dial `target`, announce the stream and send everything.
    ///
    /// A failed dial cancels the flow; the metadata sources are still drained.
    pub async fn run(
        self,
        dialer: Arc<dyn NodeDialer>,
        target: NodeId,
        flow_id: FlowId,
        stream_id: StreamId,
        cancel: Option<CancelFn>,
    ) {
        let dialed = tokio::select! {
            res = dialer.dial(target) => res,
            () = self.canceled.canceled() => Err(RowflowError::QueryCanceled),
        };
        let client = match dialed {
            Ok(client) => client,
            Err(err) => {
                error!(%flow_id, %stream_id, %target, error = %err, "outbox dial failed");
                self.abandon(cancel).await;
                return;
            }
        };
        let header = ProducerMessage::header(flow_id, stream_id);
        if let Err(err) = send_unless_canceled(client.as_ref(), &self.canceled, header).await {
            error!(%flow_id, %stream_id, error = %err, "outbox failed to send stream header");
            self.abandon(cancel).await;
            return;
        }
        debug!(%flow_id, %stream_id, %target, "outbox connected");
        self.run_with_stream(client, cancel).await;
    }

    /// Send everything over an already announced stream.
    ///
    /// Vectorized errors raised by the input are caught and sent as metadata;
    /// any other panic is resumed on the caller.
    pub async fn run_with_stream(self, client: ClientStreamRef, cancel: Option<CancelFn>) {
        let draining = Arc::new(AtomicBool::new(false));
        let listener = tokio::spawn(listen_for_signals(
            Arc::clone(&client),
            Arc::clone(&draining),
            cancel.clone(),
        ));

        let rt = Handle::current();
        let sender = {
            let client = Arc::clone(&client);
            tokio::task::spawn_blocking(move || {
                self.send_all(&rt, client.as_ref(), &draining, cancel)
            })
        };
        let res = sender.await;
        listener.abort();
        match res {
            Ok(()) => {}
            Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
            Err(e) => error!(error = %e, "outbox sender task failed"),
        }
    }

    fn send_all(
        mut self,
        rt: &Handle,
        client: &dyn FlowStreamClient,
        draining: &AtomicBool,
        cancel: Option<CancelFn>,
    ) {
        let mut err_to_send = None;
        match self.send_batches(rt, client, draining) {
            Ok(()) => {}
            Err(SendError::Canceled) => {
                debug!("outbox stopped by flow cancellation");
                err_to_send = Some(RowflowError::QueryCanceled);
            }
            Err(SendError::Input(err)) => {
                warn!(error = %err, "outbox input failed");
                err_to_send = Some(err);
            }
            Err(SendError::Stream(err)) => {
                error!(error = %err, "outbox failed to send batch, canceling flow");
                if let Some(cancel) = &cancel {
                    cancel();
                }
            }
        }

        let mut meta: Vec<ProducerMetadata> = err_to_send.into_iter().map(Into::into).collect();
        meta.extend(self.metadata_sources.iter().flat_map(|src| src.drain_meta()));
        if !meta.is_empty() {
            let msg = ProducerMessage::metadata(meta);
            if let Err(err) = rt.block_on(send_unless_canceled(client, &self.canceled, msg)) {
                warn!(error = %err, "outbox failed to send metadata");
            }
        }
        if let Err(err) = rt.block_on(client.close_send()) {
            warn!(error = %err, "outbox failed to close stream");
        }
    }

    fn send_batches(
        &mut self,
        rt: &Handle,
        client: &dyn FlowStreamClient,
        draining: &AtomicBool,
    ) -> std::result::Result<(), SendError> {
        let input = &mut self.input;
        catch_vectorized_runtime_error(|| input.init()).map_err(SendError::Input)?;
        loop {
            if draining.load(Ordering::Acquire) {
                debug!("outbox draining on consumer request");
                return Ok(());
            }
            if self.canceled.is_canceled() {
                return Err(SendError::Canceled);
            }
            let batch = catch_vectorized_runtime_error(|| input.next()).map_err(SendError::Input)?;
            if batch.num_rows() == 0 {
                return Ok(());
            }
            let msg = ProducerMessage::data(&batch).map_err(SendError::Input)?;
            let bytes = msg.data.as_ref().map_or(0, Vec::len) as u64;
            match rt.block_on(send_unless_canceled(client, &self.canceled, msg)) {
                Ok(()) => {}
                Err(RowflowError::QueryCanceled) => return Err(SendError::Canceled),
                Err(err) => return Err(SendError::Stream(err)),
            }
            global_metrics().record_outbox_send(self.node_id, 1, bytes);
        }
    }

    /// Give up on the stream without sending anything. Draining a source may
    /// block on its input, so it happens on a blocking thread.
    async fn abandon(self, cancel: Option<CancelFn>) {
        if let Some(cancel) = &cancel {
            cancel();
        }
        let sources = self.metadata_sources;
        let res = tokio::task::spawn_blocking(move || {
            for src in &sources {
                let dropped = src.drain_meta();
                if !dropped.is_empty() {
                    warn!(count = dropped.len(), "dropping metadata of an unconnected outbox");
                }
            }
        })
        .await;
        if let Err(e) = res {
            error!(error = %e, "draining an abandoned outbox failed");
        }
    }
}

enum SendError {
    Input(RowflowError),
    Stream(RowflowError),
    Canceled,
}

/// Send `msg` unless `canceled` fires first. A send that can complete right
/// away still goes through after cancellation.
async fn send_unless_canceled(
    client: &dyn FlowStreamClient,
    canceled: &CancelSignal,
    msg: ProducerMessage,
) -> rowflow_common::Result<()> {
    tokio::select! {
        biased;
        res = client.send(msg) => res,
        () = canceled.canceled() => Err(RowflowError::QueryCanceled),
    }
}

async fn listen_for_signals(
    client: ClientStreamRef,
    draining: Arc<AtomicBool>,
    cancel: Option<CancelFn>,
) {
    loop {
        match client.recv().await {
            Ok(Some(ConsumerSignal::DrainRequest)) => draining.store(true, Ordering::Release),
            Ok(Some(ConsumerSignal::Handshake(h))) => {
                debug!(
                    consumer_scheduled = h.consumer_scheduled,
                    version = h.version,
                    "outbox handshake"
                );
            }
            Ok(None) => return,
            Err(err) => {
                error!(error = %err, "outbox connection error, canceling flow");
                if let Some(cancel) = &cancel {
                    cancel();
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use arrow::record_batch::RecordBatch;
    use rowflow_common::NodeId;
    use rowflow_execution::vectorized::{rows_to_batch, schema_for, BatchBuffer};
    use rowflow_execution::{CallbackMetadataSource, ColumnType, Datum};

    use super::*;
    use crate::inbox::Inbox;
    use crate::stream::{stream_pair, FlowStreamServer};

    fn counting_source() -> (Arc<dyn MetadataSource>, Arc<AtomicUsize>) {
        let drained = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&drained);
        let src = CallbackMetadataSource::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        });
        (Arc::new(src), drained)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn outbox_catches_vectorized_panics() {
        let schema = schema_for(&[ColumnType::Int]);
        // An empty batch buffer raises a vectorized panic on `next`.
        let input = BatchBuffer::new(schema.clone());
        let (server, client) = stream_pair(8);
        let ctx = FlowCtx::for_tests();
        let outbox = Outbox::new(&ctx, Box::new(input), Vec::new());
        let sender = tokio::spawn(outbox.run_with_stream(client, None));

        let inbox = Inbox::new(schema);
        let handler = {
            let inbox = inbox.clone();
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                let res = inbox
                    .run_with_stream(NodeId(0), server.clone(), ProducerMessage::default())
                    .await;
                server.close().await;
                res
            })
        };

        let mut reader = inbox.clone();
        let (len, meta) = tokio::task::spawn_blocking(move || {
            let len = reader.next().num_rows();
            (len, reader.drain_meta())
        })
        .await
        .expect("join");
        // The error arrives eagerly as metadata; the batch stream just ends.
        assert_eq!(len, 0);
        assert_eq!(meta.len(), 1);
        let err = meta[0].err().expect("error metadata");
        assert!(err.to_string().contains("panic"), "{err}");

        handler.await.expect("join").expect("stream handler");
        tokio::time::timeout(Duration::from_secs(5), sender)
            .await
            .expect("outbox returns")
            .expect("outbox did not panic");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn metadata_sources_drained_after_successful_run() {
        let schema = schema_for(&[ColumnType::Int]);
        let mut input = BatchBuffer::new(schema.clone());
        input.add(RecordBatch::new_empty(schema));
        let (src, drained) = counting_source();
        let (_server, client) = stream_pair(8);
        Outbox::new(&FlowCtx::for_tests(), Box::new(input), vec![src])
            .run_with_stream(client, None)
            .await;
        assert_eq!(drained.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn metadata_sources_drained_after_input_error() {
        let schema = schema_for(&[ColumnType::Int]);
        let (src, drained) = counting_source();
        let (server, client) = stream_pair(8);
        Outbox::new(
            &FlowCtx::for_tests(),
            Box::new(BatchBuffer::new(schema)),
            vec![src],
        )
        .run_with_stream(client, None)
        .await;
        assert_eq!(drained.load(Ordering::SeqCst), 1);

        let msg = server.recv().await.expect("recv").expect("metadata message");
        assert_eq!(msg.metadata.len(), 1);
        assert!(msg.metadata[0].is_err());
        assert!(server.recv().await.expect("recv").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_send_cancels_the_flow() {
        let schema = schema_for(&[ColumnType::Int]);
        let mut input = BatchBuffer::new(schema.clone());
        let batch = rows_to_batch(&schema, &[vec![Datum::Int(1)]]).expect("batch");
        input.add(batch);
        let (server, client) = stream_pair(1);
        drop(server);

        let ctx = FlowCtx::for_tests();
        let cancel: CancelFn = {
            let ctx = ctx.clone();
            Arc::new(move || ctx.cancel())
        };
        Outbox::new(&ctx, Box::new(input), Vec::new())
            .run_with_stream(client, Some(cancel))
            .await;
        assert!(ctx.is_canceled());
    }

    fn int_batches(n: i64) -> BatchBuffer {
        let schema = schema_for(&[ColumnType::Int]);
        let mut input = BatchBuffer::new(schema.clone());
        for i in 0..n {
            input.add(rows_to_batch(&schema, &[vec![Datum::Int(i)]]).expect("batch"));
        }
        input.add(RecordBatch::new_empty(schema));
        input
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_stops_a_send_blocked_on_a_stalled_consumer() {
        let (src, drained) = counting_source();
        // Room for one message; the consumer never reads.
        let (server, client) = stream_pair(1);
        let signal = CancelSignal::new();
        let outbox = Outbox::new(&FlowCtx::for_tests(), Box::new(int_batches(3)), vec![src])
            .with_cancel_signal(signal.clone());
        let sender = tokio::spawn(outbox.run_with_stream(client, None));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sender.is_finished());
        signal.cancel();
        tokio::time::timeout(Duration::from_secs(5), sender)
            .await
            .expect("outbox returns after cancel")
            .expect("outbox did not panic");
        assert_eq!(drained.load(Ordering::SeqCst), 1);

        let first = server.recv().await.expect("recv").expect("first batch");
        assert!(first.data.is_some());
        assert!(server.recv().await.expect("recv").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn canceled_outbox_reports_query_canceled_when_the_stream_has_room() {
        let (server, client) = stream_pair(8);
        let signal = CancelSignal::new();
        signal.cancel();
        Outbox::new(&FlowCtx::for_tests(), Box::new(int_batches(2)), Vec::new())
            .with_cancel_signal(signal)
            .run_with_stream(client, None)
            .await;

        let msg = server.recv().await.expect("recv").expect("metadata message");
        assert!(msg.data.is_none());
        assert_eq!(msg.metadata.len(), 1);
        assert_eq!(msg.metadata[0].err(), Some(&RowflowError::QueryCanceled));
        assert!(server.recv().await.expect("recv").is_none());
    }
}
