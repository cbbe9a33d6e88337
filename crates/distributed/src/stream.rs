//! Flow stream wire messages, transport traits and the in-memory transport.
//!
//! A flow stream is bidirectional: the producer (an outbox) sends
//! [`ProducerMessage`]s carrying a header (first message only), Arrow IPC
//! encoded batches and metadata; the consumer answers with
//! [`ConsumerSignal`]s (handshakes and drain requests).

use std::sync::Arc;

use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use rowflow_common::{FlowId, Result, RowflowError, StreamId};
use rowflow_execution::ProducerMetadata;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

/// Version of the flow stream protocol spoken by this node.
pub const FLOW_STREAM_VERSION: u32 = 1;

/// Identifies the consumer of a stream. Present on the first message only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    pub flow_id: FlowId,
    pub stream_id: StreamId,
}

/// Producer-to-consumer message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProducerMessage {
    pub header: Option<StreamHeader>,
    /// Arrow IPC stream bytes of one record batch.
    pub data: Option<Vec<u8>>,
    pub metadata: Vec<ProducerMetadata>,
}

impl ProducerMessage {
    pub fn header(flow_id: FlowId, stream_id: StreamId) -> Self {
        Self {
            header: Some(StreamHeader { flow_id, stream_id }),
            ..Self::default()
        }
    }

    pub fn data(batch: &RecordBatch) -> Result<Self> {
        Ok(Self {
            data: Some(encode_batch(batch)?),
            ..Self::default()
        })
    }

    pub fn metadata(metadata: Vec<ProducerMetadata>) -> Self {
        Self {
            metadata,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerHandshake {
    pub consumer_scheduled: bool,
    pub version: u32,
}

/// Consumer-to-producer message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumerSignal {
    Handshake(ConsumerHandshake),
    /// The consumer needs no more rows; send trailing metadata and close.
    DrainRequest,
}

impl ConsumerSignal {
    pub fn handshake(consumer_scheduled: bool) -> Self {
        ConsumerSignal::Handshake(ConsumerHandshake {
            consumer_scheduled,
            version: FLOW_STREAM_VERSION,
        })
    }
}

/// Consumer side of a flow stream.
///
/// `recv` returns `Ok(None)` once the producer closed its send side.
#[async_trait]
pub trait FlowStreamServer: Send + Sync {
    async fn send(&self, signal: ConsumerSignal) -> Result<()>;

    async fn recv(&self) -> Result<Option<ProducerMessage>>;
}

/// Producer side of a flow stream.
#[async_trait]
pub trait FlowStreamClient: Send + Sync {
    async fn send(&self, msg: ProducerMessage) -> Result<()>;

    async fn recv(&self) -> Result<Option<ConsumerSignal>>;

    /// Close the send side; the server then observes end of stream.
    async fn close_send(&self) -> Result<()>;
}

pub type ServerStreamRef = Arc<dyn FlowStreamServer>;
pub type ClientStreamRef = Arc<dyn FlowStreamClient>;

fn closed(what: &str) -> RowflowError {
    RowflowError::Connection(format!("flow stream closed: cannot {what}"))
}

/// In-memory consumer end created by [`stream_pair`].
pub struct MemServerStream {
    tx: Mutex<Option<mpsc::Sender<ConsumerSignal>>>,
    rx: Mutex<mpsc::Receiver<ProducerMessage>>,
}

/// In-memory producer end created by [`stream_pair`].
pub struct MemClientStream {
    tx: Mutex<Option<mpsc::Sender<ProducerMessage>>>,
    rx: Mutex<mpsc::Receiver<ConsumerSignal>>,
}

/// Connected in-memory stream ends, each direction buffering up to
/// `capacity` messages.
pub fn stream_pair(capacity: usize) -> (Arc<MemServerStream>, Arc<MemClientStream>) {
    let (p_tx, p_rx) = mpsc::channel(capacity.max(1));
    let (c_tx, c_rx) = mpsc::channel(capacity.max(1));
    let server = MemServerStream {
        tx: Mutex::new(Some(c_tx)),
        rx: Mutex::new(p_rx),
    };
    let client = MemClientStream {
        tx: Mutex::new(Some(p_tx)),
        rx: Mutex::new(c_rx),
    };
    (Arc::new(server), Arc::new(client))
}

impl MemServerStream {
    /// Close the consumer-to-producer direction.
    pub async fn close(&self) {
        self.tx.lock().await.take();
    }
}

#[async_trait]
impl FlowStreamServer for MemServerStream {
    async fn send(&self, signal: ConsumerSignal) -> Result<()> {
        let tx = self.tx.lock().await.clone().ok_or_else(|| closed("send signal"))?;
        tx.send(signal).await.map_err(|_| closed("send signal"))
    }

    async fn recv(&self) -> Result<Option<ProducerMessage>> {
        Ok(self.rx.lock().await.recv().await)
    }
}

#[async_trait]
impl FlowStreamClient for MemClientStream {
    async fn send(&self, msg: ProducerMessage) -> Result<()> {
        let tx = self.tx.lock().await.clone().ok_or_else(|| closed("send message"))?;
        tx.send(msg).await.map_err(|_| closed("send message"))
    }

    async fn recv(&self) -> Result<Option<ConsumerSignal>> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close_send(&self) -> Result<()> {
        self.tx.lock().await.take();
        Ok(())
    }
}

/// Encode one record batch as Arrow IPC stream bytes.
pub fn encode_batch(batch: &RecordBatch) -> Result<Vec<u8>> {
    let schema = batch.schema();
    let mut out = Vec::<u8>::new();
    {
        let mut writer = StreamWriter::try_new(&mut out, schema.as_ref())
            .map_err(|e| RowflowError::Execution(format!("ipc writer init failed: {e}")))?;
        writer
            .write(batch)
            .map_err(|e| RowflowError::Execution(format!("ipc write failed: {e}")))?;
        writer
            .finish()
            .map_err(|e| RowflowError::Execution(format!("ipc finish failed: {e}")))?;
    }
    Ok(out)
}

/// Decode bytes written by [`encode_batch`].
pub fn decode_batch(bytes: &[u8]) -> Result<RecordBatch> {
    let reader = StreamReader::try_new(std::io::Cursor::new(bytes), None)
        .map_err(|e| RowflowError::Execution(format!("ipc reader init failed: {e}")))?;
    let schema = reader.schema();
    let mut batches = Vec::with_capacity(1);
    for batch in reader {
        batches.push(batch.map_err(|e| RowflowError::Execution(format!("ipc read failed: {e}")))?);
    }
    match batches.len() {
        1 => batches
            .pop()
            .ok_or_else(|| RowflowError::Internal("batch vanished".to_string())),
        0 => Ok(RecordBatch::new_empty(schema)),
        n => Err(RowflowError::Execution(format!(
            "expected one record batch per message, got {n}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use rowflow_execution::vectorized::{batch_to_rows, rows_to_batch, schema_for};
    use rowflow_execution::{ColumnType, Datum};

    use super::*;

    #[test]
    fn batches_cross_the_wire_encoding() {
        let schema = schema_for(&[ColumnType::Int, ColumnType::String]);
        let rows = vec![
            vec![Datum::Int(1), Datum::from("x")],
            vec![Datum::Null, Datum::from("y")],
        ];
        let batch = rows_to_batch(&schema, &rows).expect("batch");
        let msg = ProducerMessage::data(&batch).expect("encode");
        let json = serde_json::to_vec(&msg).expect("json");
        let back: ProducerMessage = serde_json::from_slice(&json).expect("json decode");
        let decoded = decode_batch(back.data.as_deref().expect("data")).expect("decode");
        assert_eq!(batch_to_rows(&decoded).expect("rows"), rows);
    }

    #[tokio::test]
    async fn closing_the_send_side_ends_the_server_stream() {
        let (server, client) = stream_pair(4);
        client
            .send(ProducerMessage::header(FlowId::new_v4(), StreamId(3)))
            .await
            .expect("send");
        client.close_send().await.expect("close");
        let first = server.recv().await.expect("recv").expect("message");
        assert_eq!(first.header.map(|h| h.stream_id), Some(StreamId(3)));
        assert!(server.recv().await.expect("recv").is_none());
        assert!(client.send(ProducerMessage::default()).await.is_err());
    }

    #[tokio::test]
    async fn signals_flow_back_to_the_client() {
        let (server, client) = stream_pair(1);
        server.send(ConsumerSignal::handshake(false)).await.expect("send");
        assert_eq!(
            client.recv().await.expect("recv"),
            Some(ConsumerSignal::handshake(false))
        );
        drop(server);
        assert_eq!(client.recv().await.expect("recv"), None);
    }
}
