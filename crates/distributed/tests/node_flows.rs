use std::sync::Arc;
use std::time::Duration;

use rowflow_common::{FlowConfig, FlowId, NodeId, ProcessorId, RowflowError, StreamId};
use rowflow_distributed::{
    ConsumerSignal, FlowSpec, FlowStreamClient, InputSyncSpec, LocalDialer, NodeDialer,
    NodeServer, ProcessorSpec, ProducerMessage, StreamEndpointSpec,
};
use rowflow_execution::spec::{MergeJoinerSpec, ValuesSpec};
use rowflow_execution::{
    ColumnOrdering, ColumnType, Datum, JoinType, PostProcessSpec, ProcessorCoreUnion, RowBuffer,
};

fn node(dialer: &Arc<LocalDialer>, id: u32, config: FlowConfig) -> Arc<NodeServer> {
    let config = FlowConfig {
        node_id: NodeId(id),
        ..config
    };
    let server = Arc::new(NodeServer::new(config, dialer.clone()).expect("node server"));
    dialer.add_node(&server);
    server
}

fn values(id: u32, keys: &[i64], output: StreamEndpointSpec) -> ProcessorSpec {
    ProcessorSpec {
        processor_id: ProcessorId(id),
        core: ProcessorCoreUnion::Values(ValuesSpec {
            types: vec![ColumnType::Int],
            rows: keys.iter().map(|k| vec![Datum::Int(*k)]).collect(),
        }),
        post: PostProcessSpec::default(),
        inputs: Vec::new(),
        output,
    }
}

fn int_input(stream: StreamEndpointSpec) -> InputSyncSpec {
    InputSyncSpec {
        types: vec![ColumnType::Int],
        streams: vec![stream],
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn merge_join_across_two_nodes() {
    let dialer = Arc::new(LocalDialer::new());
    let producer = node(&dialer, 1, FlowConfig::default());
    let consumer = node(&dialer, 2, FlowConfig::default());
    let flow_id = FlowId::new_v4();
    let left_stream = StreamId(1);
    let right_stream = StreamId(2);

    let producer_spec = FlowSpec {
        flow_id,
        processors: vec![values(
            1,
            &[1, 1, 2],
            StreamEndpointSpec::Remote {
                stream_id: left_stream,
                target_node: NodeId(2),
            },
        )],
    };
    let consumer_spec = FlowSpec {
        flow_id,
        processors: vec![
            values(2, &[1, 2, 2], StreamEndpointSpec::Local { stream_id: right_stream }),
            ProcessorSpec {
                processor_id: ProcessorId(3),
                core: ProcessorCoreUnion::MergeJoiner(MergeJoinerSpec {
                    left_ordering: vec![ColumnOrdering::asc(0)],
                    right_ordering: vec![ColumnOrdering::asc(0)],
                    join_type: JoinType::Inner,
                    on_expr: None,
                    null_equality: false,
                }),
                post: PostProcessSpec::default(),
                inputs: vec![
                    int_input(StreamEndpointSpec::Remote {
                        stream_id: left_stream,
                        target_node: NodeId(1),
                    }),
                    int_input(StreamEndpointSpec::Local { stream_id: right_stream }),
                ],
                output: StreamEndpointSpec::SyncResponse,
            },
        ],
    };

    // The producer starts first, so its stream arrives before the consumer
    // flow is registered.
    let mut producer_flow = producer.setup_flow(&producer_spec).expect("producer setup");
    producer_flow.start().expect("producer start");

    let out = Arc::new(RowBuffer::new(vec![ColumnType::Int, ColumnType::Int]));
    let mut consumer_flow = consumer
        .setup_sync_flow(&consumer_spec, out.clone())
        .expect("consumer setup");
    consumer_flow.start().expect("consumer start");

    tokio::time::timeout(Duration::from_secs(10), async {
        producer_flow.wait().await;
        consumer_flow.wait().await;
    })
    .await
    .expect("flows finish");
    producer_flow.cleanup();
    consumer_flow.cleanup();

    let mut rows = out.rows();
    rows.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
    assert_eq!(
        rows,
        vec![
            vec![Datum::Int(1), Datum::Int(1)],
            vec![Datum::Int(1), Datum::Int(1)],
            vec![Datum::Int(2), Datum::Int(2)],
            vec![Datum::Int(2), Datum::Int(2)],
        ]
    );
    assert!(out.metadata().iter().all(|m| !m.is_err()), "{:?}", out.metadata());
    assert!(out.producer_done_called());
    assert_eq!(consumer.registry().num_registered_flows(), 0);
    assert_eq!(producer.registry().num_registered_flows(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn drained_node_rejects_sync_flows_with_a_retryable_error() {
    let dialer = Arc::new(LocalDialer::new());
    let server = node(
        &dialer,
        1,
        FlowConfig {
            flow_drain_wait: Duration::from_millis(100),
            min_flow_drain_wait: Duration::ZERO,
            ..FlowConfig::default()
        },
    );
    server.drain().await;
    assert!(server.registry().is_draining());

    let spec = FlowSpec {
        flow_id: FlowId::new_v4(),
        processors: vec![ProcessorSpec {
            processor_id: ProcessorId(1),
            core: ProcessorCoreUnion::Noop,
            post: PostProcessSpec::default(),
            inputs: vec![int_input(StreamEndpointSpec::Remote {
                stream_id: StreamId(1),
                target_node: NodeId(2),
            })],
            output: StreamEndpointSpec::SyncResponse,
        }],
    };
    let out = Arc::new(RowBuffer::new(vec![ColumnType::Int]));
    let mut flow = server.setup_sync_flow(&spec, out.clone()).expect("setup");
    flow.run().await.expect("run");
    let meta = out.metadata();
    assert_eq!(meta.len(), 1);
    let err = meta[0].err().expect("error");
    assert!(err.to_string().contains("draining"), "{err}");
    assert!(err.is_retryable());

    server.undrain();
    assert!(!server.registry().is_draining());
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_for_an_unknown_flow_is_rejected() {
    let dialer = Arc::new(LocalDialer::new());
    let _server = node(
        &dialer,
        1,
        FlowConfig {
            flow_stream_timeout: Duration::from_millis(20),
            ..FlowConfig::default()
        },
    );
    let client = dialer.dial(NodeId(1)).await.expect("dial");
    client
        .send(ProducerMessage::header(FlowId::new_v4(), StreamId(1)))
        .await
        .expect("send header");
    assert_eq!(
        client.recv().await.expect("recv"),
        Some(ConsumerSignal::handshake(false))
    );
    // The server gives up and closes the stream.
    let closed = tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("stream closes");
    assert_eq!(closed.expect("recv"), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn canceling_a_flow_stops_a_connected_stalled_stream() {
    let dialer = Arc::new(LocalDialer::new());
    let server = node(&dialer, 1, FlowConfig::default());
    let flow_id = FlowId::new_v4();
    let spec = FlowSpec {
        flow_id,
        processors: vec![ProcessorSpec {
            processor_id: ProcessorId(1),
            core: ProcessorCoreUnion::Noop,
            post: PostProcessSpec::default(),
            inputs: vec![int_input(StreamEndpointSpec::Remote {
                stream_id: StreamId(7),
                target_node: NodeId(2),
            })],
            output: StreamEndpointSpec::SyncResponse,
        }],
    };
    let out = Arc::new(RowBuffer::new(vec![ColumnType::Int]));
    let mut flow = server.setup_sync_flow(&spec, out.clone()).expect("setup");
    flow.start().expect("start");

    // Connect and then send nothing.
    let client = dialer.dial(NodeId(1)).await.expect("dial");
    client
        .send(ProducerMessage::header(flow_id, StreamId(7)))
        .await
        .expect("send header");
    assert_eq!(
        client.recv().await.expect("recv"),
        Some(ConsumerSignal::handshake(true))
    );

    flow.cancel();
    tokio::time::timeout(Duration::from_secs(5), flow.wait())
        .await
        .expect("flow finishes after cancel");
    flow.cleanup();

    let errs: Vec<_> = out
        .metadata()
        .into_iter()
        .filter_map(|m| m.err().cloned())
        .collect();
    assert!(errs.contains(&RowflowError::QueryCanceled), "{errs:?}");
    assert!(out.producer_done_called());
}

#[tokio::test(flavor = "multi_thread")]
async fn canceling_a_producer_stops_an_outbox_stalled_on_its_consumer() {
    let dialer = Arc::new(LocalDialer::new());
    let producer = node(
        &dialer,
        1,
        FlowConfig {
            row_channel_buffer_size: 1,
            outbox_batch_size_rows: 1,
            ..FlowConfig::default()
        },
    );
    // The consumer node accepts the stream but never registers the flow, so
    // nothing reads it.
    let _consumer = node(
        &dialer,
        2,
        FlowConfig {
            flow_stream_timeout: Duration::from_secs(3600),
            ..FlowConfig::default()
        },
    );
    let keys: Vec<i64> = (0..1000).collect();
    let spec = FlowSpec {
        flow_id: FlowId::new_v4(),
        processors: vec![values(
            1,
            &keys,
            StreamEndpointSpec::Remote {
                stream_id: StreamId(1),
                target_node: NodeId(2),
            },
        )],
    };
    let mut flow = producer.setup_flow(&spec).expect("setup");
    flow.start().expect("start");

    tokio::time::sleep(Duration::from_millis(200)).await;
    flow.cancel();
    tokio::time::timeout(Duration::from_secs(5), flow.wait())
        .await
        .expect("flow finishes after cancel");
    flow.cleanup();
    assert_eq!(producer.registry().num_registered_flows(), 0);
}
