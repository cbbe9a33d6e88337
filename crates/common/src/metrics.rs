use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

use crate::ids::NodeId;

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    flows_active: GaugeVec,
    flows_registered: CounterVec,
    flows_canceled: CounterVec,
    inbound_stream_timeouts: CounterVec,
    registry_drain_seconds: HistogramVec,
    processor_rows_out: CounterVec,
    processor_meta_out: CounterVec,
    outbox_batches_sent: CounterVec,
    outbox_bytes_sent: CounterVec,
    inbox_batches_received: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn flow_registered(&self, node: NodeId) {
        let labels = [&node.to_string()[..]];
        self.inner.flows_registered.with_label_values(&labels).inc();
        self.inner.flows_active.with_label_values(&labels).inc();
    }

    pub fn flow_unregistered(&self, node: NodeId) {
        let labels = [&node.to_string()[..]];
        self.inner.flows_active.with_label_values(&labels).dec();
    }

    pub fn flow_canceled(&self, node: NodeId) {
        let labels = [&node.to_string()[..]];
        self.inner.flows_canceled.with_label_values(&labels).inc();
    }

    pub fn inbound_streams_timed_out(&self, node: NodeId, streams: u64) {
        let labels = [&node.to_string()[..]];
        self.inner
            .inbound_stream_timeouts
            .with_label_values(&labels)
            .inc_by(streams as f64);
    }

    pub fn observe_drain(&self, node: NodeId, secs: f64) {
        let labels = [&node.to_string()[..]];
        self.inner
            .registry_drain_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    pub fn record_processor_output(&self, processor: &str, rows: u64, meta: u64) {
        if rows > 0 {
            self.inner
                .processor_rows_out
                .with_label_values(&[processor])
                .inc_by(rows as f64);
        }
        if meta > 0 {
            self.inner
                .processor_meta_out
                .with_label_values(&[processor])
                .inc_by(meta as f64);
        }
    }

    pub fn record_outbox_send(&self, node: NodeId, batches: u64, bytes: u64) {
        let labels = [&node.to_string()[..]];
        self.inner
            .outbox_batches_sent
            .with_label_values(&labels)
            .inc_by(batches as f64);
        self.inner
            .outbox_bytes_sent
            .with_label_values(&labels)
            .inc_by(bytes as f64);
    }

    pub fn record_inbox_receive(&self, node: NodeId, batches: u64) {
        let labels = [&node.to_string()[..]];
        self.inner
            .inbox_batches_received
            .with_label_values(&labels)
            .inc_by(batches as f64);
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let flows_active = gauge_vec(
            &registry,
            "rowflow_flows_active",
            "Flows currently registered",
            &["node_id"],
        );
        let flows_registered = counter_vec(
            &registry,
            "rowflow_flows_registered_total",
            "Flows registered with the flow registry",
            &["node_id"],
        );
        let flows_canceled = counter_vec(
            &registry,
            "rowflow_flows_canceled_total",
            "Flows canceled before completion",
            &["node_id"],
        );
        let inbound_stream_timeouts = counter_vec(
            &registry,
            "rowflow_inbound_stream_timeouts_total",
            "Inbound streams that never connected before the stream timeout",
            &["node_id"],
        );
        let registry_drain_seconds = histogram_vec(
            &registry,
            "rowflow_registry_drain_seconds",
            "Time spent draining the flow registry",
            &["node_id"],
        );

        let processor_rows_out = counter_vec(
            &registry,
            "rowflow_processor_rows_out_total",
            "Rows emitted per processor kind",
            &["processor"],
        );
        let processor_meta_out = counter_vec(
            &registry,
            "rowflow_processor_meta_out_total",
            "Metadata records emitted per processor kind",
            &["processor"],
        );

        let outbox_batches_sent = counter_vec(
            &registry,
            "rowflow_outbox_batches_sent_total",
            "Batches written to network streams",
            &["node_id"],
        );
        let outbox_bytes_sent = counter_vec(
            &registry,
            "rowflow_outbox_bytes_sent_total",
            "Encoded bytes written to network streams",
            &["node_id"],
        );
        let inbox_batches_received = counter_vec(
            &registry,
            "rowflow_inbox_batches_received_total",
            "Batches decoded from network streams",
            &["node_id"],
        );

        Self {
            registry,
            flows_active,
            flows_registered,
            flows_canceled,
            inbound_stream_timeouts,
            registry_drain_seconds,
            processor_rows_out,
            processor_meta_out,
            outbox_batches_sent,
            outbox_bytes_sent,
            inbox_batches_received,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
