use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RowflowError};
use crate::ids::NodeId;

/// Node-level flow execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Id of the node hosting the flows.
    pub node_id: NodeId,
    /// How long a registered flow waits for its inbound streams to connect,
    /// and how long an early inbound stream waits for its flow to register.
    pub flow_stream_timeout: Duration,
    /// Upper bound on how long `drain` waits for registered flows to finish.
    pub flow_drain_wait: Duration,
    /// Minimum time `drain` waits for flows racing into registration.
    pub min_flow_drain_wait: Duration,
    /// Buffered rows per row channel before pushes block.
    pub row_channel_buffer_size: usize,
    /// Rows per batch when a row source is columnarized for an outbox.
    pub outbox_batch_size_rows: usize,
    /// Byte budget for rows buffered by merge joiners.
    pub merge_join_mem_budget_bytes: usize,
    /// Number of calls between cancellation checks in hot loops.
    pub cancel_check_interval: u64,
    /// Attach trace spans to the trailing metadata of every processor.
    pub trace_enabled: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(1),
            flow_stream_timeout: Duration::from_secs(10),
            flow_drain_wait: Duration::from_secs(10),
            min_flow_drain_wait: Duration::from_secs(1),
            row_channel_buffer_size: 16,
            outbox_batch_size_rows: 1024,
            merge_join_mem_budget_bytes: 64 * 1024 * 1024,
            cancel_check_interval: 1024,
            trace_enabled: false,
        }
    }
}

impl FlowConfig {
    /// Build a config from defaults overlaid with `ROWFLOW_*` environment variables.
    ///
    /// Recognized keys:
    /// - `ROWFLOW_NODE_ID`
    /// - `ROWFLOW_FLOW_STREAM_TIMEOUT_MS`
    /// - `ROWFLOW_FLOW_DRAIN_WAIT_MS`
    /// - `ROWFLOW_MIN_FLOW_DRAIN_WAIT_MS`
    /// - `ROWFLOW_ROW_CHANNEL_BUFFER_SIZE`
    /// - `ROWFLOW_OUTBOX_BATCH_SIZE_ROWS`
    /// - `ROWFLOW_MERGE_JOIN_MEM_BUDGET_BYTES`
    /// - `ROWFLOW_CANCEL_CHECK_INTERVAL`
    /// - `ROWFLOW_TRACE_ENABLED` (`true` or `false`)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`FlowConfig::from_env`] but reads values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(v) = parse_key::<u32>(&lookup, "ROWFLOW_NODE_ID")? {
            cfg.node_id = NodeId(v);
        }
        if let Some(v) = parse_key::<u64>(&lookup, "ROWFLOW_FLOW_STREAM_TIMEOUT_MS")? {
            cfg.flow_stream_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_key::<u64>(&lookup, "ROWFLOW_FLOW_DRAIN_WAIT_MS")? {
            cfg.flow_drain_wait = Duration::from_millis(v);
        }
        if let Some(v) = parse_key::<u64>(&lookup, "ROWFLOW_MIN_FLOW_DRAIN_WAIT_MS")? {
            cfg.min_flow_drain_wait = Duration::from_millis(v);
        }
        if let Some(v) = parse_key::<usize>(&lookup, "ROWFLOW_ROW_CHANNEL_BUFFER_SIZE")? {
            cfg.row_channel_buffer_size = v;
        }
        if let Some(v) = parse_key::<usize>(&lookup, "ROWFLOW_OUTBOX_BATCH_SIZE_ROWS")? {
            cfg.outbox_batch_size_rows = v;
        }
        if let Some(v) = parse_key::<usize>(&lookup, "ROWFLOW_MERGE_JOIN_MEM_BUDGET_BYTES")? {
            cfg.merge_join_mem_budget_bytes = v;
        }
        if let Some(v) = parse_key::<u64>(&lookup, "ROWFLOW_CANCEL_CHECK_INTERVAL")? {
            cfg.cancel_check_interval = v;
        }
        if let Some(v) = parse_key::<bool>(&lookup, "ROWFLOW_TRACE_ENABLED")? {
            cfg.trace_enabled = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would stall flows.
    pub fn validate(&self) -> Result<()> {
        if self.row_channel_buffer_size == 0 {
            return Err(RowflowError::InvalidConfig(
                "row_channel_buffer_size must be positive".to_string(),
            ));
        }
        if self.outbox_batch_size_rows == 0 {
            return Err(RowflowError::InvalidConfig(
                "outbox_batch_size_rows must be positive".to_string(),
            ));
        }
        if self.cancel_check_interval == 0 {
            return Err(RowflowError::InvalidConfig(
                "cancel_check_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_key<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| RowflowError::InvalidConfig(format!("{key}={raw:?}: {e}"))),
    }
}
