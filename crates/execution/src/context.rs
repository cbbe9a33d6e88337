use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rowflow_common::{FlowConfig, FlowId, NodeId, Result, RowflowError};

/// Per-flow execution context shared by every processor of the flow.
///
/// Processors hold a clone; the flow keeps the cancellation flag and flips it
/// when the flow is canceled.
#[derive(Debug, Clone)]
pub struct FlowCtx {
    /// Flow this context belongs to.
    pub flow_id: FlowId,
    /// Node hosting the flow.
    pub node_id: NodeId,
    /// Node configuration the flow was set up with.
    pub config: Arc<FlowConfig>,
    /// Whether processors attach trace data to their trailing metadata.
    pub trace_enabled: bool,
    canceled: Arc<AtomicBool>,
}

impl FlowCtx {
    pub fn new(flow_id: FlowId, config: Arc<FlowConfig>) -> Self {
        Self {
            flow_id,
            node_id: config.node_id,
            trace_enabled: config.trace_enabled,
            config,
            canceled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Context for a throwaway flow with default configuration.
    pub fn for_tests() -> Self {
        Self::new(FlowId::new_v4(), Arc::new(FlowConfig::default()))
    }

    /// Raise the cancellation flag observed by [`CancelChecker`]s.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Checker sampling this flow's cancellation flag every
    /// `cancel_check_interval` calls.
    pub fn cancel_checker(&self) -> CancelChecker {
        CancelChecker::new(Arc::clone(&self.canceled), self.config.cancel_check_interval)
    }
}

/// Amortized cancellation check for hot loops.
#[derive(Debug)]
pub struct CancelChecker {
    canceled: Arc<AtomicBool>,
    interval: u64,
    calls: u64,
}

impl CancelChecker {
    fn new(canceled: Arc<AtomicBool>, interval: u64) -> Self {
        Self {
            canceled,
            interval: interval.max(1),
            calls: 0,
        }
    }

    /// Returns `QueryCanceled` if the flag is set, sampling it only once every
    /// `interval` calls.
    pub fn check(&mut self) -> Result<()> {
        self.calls += 1;
        if self.calls % self.interval == 0 {
            return self.check_now();
        }
        Ok(())
    }

    /// Unamortized check.
    pub fn check_now(&self) -> Result<()> {
        if self.canceled.load(Ordering::Acquire) {
            return Err(RowflowError::QueryCanceled);
        }
        Ok(())
    }
}
