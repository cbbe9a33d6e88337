//! Shared configuration, error types, IDs, memory accounting and observability
//! primitives for rowflow crates.
//!
//! Architecture role:
//! - defines node/flow configuration passed across layers
//! - provides the common [`RowflowError`] / [`Result`] contracts and their
//!   retryability classification
//! - hosts the byte-budget monitor used by buffering operators
//! - hosts metrics and tracing initialization
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`memory`]
//! - [`metrics`]
//! - [`sync`]

pub mod config;
pub mod error;
pub mod ids;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod sync;

pub use config::FlowConfig;
pub use error::{ErrorCode, Result, RowflowError};
pub use ids::*;
pub use memory::{BoundAccount, BytesMonitor};
pub use metrics::{global_metrics, MetricsRegistry};
pub use sync::WaitGroup;
